//! Stable bucket assignment for integer keys.
//!
//! Fibonacci multiplicative hashing: `h = key * 0x9E3779B97F4A7C15 mod 2^64`,
//! `bucket = floor(h * N / 2^64)`. The same arithmetic is rendered as exact
//! `numeric` SQL so Postgres and Rust agree on every key. The final step uses
//! `div()`: `numeric` division rounds its result, which pushes keys just below
//! a bucket boundary into the next bucket (and the last one out of range).

/// 2^64 / golden ratio, odd.
pub const FIBONACCI_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

const TWO_POW_64: &str = "18446744073709551616";

/// Bucket of a non-NULL key among `partitions` buckets.
pub fn bucket_of(key: i64, partitions: usize) -> usize {
    debug_assert!(partitions > 0);
    let h = (key as u64).wrapping_mul(FIBONACCI_MULTIPLIER);
    ((h as u128 * partitions as u128) >> 64) as usize
}

/// Bucket of a nullable key; NULL keys land in bucket 0.
pub fn bucket_for(key: Option<i64>, partitions: usize) -> usize {
    key.map(|k| bucket_of(k, partitions)).unwrap_or(0)
}

/// SQL expression computing [`bucket_for`] of `expr` (an integer column).
pub fn bucket_sql(expr: &str, partitions: usize) -> String {
    format!(
        "COALESCE(div(((({expr})::numeric + {m}) % {m} * {mult} % {m}) * {n}, {m})::int, 0)",
        expr = expr,
        m = TWO_POW_64,
        mult = FIBONACCI_MULTIPLIER,
        n = partitions
    )
}
