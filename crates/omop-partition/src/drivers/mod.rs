//! Database drivers.
//!
//! [`postgres`] holds the live implementations of the source and partition
//! traits. Every pooled connection is handed to exactly one job at a time;
//! exports and imports keep their connection checked out until they finish.

pub mod postgres;

pub use postgres::{build_pool, PgEndpoint, PgPartition, PgSource, SslMode};
