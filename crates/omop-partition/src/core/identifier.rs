//! Identifier validation and quoting for generated PostgreSQL statements.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! identifier that ends up in generated SQL (COPY selections, counts, catalog
//! lookups) goes through [`quote_pg`] first.

use crate::error::{PartitionError, Result};

/// Maximum identifier length accepted in configuration and catalog results.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers longer than [`MAX_IDENTIFIER_LENGTH`].
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PartitionError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(PartitionError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(PartitionError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// Escapes double quotes by doubling them and wraps in double quotes.
///
/// ```ignore
/// assert_eq!(quote_pg("person")?, "\"person\"");
/// assert_eq!(quote_pg("odd\"name")?, "\"odd\"\"name\"");
/// ```
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a PostgreSQL table name with schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Quote a column reference through a table alias (`alias."column"`).
///
/// The pseudo-column `ctid` is emitted unquoted so it keeps its system meaning.
pub fn aliased_column(alias: &str, column: &str) -> Result<String> {
    if column == "ctid" {
        return Ok(format!("{}.ctid", alias));
    }
    Ok(format!("{}.{}", alias, quote_pg(column)?))
}
