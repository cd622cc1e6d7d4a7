//! Error types for the partitioning library.

use thiserror::Error;

/// Process exit codes used by the CLI.
pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_INTROSPECTION_ERROR: u8 = 2;
pub const EXIT_TRANSFER_ERROR: u8 = 3;
pub const EXIT_VALIDATION_FAILED: u8 = 4;
pub const EXIT_CONNECTION_ERROR: u8 = 5;
pub const EXIT_CANCELLED: u8 = 6;
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for partitioning operations.
#[derive(Error, Debug)]
pub enum PartitionError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The source catalog could not be read. Fatal for the whole run.
    #[error("Schema introspection failed: {0}")]
    SchemaIntrospection(String),

    /// Metadata for a single table could not be gathered.
    #[error("Could not resolve split rule for {table}: {message}")]
    RuleResolution { table: String, message: String },

    /// A transfer job failed. Other jobs keep running.
    #[error("Transfer failed for {table} -> partition {partition}: {message}")]
    Transfer {
        table: String,
        partition: usize,
        message: String,
    },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Database query error
    #[error("Database error: {}", db_message(.0))]
    Database(#[from] tokio_postgres::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, timeout, etc.)
    #[error("Run cancelled")]
    Cancelled,
}

impl PartitionError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        PartitionError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error for one (table, partition) job.
    pub fn transfer(
        table: impl ToString,
        partition: usize,
        message: impl Into<String>,
    ) -> Self {
        PartitionError::Transfer {
            table: table.to_string(),
            partition,
            message: message.into(),
        }
    }

    /// Create a RuleResolution error for one table.
    pub fn rule(table: impl ToString, message: impl Into<String>) -> Self {
        PartitionError::RuleResolution {
            table: table.to_string(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            PartitionError::Config(_) | PartitionError::Yaml(_) | PartitionError::Json(_) => {
                EXIT_CONFIG_ERROR
            }
            PartitionError::SchemaIntrospection(_) | PartitionError::RuleResolution { .. } => {
                EXIT_INTROSPECTION_ERROR
            }
            PartitionError::Transfer { .. } => EXIT_TRANSFER_ERROR,
            PartitionError::Pool { .. } | PartitionError::Database(_) => EXIT_CONNECTION_ERROR,
            PartitionError::Cancelled => EXIT_CANCELLED,
            PartitionError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// The server's own message, detail and hint when there is one.
///
/// `tokio_postgres::Error` displays as just "db error" for server-side errors.
fn db_message(error: &tokio_postgres::Error) -> String {
    match error.as_db_error() {
        Some(db) => {
            describe_server_error(db.code().code(), db.message(), db.detail(), db.hint())
        }
        None => error.to_string(),
    }
}

fn describe_server_error(
    code: &str,
    message: &str,
    detail: Option<&str>,
    hint: Option<&str>,
) -> String {
    let mut text = message.to_string();
    for (label, value) in [("detail", detail), ("hint", hint)] {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            text.push_str(&format!(" ({}: {})", label, value));
        }
    }
    format!("{} [SQLSTATE {}]", text, code)
}

/// Result type alias for partitioning operations.
pub type Result<T> = std::result::Result<T, PartitionError>;
