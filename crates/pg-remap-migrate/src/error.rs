//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mapping file error (unknown directive, unregistered custom rule, etc.)
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(tokio_postgres::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Record file could not be read or written
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A record file holds a value the engine cannot interpret
    #[error("Invalid record in table {table}: {message}")]
    InvalidRecord { table: String, message: String },

    /// Table has no primary key (required to merge deferred updates)
    #[error("Table {0} has no primary key - deferred updates require primary keys")]
    NoPrimaryKey(String),

    /// Some record files could not be bulk loaded
    #[error("Rows left unmigrated in tables: {}", .0.join(", "))]
    ResidualRows(Vec<String>),

    /// The final commit was refused
    #[error("Commit blocked: {0}")]
    CommitBlocked(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create an InvalidRecord error
    pub fn invalid_record(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::InvalidRecord {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Mapping(_) | MigrateError::Yaml(_) => 2,
            MigrateError::Source(_) | MigrateError::Target(_) | MigrateError::Pool { .. } => 3,
            MigrateError::ResidualRows(_)
            | MigrateError::CommitBlocked(_)
            | MigrateError::NoPrimaryKey(_) => 4,
            MigrateError::Cancelled => 130,
            _ => 1,
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

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
