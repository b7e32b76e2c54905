//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration and backup operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] sqlx::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A table could not be read or a write to it was rejected
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// A source record could not be mapped to the target schema
    #[error("Mapping error: {0}")]
    Mapping(#[from] crate::mapper::MappingError),

    /// A foreign key parent could not be resolved in the target
    #[error("Foreign key error: {entity} references missing {parent} '{key}'")]
    ForeignKey {
        entity: String,
        parent: String,
        key: String,
    },

    /// Integrity or count validation failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Backup creation, listing or restore failed
    #[error("Backup error: {0}")]
    Backup(String),

    /// No backup metadata with the given id
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// Dump artifact does not match its recorded checksum
    #[error("Backup checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A long-running subprocess exceeded its time limit
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

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
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a ForeignKey error
    pub fn foreign_key(
        entity: impl Into<String>,
        parent: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        MigrateError::ForeignKey {
            entity: entity.into(),
            parent: parent.into(),
            key: key.into(),
        }
    }

    /// Whether this error means the connection itself is unusable.
    ///
    /// Connectivity errors abort the current table; everything else is
    /// attributed to the record being processed.
    pub fn is_connectivity(&self) -> bool {
        match self {
            MigrateError::Pool { .. } | MigrateError::Io(_) | MigrateError::Timeout { .. } => true,
            MigrateError::Source(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            MigrateError::Target(e) => e.is_closed(),
            _ => false,
        }
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::Source(_) | MigrateError::Target(_) | MigrateError::Pool { .. } => 3,
            MigrateError::Backup(_)
            | MigrateError::BackupNotFound(_)
            | MigrateError::ChecksumMismatch { .. } => 4,
            MigrateError::Timeout { .. } => 5,
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
