//! Source database access (legacy schema).
//!
//! The [`SourceReader`] trait is the only way the migration core touches the
//! legacy database: a row count and offset/limit batches ordered by a stable
//! key. Each call is its own read; no transaction spans batches.

mod mysql;
mod value;

pub use mysql::MysqlSource;
pub use value::{SourceRow, SourceValue};

use crate::config::SourceTable;
use crate::error::Result;
use async_trait::async_trait;

/// Paginated read access to legacy tables.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Count rows in a source table.
    async fn count(&self, table: &SourceTable) -> Result<i64>;

    /// Fetch one batch, ordered by `table.primary_key` so that pagination
    /// is deterministic and resumable.
    async fn fetch(&self, table: &SourceTable, limit: usize, offset: usize)
        -> Result<Vec<SourceRow>>;

    /// Get the database type identifier (e.g., "mysql", "memory").
    fn db_type(&self) -> &str;

    /// Close the connection pool.
    async fn close(&self) {}
}
