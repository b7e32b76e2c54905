//! # civreg-migrate
//!
//! Migration and backup library for moving a legacy civil-registry MySQL
//! database into its PostgreSQL successor.
//!
//! This library provides:
//!
//! - **Field mapping** from legacy rows and code tables to typed records
//! - **Idempotent upserts** keyed by natural keys (national ID, family
//!   number, username, ...)
//! - **Dependency-ordered** table migration with per-record error isolation
//! - **Checksummed backups** with verified restore
//! - **Integrity validation** of the migrated data
//!
//! ## Example
//!
//! ```rust,no_run
//! use civreg_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> civreg_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::connect(config).await?;
//!     let report = orchestrator.run(CancellationToken::new()).await?;
//!     println!("Migrated {} records", report.summary.migrated_records);
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod config;
pub mod error;
pub mod mapper;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod migrator;
pub mod orchestrator;
pub mod source;
pub mod target;
pub mod validation;

// Re-exports for convenient access
pub use backup::{BackupInfo, BackupManager, BackupMetadata, RestoreReport};
pub use config::{Config, ConfigOverrides, MigrationConfig, SourceConfig, TargetConfig};
pub use error::{MigrateError, Result};
pub use mapper::{Entity, MappedRecord, MappingContext};
pub use migrator::{MigrationStatus, TableMigrationResult, TableMigrator};
pub use orchestrator::{MigrationReport, Orchestrator, PreflightReport};
pub use source::{MysqlSource, SourceReader, SourceRow, SourceValue};
pub use target::{PgTarget, TargetInspector, TargetRepository, TargetSet};
pub use validation::{ValidationEngine, ValidationReport};
