//! Configuration type definitions.

use crate::mapper::Entity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Legacy source database (MySQL).
    #[serde(default)]
    pub source: SourceConfig,

    /// New target database (PostgreSQL).
    #[serde(default)]
    pub target: TargetConfig,

    /// Migration behavior.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Backup artifacts and dump tooling.
    #[serde(default)]
    pub backup: BackupConfig,

    /// Migration report output.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Legacy table backing one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTable {
    /// Table name in the source database.
    pub name: String,

    /// Stable ordering column for deterministic pagination (default: "id").
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
}

impl SourceTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: default_primary_key(),
        }
    }
}

/// Source database (MySQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type (always "mysql" for now).
    #[serde(default = "default_mysql")]
    pub r#type: String,

    /// Database host.
    #[serde(default = "default_localhost")]
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database name.
    #[serde(default)]
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Legacy table per entity. An entity missing from this map cannot be
    /// migrated and is reported as failed.
    #[serde(default = "default_source_tables")]
    pub tables: BTreeMap<Entity, SourceTable>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            r#type: default_mysql(),
            host: default_localhost(),
            port: default_mysql_port(),
            database: String::new(),
            user: String::new(),
            password: String::new(),
            max_connections: default_max_connections(),
            tables: default_source_tables(),
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("tables", &self.tables)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Connection string, URL (`postgres://…`) or key-value form.
    #[serde(default)]
    pub url: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: disable).
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ssl_mode: default_disable(),
            max_connections: default_max_connections(),
        }
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("url", &redact_connection_string(&self.url))
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Mask the password in a PostgreSQL connection string.
pub fn redact_connection_string(conn: &str) -> String {
    if let Some(scheme_end) = conn.find("://") {
        let rest = &conn[scheme_end + 3..];
        if let Some(at) = rest.rfind('@') {
            let userinfo = &rest[..at];
            if let Some(colon) = userinfo.find(':') {
                return format!(
                    "{}{}:[REDACTED]{}",
                    &conn[..scheme_end + 3],
                    &userinfo[..colon],
                    &rest[at..]
                );
            }
        }
        return conn.to_string();
    }

    conn.split_whitespace()
        .map(|part| {
            if part.to_lowercase().starts_with("password=") {
                "password=[REDACTED]".to_string()
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Migration behavior configuration. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Records fetched and processed per iteration (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Skip records whose natural key already exists in the target (default: true).
    #[serde(default = "default_true")]
    pub skip_existing: bool,

    /// Run the integrity scan after migration (default: true).
    #[serde(default = "default_true")]
    pub validate_data: bool,

    /// Snapshot the target before writing (default: false).
    #[serde(default)]
    pub create_backup: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            skip_existing: true,
            validate_data: true,
            create_backup: false,
        }
    }
}

/// Backup artifact and dump tool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding dumps, sidecar metadata and the backup log.
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,

    /// `pg_dump` executable.
    #[serde(default = "default_pg_dump")]
    pub pg_dump_path: String,

    /// `psql` executable used to replay dumps.
    #[serde(default = "default_psql")]
    pub psql_path: String,

    /// Time limit for a single dump or restore subprocess (default: 600s).
    #[serde(default = "default_backup_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            pg_dump_path: default_pg_dump(),
            psql_path: default_psql(),
            timeout_secs: default_backup_timeout(),
        }
    }
}

/// Migration report output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Directory the JSON report is written to (default: "logs").
    #[serde(default = "default_report_dir")]
    pub dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: default_report_dir(),
        }
    }
}

// Default value functions for serde
fn default_mysql() -> String {
    "mysql".to_string()
}

fn default_localhost() -> String {
    "localhost".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_max_connections() -> u32 {
    4
}

fn default_primary_key() -> String {
    "id".to_string()
}

pub(crate) fn default_source_tables() -> BTreeMap<Entity, SourceTable> {
    Entity::MIGRATION_ORDER
        .iter()
        .map(|e| (*e, SourceTable::new(e.default_source_table())))
        .collect()
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_pg_dump() -> String {
    "pg_dump".to_string()
}

fn default_psql() -> String {
    "psql".to_string()
}

fn default_backup_timeout() -> u64 {
    600
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("logs")
}
