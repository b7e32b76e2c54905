//! Backup manager: checksummed full dumps of the target database.
//!
//! Each backup is two files in the backup directory:
//!
//! - `<id>.sql`: the dump produced by a [`DumpTool`]
//! - `<id>.sql.metadata.json`: [`BackupMetadata`] (the [`BackupInfo`] plus a
//!   description)
//!
//! The metadata file is what makes a backup visible. It is written last on
//! create and removed first on delete, so a listing never points at a
//! missing dump. Every operation appends one line to `backup-log.jsonl`.

mod dump;

pub use dump::{DumpTool, PgDumpTool};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{MigrateError, Result};
use crate::target::TargetInspector;

const METADATA_SUFFIX: &str = ".sql.metadata.json";
const LOG_FILE: &str = "backup-log.jsonl";

/// A persisted backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub id: String,
    pub filepath: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub tables: Vec<String>,
    pub record_counts: BTreeMap<String, i64>,
    /// SHA-256 of the dump file, lowercase hex.
    pub checksum: String,
}

/// Sidecar metadata file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    #[serde(flatten)]
    pub info: BackupInfo,
    #[serde(default)]
    pub description: String,
    /// Set when this backup was taken as an incremental of another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backup_id: Option<String>,
}

/// Outcome of a completed restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub backup_id: String,
    /// Tables whose row count after restore differs from the backup.
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry<'a> {
    timestamp: DateTime<Utc>,
    action: &'a str,
    backup_id: &'a str,
    outcome: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Creates, verifies, restores and deletes target database backups.
pub struct BackupManager {
    dir: PathBuf,
    dump: Arc<dyn DumpTool>,
    inspector: Arc<dyn TargetInspector>,
}

impl BackupManager {
    pub fn new(
        dir: impl Into<PathBuf>,
        dump: Arc<dyn DumpTool>,
        inspector: Arc<dyn TargetInspector>,
    ) -> Self {
        Self {
            dir: dir.into(),
            dump,
            inspector,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take a full dump of the target.
    pub async fn create_backup(&self, description: &str) -> Result<BackupInfo> {
        let id = new_backup_id(Utc::now());
        let result = self.create_full(&id, description, None).await;
        self.log_result("create", &id, &result).await;
        result
    }

    /// Verify and replay a backup. A checksum mismatch aborts before the
    /// target is touched; row count differences afterwards are warnings.
    pub async fn restore_backup(&self, id: &str) -> Result<RestoreReport> {
        let result = self.restore(id).await;
        self.log_result("restore", id, &result).await;
        result
    }

    /// All backups with a readable metadata file and an existing dump,
    /// newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(METADATA_SUFFIX) {
                continue;
            }
            let metadata = match read_metadata(&entry.path()).await {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping unreadable backup metadata {}: {}", name, e);
                    continue;
                }
            };
            if !tokio::fs::try_exists(&metadata.info.filepath)
                .await
                .unwrap_or(false)
            {
                debug!("Skipping {}: dump file is missing", metadata.info.id);
                continue;
            }
            backups.push(metadata.info);
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Metadata for one backup.
    pub async fn get_backup(&self, id: &str) -> Result<BackupMetadata> {
        let path = self.metadata_path(id)?;
        match read_metadata(&path).await {
            Err(MigrateError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MigrateError::BackupNotFound(id.to_string()))
            }
            other => other,
        }
    }

    /// Remove a backup's metadata, then its dump.
    pub async fn delete_backup(&self, id: &str) -> Result<()> {
        let result = self.delete(id).await;
        self.log_result("delete", id, &result).await;
        result
    }

    /// Take a new backup only if some table's row count changed since
    /// `base_id`; otherwise return the base backup.
    ///
    /// Row counts are the only change signal, so a table whose rows were
    /// replaced one-for-one reads as unchanged.
    pub async fn create_incremental_backup(&self, base_id: &str) -> Result<BackupInfo> {
        let base = self.get_backup(base_id).await?;
        let current = self.inspector.table_counts().await?;
        let changed = changed_tables(&base.info.record_counts, &current);

        if changed.is_empty() {
            info!(
                "No row count changes since {}; reusing existing backup",
                base_id
            );
            self.append_log(LogEntry {
                timestamp: Utc::now(),
                action: "incremental",
                backup_id: base_id,
                outcome: "unchanged",
                detail: None,
            })
            .await;
            return Ok(base.info);
        }

        info!("Tables changed since {}: {}", base_id, changed.join(", "));
        let id = new_backup_id(Utc::now());
        let description = format!("Incremental backup based on {}", base_id);
        let result = self.create_full(&id, &description, Some(base_id)).await;
        self.log_result("incremental", &id, &result).await;
        result
    }

    async fn create_full(
        &self,
        id: &str,
        description: &str,
        base_backup_id: Option<&str>,
    ) -> Result<BackupInfo> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let dump_path = self.dir.join(format!("{}.sql", id));

        info!("Creating backup {} with {}", id, self.dump.name());
        let record_counts = self.inspector.table_counts().await?;

        if let Err(e) = self.dump.dump(&dump_path).await {
            // Never leave a half-written dump behind
            let _ = tokio::fs::remove_file(&dump_path).await;
            return Err(e);
        }

        let (checksum, size_bytes) = file_checksum(&dump_path).await?;
        let info = BackupInfo {
            id: id.to_string(),
            filepath: dump_path,
            size_bytes,
            created_at: Utc::now(),
            tables: record_counts.keys().cloned().collect(),
            record_counts,
            checksum,
        };
        let metadata = BackupMetadata {
            info,
            description: description.to_string(),
            base_backup_id: base_backup_id.map(str::to_string),
        };
        self.write_metadata(&metadata).await?;

        info!(
            "Backup {} created: {} bytes, {} tables, sha256 {}",
            id,
            metadata.info.size_bytes,
            metadata.info.tables.len(),
            metadata.info.checksum
        );
        Ok(metadata.info)
    }

    async fn restore(&self, id: &str) -> Result<RestoreReport> {
        let metadata = self.get_backup(id).await?;
        let info = metadata.info;

        if !tokio::fs::try_exists(&info.filepath).await.unwrap_or(false) {
            return Err(MigrateError::Backup(format!(
                "dump file {} for backup {} is missing",
                info.filepath.display(),
                id
            )));
        }

        let (actual, _) = file_checksum(&info.filepath).await?;
        if actual != info.checksum {
            warn!("Backup {} failed checksum verification; not restoring", id);
            return Err(MigrateError::ChecksumMismatch {
                expected: info.checksum,
                actual,
            });
        }

        info!("Restoring backup {} with {}", id, self.dump.name());
        self.dump.restore(&info.filepath).await?;

        let current = self.inspector.table_counts().await?;
        let mut warnings = Vec::new();
        for (table, expected) in &info.record_counts {
            match current.get(table) {
                Some(actual) if actual == expected => {}
                Some(actual) => warnings.push(format!(
                    "{}: expected {} rows after restore, found {}",
                    table, expected, actual
                )),
                None => warnings.push(format!("{}: table missing after restore", table)),
            }
        }
        for warning in &warnings {
            warn!("Restore {}: {}", id, warning);
        }

        info!("Backup {} restored ({} warnings)", id, warnings.len());
        Ok(RestoreReport {
            backup_id: id.to_string(),
            warnings,
        })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let metadata = self.get_backup(id).await?;

        tokio::fs::remove_file(self.metadata_path(id)?).await?;
        match tokio::fs::remove_file(&metadata.info.filepath).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Dump for {} was already gone", id);
            }
            Err(e) => return Err(e.into()),
        }

        info!("Backup {} deleted", id);
        Ok(())
    }

    fn metadata_path(&self, id: &str) -> Result<PathBuf> {
        // Ids come from the command line; keep them inside the backup dir
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(MigrateError::BackupNotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{}{}", id, METADATA_SUFFIX)))
    }

    async fn write_metadata(&self, metadata: &BackupMetadata) -> Result<()> {
        let path = self.metadata_path(&metadata.info.id)?;
        let json = serde_json::to_vec_pretty(metadata)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn log_result<T>(&self, action: &str, id: &str, result: &Result<T>) {
        let (outcome, detail) = match result {
            Ok(_) => ("success", None),
            Err(e) => ("failed", Some(e.to_string())),
        };
        self.append_log(LogEntry {
            timestamp: Utc::now(),
            action,
            backup_id: id,
            outcome,
            detail,
        })
        .await;
    }

    async fn append_log(&self, entry: LogEntry<'_>) {
        if let Err(e) = self.try_append_log(&entry).await {
            warn!("Could not write backup log: {}", e);
        }
    }

    async fn try_append_log(&self, entry: &LogEntry<'_>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// `backup-<YYYYMMDD-HHMMSS>-<8 hex>`.
fn new_backup_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("backup-{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

async fn read_metadata(path: &Path) -> Result<BackupMetadata> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// SHA-256 (lowercase hex) and size of a file, streamed.
pub async fn file_checksum(path: &Path) -> Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Tables whose count differs, including tables added or dropped.
fn changed_tables(base: &BTreeMap<String, i64>, current: &BTreeMap<String, i64>) -> Vec<String> {
    let names: BTreeSet<&String> = base.keys().chain(current.keys()).collect();
    names
        .into_iter()
        .filter(|name| base.get(*name) != current.get(*name))
        .cloned()
        .collect()
}
