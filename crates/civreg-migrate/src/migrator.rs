//! Table migrator: moves one entity from a legacy table into the target.
//!
//! Batches are fetched by offset in primary key order and records are
//! processed one at a time. A bad record is counted and recorded, never
//! fatal. The table stops early on a connectivity failure, on cancellation
//! or when the source runs out of rows before the counted total.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MigrationConfig, SourceTable};
use crate::error::{MigrateError, Result};
use crate::mapper::{MappedRecord, MappingContext, MappingError};
use crate::source::{SourceReader, SourceRow};
use crate::target::{TargetRepository, UpsertOutcome};

/// Maximum error messages kept per table. `errorRecords` keeps the true count.
pub const MAX_ERROR_DETAILS: usize = 10;

/// Maximum length of a single error message, in characters.
const MAX_ERROR_LEN: usize = 200;

/// Outcome of one table migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Success,
    Partial,
    Failed,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MigrationStatus::Success => "success",
            MigrationStatus::Partial => "partial",
            MigrationStatus::Failed => "failed",
        })
    }
}

/// Counters and errors for one migrated table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMigrationResult {
    /// Target table name.
    pub table_name: String,

    /// Source row count at the start of the table.
    pub total_records: i64,

    /// Records created or updated in the target.
    pub migrated_records: i64,

    /// Records whose natural key already existed (with skip enabled).
    pub skipped_records: i64,

    /// Records that failed mapping or writing.
    pub error_records: i64,

    /// First [`MAX_ERROR_DETAILS`] error messages.
    pub errors: Vec<String>,

    pub duration_ms: u64,

    pub status: MigrationStatus,

    /// Set when the table stopped before reading every batch.
    #[serde(default)]
    pub aborted: bool,
}

impl TableMigrationResult {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            total_records: 0,
            migrated_records: 0,
            skipped_records: 0,
            error_records: 0,
            errors: Vec::new(),
            duration_ms: 0,
            status: MigrationStatus::Success,
            aborted: false,
        }
    }

    /// Record an error message, truncated and capped.
    pub fn push_error(&mut self, message: impl AsRef<str>) {
        if self.errors.len() >= MAX_ERROR_DETAILS {
            return;
        }
        let message = message.as_ref();
        let truncated = if message.chars().count() > MAX_ERROR_LEN {
            let head: String = message.chars().take(MAX_ERROR_LEN).collect();
            format!("{}...", head)
        } else {
            message.to_string()
        };
        self.errors.push(truncated);
    }

    /// Every counted record is migrated, skipped or an error.
    pub fn is_conserved(&self) -> bool {
        self.migrated_records + self.skipped_records + self.error_records == self.total_records
    }

    fn derive_status(&self) -> MigrationStatus {
        if self.aborted {
            // Stopped early: whatever landed is kept, the rest is missing
            return if self.migrated_records + self.skipped_records == 0 {
                MigrationStatus::Failed
            } else {
                MigrationStatus::Partial
            };
        }
        match (self.migrated_records, self.error_records) {
            (0, e) if e > 0 => MigrationStatus::Failed,
            (_, e) if e > 0 => MigrationStatus::Partial,
            _ => MigrationStatus::Success,
        }
    }

    fn finish(mut self, start: Instant) -> Self {
        self.duration_ms = start.elapsed().as_millis() as u64;
        self.status = self.derive_status();
        self
    }
}

enum RecordOutcome {
    Migrated,
    Skipped,
}

/// Migrates tables from one source reader.
///
/// Tables must be migrated parents first: the mapping context filled by
/// one table is what resolves legacy references in the next.
pub struct TableMigrator<'a> {
    source: &'a dyn SourceReader,
    batch_size: usize,
    skip_existing: bool,
    cancel: CancellationToken,
    context: Mutex<MappingContext>,
}

impl<'a> TableMigrator<'a> {
    pub fn new(
        source: &'a dyn SourceReader,
        config: &MigrationConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            batch_size: config.batch_size.max(1),
            skip_existing: config.skip_existing,
            cancel,
            context: Mutex::new(MappingContext::default()),
        }
    }

    fn context(&self) -> MutexGuard<'_, MappingContext> {
        self.context.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Migrate one entity. Never returns an error: every failure is
    /// reflected in the result's counters, errors and status.
    pub async fn migrate<R: MappedRecord>(
        &self,
        table: Option<&SourceTable>,
        target: &dyn TargetRepository<R>,
    ) -> TableMigrationResult {
        let start = Instant::now();
        let entity = R::ENTITY;
        let mut result = TableMigrationResult::new(entity.table_name());

        let Some(table) = table else {
            warn!("{}: no source table mapped, skipping", entity);
            result.push_error(format!("no source table mapped for {}", entity));
            result.aborted = true;
            return result.finish(start);
        };

        info!("{}: migrating from source table {}", entity, table.name);

        result.total_records = match self.source.count(table).await {
            Ok(n) => n,
            Err(e) => {
                warn!("{}: cannot count {}: {}", entity, table.name, e);
                result.push_error(format!("counting {}: {}", table.name, e));
                result.aborted = true;
                return result.finish(start);
            }
        };

        if result.total_records == 0 {
            info!("{}: source table {} is empty", entity, table.name);
            return result.finish(start);
        }

        let mut offset = 0usize;
        let mut position = 0usize;
        // Natural key -> position of the record that first used it
        let mut seen: HashMap<String, usize> = HashMap::new();

        'batches: while (offset as i64) < result.total_records {
            if self.cancel.is_cancelled() {
                warn!("{}: cancelled at offset {}", entity, offset);
                result.push_error(format!("cancelled at offset {}", offset));
                result.aborted = true;
                break;
            }

            let batch = match self.source.fetch(table, self.batch_size, offset).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("{}: batch at offset {} failed: {}", entity, offset, e);
                    result.push_error(format!("batch at offset {}: {}", offset, e));
                    result.aborted = true;
                    break;
                }
            };
            if batch.is_empty() {
                let missing = result.total_records - position as i64;
                warn!(
                    "{}: source ran out at offset {}, {} rows short of the count",
                    entity, offset, missing
                );
                result.push_error(format!(
                    "source returned {} fewer rows than counted (stopped at offset {})",
                    missing, offset
                ));
                result.aborted = true;
                break;
            }
            debug!(
                "{}: processing {} rows at offset {}",
                entity,
                batch.len(),
                offset
            );

            for row in &batch {
                position += 1;
                match self.migrate_record::<R>(row, position, &mut seen, target).await {
                    Ok(RecordOutcome::Migrated) => result.migrated_records += 1,
                    Ok(RecordOutcome::Skipped) => result.skipped_records += 1,
                    Err(e) if e.is_connectivity() => {
                        warn!("{}: target unavailable at record #{}: {}", entity, position, e);
                        result.push_error(format!("aborted at record #{}: {}", position, e));
                        result.aborted = true;
                        break 'batches;
                    }
                    Err(e) => {
                        let message = format!(
                            "record #{} ({}={}): {}",
                            position,
                            table.primary_key,
                            row.get(&table.primary_key),
                            e
                        );
                        warn!("{}: {}", entity, message);
                        result.error_records += 1;
                        result.push_error(message);
                    }
                }
            }

            offset += self.batch_size;
        }

        let result = result.finish(start);
        info!(
            "{}: {} migrated, {} skipped, {} errors of {} in {}ms ({})",
            entity,
            result.migrated_records,
            result.skipped_records,
            result.error_records,
            result.total_records,
            result.duration_ms,
            result.status
        );
        result
    }

    async fn migrate_record<R: MappedRecord>(
        &self,
        row: &SourceRow,
        position: usize,
        seen: &mut HashMap<String, usize>,
        target: &dyn TargetRepository<R>,
    ) -> Result<RecordOutcome> {
        let record = {
            let context = self.context();
            R::from_row(row, &context)?
        };
        let key = record.natural_key();

        // Normalized keys stay unique within one table run
        if let Some(first) = seen.get(key) {
            return Err(MappingError::invalid(
                R::ENTITY.natural_key_column(),
                format!("'{}' was already used by record #{} in this run", key, first),
            )
            .into());
        }

        let outcome = if self.skip_existing && target.exists(key).await? {
            RecordOutcome::Skipped
        } else {
            match target.upsert(key, &record).await? {
                UpsertOutcome::Created | UpsertOutcome::Updated => RecordOutcome::Migrated,
            }
        };

        seen.insert(key.to_string(), position);
        record.remember(row, &mut self.context());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{
        CitizenRecord, Entity, FamilyRecord, RoleRecord, SettingRecord, UserRecord,
    };
    use crate::memory::{MemorySource, MemoryTarget};

    const KK: &str = "3201010101010001";

    fn config(batch_size: usize, skip_existing: bool) -> MigrationConfig {
        MigrationConfig {
            batch_size,
            skip_existing,
            ..MigrationConfig::default()
        }
    }

    fn family_row(id: i64, kk: &str) -> SourceRow {
        SourceRow::new()
            .with("id", id)
            .with("no_kk", kk)
            .with("alamat", "Jl. Sudirman 5")
    }

    fn citizen_row(id: i64, nik: &str) -> SourceRow {
        SourceRow::new()
            .with("id", id)
            .with("nik", nik)
            .with("no_kk", KK)
            .with("nama", format!("Warga {}", id))
            .with("hubungan_keluarga", 4)
    }

    fn setting_row(id: i64, key: &str) -> SourceRow {
        SourceRow::new()
            .with("id", id)
            .with("nama_setting", key)
            .with("nilai", "1")
    }

    async fn target_with_family() -> MemoryTarget {
        let target = MemoryTarget::new();
        let source = MemorySource::new().with_table("tbl_families", vec![family_row(1, KK)]);
        let migrator = TableMigrator::new(&source, &config(10, false), CancellationToken::new());
        let result = migrator
            .migrate::<FamilyRecord>(Some(&SourceTable::new("tbl_families")), &target)
            .await;
        assert_eq!(result.status, MigrationStatus::Success);
        target
    }

    #[tokio::test]
    async fn test_unmapped_table_fails_with_single_error() {
        let source = MemorySource::new();
        let target = MemoryTarget::new();
        let migrator = TableMigrator::new(&source, &config(10, true), CancellationToken::new());

        let result = migrator.migrate::<SettingRecord>(None, &target).await;
        assert_eq!(result.status, MigrationStatus::Failed);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("no source table mapped"));
    }

    #[tokio::test]
    async fn test_empty_table_is_success_with_zero_counters() {
        let source = MemorySource::new().with_table("tbl_settings", vec![]);
        let target = MemoryTarget::new();
        let migrator = TableMigrator::new(&source, &config(10, true), CancellationToken::new());

        let result = migrator
            .migrate::<SettingRecord>(Some(&SourceTable::new("tbl_settings")), &target)
            .await;
        assert_eq!(result.status, MigrationStatus::Success);
        assert_eq!(result.total_records, 0);
        assert_eq!(result.migrated_records, 0);
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_national_id_is_isolated() {
        let target = target_with_family().await;
        let source = MemorySource::new().with_table(
            "tbl_citizens",
            vec![
                citizen_row(1, "3201010101900001"),
                citizen_row(2, "32010101"),
                citizen_row(3, "3201010101900003"),
            ],
        );
        let migrator = TableMigrator::new(&source, &config(10, false), CancellationToken::new());

        let result = migrator
            .migrate::<CitizenRecord>(Some(&SourceTable::new("tbl_citizens")), &target)
            .await;

        assert_eq!(result.total_records, 3);
        assert_eq!(result.migrated_records, 2);
        assert_eq!(result.skipped_records, 0);
        assert_eq!(result.error_records, 1);
        assert_eq!(result.status, MigrationStatus::Partial);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("record #2"), "{}", result.errors[0]);
        assert!(result.is_conserved());
    }

    #[tokio::test]
    async fn test_skip_existing_avoids_upserts() {
        let target = MemoryTarget::new();
        let source = MemorySource::new().with_table(
            "tbl_settings",
            vec![setting_row(1, "app_name"), setting_row(2, "village_code")],
        );
        let table = SourceTable::new("tbl_settings");
        let migrator = TableMigrator::new(&source, &config(1, true), CancellationToken::new());

        let first = migrator.migrate::<SettingRecord>(Some(&table), &target).await;
        assert_eq!(first.migrated_records, 2);
        let upserts = target.upsert_count();

        let second = migrator.migrate::<SettingRecord>(Some(&table), &target).await;
        assert_eq!(second.migrated_records, 0);
        assert_eq!(second.skipped_records, 2);
        assert_eq!(second.status, MigrationStatus::Success);
        assert_eq!(target.upsert_count(), upserts);
        assert_eq!(target.len(Entity::Settings), 2);
    }

    #[tokio::test]
    async fn test_error_list_is_capped_but_count_is_not() {
        let rows = (1..=25)
            .map(|i| SourceRow::new().with("id", i).with("nilai", "orphan value"))
            .collect();
        let source = MemorySource::new().with_table("tbl_settings", rows);
        let target = MemoryTarget::new();
        let migrator = TableMigrator::new(&source, &config(7, false), CancellationToken::new());

        let result = migrator
            .migrate::<SettingRecord>(Some(&SourceTable::new("tbl_settings")), &target)
            .await;
        assert_eq!(result.error_records, 25);
        assert_eq!(result.errors.len(), MAX_ERROR_DETAILS);
        assert_eq!(result.status, MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_counters() {
        let rows = (1..=6)
            .map(|i| setting_row(i, &format!("key_{}", i)))
            .collect();
        let source = MemorySource::new().with_table("tbl_settings", rows);
        source.fail_fetch_at("tbl_settings", 4);
        let target = MemoryTarget::new();
        let migrator = TableMigrator::new(&source, &config(2, false), CancellationToken::new());

        let result = migrator
            .migrate::<SettingRecord>(Some(&SourceTable::new("tbl_settings")), &target)
            .await;
        assert!(result.aborted);
        assert_eq!(result.migrated_records, 4);
        assert_eq!(result.status, MigrationStatus::Partial);
        assert!(result.errors[0].contains("offset 4"));
    }

    #[tokio::test]
    async fn test_offline_target_fails_table() {
        let source =
            MemorySource::new().with_table("tbl_settings", vec![setting_row(1, "a"), setting_row(2, "b")]);
        let target = MemoryTarget::new();
        target.set_offline(true);
        let migrator = TableMigrator::new(&source, &config(10, true), CancellationToken::new());

        let result = migrator
            .migrate::<SettingRecord>(Some(&SourceTable::new("tbl_settings")), &target)
            .await;
        assert_eq!(result.status, MigrationStatus::Failed);
        assert_eq!(result.error_records, 0);
        assert!(result.errors[0].contains("aborted at record #1"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let source = MemorySource::new().with_table("tbl_settings", vec![setting_row(1, "a")]);
        let target = MemoryTarget::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let migrator = TableMigrator::new(&source, &config(10, true), cancel);

        let result = migrator
            .migrate::<SettingRecord>(Some(&SourceTable::new("tbl_settings")), &target)
            .await;
        assert!(result.aborted);
        assert_eq!(result.status, MigrationStatus::Failed);
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_between_batches_keeps_first_batch() {
        let rows = (1..=6)
            .map(|i| setting_row(i, &format!("key_{}", i)))
            .collect();
        let source = MemorySource::new().with_table("tbl_settings", rows);
        let cancel = CancellationToken::new();
        source.cancel_after_fetch("tbl_settings", cancel.clone());
        let target = MemoryTarget::new();
        let migrator = TableMigrator::new(&source, &config(2, false), cancel);

        let result = migrator
            .migrate::<SettingRecord>(Some(&SourceTable::new("tbl_settings")), &target)
            .await;
        assert!(result.aborted);
        assert_eq!(result.migrated_records, 2);
        assert_eq!(result.status, MigrationStatus::Partial);
        assert_eq!(source.fetch_count(), 1);
        assert!(result.errors[0].contains("cancelled at offset 2"), "{:?}", result.errors);
        assert_eq!(target.len(Entity::Settings), 2);
    }

    #[tokio::test]
    async fn test_source_shorter_than_count_is_aborted() {
        let rows = (1..=3)
            .map(|i| setting_row(i, &format!("key_{}", i)))
            .collect();
        let source = MemorySource::new().with_table("tbl_settings", rows);
        source.overcount("tbl_settings", 3);
        let target = MemoryTarget::new();
        let migrator = TableMigrator::new(&source, &config(2, false), CancellationToken::new());

        let result = migrator
            .migrate::<SettingRecord>(Some(&SourceTable::new("tbl_settings")), &target)
            .await;
        assert_eq!(result.total_records, 6);
        assert_eq!(result.migrated_records, 3);
        assert!(result.aborted);
        assert_eq!(result.status, MigrationStatus::Partial);
        assert!(!result.is_conserved());
        assert!(
            result.errors[0].contains("3 fewer rows than counted"),
            "{:?}",
            result.errors
        );
    }

    #[tokio::test]
    async fn test_duplicate_natural_key_is_a_record_error() {
        let source = MemorySource::new().with_table(
            "tbl_settings",
            vec![
                setting_row(1, "Nama Desa"),
                setting_row(2, "kode_desa"),
                setting_row(3, "nama_desa"),
            ],
        );
        let target = MemoryTarget::new();
        let migrator = TableMigrator::new(&source, &config(10, false), CancellationToken::new());

        let result = migrator
            .migrate::<SettingRecord>(Some(&SourceTable::new("tbl_settings")), &target)
            .await;
        assert_eq!(result.migrated_records, 2);
        assert_eq!(result.error_records, 1);
        assert_eq!(result.status, MigrationStatus::Partial);
        assert!(result.is_conserved());
        assert!(result.errors[0].starts_with("record #3"), "{}", result.errors[0]);
        assert!(result.errors[0].contains("already used by record #1"));
        assert_eq!(target.len(Entity::Settings), 2);
        assert_eq!(target.upsert_count(), 2);
    }

    #[tokio::test]
    async fn test_users_resolve_roles_migrated_earlier() {
        let source = MemorySource::new()
            .with_table(
                "tbl_level",
                vec![
                    SourceRow::new().with("id_level", 1).with("nama_level", "Administrator"),
                    SourceRow::new().with("id_level", 4).with("nama_level", "Kepala Desa"),
                ],
            )
            .with_table(
                "tbl_user",
                vec![
                    SourceRow::new().with("id", 1).with("username", "admin").with("id_level", 1),
                    SourceRow::new().with("id", 2).with("username", "kades").with("id_level", 4),
                    SourceRow::new().with("id", 3).with("username", "tamu").with("id_level", 3),
                ],
            );
        let target = MemoryTarget::new();
        let migrator = TableMigrator::new(&source, &config(10, false), CancellationToken::new());

        let levels = SourceTable {
            name: "tbl_level".to_string(),
            primary_key: "id_level".to_string(),
        };
        let roles = migrator.migrate::<RoleRecord>(Some(&levels), &target).await;
        assert_eq!(roles.status, MigrationStatus::Success);

        let users = migrator
            .migrate::<UserRecord>(Some(&SourceTable::new("tbl_user")), &target)
            .await;
        assert_eq!(users.migrated_records, 2);
        assert_eq!(users.error_records, 1);
        assert!(users.errors[0].contains("legacy id 3"), "{:?}", users.errors);
        let kades: UserRecord = target.get("kades").unwrap();
        assert_eq!(kades.role_name, "kepala desa");
    }

    #[test]
    fn test_long_errors_are_truncated() {
        let mut result = TableMigrationResult::new("citizens");
        result.push_error("x".repeat(500));
        assert_eq!(result.errors[0].chars().count(), MAX_ERROR_LEN + 3);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let json = serde_json::to_value(TableMigrationResult::new("roles")).unwrap();
        assert!(json.get("tableName").is_some());
        assert!(json.get("errorRecords").is_some());
        assert_eq!(json["status"], "success");
    }
}
