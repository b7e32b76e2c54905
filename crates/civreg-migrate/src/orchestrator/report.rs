//! Migration, preflight and count-comparison reports.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::overall_status;
use crate::backup::BackupInfo;
use crate::error::Result;
use crate::mapper::Entity;
use crate::migrator::{MigrationStatus, TableMigrationResult};
use crate::validation::ValidationReport;

/// Totals across all table results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub total_tables: usize,
    pub successful_tables: usize,
    pub partial_tables: usize,
    pub failed_tables: usize,
    pub total_records: i64,
    pub migrated_records: i64,
    pub skipped_records: i64,
    pub error_records: i64,
}

impl MigrationSummary {
    fn from_results(results: &[TableMigrationResult]) -> Self {
        let mut summary = Self {
            total_tables: results.len(),
            ..Self::default()
        };
        for r in results {
            match r.status {
                MigrationStatus::Success => summary.successful_tables += 1,
                MigrationStatus::Partial => summary.partial_tables += 1,
                MigrationStatus::Failed => summary.failed_tables += 1,
            }
            summary.total_records += r.total_records;
            summary.migrated_records += r.migrated_records;
            summary.skipped_records += r.skipped_records;
            summary.error_records += r.error_records;
        }
        summary
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,

    pub start_time: DateTime<Utc>,

    pub end_time: DateTime<Utc>,

    pub total_duration_ms: u64,

    /// One entry per table attempted, in migration order.
    pub results: Vec<TableMigrationResult>,

    pub overall_status: MigrationStatus,

    pub summary: MigrationSummary,

    /// SHA-256 of the configuration used.
    pub config_hash: String,

    /// Set when the run stopped on a cancellation request.
    pub cancelled: bool,

    /// Backup taken before the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupInfo>,

    /// Post-run validation findings, if validation ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

impl MigrationReport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: String,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        results: Vec<TableMigrationResult>,
        config_hash: String,
        cancelled: bool,
        backup: Option<BackupInfo>,
        validation: Option<ValidationReport>,
    ) -> Self {
        let mut status = overall_status(&results);
        if cancelled && status == MigrationStatus::Success {
            status = MigrationStatus::Partial;
        }
        let total_duration_ms = (end_time - start_time).num_milliseconds().max(0) as u64;

        Self {
            run_id,
            start_time,
            end_time,
            total_duration_ms,
            summary: MigrationSummary::from_results(&results),
            results,
            overall_status: status,
            config_hash,
            cancelled,
            backup,
            validation,
        }
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Report file name, stamped with the run start time and the head of
    /// the run id so runs started within the same second stay apart.
    pub fn file_name(&self) -> String {
        let run: String = self
            .run_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .take(8)
            .collect();
        format!(
            "migration-report-{}-{}.json",
            self.start_time.format("%Y%m%d-%H%M%S"),
            run
        )
    }

    /// Write the report into `dir`, creating it if needed.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, self.to_json()?)?;
        std::fs::rename(&temp_path, &path)?;

        info!("Migration report written to {}", path.display());
        Ok(path)
    }

    /// Process exit code: zero only for a fully successful run.
    pub fn exit_code(&self) -> u8 {
        if self.cancelled {
            return 130;
        }
        match self.overall_status {
            MigrationStatus::Success => 0,
            MigrationStatus::Partial | MigrationStatus::Failed => 1,
        }
    }
}

/// Preflight result for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightCheck {
    pub entity: Entity,
    pub source_table: Option<String>,
    pub source_count: Option<i64>,
    pub issue: Option<String>,
}

/// Source-side readiness across all entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub ok: bool,
    pub checks: Vec<PreflightCheck>,
}

impl PreflightReport {
    pub fn new(checks: Vec<PreflightCheck>) -> Self {
        Self {
            ok: checks.iter().all(|c| c.issue.is_none()),
            checks,
        }
    }
}

/// Source and target row counts for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountComparison {
    pub entity: Entity,
    pub source_count: i64,
    pub target_count: i64,
    pub matches: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, status: MigrationStatus, migrated: i64, errors: i64) -> TableMigrationResult {
        let mut r = TableMigrationResult::new(name);
        r.total_records = migrated + errors;
        r.migrated_records = migrated;
        r.error_records = errors;
        r.status = status;
        r
    }

    fn report(results: Vec<TableMigrationResult>, cancelled: bool) -> MigrationReport {
        let start = DateTime::parse_from_rfc3339("2024-06-01T10:20:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let end = start + chrono::Duration::milliseconds(1500);
        MigrationReport::new(
            "run-1".into(),
            start,
            end,
            results,
            "hash".into(),
            cancelled,
            None,
            None,
        )
    }

    #[test]
    fn test_summary_sums_results() {
        let r = report(
            vec![
                result("roles", MigrationStatus::Success, 3, 0),
                result("citizens", MigrationStatus::Partial, 2, 1),
            ],
            false,
        );
        assert_eq!(r.total_duration_ms, 1500);
        assert_eq!(r.summary.total_tables, 2);
        assert_eq!(r.summary.migrated_records, 5);
        assert_eq!(r.summary.error_records, 1);
        assert_eq!(r.summary.partial_tables, 1);
        assert_eq!(r.overall_status, MigrationStatus::Partial);
        assert_eq!(r.exit_code(), 1);
    }

    #[test]
    fn test_cancelled_success_is_downgraded() {
        let r = report(vec![result("roles", MigrationStatus::Success, 1, 0)], true);
        assert_eq!(r.overall_status, MigrationStatus::Partial);
        assert_eq!(r.exit_code(), 130);
    }

    #[test]
    fn test_write_to_dir_uses_timestamped_name() {
        let dir = tempfile::tempdir().unwrap();
        let r = report(vec![], false);
        let path = r.write_to_dir(&dir.path().join("logs")).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "migration-report-20240601-102030-run-1.json"
        );

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["overallStatus"], "success");
        assert_eq!(json["runId"], "run-1");
        assert!(json.get("backup").is_none());
        assert!(!dir
            .path()
            .join("logs/migration-report-20240601-102030-run-1.tmp")
            .exists());
    }

    #[test]
    fn test_runs_in_the_same_second_keep_separate_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = report(vec![], false);
        first.run_id = "3f2b8c1e-0d4a-4c55-9a61-1b2c3d4e5f60".into();
        let mut second = report(vec![], true);
        second.run_id = "a9e07d52-77c1-4f0e-8b3a-6d5e4f3a2b10".into();

        let a = first.write_to_dir(dir.path()).unwrap();
        let b = second.write_to_dir(dir.path()).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            a.file_name().unwrap().to_str().unwrap(),
            "migration-report-20240601-102030-3f2b8c1e.json"
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
