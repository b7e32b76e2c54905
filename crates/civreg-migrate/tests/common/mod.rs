//! Shared fixtures for the pipeline and backup tests.

#![allow(dead_code)]

use std::sync::Arc;

use civreg_migrate::backup::BackupManager;
use civreg_migrate::memory::{MemoryDumpTool, MemorySource, MemoryTarget};
use civreg_migrate::{Config, Orchestrator, SourceRow, TargetSet};

/// Sixteen-digit family number for family `n`.
pub fn family_number(n: i64) -> String {
    format!("32010101010{:05}", n)
}

/// Sixteen-digit national ID for citizen `n`.
pub fn national_id(n: i64) -> String {
    format!("32010141048{:05}", n)
}

pub fn role_row(id: i64, name: &str) -> SourceRow {
    SourceRow::new().with("id", id).with("nama_level", name)
}

pub fn user_row(id: i64, username: &str, level: i64) -> SourceRow {
    SourceRow::new()
        .with("id", id)
        .with("username", username)
        .with("nama_lengkap", format!("Petugas {}", id))
        .with("id_level", level)
}

pub fn family_row(id: i64) -> SourceRow {
    SourceRow::new()
        .with("id", id)
        .with("no_kk", family_number(id))
        .with("alamat", format!("Jl. Melati {}", id))
        .with("rt", "003")
        .with("rw", "007")
}

/// Citizen `id` in family `family`; the first member of each family is its head.
pub fn citizen_row(id: i64, family: i64, head: bool) -> SourceRow {
    SourceRow::new()
        .with("id", id)
        .with("nik", national_id(id))
        .with("no_kk", family_number(family))
        .with("nama", format!("Warga {}", id))
        .with("jenis_kelamin", if id % 2 == 0 { 2 } else { 1 })
        .with("hubungan_keluarga", if head { 1 } else { 4 })
}

pub fn setting_row(id: i64, key: &str, value: &str) -> SourceRow {
    SourceRow::new()
        .with("id", id)
        .with("nama_setting", key)
        .with("nilai", value)
}

/// A small but complete legacy database: 2 roles, 2 users, `families`
/// families with `per_family` members each, and 2 settings.
pub fn legacy_source(families: i64, per_family: i64) -> MemorySource {
    let mut citizens = Vec::new();
    for f in 1..=families {
        for m in 0..per_family {
            let id = (f - 1) * per_family + m + 1;
            citizens.push(citizen_row(id, f, m == 0));
        }
    }

    MemorySource::new()
        .with_table(
            "tbl_roles",
            vec![role_row(1, "Administrator"), role_row(4, "Kepala Desa")],
        )
        .with_table(
            "tbl_users",
            vec![user_row(1, "Admin.Desa", 1), user_row(2, "kades", 4)],
        )
        .with_table("tbl_families", (1..=families).map(family_row).collect())
        .with_table("tbl_citizens", citizens)
        .with_table(
            "tbl_settings",
            vec![
                setting_row(1, "nama_desa", "Sukamaju"),
                setting_row(2, "kode_desa", "3201010001"),
            ],
        )
}

pub fn config(batch_size: usize, skip_existing: bool) -> Config {
    let mut config = Config::default();
    config.migration.batch_size = batch_size;
    config.migration.skip_existing = skip_existing;
    config.migration.validate_data = true;
    config.migration.create_backup = false;
    config
}

pub fn orchestrator(
    source: Arc<MemorySource>,
    target: Arc<MemoryTarget>,
    config: Config,
) -> Orchestrator {
    Orchestrator::new(
        config,
        source,
        TargetSet::from_backend(target.clone()),
        target,
    )
}

/// Backup manager over an in-memory target, plus the dump tool so tests can
/// observe restores.
pub fn backup_manager(
    dir: &std::path::Path,
    target: &Arc<MemoryTarget>,
) -> (BackupManager, Arc<MemoryDumpTool>) {
    let tool = Arc::new(MemoryDumpTool::new(target.clone()));
    let manager = BackupManager::new(dir, tool.clone(), target.clone());
    (manager, tool)
}
