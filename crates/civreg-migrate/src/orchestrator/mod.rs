//! Migration orchestrator - main workflow coordinator.

mod report;

pub use report::{CountComparison, MigrationReport, MigrationSummary, PreflightCheck, PreflightReport};

use crate::backup::{BackupManager, PgDumpTool};
use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::mapper::{CitizenRecord, Entity, FamilyRecord, RoleRecord, SettingRecord, UserRecord};
use crate::migrator::{MigrationStatus, TableMigrationResult, TableMigrator};
use crate::source::{MysqlSource, SourceReader};
use crate::target::{PgTarget, TargetInspector, TargetSet};
use crate::validation::{ValidationEngine, ValidationReport};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceReader>,
    targets: TargetSet,
    inspector: Arc<dyn TargetInspector>,
    backup: Option<BackupManager>,
}

impl Orchestrator {
    /// Create an orchestrator over already-connected collaborators.
    pub fn new(
        config: Config,
        source: Arc<dyn SourceReader>,
        targets: TargetSet,
        inspector: Arc<dyn TargetInspector>,
    ) -> Self {
        Self {
            config,
            source,
            targets,
            inspector,
            backup: None,
        }
    }

    /// Attach a backup manager, used when `create_backup` is enabled.
    pub fn with_backup_manager(mut self, manager: BackupManager) -> Self {
        self.backup = Some(manager);
        self
    }

    /// Connect to the MySQL source and PostgreSQL target described by the
    /// configuration, with `pg_dump` backups.
    pub async fn connect(config: Config) -> Result<Self> {
        let source = MysqlSource::connect(&config.source).await?;
        let target = Arc::new(PgTarget::connect(&config.target).await?);

        let dump = PgDumpTool::new(&config.backup, &config.target)?;
        let backup = BackupManager::new(&config.backup.dir, Arc::new(dump), target.clone());

        Ok(Self::new(
            config,
            Arc::new(source),
            TargetSet::from_backend(target.clone()),
            target,
        )
        .with_backup_manager(backup))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backup_manager(&self) -> Option<&BackupManager> {
        self.backup.as_ref()
    }

    /// Run the migration.
    ///
    /// Tables are migrated one at a time in dependency order; a failed
    /// table never stops the ones after it. Only a failed pre-migration
    /// backup aborts the run, since nothing has been written yet.
    pub async fn run(&self, cancel: CancellationToken) -> Result<MigrationReport> {
        let start_time = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting migration run: {}", run_id);

        // Phase 1: Safety net
        let backup = if self.config.migration.create_backup {
            info!("Phase 1: Backing up target database");
            let manager = self.backup.as_ref().ok_or_else(|| {
                MigrateError::Config(
                    "create_backup is enabled but no backup manager is configured".into(),
                )
            })?;
            Some(
                manager
                    .create_backup(&format!("Pre-migration backup for run {}", run_id))
                    .await?,
            )
        } else {
            None
        };

        // Phase 2: Transfer
        info!(
            "Phase 2: Migrating {} tables (batch size {}, skip existing: {})",
            Entity::MIGRATION_ORDER.len(),
            self.config.migration.batch_size,
            self.config.migration.skip_existing
        );
        let migrator = TableMigrator::new(
            self.source.as_ref(),
            &self.config.migration,
            cancel.clone(),
        );
        let mut results = Vec::with_capacity(Entity::MIGRATION_ORDER.len());
        for entity in Entity::MIGRATION_ORDER {
            if cancel.is_cancelled() {
                warn!("Migration cancelled before {}", entity);
                break;
            }
            results.push(self.migrate_entity(&migrator, entity).await);
        }
        let cancelled = cancel.is_cancelled();

        // Phase 3: Validation
        let validation = if self.config.migration.validate_data && !cancelled {
            info!("Phase 3: Validating target data");
            Some(self.validate().await.unwrap_or_else(|e| {
                warn!("Validation could not run: {}", e);
                ValidationReport {
                    checked_at: Utc::now(),
                    issues: vec![format!("validation could not run: {}", e)],
                    entity_counts: Default::default(),
                }
            }))
        } else {
            None
        };

        let end_time = Utc::now();
        let report = MigrationReport::new(
            run_id,
            start_time,
            end_time,
            results,
            self.config.hash(),
            cancelled,
            backup,
            validation,
        );

        info!(
            "Migration {}: {} migrated, {} skipped, {} errors across {} tables in {}ms",
            report.overall_status,
            report.summary.migrated_records,
            report.summary.skipped_records,
            report.summary.error_records,
            report.summary.total_tables,
            report.total_duration_ms
        );
        Ok(report)
    }

    async fn migrate_entity(
        &self,
        migrator: &TableMigrator<'_>,
        entity: Entity,
    ) -> TableMigrationResult {
        let table = self.config.source.tables.get(&entity);
        let t = &self.targets;
        match entity {
            Entity::Roles => migrator.migrate::<RoleRecord>(table, t.roles.as_ref()).await,
            Entity::Users => migrator.migrate::<UserRecord>(table, t.users.as_ref()).await,
            Entity::Families => migrator.migrate::<FamilyRecord>(table, t.families.as_ref()).await,
            Entity::Citizens => migrator.migrate::<CitizenRecord>(table, t.citizens.as_ref()).await,
            Entity::Settings => migrator.migrate::<SettingRecord>(table, t.settings.as_ref()).await,
        }
    }

    async fn target_count(&self, entity: Entity) -> Result<i64> {
        let t = &self.targets;
        match entity {
            Entity::Roles => t.roles.count().await,
            Entity::Users => t.users.count().await,
            Entity::Families => t.families.count().await,
            Entity::Citizens => t.citizens.count().await,
            Entity::Settings => t.settings.count().await,
        }
    }

    /// Check every entity's source mapping and row count without writing.
    pub async fn pre_validate(&self) -> PreflightReport {
        let mut checks = Vec::new();
        for entity in Entity::MIGRATION_ORDER {
            let mut check = PreflightCheck {
                entity,
                source_table: None,
                source_count: None,
                issue: None,
            };
            match self.config.source.tables.get(&entity) {
                None => {
                    warn!("{}: no source table mapped", entity);
                    check.issue = Some(format!("no source table mapped for {}", entity));
                }
                Some(table) => {
                    check.source_table = Some(table.name.clone());
                    match self.source.count(table).await {
                        Ok(n) => {
                            info!("{}: {} rows in {}", entity, n, table.name);
                            check.source_count = Some(n);
                        }
                        Err(e) => {
                            warn!("{}: cannot read {}: {}", entity, table.name, e);
                            check.issue = Some(format!("cannot read {}: {}", table.name, e));
                        }
                    }
                }
            }
            checks.push(check);
        }
        PreflightReport::new(checks)
    }

    /// Compare source and target row counts per mapped entity.
    pub async fn compare_counts(&self) -> Result<Vec<CountComparison>> {
        let mut results = Vec::new();
        for entity in Entity::MIGRATION_ORDER {
            let Some(table) = self.config.source.tables.get(&entity) else {
                continue;
            };
            let source_count = self.source.count(table).await?;
            let target_count = self.target_count(entity).await?;

            let matches = source_count == target_count;
            if matches {
                info!("{}: {} rows (match)", entity, source_count);
            } else {
                warn!(
                    "{}: source={} target={} (MISMATCH)",
                    entity, source_count, target_count
                );
            }
            results.push(CountComparison {
                entity,
                source_count,
                target_count,
                matches,
            });
        }
        Ok(results)
    }

    /// Run the validation engine against the target.
    pub async fn validate(&self) -> Result<ValidationReport> {
        ValidationEngine::new(self.inspector.clone()).validate().await
    }

    /// Release source connections.
    pub async fn close(&self) {
        self.source.close().await;
    }
}

/// Overall status across table results: the worst one wins.
pub fn overall_status(results: &[TableMigrationResult]) -> MigrationStatus {
    results
        .iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(MigrationStatus::Success)
}
