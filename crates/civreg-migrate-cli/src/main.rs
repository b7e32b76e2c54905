//! civreg-migrate CLI - legacy civil-registry MySQL to PostgreSQL migration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use civreg_migrate::backup::PgDumpTool;
use civreg_migrate::{
    BackupManager, Config, ConfigOverrides, MigrateError, Orchestrator, PgTarget, ValidationEngine,
};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "civreg-migrate")]
#[command(about = "Civil-registry MySQL to PostgreSQL migration and backup")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Connection settings that override the configuration file.
#[derive(Args)]
struct ConnectionArgs {
    /// Override source host
    #[arg(long, env = "SOURCE_DB_HOST")]
    source_host: Option<String>,

    /// Override source port
    #[arg(long, env = "SOURCE_DB_PORT")]
    source_port: Option<u16>,

    /// Override source user
    #[arg(long, env = "SOURCE_DB_USER")]
    source_user: Option<String>,

    /// Override source password
    #[arg(long, env = "SOURCE_DB_PASSWORD", hide_env_values = true)]
    source_password: Option<String>,

    /// Override source database name
    #[arg(long, env = "SOURCE_DB_NAME")]
    source_database: Option<String>,

    /// Override target connection string
    #[arg(long, env = "TARGET_DATABASE_URL", hide_env_values = true)]
    target_url: Option<String>,

    /// Override backup directory
    #[arg(long, env = "BACKUP_DIR")]
    backup_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full migration: backup, transfer, validation
    Run {
        /// Override rows fetched per batch
        #[arg(long, env = "MIGRATION_BATCH_SIZE")]
        batch_size: Option<usize>,

        /// Leave rows that already exist in the target untouched
        #[arg(long, env = "MIGRATION_SKIP_EXISTING", num_args = 0..=1, default_missing_value = "true")]
        skip_existing: Option<bool>,

        /// Validate the target after migrating
        #[arg(long, env = "MIGRATION_VALIDATE_DATA", num_args = 0..=1, default_missing_value = "true")]
        validate: Option<bool>,

        /// Back up the target before writing
        #[arg(long, env = "MIGRATION_CREATE_BACKUP", num_args = 0..=1, default_missing_value = "true")]
        backup: Option<bool>,

        /// Directory for the migration report
        #[arg(long, env = "REPORT_DIR")]
        report_dir: Option<PathBuf>,
    },

    /// Check referential integrity and natural-key uniqueness in the target
    Validate,

    /// Check source table mappings and row counts without writing
    Preflight,

    /// Compare source and target row counts
    Compare,

    /// Manage target database backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Create a full backup
    Create {
        /// Free-text description stored with the backup
        #[arg(long, default_value = "Manual backup")]
        description: String,
    },

    /// List backups, newest first
    List,

    /// Restore a backup after verifying its checksum
    Restore {
        /// Backup identifier
        id: String,
    },

    /// Delete a backup
    Delete {
        /// Backup identifier
        id: String,
    },

    /// Back up only if the target changed since a base backup
    Incremental {
        /// Base backup identifier
        base_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut overrides = ConfigOverrides {
        source_host: cli.connection.source_host,
        source_port: cli.connection.source_port,
        source_user: cli.connection.source_user,
        source_password: cli.connection.source_password,
        source_database: cli.connection.source_database,
        target_url: cli.connection.target_url,
        backup_dir: cli.connection.backup_dir,
        ..Default::default()
    };
    if let Commands::Run {
        batch_size,
        skip_existing,
        validate,
        backup,
        report_dir,
    } = &cli.command
    {
        overrides.batch_size = *batch_size;
        overrides.skip_existing = *skip_existing;
        overrides.validate_data = *validate;
        overrides.create_backup = *backup;
        overrides.report_dir = report_dir.clone();
    }

    let config = Config::load_with_overrides(&cli.config, &overrides)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run { .. } => {
            let cancel_token = setup_signal_handler();
            let report_dir = config.report.dir.clone();
            let orchestrator = Orchestrator::connect(config).await?;
            let result = orchestrator.run(cancel_token).await;
            orchestrator.close().await;
            let report = result?;

            let path = report.write_to_dir(&report_dir)?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                println!("\nMigration {}!", report.overall_status);
                println!("  Run ID: {}", report.run_id);
                println!("  Duration: {:.2}s", report.total_duration_ms as f64 / 1000.0);
                for r in &report.results {
                    println!(
                        "  {:<10} {:>8} total {:>8} migrated {:>8} skipped {:>6} errors  [{}]",
                        r.table_name,
                        r.total_records,
                        r.migrated_records,
                        r.skipped_records,
                        r.error_records,
                        r.status
                    );
                }
                if let Some(backup) = &report.backup {
                    println!("  Backup: {}", backup.id);
                }
                if let Some(validation) = &report.validation {
                    println!("  Validation issues: {}", validation.issues.len());
                }
                if report.cancelled {
                    println!("  Run was cancelled before all tables were migrated");
                }
                println!("  Report: {}", path.display());
            }

            Ok(report.exit_code())
        }

        Commands::Validate => {
            let target = PgTarget::connect(&config.target).await?;
            let report = ValidationEngine::new(Arc::new(target)).validate().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Validation Results:");
                for (table, count) in &report.entity_counts {
                    println!("  {}: {} rows", table, count);
                }
                if report.is_clean() {
                    println!("\n  No issues found");
                } else {
                    println!("\n  Issues ({}):", report.issues.len());
                    for issue in &report.issues {
                        println!("    - {}", issue);
                    }
                }
            }

            Ok(if report.is_clean() { 0 } else { 1 })
        }

        Commands::Preflight => {
            let orchestrator = Orchestrator::connect(config).await?;
            let report = orchestrator.pre_validate().await;
            orchestrator.close().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Preflight Results:");
                for check in &report.checks {
                    match (&check.source_table, check.source_count, &check.issue) {
                        (_, _, Some(issue)) => println!("  {}: FAILED ({})", check.entity, issue),
                        (Some(table), Some(n), None) => {
                            println!("  {}: {} rows in {}", check.entity, n, table)
                        }
                        _ => println!("  {}: OK", check.entity),
                    }
                }
                println!("\n  Overall: {}", if report.ok { "READY" } else { "NOT READY" });
            }

            Ok(if report.ok { 0 } else { 1 })
        }

        Commands::Compare => {
            let orchestrator = Orchestrator::connect(config).await?;
            let result = orchestrator.compare_counts().await;
            orchestrator.close().await;
            let counts = result?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                println!("Row Counts:");
                for c in &counts {
                    println!(
                        "  {:<10} source={:>8} target={:>8} {}",
                        c.entity,
                        c.source_count,
                        c.target_count,
                        if c.matches { "OK" } else { "MISMATCH" }
                    );
                }
            }

            Ok(if counts.iter().all(|c| c.matches) { 0 } else { 1 })
        }

        Commands::Backup { action } => {
            let manager = backup_manager(&config).await?;
            run_backup(&manager, action, cli.output_json).await
        }
    }
}

async fn backup_manager(config: &Config) -> Result<BackupManager, MigrateError> {
    let target = PgTarget::connect(&config.target).await?;
    let dump = PgDumpTool::new(&config.backup, &config.target)?;
    Ok(BackupManager::new(
        &config.backup.dir,
        Arc::new(dump),
        Arc::new(target),
    ))
}

async fn run_backup(
    manager: &BackupManager,
    action: BackupAction,
    output_json: bool,
) -> Result<u8, MigrateError> {
    match action {
        BackupAction::Create { description } => {
            let info = manager.create_backup(&description).await?;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Created backup {}", info.id);
                println!("  File: {}", info.filepath.display());
                println!("  Size: {} bytes", info.size_bytes);
                println!("  Checksum: {}", info.checksum);
            }
        }

        BackupAction::List => {
            let backups = manager.list_backups().await?;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&backups)?);
            } else if backups.is_empty() {
                println!("No backups in {}", manager.dir().display());
            } else {
                for b in &backups {
                    println!(
                        "  {}  {}  {} bytes  {} tables",
                        b.id,
                        b.created_at.format("%Y-%m-%d %H:%M:%S"),
                        b.size_bytes,
                        b.tables.len()
                    );
                }
            }
        }

        BackupAction::Restore { id } => {
            let report = manager.restore_backup(&id).await?;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Restored backup {}", report.backup_id);
                for w in &report.warnings {
                    println!("  Warning: {}", w);
                }
            }
            // Count mismatches are warnings; the restore itself completed
            if !report.warnings.is_empty() {
                warn!("Restore finished with {} warnings", report.warnings.len());
            }
        }

        BackupAction::Delete { id } => {
            manager.delete_backup(&id).await?;
            if !output_json {
                println!("Deleted backup {}", id);
            }
        }

        BackupAction::Incremental { base_id } => {
            let info = manager.create_incremental_backup(&base_id).await?;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else if info.id == base_id {
                println!("No changes since {}; no new backup taken", base_id);
            } else {
                println!("Created incremental backup {} (base {})", info.id, base_id);
            }
        }
    }
    Ok(0)
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM. The migration stops at
/// the next batch boundary and still writes its report.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to install {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!("\nReceived {}. Stopping after the current batch...", name);
            token.cancel();
        });
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current batch...");
            token.cancel();
        }
    });

    cancel_token
}
