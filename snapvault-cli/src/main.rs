//! snapvault - Main entry point
//!
//! Command line front end for the snapshot & archive engine.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use snapvault_engine::container::{ContainerSummary, VerifyReport};
use snapvault_engine::daemon::ShutdownCoordinator;
use snapvault_engine::report::format_bytes;
use snapvault_engine::{
    utils, BackupScheduler, Cadence, Config, Engine, EngineError, RestoreOptions, RestoreReport,
    Severity, VersionLedgerEntry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot the configured source into local containers
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Pack local files into containers kept in the object store
    #[command(subcommand)]
    Archive(ArchiveCommand),

    /// Run backups on a cadence until interrupted
    #[command(subcommand)]
    Schedule(ScheduleCommand),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Take a snapshot and register it as the next version
    Create { logical_name: String },
    /// List registered versions
    List { logical_name: String },
    /// Restore a version back into the store
    Restore(RestoreArgs),
    /// Show a container's header and entries
    Inspect { container: PathBuf },
    /// Check the container digest and every entry checksum
    Verify { container: PathBuf },
    /// Register an existing container as the next version
    Register {
        logical_name: String,
        container: PathBuf,
    },
    /// List every logical name with at least one version
    Names,
}

#[derive(Subcommand, Debug)]
enum ArchiveCommand {
    /// Pack files, upload the container and register it
    Create {
        logical_name: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List archived versions
    List { logical_name: String },
    /// Restore an archived version into the store
    Restore(RestoreArgs),
    /// Register a container already uploaded under a store key
    Register { logical_name: String, key: String },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    /// Run scheduled backups for a logical name
    Run {
        logical_name: String,
        /// Cadence such as "daily@02:00", "weekly:mon@03:30" or "interval:6h"
        #[arg(long)]
        cadence: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RestoreArgs {
    logical_name: String,
    /// Version to restore (latest when omitted)
    #[arg(long)]
    sequence: Option<u64>,
    /// Abort before writing anything if any entry fails verification
    #[arg(long)]
    strict: bool,
    /// Leave keys alone that changed since the snapshot
    #[arg(long)]
    conflict_aware: bool,
}

impl RestoreArgs {
    fn options(&self) -> RestoreOptions {
        RestoreOptions {
            strict: self.strict,
            conflict_aware: self.conflict_aware,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(e.severity().exit_code());
        }
    };

    // Initialize logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("snapvault v{}", env!("CARGO_PKG_VERSION"));

    let severity = match run(cli.command, config).await {
        Ok(severity) => severity,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            e.severity()
        }
    };

    std::process::exit(severity.exit_code());
}

async fn run(command: Command, config: Config) -> Result<Severity, EngineError> {
    if let Command::Config = command {
        print!("{}", config.to_toml()?);
        return Ok(Severity::Success);
    }

    let engine = Arc::new(Engine::from_config(config)?);
    let shutdown = ShutdownCoordinator::new();
    let _signals = shutdown.listen();
    let cancel = shutdown.token();

    match command {
        Command::Backup(BackupCommand::Create { logical_name }) => {
            let outcome = engine.backup_create(&logical_name, &cancel).await?;
            println!(
                "Registered {} version {} ({} entries, {}) in {:.1}s",
                outcome.entry.logical_name,
                outcome.entry.sequence_number,
                outcome.entry.entry_count,
                format_bytes(outcome.entry.total_bytes),
                outcome.duration_secs
            );
            println!("Container: {}", outcome.entry.container);
            for failure in &outcome.failed {
                println!("  failed  {}: {}", failure.logical_key, failure.reason);
            }
            println!("{}", outcome.summary);
            Ok(outcome.severity())
        }
        Command::Backup(BackupCommand::List { logical_name }) => {
            print_versions(&engine.backup_list(&logical_name).await?);
            Ok(Severity::Success)
        }
        Command::Backup(BackupCommand::Restore(args)) => {
            let report = engine
                .backup_restore(&args.logical_name, args.sequence, args.options(), &cancel)
                .await?;
            print_restore(&report);
            Ok(report.severity())
        }
        Command::Backup(BackupCommand::Inspect { container }) => {
            print_summary(&engine.inspect(&container).await?);
            Ok(Severity::Success)
        }
        Command::Backup(BackupCommand::Verify { container }) => {
            let report = engine.verify(&container).await?;
            print_verify(&report);
            Ok(if report.is_ok() {
                Severity::Success
            } else {
                Severity::Integrity
            })
        }
        Command::Backup(BackupCommand::Register {
            logical_name,
            container,
        }) => {
            let entry = engine.register_container(&logical_name, &container).await?;
            println!(
                "Registered {} version {} ({} entries)",
                entry.logical_name, entry.sequence_number, entry.entry_count
            );
            Ok(Severity::Success)
        }
        Command::Backup(BackupCommand::Names) => {
            let names = engine.series().await?;
            if names.is_empty() {
                println!("No versions recorded");
            }
            for name in names {
                println!("{}", name);
            }
            Ok(Severity::Success)
        }
        Command::Archive(ArchiveCommand::Register { logical_name, key }) => {
            let entry = engine.register_archive(&logical_name, &key, &cancel).await?;
            println!(
                "Registered {} version {} ({} entries) from {}",
                entry.logical_name, entry.sequence_number, entry.entry_count, entry.container
            );
            Ok(Severity::Success)
        }
        Command::Archive(ArchiveCommand::Create {
            logical_name,
            files,
        }) => {
            let outcome = engine.archive_create(&logical_name, files, &cancel).await?;
            println!(
                "Archived {} version {} to {} ({} entries, {})",
                outcome.entry.logical_name,
                outcome.entry.sequence_number,
                outcome.key,
                outcome.entry.entry_count,
                format_bytes(outcome.entry.total_bytes)
            );
            for failure in &outcome.failed {
                println!("  failed  {}: {}", failure.logical_key, failure.reason);
            }
            println!("{}", outcome.summary);
            Ok(outcome.severity())
        }
        Command::Archive(ArchiveCommand::List { logical_name }) => {
            print_versions(&engine.archive_list(&logical_name).await?);
            Ok(Severity::Success)
        }
        Command::Archive(ArchiveCommand::Restore(args)) => {
            let report = engine
                .archive_restore(&args.logical_name, args.sequence, args.options(), &cancel)
                .await?;
            print_restore(&report);
            Ok(report.severity())
        }
        Command::Schedule(ScheduleCommand::Run {
            logical_name,
            cadence,
        }) => {
            let cadence: Cadence = match cadence {
                Some(spec) => spec.parse()?,
                None => engine.config().cadence()?,
            };
            snapvault_engine::executor::validate_logical_name(&logical_name)?;

            let mut scheduler = BackupScheduler::new().await?;
            scheduler
                .schedule(
                    &logical_name,
                    cadence,
                    engine.backup_trigger(&logical_name, cancel.clone()),
                )
                .await?;
            scheduler.start().await?;
            println!(
                "Scheduled {} {} (next run {})",
                logical_name,
                cadence,
                cadence.next_after(chrono::Utc::now())
            );

            cancel.cancelled().await;
            scheduler.stop().await?;

            // Give cancelled runs a moment to discard their partial containers
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while engine.jobs().running_count() > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(Severity::Success)
        }
        Command::Config => Ok(Severity::Success),
    }
}

fn print_versions(entries: &[VersionLedgerEntry]) {
    if entries.is_empty() {
        println!("No versions recorded");
        return;
    }
    println!(
        "{:>5}  {:<25}  {:>7}  {:>10}  CONTAINER",
        "SEQ", "CREATED", "ENTRIES", "SIZE"
    );
    for entry in entries {
        println!(
            "{:>5}  {:<25}  {:>7}  {:>10}  {}",
            entry.sequence_number,
            entry.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.entry_count,
            format_bytes(entry.total_bytes),
            entry.container
        );
    }
}

fn print_restore(report: &RestoreReport) {
    println!("Snapshot {} from {}", report.snapshot_id, report.container);
    if let Some(drift) = &report.version_drift {
        println!("Warning: {}", drift);
    }
    for key in &report.keys {
        println!("  {:<10} {}", key.outcome.to_string(), key.logical_key);
    }
    println!("{}", report.summary());
}

fn print_summary(summary: &ContainerSummary) {
    let header = &summary.header;
    println!("Snapshot:    {}", header.snapshot_id);
    println!("Created:     {}", header.created_at);
    println!("Source:      {}", header.source);
    println!("Compression: {}", header.compression);
    println!(
        "Entries:     {} ({} stored as {}, container {})",
        summary.entries.len(),
        format_bytes(summary.total_bytes()),
        format_bytes(summary.stored_bytes()),
        format_bytes(summary.container_bytes)
    );
    for record in &summary.entries {
        println!(
            "  {}  {:>10}  {}",
            record.entry.checksum.short(),
            format_bytes(record.entry.size_bytes),
            record.entry.logical_key
        );
    }
}

fn print_verify(report: &VerifyReport) {
    println!("Digest:  {}", report.digest);
    println!("Checked: {} entries", report.entries_checked);
    if report.is_ok() {
        println!("OK");
    } else {
        for key in &report.mismatched {
            println!("  mismatch  {}", key);
        }
    }
}
