//! genback - Main entry point
//!
//! Generational directory backup, restore and verify.

use anyhow::Result;
use clap::{Parser, Subcommand};
use genback::fs::LocalFileSystem;
use genback::shutdown::ShutdownCoordinator;
use genback::utils::{self, errors::describe, RunLog};
use genback::{Config, Engine};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Subdirectory name to skip (repeatable, case-insensitive)
    #[arg(long, value_name = "NAME", global = true)]
    ignore: Vec<String>,

    /// Delete archive items that no longer exist in the source (backup only)
    #[arg(long, global = true)]
    sync: bool,

    /// Append copied/restored/deleted items to this file
    #[arg(long, value_name = "FILE", global = true)]
    info_log: Option<PathBuf>,

    /// Append per-item failures and run statistics to this file
    #[arg(long, value_name = "FILE", global = true)]
    error_log: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up a local directory into an archive directory
    Backup { from: PathBuf, to: PathBuf },
    /// Restore an archive directory onto a local directory
    Restore { from: PathBuf, to: PathBuf },
    /// Check a local directory against its archive
    Verify { from: PathBuf, to: PathBuf },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting genback v{}", env!("CARGO_PKG_VERSION"));

    let mut options = config.engine_options();
    if args.sync {
        options.sync = true;
    }

    let info_log = args.info_log.or(config.log.info_file);
    let error_log = args.error_log.or(config.log.error_file);
    let log = Arc::new(RunLog::open(info_log.as_deref(), error_log.as_deref())?);

    // Ctrl-C / SIGTERM cancel the run
    let cancel = CancellationToken::new();
    let shutdown = ShutdownCoordinator::new(cancel.clone());
    let signal_handle = tokio::spawn(async move {
        if let Err(e) = shutdown.wait_for_signal().await {
            tracing::warn!("Signal handling unavailable: {}", e);
        }
    });

    let engine = Engine::new(
        Arc::new(LocalFileSystem::new()),
        Arc::new(LocalFileSystem::new()),
        options,
        log,
        cancel,
    )?;

    let result = match &args.command {
        Command::Backup { from, to } => engine.backup(from, to, &args.ignore).await,
        Command::Restore { from, to } => engine.restore(from, to, &args.ignore).await,
        Command::Verify { from, to } => engine.verify(from, to, &args.ignore).await,
    };
    signal_handle.abort();

    match result {
        Ok(stats) => {
            println!("{}", stats.summary());
            if stats.has_errors() {
                Ok(ExitCode::from(1))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(e) => {
            tracing::error!("{}", describe(&e));
            Ok(ExitCode::from(1))
        }
    }
}
