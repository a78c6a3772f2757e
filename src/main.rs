//! Database Backup/Restore Tool
//!
//! Streams `pg_dump`/`mysqldump` output through gzip into a dated backup file,
//! and replays such a file through `psql`/`pg_restore`/`mysql`.

// dbstream/src/main.rs
mod backup;
mod config;
mod connection;
mod errors;
mod orchestrator;
mod pipeline;
mod restore;
mod utils;
mod vendor;

use anyhow::{Context, Result};
use config::{AppConfig, ArtifactLocation, Operation};
use connection::SqlxAdapter;
use orchestrator::Orchestrator;
use pipeline::RunControl;
use pipeline::compose::PipelineSummary;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use utils::SystemToolchain;
use utils::backup_files::{create_backup_path, format_file_size, latest_backup};

/// Environment variable naming the configuration file.
const CONFIG_ENV: &str = "DBSTREAM_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    let operation = match choice.as_str() {
        "1" | "backup" => Operation::Backup,
        "2" | "restore" => Operation::Restore,
        _ => {
            println!("❌ Invalid choice. Please enter '1' (backup) or '2' (restore).");
            anyhow::bail!("Invalid operation choice");
        }
    };

    let artifact = ArtifactLocation {
        path: resolve_artifact_path(&app_config, operation, args.get(2))?,
        format: app_config.format,
    };

    match operation {
        Operation::Backup => println!("🚀 Starting Backup Process..."),
        Operation::Restore => println!("🔄 Starting Restore Process..."),
    }

    let control = RunControl {
        cancel: CancellationToken::new(),
        deadline: app_config.timeout,
    };
    let interrupt = control.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, stopping...");
            interrupt.cancel();
        }
    });

    let orchestrator = Orchestrator::new(SqlxAdapter, SystemToolchain).with_control(control);
    match orchestrator
        .execute(&app_config.connection, &artifact, operation)
        .await
    {
        Ok(summary) => {
            print_summary(&app_config, &artifact, operation, &summary);
            Ok(())
        }
        Err(e) => {
            error!(stage = %e.stage(), "{} failed: {}", operation, e);
            for line in e.diagnostics() {
                eprintln!("   {}", line);
            }
            Err(e).with_context(|| format!("{} process failed", operation))
        }
    }
}

/// Backups go to today's file; restores take the command-line path, then
/// `restore_file`, then the newest backup of the database.
fn resolve_artifact_path(
    app_config: &AppConfig,
    operation: Operation,
    explicit: Option<&String>,
) -> Result<PathBuf> {
    let db_name = &app_config.connection.database;
    match operation {
        Operation::Backup => create_backup_path(&app_config.backup_dir, db_name)
            .context("Failed to prepare backup destination"),
        Operation::Restore => {
            if let Some(path) = explicit.map(PathBuf::from).or_else(|| app_config.restore_file.clone()) {
                return Ok(path);
            }

            let latest = latest_backup(&app_config.backup_dir, db_name)
                .context("No restore file given and no backup to fall back on")?;
            info!(
                "Using latest backup {} ({})",
                latest.path.display(),
                format_file_size(latest.size)
            );
            Ok(latest.path)
        }
    }
}

fn print_summary(
    app_config: &AppConfig,
    artifact: &ArtifactLocation,
    operation: Operation,
    summary: &PipelineSummary,
) {
    let connection = &app_config.connection;
    println!("📋 {} summary", operation);
    println!("   Database:       {} ({})", connection.database, connection.kind);
    println!("   Duration:       {:.2}s", summary.duration.as_secs_f64());
    println!("   Bytes observed: {}", format_file_size(summary.bytes_observed));
    println!("   Bytes written:  {}", format_file_size(summary.bytes_written));
    println!("   File:           {}", artifact.path.display());
}

/// Prompts user to select backup or restore operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
