//! pg-remap-migrate CLI - migrate records between two versions of an application schema.

use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use pg_remap_migrate::{Config, MigrateError, MigrationResult, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-remap-migrate")]
#[command(about = "Migrate records between two versions of a PostgreSQL application schema")]
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

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export, remap and load; rolls back unless --write or confirmed interactively
    Run {
        /// Commit the transaction when the run succeeds
        #[arg(long, conflicts_with = "interactive")]
        write: bool,

        /// Ask for confirmation before committing
        #[arg(long, short)]
        interactive: bool,

        /// Override the directory for intermediate files
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Keep intermediate files after the run
        #[arg(long)]
        keep_files: bool,

        /// Override number of export workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Test database connections
    HealthCheck,

    /// Show target columns and processing order for already exported files
    Plan {
        /// Directory holding `<table>.csv` exports
        #[arg(long)]
        work_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            write,
            interactive,
            work_dir,
            keep_files,
            workers,
        } => {
            if let Some(dir) = work_dir {
                config.migration.work_dir = Some(dir);
            }
            if keep_files {
                config.migration.keep_files = true;
            }
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }

            let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
            let cancel = bridge_cancellation(cancel_token);

            let orchestrator = Orchestrator::new(config);
            let result = orchestrator
                .run(Some(cancel), |result| {
                    if interactive {
                        confirm_commit(result)
                    } else {
                        write
                    }
                })
                .await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_summary(&result);
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config);
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source: {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target: {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
        }

        Commands::Plan { work_dir } => {
            let orchestrator = Orchestrator::new(config);
            let plan = orchestrator.plan(&work_dir)?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("Processing order:");
                for (i, table) in plan.order.iter().enumerate() {
                    println!("  {:>3}. {}", i + 1, table);
                }
                println!("\nTarget columns:");
                for (table, columns) in &plan.target_columns {
                    println!("  {}: {}", table, columns.join(", "));
                }
                if !plan.missing_exports.is_empty() {
                    println!("\nNo export found for: {}", plan.missing_exports.join(", "));
                }
            }
        }
    }

    Ok(())
}

fn print_summary(result: &MigrationResult) {
    let status_msg = match result.status.as_str() {
        "committed" => "Migration committed!",
        _ => "Migration rolled back (run with --write to commit)",
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Tables: {}", result.tables_processed.len());
    println!("  Rows read: {}", result.stats.rows_read);
    println!(
        "  Rows: {} inserted, {} merged, {} deferred",
        result.stats.rows_inserted, result.stats.rows_merged, result.stats.rows_deferred
    );
    println!("  Rows loaded: {}", result.rows_loaded);
    if result.stats.rows_unresolved > 0 {
        println!("  Unresolved references: {}", result.stats.rows_unresolved);
    }
    for (table, rows) in &result.updates.applied {
        println!("  Updated {}: {} rows", table, rows);
    }
}

fn confirm_commit(result: &MigrationResult) -> bool {
    print_summary(result);
    match Confirm::new()
        .with_prompt("Commit this migration?")
        .default(false)
        .interact()
    {
        Ok(answer) => answer,
        Err(e) => {
            warn!("Confirmation prompt failed, rolling back: {}", e);
            false
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
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

    Ok(())
}

/// Forward a cancelled token into the watch channel the orchestrator polls.
fn bridge_cancellation(token: CancellationToken) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        token.cancelled().await;
        let _ = tx.send(true);
    });
    rx
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token_int = cancel_token.clone();
    tokio::spawn(async move {
        sigint.recv().await;
        eprintln!(
            "\nReceived SIGINT. Rolling back (timeout: {}s)...",
            shutdown_timeout
        );
        token_int.cancel();
    });

    let token_term = cancel_token.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        eprintln!(
            "\nReceived SIGTERM. Rolling back (timeout: {}s)...",
            shutdown_timeout
        );
        token_term.cancel();
    });

    spawn_shutdown_deadline(cancel_token.clone(), shutdown_timeout);
    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Rolling back...");
            token.cancel();
        }
    });

    spawn_shutdown_deadline(cancel_token.clone(), shutdown_timeout);
    Ok(cancel_token)
}

/// Exit hard if a cancelled run has not wound down within the timeout.
fn spawn_shutdown_deadline(token: CancellationToken, shutdown_timeout: u64) {
    tokio::spawn(async move {
        token.cancelled().await;
        tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
        eprintln!("Shutdown timeout of {}s exceeded, exiting", shutdown_timeout);
        std::process::exit(130);
    });
}
