use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use psr_sync::{init_logging, maybe_build_scheduler, SyncConfig, SyncRunner};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "psr-cli")]
#[command(about = "Payment-standard rent ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once for every enabled source (or just one).
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Report whether a newer artifact is published, without fetching it.
    Check {
        #[arg(long)]
        source: Option<String>,
    },
    /// Create the rents table.
    Migrate,
    /// Run sync on the PSR_SYNC_CRON schedule until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let _log_guard = match init_logging(&config.log_config()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("psr: logging setup failed: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command.unwrap_or(Commands::Sync { source: None }), config).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "psr-cli failed");
            println!("psr FAILED: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: SyncConfig) -> Result<ExitCode> {
    match command {
        Commands::Sync { source } => {
            let runner = SyncRunner::from_config(config)?;
            let reports = runner.run(source.as_deref()).await?;
            for report in &reports {
                println!("{}", report.status_line());
            }
            let failed = reports.iter().any(|r| r.exit_code() != 0);
            Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        Commands::Check { source } => {
            let runner = SyncRunner::from_config(config)?;
            let mut failed = false;
            for (source_id, check) in runner.check(source.as_deref()).await? {
                match check {
                    Ok(check) => println!(
                        "psr check: source={} latest={} marker={} update_available={}",
                        source_id,
                        check.recency,
                        check
                            .marker
                            .map(|m| m.last_recency.to_string())
                            .unwrap_or_else(|| "none".to_string()),
                        check.update_available
                    ),
                    Err(failure) => {
                        failed = true;
                        println!("psr check FAILED: source={source_id} {failure}");
                    }
                }
            }
            Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        Commands::Migrate => {
            let runner = SyncRunner::from_config(config)?;
            let table = runner.migrate().await?;
            println!("psr migrate ok: {table}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Watch => {
            let cron = config.sync_cron.clone();
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let runner = Arc::new(SyncRunner::from_config(config)?);
            let Some(mut sched) = maybe_build_scheduler(Arc::clone(&runner)).await? else {
                return Ok(ExitCode::FAILURE);
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");
            println!("psr watch: running on schedule {cron}; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
            Ok(ExitCode::SUCCESS)
        }
    }
}
