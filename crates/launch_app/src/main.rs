//! `launch`: deploy, wire, fund and verify the Atlas contracts.
//!
//! Every command is resumable. State lives in the per-network checkpoint
//! file, so re-running a command after a failure continues where it stopped.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use launch_core::{ErrorCategory, LaunchConfig, LaunchError, logging};
use launch_deploy::DeployOptions;

use commands::Launch;

#[derive(Parser)]
#[command(name = "launch")]
#[command(about = "Resumable deployment, wiring, funding and verification for the Atlas launch")]
struct Cli {
    /// Flat JSON config file (defaults to ./launch.config.json when present)
    #[arg(short, long, env = "LAUNCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy missing modules and apply capability grants
    Deploy {
        /// Redeploy even if the checkpoint already records the module
        #[arg(long)]
        force_redeploy: bool,

        /// Only this module and its dependencies
        #[arg(long, value_name = "NAME")]
        module: Option<String>,
    },
    /// Fund allocation sinks and schedule vesting
    Fund {
        /// Schedule beneficiaries even if they already have a schedule
        #[arg(long)]
        allow_duplicate_beneficiaries: bool,
    },
    /// Submit recorded modules for source verification
    Verify,
    /// Show what the checkpoint records
    Status {
        /// Print the raw checkpoint document
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match LaunchConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match config.logs_dir().and_then(|dir| logging::init_logging(&dir)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("warning: file logging unavailable: {e:#}");
            None
        }
    };
    info!("Starting launch v{}", env!("CARGO_PKG_VERSION"));

    match run(cli.command, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn report_error(e: &anyhow::Error) {
    let category = e.downcast_ref::<LaunchError>().map(LaunchError::category);
    error!(?category, "{e:#}");
    match category {
        Some(ErrorCategory::Preflight) => {
            eprintln!("error [preflight]: {e:#}\nnothing was sent to the chain");
        }
        Some(category) => eprintln!("error [{category}]: {e:#}"),
        None => eprintln!("error: {e:#}"),
    }
}

async fn run(command: Command, config: LaunchConfig) -> Result<bool> {
    let abort = Arc::new(AtomicBool::new(false));
    {
        let abort = Arc::clone(&abort);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing the in-flight call before stopping");
                abort.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut launch = Launch::open(config, abort)?;
    match command {
        Command::Deploy {
            force_redeploy,
            module,
        } => {
            let options = DeployOptions {
                force_redeploy,
                only: module,
            };
            commands::deploy(&mut launch, options).await
        }
        Command::Fund {
            allow_duplicate_beneficiaries,
        } => commands::fund(&mut launch, allow_duplicate_beneficiaries).await,
        Command::Verify => commands::verify(&launch).await,
        Command::Status { json } => commands::status(&launch, json),
    }
}
