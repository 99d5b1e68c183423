//! Tether CLI - talk to the configured worker from the shell
//!
//! Usage:
//!   tether call <method> [json] [--timeout-ms <ms>]
//!   tether install [--force]
//!   tether doctor
//!
//! Examples:
//!   tether call ping
//!   tether call fmt '{"fn":"a.go","src":"package a","tabIndent":true,"tabWidth":4}'
//!   RUST_LOG=tether=debug tether install --force

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tether::config::Settings;
use tether::worker::{format_report, sanity_report, InstallOutcome, WorkerClient};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether - request/response IPC with a supervised worker process")]
#[command(version)]
struct Cli {
    /// Config file (defaults to TETHER_CONFIG, ./tether.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the reply payload
    Call {
        /// Method name
        method: String,

        /// Request body as JSON
        #[arg(default_value = "{}")]
        params: String,

        /// Reply deadline (defaults to client.blocking_timeout_ms)
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Provision the worker executable
    Install {
        /// Rebuild even if the executable is up to date
        #[arg(short, long)]
        force: bool,
    },

    /// Print installation diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let mut settings = match loaded {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Call {
            method,
            params,
            timeout_ms,
        } => cmd_call(&settings, &method, &params, timeout_ms).await,
        Commands::Install { force } => {
            settings.client.install_on_start = false;
            cmd_install(&settings, force).await
        }
        Commands::Doctor => {
            settings.client.install_on_start = false;
            cmd_doctor(&settings).await
        }
    }
}

async fn cmd_call(
    settings: &Settings,
    method: &str,
    params: &str,
    timeout_ms: Option<u64>,
) -> ExitCode {
    let params: Value = match serde_json::from_str(params) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Invalid JSON params: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let client = match WorkerClient::start(settings).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    client.ensure_ready().await;

    let timeout = Duration::from_millis(timeout_ms.unwrap_or(settings.client.blocking_timeout_ms));
    let result = client.call_timeout(method, params, timeout).await.into_result();
    client.shutdown();

    match result {
        Ok(data) => {
            match serde_json::to_string_pretty(&data) {
                Ok(text) => println!("{}", text),
                Err(_) => println!("{}", data),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_install(settings: &Settings, force: bool) -> ExitCode {
    let client = match WorkerClient::start(settings).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = client.install(force).await;
    client.shutdown();

    match outcome {
        InstallOutcome::UpToDate => {
            println!("{} is up to date", client.installer().exe().display());
            ExitCode::SUCCESS
        }
        InstallOutcome::Built { transcript, .. } => {
            println!("installed {}", client.installer().exe().display());
            if !transcript.is_empty() {
                println!("{}", transcript);
            }
            ExitCode::SUCCESS
        }
        InstallOutcome::AlreadyAttempted => {
            eprintln!("install already attempted");
            ExitCode::FAILURE
        }
        InstallOutcome::Failed(e) => {
            eprintln!("Install failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_doctor(settings: &Settings) -> ExitCode {
    let client = match WorkerClient::start(settings).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let rows = doctor_rows(
        settings.source.as_deref(),
        sanity_report(client.installer(), &settings.tag()),
    );
    client.shutdown();

    println!("{}", format_report(&rows));
    ExitCode::SUCCESS
}

/// Rows printed by `tether doctor`.
///
/// Doctor never starts an install, so the in-process install state would
/// always read "unset"; the stamp rows already tell whether the worker is
/// installed.
fn doctor_rows(source: Option<&Path>, report: Vec<(String, String)>) -> Vec<(String, String)> {
    let config = source
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".to_string());

    std::iter::once(("config".to_string(), config))
        .chain(report.into_iter().filter(|(key, _)| key != "install state"))
        .collect()
}
