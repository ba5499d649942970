//! stackup - Entry Point
//!
//! Deploys the stack found in the current directory (or `STACKUP_BASE_DIR`).
//! Behavior is driven by `.env` and a few process environment overrides.

use std::env;
use std::process::ExitCode;

use anyhow::Context;
use tracing::{error, info};

use stackup::app::options::{DeployOptions, Overrides};
use stackup::app::prompt::StdinConfirm;
use stackup::app::run::run;
use stackup::infra::command::HostRunner;
use stackup::logs::{init_logging, LogOptions};
use stackup::utils::version_info;

#[tokio::main]
async fn main() -> ExitCode {
    let version = version_info();
    if env::args().skip(1).any(|arg| arg == "--version" || arg == "-V") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    match deploy().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("stackup: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn deploy() -> anyhow::Result<bool> {
    let log_options = LogOptions::from_env().context("Invalid logging configuration")?;
    let _guard = init_logging(&log_options).context("Failed to initialize logging")?;

    let options = DeployOptions::from_env().context("Invalid deployment options")?;
    let overrides = Overrides::from_env();
    info!(
        "stackup {} deploying from {}",
        version_info().version,
        options.layout.base_dir.display()
    );

    let runner = HostRunner::detect().await;
    let report = run(&options, &overrides, &runner, &StdinConfirm).await;
    report.print_summary();

    if !report.is_success() {
        error!("Deployment failed: {}", report.error.as_deref().unwrap_or("unknown error"));
    }
    Ok(report.is_success())
}
