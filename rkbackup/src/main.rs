mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use log::{error, info};
use rkbackup::config::{Config, load_config};
use rkbackup::{BackupOrchestrator, BackupRun};
use tokio_util::sync::CancellationToken;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
}

async fn backup(cli: Cli) -> Result<()> {
    let cfg = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    let run = BackupRun::from_config(&cfg);
    let orchestrator = BackupOrchestrator::from_config(&cfg);

    let cancel = CancellationToken::new();
    {
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl_c: {e:?}");
                return;
            }
            info!("Received CTRL-C, cancelling backup...");
            token.cancel();
        });
    }

    info!(
        "Backing up {} into {} (lock {}, deadline {}s)",
        cfg.xline_config.endpoints.join(","),
        run.target.display(),
        orchestrator.lock_name(),
        cfg.deadline_secs
    );
    let report = orchestrator
        .run_with_cancel(run.deadline, &run.target, &cancel)
        .await
        .context("Error taking etcd snapshot")?;

    if let Some(version) = &report.server_version {
        info!("Snapshot taken from server version {version}");
    }
    if !report.warnings.is_empty() {
        info!(
            "Backup succeeded with {} cleanup warning(s)",
            report.warnings.len()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = backup(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
