use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use subst_notifier::app::Services;
use subst_notifier::config;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one substitution update pass over all enrolled accounts and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Update only this account instead of the whole fleet
    #[arg(long)]
    account: Option<String>,

    /// Override updater.max_errors for this run
    #[arg(long)]
    max_errors: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(Some(&args.config))?;
    if let Some(max) = args.max_errors {
        cfg.updater.max_errors = max;
    }
    let services = Services::from_config(&cfg).await?;

    if let Some(account_id) = args.account.as_deref() {
        let outcome = services.updater.update_account(account_id).await?;
        info!(account_id, ?outcome, "account updated");
        return Ok(());
    }

    match services.runner.run_all().await {
        Ok(report) => {
            info!(
                accounts = report.accounts,
                unchanged = report.unchanged,
                baselines = report.baselines,
                notified = report.notified,
                failed = report.failed,
                "update pass completed"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "update pass aborted");
            Err(err.into())
        }
    }
}
