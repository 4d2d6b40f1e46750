use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use subst_notifier::app::Services;
use subst_notifier::config;
use subst_notifier::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run one update pass right after startup
    #[arg(long)]
    run_on_start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let services = Services::from_config(&cfg).await?;

    let scheduler = Scheduler::new(services.runner.clone(), cfg.schedule()?);
    if args.run_on_start {
        if let Err(err) = scheduler.trigger_now().await {
            error!(error = %err, "startup update run failed");
        }
    }
    let handle = scheduler.start();

    info!("substitution notifier running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    scheduler.stop();
    if let Some(handle) = handle {
        let _ = handle.await;
    }
    services.pool.close().await;
    Ok(())
}
