//! Periodic trigger for batch update runs.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use cron::Schedule;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::UpdateError;
use crate::updater::{BatchReport, BatchRunner};

/// Fires [`BatchRunner::run_all`] on a cron schedule evaluated in local time.
pub struct Scheduler {
    runner: Arc<BatchRunner>,
    schedule: Schedule,
    running: AtomicBool,
    shutdown: Notify,
}

impl Scheduler {
    pub fn new(runner: Arc<BatchRunner>, schedule: Schedule) -> Arc<Self> {
        info!("initializing update scheduler");
        Arc::new(Self {
            runner,
            schedule,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Spawn the schedule loop. Returns `None` if it is already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        info!("starting update scheduler");
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.run_loop().await }))
    }

    pub fn stop(&self) {
        info!("stopping update scheduler");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Manual one-shot run, independent of the schedule.
    pub async fn trigger_now(&self) -> Result<BatchReport, UpdateError> {
        info!("manual update run triggered");
        self.runner.run_all().await
    }

    pub fn next_fire(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        self.schedule.after(&after).next()
    }

    async fn run_loop(&self) {
        loop {
            // registered before the flag check so a concurrent stop() is not missed
            let shutdown = self.shutdown.notified();
            if !self.is_running() {
                break;
            }
            let now = Local::now();
            let Some(next) = self.next_fire(now) else {
                warn!("schedule has no upcoming fire time");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown => break,
            }
            if !self.is_running() {
                break;
            }

            match self.runner.run_all().await {
                Ok(report) => info!(?report, "scheduled update run done"),
                Err(err) => error!(error = %err, "scheduled update run failed"),
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("update scheduler stopped");
    }
}
