//! Per-account and whole-fleet substitution updates.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::diff::diff;
use crate::error::{FetchError, UpdateError};
use crate::message::format_message;
use crate::model::{Credentials, UpdateContext};
use crate::notifier::Notifier;
use crate::parser;
use crate::source::{Document, SubstitutionSource};

/// What a successful update attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing new; neither persisted nor notified.
    Unchanged,
    /// First data since enrollment stored without a message.
    BaselineCaptured { days: usize },
    /// New entries stored and sent to the account's phone.
    Notified { new_lines: usize },
}

pub struct Updater {
    pool: Pool,
    source: Arc<dyn SubstitutionSource>,
    notifier: Arc<dyn Notifier>,
    fetch_timeout: Duration,
    lease_ttl: Duration,
    /// Lease owner name of this instance.
    holder: String,
    in_flight: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);
const LEASE_POLL: Duration = Duration::from_millis(250);

/// Entry of `in_flight` for one caller; removed on drop once nobody else uses it.
struct LockSlot<'a> {
    in_flight: &'a StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    account_id: &'a str,
    lock: Arc<Mutex<()>>,
}

impl Drop for LockSlot<'_> {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // the map and this slot are the last owners
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(self.account_id);
        }
    }
}

impl Updater {
    pub fn new(
        pool: Pool,
        source: Arc<dyn SubstitutionSource>,
        notifier: Arc<dyn Notifier>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            source,
            notifier,
            fetch_timeout,
            lease_ttl: DEFAULT_LEASE_TTL,
            holder: Uuid::new_v4().to_string(),
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    /// How long a lease taken by this updater stays valid without renewal.
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Accounts with an update currently running or waiting in this process.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Log into the portal once without touching any stored state.
    pub async fn verify_credentials(&self, credentials: &Credentials) -> Result<(), UpdateError> {
        self.fetch(credentials).await.map(|_| ())
    }

    async fn fetch(&self, credentials: &Credentials) -> Result<Document, UpdateError> {
        match tokio::time::timeout(self.fetch_timeout, self.source.fetch(credentials)).await {
            Ok(fetched) => Ok(fetched?),
            Err(_) => Err(FetchError::Timeout.into()),
        }
    }

    /// Load the account's context and run one update attempt.
    #[instrument(skip(self))]
    pub async fn update_account(&self, account_id: &str) -> Result<UpdateOutcome, UpdateError> {
        self.exclusive(account_id, async {
            let ctx = db::get_context(&self.pool, account_id).await?;
            self.apply(&ctx).await
        })
        .await
    }

    /// Run one update attempt with an already loaded context.
    ///
    /// If the stored entries moved past `ctx.revision` while this call waited
    /// for the account, the context is read again first.
    #[instrument(skip_all, fields(account_id = %ctx.account_id))]
    pub async fn update(&self, ctx: &UpdateContext) -> Result<UpdateOutcome, UpdateError> {
        self.exclusive(&ctx.account_id, async {
            let revision = db::get_revision(&self.pool, &ctx.account_id).await?;
            if revision != ctx.revision {
                debug!(
                    loaded = ctx.revision,
                    stored = revision,
                    "entries changed since the context was loaded, reloading"
                );
                let fresh = db::get_context(&self.pool, &ctx.account_id).await?;
                return self.apply(&fresh).await;
            }
            self.apply(ctx).await
        })
        .await
    }

    /// Run `work` while holding the account's in-process lock and its database lease.
    async fn exclusive<T>(
        &self,
        account_id: &str,
        work: impl Future<Output = Result<T, UpdateError>>,
    ) -> Result<T, UpdateError> {
        let slot = self.account_lock(account_id);
        let _guard = slot.lock.lock().await;

        let lease = format!("account:{account_id}");
        self.acquire_lease(&lease).await?;
        let result = work.await;
        if let Err(err) = db::release_lease(&self.pool, &lease, &self.holder).await {
            warn!(error = %err, "failed to release account lease");
        }
        result
    }

    /// Wait for the lease while another process holds it. Its owner either
    /// releases it or lets it expire within one `lease_ttl`.
    async fn acquire_lease(&self, name: &str) -> Result<(), UpdateError> {
        let deadline = Instant::now() + self.lease_ttl + LEASE_POLL;
        loop {
            if db::try_acquire_lease(&self.pool, name, &self.holder, self.lease_ttl).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UpdateError::AccountBusy);
            }
            debug!(lease = name, "account is being updated elsewhere, waiting");
            tokio::time::sleep(LEASE_POLL).await;
        }
    }

    async fn apply(&self, ctx: &UpdateContext) -> Result<UpdateOutcome, UpdateError> {
        debug!(auth_id = %ctx.credentials.auth_id, "updating substitutions");
        let document = self.fetch(&ctx.credentials).await?;

        let current = parser::parse(&document);
        let new_entries = diff(&ctx.entries, &current);
        if new_entries.is_empty() {
            debug!("no new substitutions");
            return Ok(UpdateOutcome::Unchanged);
        }

        db::set_entries(&self.pool, &ctx.account_id, &current, true).await?;

        if !ctx.baseline_captured {
            info!(days = current.len(), "captured substitution baseline");
            return Ok(UpdateOutcome::BaselineCaptured {
                days: current.len(),
            });
        }

        let new_lines: usize = new_entries.values().map(Vec::len).sum();
        // The new state is already stored; a failed send is not retried.
        self.notifier
            .send(&format_message(&new_entries), &ctx.phone_number)
            .await
            .map_err(|err| UpdateError::NotificationDelivery(format!("{err:#}")))?;
        info!(new_lines, "sent substitution notification");
        Ok(UpdateOutcome::Notified { new_lines })
    }

    fn account_lock<'a>(&'a self, account_id: &'a str) -> LockSlot<'a> {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let lock = map
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        LockSlot {
            in_flight: &self.in_flight,
            account_id,
            lock,
        }
    }
}

/// Counters of one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub accounts: usize,
    pub unchanged: usize,
    pub baselines: usize,
    pub notified: usize,
    pub failed: u32,
}

impl BatchReport {
    fn record(&mut self, outcome: UpdateOutcome) {
        match outcome {
            UpdateOutcome::Unchanged => self.unchanged += 1,
            UpdateOutcome::BaselineCaptured { .. } => self.baselines += 1,
            UpdateOutcome::Notified { .. } => self.notified += 1,
        }
    }
}

/// Runs the updater over every enrolled account, one at a time.
///
/// Runs are kept apart twice: an in-process flag, and the `batch` lease in
/// the database for runners living in other processes.
pub struct BatchRunner {
    updater: Arc<Updater>,
    max_errors: u32,
    running: AtomicBool,
    holder: String,
}

const BATCH_LEASE: &str = "batch";

struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl BatchRunner {
    pub fn new(updater: Arc<Updater>, max_errors: u32) -> Self {
        Self {
            updater,
            max_errors,
            running: AtomicBool::new(false),
            holder: Uuid::new_v4().to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Update all enrolled accounts. Individual failures are logged and
    /// counted; once more than `max_errors` failed, the remaining accounts
    /// are skipped and the run fails.
    #[instrument(skip_all)]
    pub async fn run_all(&self) -> Result<BatchReport, UpdateError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(UpdateError::RunInProgress)?;
        self.claim_run().await?;

        let result = self.run_accounts().await;
        if let Err(err) = db::release_lease(self.updater.pool(), BATCH_LEASE, &self.holder).await {
            warn!(error = %err, "failed to release batch lease");
        }
        result
    }

    /// Take or renew the batch lease. An account may wait up to one lease
    /// period for its own lease, so the batch lease spans two.
    async fn claim_run(&self) -> Result<(), UpdateError> {
        let ttl = self.updater.lease_ttl() * 2;
        if db::try_acquire_lease(self.updater.pool(), BATCH_LEASE, &self.holder, ttl).await? {
            Ok(())
        } else {
            Err(UpdateError::RunInProgress)
        }
    }

    async fn run_accounts(&self) -> Result<BatchReport, UpdateError> {
        let contexts = db::get_all_contexts(self.updater.pool()).await?;
        let mut report = BatchReport {
            accounts: contexts.len(),
            ..Default::default()
        };
        info!(accounts = report.accounts, "updating substitutions");

        for loaded in &contexts {
            self.claim_run().await?;
            let outcome = match loaded {
                Ok(ctx) => match self.updater.update(ctx).await {
                    Ok(outcome) => Some(outcome),
                    Err(err) => {
                        warn!(account_id = %ctx.account_id, error = %err, "error updating substitutions");
                        None
                    }
                },
                Err(err) => {
                    warn!(error = %err, "skipping account with unreadable state");
                    None
                }
            };
            match outcome {
                Some(outcome) => report.record(outcome),
                None => {
                    report.failed += 1;
                    if report.failed > self.max_errors {
                        error!(
                            errors = report.failed,
                            max = self.max_errors,
                            "too many errors, aborting update run"
                        );
                        return Err(UpdateError::BudgetExceeded {
                            errors: report.failed,
                            max: self.max_errors,
                        });
                    }
                }
            }
        }

        info!(
            unchanged = report.unchanged,
            baselines = report.baselines,
            notified = report.notified,
            failed = report.failed,
            "update run finished"
        );
        Ok(report)
    }
}
