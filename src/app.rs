//! Wiring of the long-lived services shared by the binaries.
use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::db::{self, Pool};
use crate::enrollment::EnrollmentManager;
use crate::notifier::SignalClient;
use crate::source::PortalClient;
use crate::updater::{BatchRunner, Updater};

pub struct Services {
    pub pool: Pool,
    pub updater: Arc<Updater>,
    pub runner: Arc<BatchRunner>,
    pub enrollment: EnrollmentManager,
}

impl Services {
    /// Open the database, apply migrations and build the HTTP clients.
    pub async fn from_config(cfg: &Config) -> Result<Self> {
        cfg.ensure_dirs()?;
        let pool = db::init_pool(&cfg.database_url()).await?;
        db::run_migrations(&pool).await?;

        let source = Arc::new(PortalClient::from_config(&cfg.portal)?);
        let notifier = Arc::new(SignalClient::from_config(&cfg.signal)?);
        let updater = Arc::new(
            Updater::new(pool.clone(), source, notifier, cfg.portal.timeout())
                .with_lease_ttl(cfg.updater.lease_ttl()),
        );
        let runner = Arc::new(BatchRunner::new(updater.clone(), cfg.updater.max_errors));
        let enrollment = EnrollmentManager::new(updater.clone());

        Ok(Self {
            pool,
            updater,
            runner,
            enrollment,
        })
    }
}
