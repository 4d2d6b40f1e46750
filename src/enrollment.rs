//! Enrollment of accounts into the substitution updater.
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::db;
use crate::error::{StoreError, UpdateError};
use crate::model::{normalize_phone_number, AccountClaims, Credentials};
use crate::updater::{UpdateOutcome, Updater};

pub struct EnrollmentManager {
    updater: Arc<Updater>,
}

impl EnrollmentManager {
    pub fn new(updater: Arc<Updater>) -> Self {
        Self { updater }
    }

    /// Store a validated phone number as the notification recipient.
    #[instrument(skip_all, fields(account_id = %claims.account_id))]
    pub async fn set_phone_number(
        &self,
        claims: &AccountClaims,
        raw: &str,
    ) -> Result<String, UpdateError> {
        let phone = normalize_phone_number(raw).ok_or(UpdateError::InvalidPhoneNumber)?;
        db::set_phone_number(self.updater.pool(), &claims.account_id, &phone).await?;
        Ok(phone)
    }

    /// Enroll the account and capture its baseline right away.
    ///
    /// `override_credentials` replaces the account's own portal login for
    /// this enrollment; they are checked against the portal before anything
    /// is stored. If the baseline pass itself fails the enrollment is kept
    /// and the error is returned; the next scheduled run retries.
    #[instrument(skip_all, fields(account_id = %claims.account_id))]
    pub async fn enroll(
        &self,
        claims: &AccountClaims,
        override_credentials: Option<Credentials>,
    ) -> Result<UpdateOutcome, UpdateError> {
        let pool = self.updater.pool();
        let account_id = claims.account_id.as_str();

        db::get_account(pool, account_id).await?;

        let phone = match db::get_phone_number(pool, account_id).await {
            Ok(phone) => phone,
            Err(StoreError::NotFound(_)) => String::new(),
            Err(err) => return Err(err.into()),
        };
        if phone.trim().is_empty() {
            return Err(UpdateError::MissingPhoneNumber);
        }

        if db::enrollment_exists(pool, account_id).await? {
            return Err(UpdateError::AlreadyEnrolled);
        }

        if let Some(credentials) = &override_credentials {
            self.updater.verify_credentials(credentials).await?;
        }

        db::create_enrollment(pool, account_id, override_credentials.as_ref()).await?;
        info!("account enrolled");

        self.updater.update_account(account_id).await
    }

    /// Remove the account's enrollment. Succeeds when none exists.
    #[instrument(skip_all, fields(account_id = %claims.account_id))]
    pub async fn unenroll(&self, claims: &AccountClaims) -> Result<(), UpdateError> {
        if db::delete_enrollment(self.updater.pool(), &claims.account_id).await? {
            info!("account unenrolled");
        } else {
            debug!("account was not enrolled");
        }
        Ok(())
    }
}
