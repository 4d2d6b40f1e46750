//! Database rows and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in the update engine.

use chrono::NaiveDateTime;
use sqlx::FromRow;

use crate::error::StoreError;
use crate::model::{Credentials, SubstitutionMap, UpdateContext};

#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub id: String,
    pub auth_id: String,
    pub created_at: NaiveDateTime,
}

/// Operator listing row.
#[derive(Debug, Clone, FromRow)]
pub struct AccountSummary {
    pub id: String,
    pub auth_id: String,
    pub phone_number: Option<String>,
    pub enrolled: bool,
}

/// Stored substitution state of one enrolled account.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub account_id: String,
    pub entries: SubstitutionMap,
    pub baseline_captured: bool,
    /// Bumped by every `set_entries`.
    pub revision: i64,
    pub has_override_credentials: bool,
}

#[derive(Debug, FromRow)]
pub(crate) struct EnrollmentRow {
    pub account_id: String,
    pub entries: String,
    pub baseline_captured: bool,
    pub revision: i64,
    pub has_override_credentials: bool,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StoreError;

    fn try_from(row: EnrollmentRow) -> Result<Self, Self::Error> {
        let entries = decode_entries(&row.account_id, &row.entries)?;
        Ok(Enrollment {
            account_id: row.account_id,
            entries,
            baseline_captured: row.baseline_captured,
            revision: row.revision,
            has_override_credentials: row.has_override_credentials,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct ContextRow {
    pub account_id: String,
    pub auth_id: String,
    pub auth_pw: String,
    pub phone_number: String,
    pub entries: String,
    pub baseline_captured: bool,
    pub revision: i64,
}

impl TryFrom<ContextRow> for UpdateContext {
    type Error = StoreError;

    fn try_from(row: ContextRow) -> Result<Self, Self::Error> {
        let entries = decode_entries(&row.account_id, &row.entries)?;
        Ok(UpdateContext {
            account_id: row.account_id,
            credentials: Credentials::new(row.auth_id, row.auth_pw),
            phone_number: row.phone_number,
            entries,
            baseline_captured: row.baseline_captured,
            revision: row.revision,
        })
    }
}

fn decode_entries(account_id: &str, json: &str) -> Result<SubstitutionMap, StoreError> {
    serde_json::from_str(json).map_err(|source| StoreError::CorruptEntries {
        account_id: account_id.to_string(),
        source,
    })
}
