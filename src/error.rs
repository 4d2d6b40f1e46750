//! Error kinds surfaced by the update engine and its collaborators.
use thiserror::Error;

/// Persistence gateway failures. `NotFound` is kept apart from storage faults
/// so callers can turn it into a user-facing answer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored entries are not valid JSON: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("stored entries of account {account_id} are not valid JSON: {source}")]
    CorruptEntries {
        account_id: String,
        source: serde_json::Error,
    },
}

/// Source fetch failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("portal rejected the credentials")]
    Credentials,
    #[error("portal request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("portal request timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("wrong credentials for the substitution portal")]
    Credentials,
    #[error("could not read the substitution portal: {0}")]
    Transport(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("account is already enrolled")]
    AlreadyEnrolled,
    #[error("phone number has to be added first")]
    MissingPhoneNumber,
    #[error("phone number is not valid")]
    InvalidPhoneNumber,
    #[error("persistence failed: {0}")]
    Persistence(StoreError),
    #[error("notification delivery failed: {0}")]
    NotificationDelivery(String),
    #[error("got {errors} errors updating substitutions (max {max}), stopping")]
    BudgetExceeded { errors: u32, max: u32 },
    #[error("an update run is already in progress")]
    RunInProgress,
    #[error("account is still being updated elsewhere")]
    AccountBusy,
}

impl From<StoreError> for UpdateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => UpdateError::NotFound(what),
            StoreError::Conflict("enrollment") => UpdateError::AlreadyEnrolled,
            other => UpdateError::Persistence(other),
        }
    }
}

impl From<FetchError> for UpdateError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Credentials => UpdateError::Credentials,
            FetchError::Transport(e) => UpdateError::Transport(e.to_string()),
            FetchError::Timeout => UpdateError::Transport("request timed out".into()),
        }
    }
}
