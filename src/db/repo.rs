use super::model::{Account, AccountSummary, ContextRow, Enrollment, EnrollmentRow};
use crate::error::StoreError;
use crate::model::{Credentials, SubstitutionMap, UpdateContext};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;
type Result<T, E = StoreError> = std::result::Result<T, E>;

const CONTEXT_SELECT: &str = "SELECT s.account_id AS account_id, \
        COALESCE(s.auth_id, a.auth_id) AS auth_id, \
        COALESCE(s.auth_pw, a.auth_pw) AS auth_pw, \
        COALESCE(i.phone_number, '') AS phone_number, \
        s.entries AS entries, \
        s.baseline_captured AS baseline_captured, \
        s.revision AS revision \
    FROM substitutions s \
    JOIN accounts a ON a.id = s.account_id \
    LEFT JOIN account_infos i ON i.account_id = s.account_id";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

#[instrument(skip_all)]
pub async fn create_account(pool: &Pool, credentials: &Credentials) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO accounts (id, auth_id, auth_pw) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(&credentials.auth_id)
        .bind(&credentials.auth_pw)
        .execute(pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict("account")
            } else {
                e.into()
            }
        })?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn get_account(pool: &Pool, account_id: &str) -> Result<Account> {
    sqlx::query_as::<_, Account>("SELECT id, auth_id, created_at FROM accounts WHERE id = ?")
        .bind(account_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound("account"))
}

#[instrument(skip_all)]
pub async fn list_accounts(pool: &Pool) -> Result<Vec<AccountSummary>> {
    let rows = sqlx::query_as::<_, AccountSummary>(
        "SELECT a.id AS id, a.auth_id AS auth_id, i.phone_number AS phone_number, \
         (s.account_id IS NOT NULL) AS enrolled \
         FROM accounts a \
         LEFT JOIN account_infos i ON i.account_id = a.id \
         LEFT JOIN substitutions s ON s.account_id = a.id \
         ORDER BY a.created_at, a.rowid",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Insert or replace the account's phone number.
#[instrument(skip_all)]
pub async fn set_phone_number(pool: &Pool, account_id: &str, phone_number: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO account_infos (account_id, phone_number) VALUES (?, ?) \
         ON CONFLICT(account_id) DO UPDATE SET phone_number = excluded.phone_number",
    )
    .bind(account_id)
    .bind(phone_number)
    .execute(pool)
    .await
    .map_err(|e| {
        if is_foreign_key_violation(&e) {
            StoreError::NotFound("account")
        } else {
            e.into()
        }
    })?;
    Ok(())
}

/// Phone number on file, `NotFound` when the account has no info row.
#[instrument(skip_all)]
pub async fn get_phone_number(pool: &Pool, account_id: &str) -> Result<String> {
    sqlx::query_scalar::<_, String>("SELECT phone_number FROM account_infos WHERE account_id = ?")
        .bind(account_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound("account info"))
}

#[instrument(skip_all)]
pub async fn enrollment_exists(pool: &Pool, account_id: &str) -> Result<bool> {
    let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM substitutions WHERE account_id = ?")
        .bind(account_id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

/// Create an empty enrollment with the baseline still to be captured.
#[instrument(skip_all)]
pub async fn create_enrollment(
    pool: &Pool,
    account_id: &str,
    override_credentials: Option<&Credentials>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO substitutions (account_id, auth_id, auth_pw, entries, baseline_captured) \
         VALUES (?, ?, ?, '{}', 0)",
    )
    .bind(account_id)
    .bind(override_credentials.map(|c| c.auth_id.as_str()))
    .bind(override_credentials.map(|c| c.auth_pw.as_str()))
    .execute(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict("enrollment")
        } else if is_foreign_key_violation(&e) {
            StoreError::NotFound("account")
        } else {
            e.into()
        }
    })?;
    Ok(())
}

/// Returns whether an enrollment was removed.
#[instrument(skip_all)]
pub async fn delete_enrollment(pool: &Pool, account_id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM substitutions WHERE account_id = ?")
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn get_enrollment(pool: &Pool, account_id: &str) -> Result<Enrollment> {
    let row = sqlx::query_as::<_, EnrollmentRow>(
        "SELECT account_id, entries, baseline_captured, revision, \
         (auth_id IS NOT NULL) AS has_override_credentials \
         FROM substitutions WHERE account_id = ?",
    )
    .bind(account_id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound("enrollment"))?;
    row.try_into()
}

#[instrument(skip_all)]
pub async fn get_context(pool: &Pool, account_id: &str) -> Result<UpdateContext> {
    let row = sqlx::query_as::<_, ContextRow>(&format!("{CONTEXT_SELECT} WHERE s.account_id = ?"))
        .bind(account_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound("enrollment"))?;
    row.try_into()
}

/// Contexts of every enrolled account, oldest enrollment first.
///
/// The outer error is a failed query. A row whose stored entries cannot be
/// decoded comes back as its own `CorruptEntries` item so the others stay usable.
#[instrument(skip_all)]
pub async fn get_all_contexts(pool: &Pool) -> Result<Vec<Result<UpdateContext>>> {
    let rows = sqlx::query_as::<_, ContextRow>(&format!(
        "{CONTEXT_SELECT} ORDER BY s.created_at, s.rowid"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(UpdateContext::try_from).collect())
}

/// Current revision of the account's stored entries.
#[instrument(skip_all)]
pub async fn get_revision(pool: &Pool, account_id: &str) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT revision FROM substitutions WHERE account_id = ?")
        .bind(account_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound("enrollment"))
}

/// Overwrite the stored entries wholesale.
#[instrument(skip_all)]
pub async fn set_entries(
    pool: &Pool,
    account_id: &str,
    entries: &SubstitutionMap,
    baseline_captured: bool,
) -> Result<()> {
    let json = serde_json::to_string(entries)?;
    let res = sqlx::query(
        "UPDATE substitutions SET entries = ?, baseline_captured = ?, revision = revision + 1, \
         updated_at = CURRENT_TIMESTAMP WHERE account_id = ?",
    )
    .bind(json)
    .bind(baseline_captured)
    .bind(account_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound("enrollment"));
    }
    Ok(())
}

/// Take or renew the named lease for `ttl`.
///
/// Succeeds when the lease is free, expired, or already held by `holder`.
/// Returns `false` while another holder's lease is still valid.
#[instrument(skip_all, fields(lease = name))]
pub async fn try_acquire_lease(pool: &Pool, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
    let secs = ttl.as_secs().max(1) as i64;
    let res = sqlx::query(
        "INSERT INTO run_leases (name, holder, expires_at) \
         VALUES (?, ?, datetime('now', ? || ' seconds')) \
         ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, \
         acquired_at = CURRENT_TIMESTAMP, expires_at = excluded.expires_at \
         WHERE run_leases.holder = excluded.holder OR run_leases.expires_at <= CURRENT_TIMESTAMP",
    )
    .bind(name)
    .bind(holder)
    .bind(secs)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Drop the lease if `holder` still owns it.
#[instrument(skip_all, fields(lease = name))]
pub async fn release_lease(pool: &Pool, name: &str, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM run_leases WHERE name = ? AND holder = ?")
        .bind(name)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Weekday;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[test]
    fn prepare_sqlite_url_passes_memory_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn prepare_sqlite_url_keeps_query() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/db.sqlite");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let out = prepare_sqlite_url(&url);
        assert_eq!(out, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn enrollment_lifecycle() {
        let pool = setup_pool().await;
        let id = create_account(&pool, &Credentials::new("JDoe", "pw"))
            .await
            .unwrap();

        assert!(matches!(
            get_context(&pool, &id).await,
            Err(StoreError::NotFound("enrollment"))
        ));
        assert!(!enrollment_exists(&pool, &id).await.unwrap());

        create_enrollment(&pool, &id, None).await.unwrap();
        assert!(matches!(
            create_enrollment(&pool, &id, None).await,
            Err(StoreError::Conflict("enrollment"))
        ));

        let ctx = get_context(&pool, &id).await.unwrap();
        assert_eq!(ctx.credentials.auth_id, "JDoe");
        assert_eq!(ctx.phone_number, "");
        assert!(ctx.entries.is_empty());
        assert!(!ctx.baseline_captured);

        let mut entries = SubstitutionMap::new();
        entries.insert(Weekday::Mo, vec!["Math cancelled".into()]);
        set_entries(&pool, &id, &entries, true).await.unwrap();

        let stored = get_enrollment(&pool, &id).await.unwrap();
        assert_eq!(stored.entries, entries);
        assert!(stored.baseline_captured);
        assert_eq!(stored.revision, 1);

        assert!(delete_enrollment(&pool, &id).await.unwrap());
        assert!(!delete_enrollment(&pool, &id).await.unwrap());
        assert!(matches!(
            set_entries(&pool, &id, &entries, true).await,
            Err(StoreError::NotFound("enrollment"))
        ));
    }

    #[tokio::test]
    async fn override_credentials_win() {
        let pool = setup_pool().await;
        let id = create_account(&pool, &Credentials::new("JDoe", "pw"))
            .await
            .unwrap();
        set_phone_number(&pool, &id, "+49151000000").await.unwrap();
        create_enrollment(&pool, &id, Some(&Credentials::new("Sibling", "other")))
            .await
            .unwrap();

        let ctx = get_context(&pool, &id).await.unwrap();
        assert_eq!(ctx.credentials, Credentials::new("Sibling", "other"));
        assert_eq!(ctx.phone_number, "+49151000000");
        assert!(get_enrollment(&pool, &id).await.unwrap().has_override_credentials);
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let pool = setup_pool().await;
        assert!(matches!(
            get_account(&pool, "nope").await,
            Err(StoreError::NotFound("account"))
        ));
        assert!(matches!(
            create_enrollment(&pool, "nope", None).await,
            Err(StoreError::NotFound("account"))
        ));
        assert!(matches!(
            get_phone_number(&pool, "nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_auth_id_conflicts() {
        let pool = setup_pool().await;
        create_account(&pool, &Credentials::new("JDoe", "pw"))
            .await
            .unwrap();
        assert!(matches!(
            create_account(&pool, &Credentials::new("JDoe", "pw2")).await,
            Err(StoreError::Conflict("account"))
        ));
    }

    #[tokio::test]
    async fn all_contexts_in_enrollment_order() {
        let pool = setup_pool().await;
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let id = create_account(&pool, &Credentials::new(name, "pw"))
                .await
                .unwrap();
            create_enrollment(&pool, &id, None).await.unwrap();
            ids.push(id);
        }
        // not enrolled, must not show up
        create_account(&pool, &Credentials::new("d", "pw"))
            .await
            .unwrap();

        let contexts = get_all_contexts(&pool).await.unwrap();
        let got: Vec<_> = contexts
            .into_iter()
            .map(|c| c.unwrap().account_id)
            .collect();
        assert_eq!(got, ids);

        let listed = list_accounts(&pool).await.unwrap();
        assert_eq!(listed.len(), 4);
        assert!(!listed[3].enrolled);
    }

    #[tokio::test]
    async fn undecodable_entries_fail_only_their_row() {
        let pool = setup_pool().await;
        let mut ids = Vec::new();
        for name in ["a", "b"] {
            let id = create_account(&pool, &Credentials::new(name, "pw"))
                .await
                .unwrap();
            create_enrollment(&pool, &id, None).await.unwrap();
            ids.push(id);
        }
        sqlx::query("UPDATE substitutions SET entries = 'not json' WHERE account_id = ?")
            .bind(&ids[0])
            .execute(&pool)
            .await
            .unwrap();

        let contexts = get_all_contexts(&pool).await.unwrap();
        assert_eq!(contexts.len(), 2);
        match &contexts[0] {
            Err(StoreError::CorruptEntries { account_id, .. }) => assert_eq!(account_id, &ids[0]),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(contexts[1].as_ref().unwrap().account_id, ids[1]);
    }

    #[tokio::test]
    async fn revision_follows_writes() {
        let pool = setup_pool().await;
        let id = create_account(&pool, &Credentials::new("JDoe", "pw"))
            .await
            .unwrap();
        create_enrollment(&pool, &id, None).await.unwrap();
        let before = get_context(&pool, &id).await.unwrap().revision;
        assert_eq!(get_revision(&pool, &id).await.unwrap(), before);

        set_entries(&pool, &id, &SubstitutionMap::new(), true).await.unwrap();
        assert_eq!(get_revision(&pool, &id).await.unwrap(), before + 1);
        assert!(matches!(
            get_revision(&pool, "nope").await,
            Err(StoreError::NotFound("enrollment"))
        ));
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released_or_expired() {
        let pool = setup_pool().await;
        let ttl = Duration::from_secs(60);

        assert!(try_acquire_lease(&pool, "batch", "daemon", ttl).await.unwrap());
        // renewal by the owner
        assert!(try_acquire_lease(&pool, "batch", "daemon", ttl).await.unwrap());
        assert!(!try_acquire_lease(&pool, "batch", "cli", ttl).await.unwrap());
        // other names are independent
        assert!(try_acquire_lease(&pool, "account:x", "cli", ttl).await.unwrap());

        // only the owner can release
        release_lease(&pool, "batch", "cli").await.unwrap();
        assert!(!try_acquire_lease(&pool, "batch", "cli", ttl).await.unwrap());
        release_lease(&pool, "batch", "daemon").await.unwrap();
        assert!(try_acquire_lease(&pool, "batch", "cli", ttl).await.unwrap());

        sqlx::query("UPDATE run_leases SET expires_at = datetime('now', '-1 seconds') WHERE name = 'batch'")
            .execute(&pool)
            .await
            .unwrap();
        assert!(try_acquire_lease(&pool, "batch", "daemon", ttl).await.unwrap());
    }
}
