#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use sqlx::sqlite::SqlitePoolOptions;
use subst_notifier::db::{self, Pool};
use subst_notifier::error::FetchError;
use subst_notifier::model::{Credentials, SubstitutionMap, Weekday};
use subst_notifier::notifier::Notifier;
use subst_notifier::source::{Document, SubstitutionSource};
use subst_notifier::updater::Updater;
use tokio::sync::Mutex;

pub const PHONE: &str = "+491510000000";

pub async fn setup_pool() -> Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn subs(entries: &[(Weekday, &[&str])]) -> SubstitutionMap {
    entries
        .iter()
        .map(|(day, lines)| (*day, lines.iter().map(|l| l.to_string()).collect()))
        .collect()
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// A logged-in portal page whose table holds `map`, one cell per line.
pub fn portal_page(map: &SubstitutionMap) -> String {
    let mut rows = String::new();
    for (day, lines) in map {
        rows.push_str(&format!("<tr><td colspan=\"2\">{day} 19.10.</td></tr>\n"));
        for line in lines {
            rows.push_str(&format!("<tr><td>{}</td></tr>\n", escape(line)));
        }
    }
    let table = if rows.is_empty() {
        "<p>Keine Vertretungen</p>".to_string()
    } else {
        format!("<table>\n{rows}</table>")
    };
    format!(
        "<html><body><div id=\"wikitext\"><div>{table}</div></div>\
         <a href=\"?action=logout\">abmelden</a></body></html>"
    )
}

pub async fn seed_account(pool: &Pool, auth_id: &str, phone: Option<&str>) -> String {
    let id = db::create_account(pool, &Credentials::new(auth_id, "pw"))
        .await
        .unwrap();
    if let Some(phone) = phone {
        db::set_phone_number(pool, &id, phone).await.unwrap();
    }
    id
}

/// Enrolled account; with `baseline` the entries are stored as captured.
pub async fn seed_enrolled(
    pool: &Pool,
    auth_id: &str,
    entries: &SubstitutionMap,
    baseline: bool,
) -> String {
    let id = seed_account(pool, auth_id, Some(PHONE)).await;
    db::create_enrollment(pool, &id, None).await.unwrap();
    if baseline {
        db::set_entries(pool, &id, entries, true).await.unwrap();
    }
    id
}

#[derive(Debug, Clone)]
pub enum Reply {
    Page(SubstitutionMap),
    SlowPage(Duration, SubstitutionMap),
    WrongCredentials,
    Unreachable,
}

/// Scripted portal keyed by login; an exhausted script serves an empty page.
#[derive(Clone, Default)]
pub struct RecordingSource {
    replies: Arc<Mutex<HashMap<String, VecDeque<Reply>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl RecordingSource {
    pub async fn script(&self, auth_id: &str, replies: Vec<Reply>) {
        self.replies
            .lock()
            .await
            .entry(auth_id.to_string())
            .or_default()
            .extend(replies);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SubstitutionSource for RecordingSource {
    async fn fetch(&self, credentials: &Credentials) -> Result<Document, FetchError> {
        self.calls.lock().await.push(credentials.auth_id.clone());
        let reply = self
            .replies
            .lock()
            .await
            .get_mut(&credentials.auth_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Reply::Page(SubstitutionMap::new()));

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let result = match reply {
            Reply::Page(map) => Ok(Document::new(portal_page(&map))),
            Reply::SlowPage(delay, map) => {
                tokio::time::sleep(delay).await;
                Ok(Document::new(portal_page(&map)))
            }
            Reply::WrongCredentials => Err(FetchError::Credentials),
            Reply::Unreachable => Err(FetchError::Timeout),
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(String, String)>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        let n = Self::default();
        n.failing.store(true, Ordering::SeqCst);
        n
    }

    pub async fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str, recipient: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("gateway unavailable"));
        }
        self.sent
            .lock()
            .await
            .push((text.to_string(), recipient.to_string()));
        Ok(())
    }
}

pub fn updater(
    pool: &Pool,
    source: &RecordingSource,
    notifier: &RecordingNotifier,
    timeout: Duration,
) -> Arc<Updater> {
    Arc::new(Updater::new(
        pool.clone(),
        Arc::new(source.clone()),
        Arc::new(notifier.clone()),
        timeout,
    ))
}
