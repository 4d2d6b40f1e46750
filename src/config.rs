//! Configuration loader and validator for the substitution notifier.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub portal: Portal,
    pub updater: Updater,
    pub signal: Signal,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Substitution portal settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Portal {
    pub base_url: String,
    pub login_marker: String,
    pub timeout_secs: u64,
}

/// Batch update settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Updater {
    pub max_errors: u32,
    /// Cron expression with a leading seconds field.
    pub schedule: String,
    /// Lifetime of the database lease that keeps runs of separate processes apart.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_lease_secs() -> u64 {
    300
}

/// Signal REST gateway used for outbound text messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signal {
    pub base_url: String,
    pub sender_number: String,
}

impl App {
    /// Expand a leading `~/` in `data_dir`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Portal {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Updater {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` wins over the sqlite file inside `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/subst-notifier.db?mode=rwc", self.app.resolved_data_dir())
        })
    }

    pub fn schedule(&self) -> Result<cron::Schedule, ConfigError> {
        cron::Schedule::from_str(&self.updater.schedule)
            .map_err(|_| ConfigError::Invalid("updater.schedule must be a valid cron expression"))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if Url::parse(&cfg.portal.base_url).is_err() {
        return Err(ConfigError::Invalid("portal.base_url must be a valid URL"));
    }
    if cfg.portal.login_marker.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.login_marker must be non-empty"));
    }
    if cfg.portal.timeout_secs == 0 {
        return Err(ConfigError::Invalid("portal.timeout_secs must be > 0"));
    }

    // max_errors is u32; zero means the first failure aborts a run
    cfg.schedule()?;
    if cfg.updater.lease_secs <= cfg.portal.timeout_secs {
        return Err(ConfigError::Invalid(
            "updater.lease_secs must be greater than portal.timeout_secs",
        ));
    }

    if Url::parse(&cfg.signal.base_url).is_err() {
        return Err(ConfigError::Invalid("signal.base_url must be a valid URL"));
    }
    if cfg.signal.sender_number.trim().is_empty() {
        return Err(ConfigError::Invalid("signal.sender_number must be non-empty"));
    }

    Ok(())
}

/// Reference configuration file.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

portal:
  base_url: "https://vertretungsplan.hpg-speyer.de/"
  login_marker: "abmelden"
  timeout_secs: 30

updater:
  max_errors: 5
  schedule: "0 */10 6-20 * * Mon-Fri"
  lease_secs: 300

signal:
  base_url: "http://localhost:8080/"
  sender_number: "+4915112345678"
"#
}
