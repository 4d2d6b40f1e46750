//! Outbound text messages through a Signal REST gateway.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use tracing::{info, warn};

use crate::config::Signal;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str, recipient: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SignalClient {
    http: Client,
    base_url: Url,
    sender_number: String,
}

impl fmt::Debug for SignalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SignalClient {
    pub fn new(base_url: Url, sender_number: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("subst-notifier/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("reqwest client")?;
        Ok(Self {
            http,
            base_url,
            sender_number,
        })
    }

    pub fn from_config(signal: &Signal) -> Result<Self> {
        let base_url = Url::parse(&signal.base_url).context("invalid signal.base_url")?;
        Self::new(base_url, signal.sender_number.clone())
    }

    pub fn build_request(&self, text: &str, recipient: &str) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v2/send")
            .context("invalid Signal base URL")?;
        self.http
            .post(endpoint)
            .json(&build_send_body(&self.sender_number, text, recipient))
            .build()
            .context("failed to build Signal request")
    }
}

#[async_trait]
impl Notifier for SignalClient {
    async fn send(&self, text: &str, recipient: &str) -> Result<()> {
        let request = self.build_request(text, recipient)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Signal gateway")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("Rate limited by Signal gateway: {}", body);
            return Err(anyhow!("received 429 from Signal gateway: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "Signal gateway error: {}", body);
            return Err(anyhow!("signal error {}: {}", status, body));
        }

        info!("message delivered to Signal gateway");
        Ok(())
    }
}

pub fn build_send_body(sender: &str, text: &str, recipient: &str) -> Value {
    json!({
        "message": text,
        "number": sender,
        "recipients": [recipient],
    })
}
