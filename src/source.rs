//! Authenticated fetch of a student's substitution page.
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Url};
use scraper::Html;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::Portal;
use crate::error::FetchError;
use crate::model::Credentials;

const PORTAL_PAGE: &str = "pmwiki/pmwiki.php";

/// Raw HTML of a fetched substitution page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    html: String,
}

impl Document {
    pub fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    /// Concatenated text content of the whole document.
    pub fn text(&self) -> String {
        Html::parse_document(&self.html)
            .root_element()
            .text()
            .collect()
    }
}

#[async_trait]
pub trait SubstitutionSource: Send + Sync {
    /// Log in with `credentials` and return the resulting page.
    async fn fetch(&self, credentials: &Credentials) -> Result<Document, FetchError>;
}

#[derive(Clone)]
pub struct PortalClient {
    http: Client,
    page_url: Url,
    login_marker: String,
}

impl fmt::Debug for PortalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalClient")
            .field("page_url", &self.page_url)
            .finish_non_exhaustive()
    }
}

impl PortalClient {
    pub fn new(
        base_url: Url,
        login_marker: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let page_url = base_url
            .join(PORTAL_PAGE)
            .context("invalid portal base URL")?;
        let http = Client::builder()
            .user_agent(concat!("subst-notifier/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("reqwest client")?;
        Ok(Self {
            http,
            page_url,
            login_marker: login_marker.into(),
        })
    }

    pub fn from_config(portal: &Portal) -> anyhow::Result<Self> {
        let base_url = Url::parse(&portal.base_url).context("invalid portal.base_url")?;
        Self::new(base_url, portal.login_marker.clone(), portal.timeout())
    }

    /// Each student has their own wiki page named after the lowercased login.
    pub fn page_url(&self, auth_id: &str) -> Url {
        let mut url = self.page_url.clone();
        url.query_pairs_mut()
            .append_pair("n", &format!("Main.{}", auth_id.to_lowercase()));
        url
    }

    pub fn build_request(&self, credentials: &Credentials) -> Result<reqwest::Request, FetchError> {
        let url = self.page_url(&credentials.auth_id);
        let form = [
            ("authid", credentials.auth_id.as_str()),
            ("authpw", credentials.auth_pw.as_str()),
        ];
        Ok(self.http.post(url).form(&form).build()?)
    }

    fn is_logged_in(&self, document: &Document) -> bool {
        document.text().contains(&self.login_marker)
    }
}

#[async_trait]
impl SubstitutionSource for PortalClient {
    #[instrument(skip_all, fields(auth_id = %credentials.auth_id))]
    async fn fetch(&self, credentials: &Credentials) -> Result<Document, FetchError> {
        let request = self.build_request(credentials)?;
        debug!(url = %request.url(), "requesting substitution page");
        let res = self.http.execute(request).await?.error_for_status()?;
        let body = res.text().await?;
        let document = Document::new(body);
        if !self.is_logged_in(&document) {
            return Err(FetchError::Credentials);
        }
        Ok(document)
    }
}
