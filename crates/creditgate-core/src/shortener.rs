//! ============================================================================
//! Link Shortener - Ad-gated short links for verification URLs
//! ============================================================================
//! Verification links are passed through an external shortener so the user
//! visits it before reaching the bot. Shortener outages never block a user:
//! `shorten_or_original` falls back to the long link.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

/// External URL shortener
#[async_trait]
pub trait Shortener: Send + Sync {
    async fn shorten(&self, url: &str) -> Result<String>;
}

/// Shorten `url`, returning it unchanged if the shortener fails
pub async fn shorten_or_original(shortener: &dyn Shortener, url: &str) -> String {
    match shortener.shorten(url).await {
        Ok(short) => short,
        Err(e) => {
            warn!("Shortener failed, using original link: {}", e);
            url.to_string()
        }
    }
}

/// Shortener that returns its input (no shortener configured)
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughShortener;

#[async_trait]
impl Shortener for PassthroughShortener {
    async fn shorten(&self, url: &str) -> Result<String> {
        Ok(url.to_string())
    }
}

/// Shortener speaking the common `/api?api=KEY&url=URL` protocol
pub struct HttpShortener {
    client: reqwest::Client,
    site: String,
    api_key: String,
}

impl HttpShortener {
    /// `site` is the shortener host, e.g. "publicearn.com"
    pub fn new(site: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            site: site
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn request_url(&self, url: &str) -> String {
        format!(
            "https://{}/api?api={}&url={}",
            self.site,
            urlencoding::encode(&self.api_key),
            urlencoding::encode(url)
        )
    }
}

#[async_trait]
impl Shortener for HttpShortener {
    async fn shorten(&self, url: &str) -> Result<String> {
        debug!("Shortening link via {}", self.site);

        let response = self
            .client
            .get(self.request_url(url))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to reach shortener {}: {}", self.site, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Shortener error {}: {}", status, body));
        }

        let reply: ShortenResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse shortener response: {}", e))?;

        reply.into_link()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShortenResponse {
    status: String,
    #[serde(default)]
    shortened_url: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ShortenResponse {
    fn into_link(self) -> Result<String> {
        let ShortenResponse {
            status,
            shortened_url,
            message,
        } = self;

        match shortened_url {
            Some(link) if status == "success" && !link.is_empty() => Ok(link),
            _ => Err(anyhow!(
                "Shortener refused link: {}",
                message.unwrap_or(status)
            )),
        }
    }
}
