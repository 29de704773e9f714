//! Outbound HTTP for guest code.
//!
//! The guest never sees a socket or stream: every response is read fully on
//! the host, capped, and handed back as a JSON envelope.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use fathom_config::BridgeSection;
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};

/// Request options accepted from `fetch(url, opts)`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetchRequest {
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// Response envelope returned to the guest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub ok: bool,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Host-side implementation of the guest `fetch` capability.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, request: FetchRequest) -> anyhow::Result<FetchResponse>;
}

/// Settings for [`ReqwestFetcher`].
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_response_bytes: usize,
    pub allowed_schemes: Vec<String>,
    pub user_agent: String,
}

impl From<&BridgeSection> for FetchPolicy {
    fn from(section: &BridgeSection) -> Self {
        Self {
            timeout: section.fetch_timeout(),
            max_response_bytes: section.max_response_bytes,
            allowed_schemes: section.allowed_schemes.clone(),
            user_agent: section.user_agent.clone(),
        }
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::from(&BridgeSection::default())
    }
}

/// [`Fetcher`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: Client,
    policy: FetchPolicy,
}

impl ReqwestFetcher {
    pub fn new(policy: FetchPolicy) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(policy.timeout)
            .user_agent(&policy.user_agent)
            .build()?;
        Ok(Self { client, policy })
    }

    /// Parse `url` and check it against the scheme allow-list.
    pub fn check_url(&self, url: &str) -> anyhow::Result<Url> {
        let parsed = Url::parse(url).map_err(|e| anyhow::anyhow!("invalid URL '{url}': {e}"))?;
        if !self
            .policy
            .allowed_schemes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(parsed.scheme()))
        {
            anyhow::bail!("URL scheme '{}' is not allowed", parsed.scheme());
        }
        Ok(parsed)
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str, request: FetchRequest) -> anyhow::Result<FetchResponse> {
        let url = self.check_url(url)?;
        let method = match request.method.as_deref() {
            None => Method::GET,
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| anyhow::anyhow!("unsupported HTTP method '{m}'"))?,
        };

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let limit = self.policy.max_response_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            anyhow::bail!("response exceeds {limit} byte limit");
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                anyhow::bail!("response exceeds {limit} byte limit");
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status: status.as_u16(),
            ok: status.is_success(),
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
