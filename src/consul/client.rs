//! HTTP client for the Consul KV and status APIs.
//!
//! Reads use Consul blocking queries: passing the last seen `ModifyIndex` as
//! `index` makes the server hold the request until the entry changes or the
//! `wait` duration elapses.

use std::time::Duration;

use base64::Engine;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;

/// Default agent address, matching the Consul CLI.
pub const DEFAULT_ADDRESS: &str = "http://127.0.0.1:8500";

/// Slack added on top of the blocking wait before the HTTP request times out.
const REQUEST_SLACK: Duration = Duration::from_secs(5);

/// HTTP client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid Consul address '{0}'")]
    InvalidAddress(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid response: {0}")]
    Decode(String),
}

/// A KV entry as returned by a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    /// Decoded value; empty when the key holds no data.
    pub value: Vec<u8>,
    pub modify_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawKvPair {
    key: String,
    value: Option<String>,
    modify_index: u64,
}

impl RawKvPair {
    fn decode(self) -> Result<KvPair, ClientError> {
        let value = match self.value {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| ClientError::Decode(format!("value of '{}': {}", self.key, e)))?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
            modify_index: self.modify_index,
        })
    }
}

/// HTTP client for a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    base_url: Url,
    token: Option<String>,
    datacenter: Option<String>,
    client: Client,
}

impl ConsulClient {
    /// Create with explicit configuration.
    ///
    /// `address` may omit the scheme (`127.0.0.1:8500`), as `CONSUL_HTTP_ADDR`
    /// commonly does.
    pub fn new(
        address: &str,
        token: Option<String>,
        datacenter: Option<String>,
    ) -> Result<Self, ClientError> {
        let normalized = normalize_address(address);
        let base_url = Url::parse(&normalized)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| ClientError::InvalidAddress(address.to_string()))?;

        Ok(Self {
            base_url,
            token: token.filter(|t| !t.is_empty()),
            datacenter: datacenter.filter(|dc| !dc.is_empty()),
            client: Client::new(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build a URL below the agent address, percent-encoding each segment.
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn kv_url(&self, key: &str) -> Url {
        self.url(["v1", "kv"].into_iter().chain(key.split('/')))
    }

    /// Build a request with optional token header and datacenter.
    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(ref token) = self.token {
            req = req.header("X-Consul-Token", token);
        }
        if let Some(ref dc) = self.datacenter {
            req = req.query(&[("dc", dc)]);
        }
        req
    }

    async fn server_error(response: reqwest::Response) -> ClientError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ClientError::Server(format!("{}: {}", status, body.trim()))
    }

    /// Read a single key, blocking until its index moves past `index` or
    /// `wait` elapses.
    ///
    /// Returns `Ok(None)` when the key does not exist. A leading `/` is not
    /// part of the key, as with the Consul CLI.
    pub async fn get_kv(
        &self,
        key: &str,
        index: u64,
        wait: Duration,
    ) -> Result<Option<KvPair>, ClientError> {
        let key = key.trim_start_matches('/');
        let url = self.kv_url(key);
        let response = self
            .request(url)
            .query(&[
                ("index", index.to_string()),
                ("wait", format!("{}ms", wait.as_millis())),
            ])
            .timeout(wait + wait / 16 + REQUEST_SLACK)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let entries: Vec<RawKvPair> = response
                    .json()
                    .await
                    .map_err(|e| ClientError::Decode(e.to_string()))?;
                entries
                    .into_iter()
                    .find(|entry| entry.key == key)
                    .map(RawKvPair::decode)
                    .transpose()
            }
            _ => Err(Self::server_error(response).await),
        }
    }

    /// Address of the current raft leader, or `None` while there is none.
    pub async fn leader(&self) -> Result<Option<String>, ClientError> {
        let response = self
            .request(self.url(["v1", "status", "leader"]))
            .timeout(REQUEST_SLACK)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::server_error(response).await);
        }

        let leader: String = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(Some(leader).filter(|l| !l.is_empty()))
    }
}

fn normalize_address(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}
