use crate::config::ExplorerConfig;
use crate::models::Network;
use crate::services::cache::{CacheKey, CacheService};
use anyhow::{Context, Result};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExplorerError {
    #[error("Explorer request timed out")]
    Timeout,

    #[error("Explorer unreachable: {0}")]
    Http(String),

    #[error("API error: {0}")]
    Status(u16),

    #[error("API error: rate limited by explorer")]
    RateLimited,

    #[error("API error: {0}")]
    Api(String),

    #[error("Malformed explorer response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ExplorerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExplorerError::Timeout
        } else if e.is_decode() {
            ExplorerError::Decode(e.to_string())
        } else {
            ExplorerError::Http(e.to_string())
        }
    }
}

/// One GET against a block explorer.
#[derive(Debug, Clone)]
pub struct ExplorerRequest {
    pub network: Network,
    pub url: String,
    query: Vec<(&'static str, String)>,
    secret_query: Vec<(&'static str, String)>,
    headers: Vec<(&'static str, String)>,
}

impl ExplorerRequest {
    pub fn new(network: Network, url: impl Into<String>) -> Self {
        Self {
            network,
            url: url.into(),
            query: Vec::new(),
            secret_query: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn query(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.query.push((name, value.into()));
        self
    }

    /// Query parameter that is sent but kept out of the cache key.
    pub fn secret(mut self, name: &'static str, value: Option<&str>) -> Self {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            self.secret_query.push((name, v.to_string()));
        }
        self
    }

    pub fn header(mut self, name: &'static str, value: Option<&str>) -> Self {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            self.headers.push((name, v.to_string()));
        }
        self
    }

    pub fn cache_key(&self) -> String {
        let mut key = CacheKey::new("explorer")
            .partition(self.network.as_str())
            .arg(&self.url);
        for (name, value) in &self.query {
            key = key.kwarg(*name, value);
        }
        key.fingerprint()
    }
}

/// HTTP access to explorers with a response cache and per-network throttle.
pub struct ExplorerClient {
    http: reqwest::Client,
    cache: Arc<CacheService>,
    limiter: DefaultKeyedRateLimiter<Network>,
    ttls: HashMap<Network, Duration>,
}

impl ExplorerClient {
    pub fn new(config: &ExplorerConfig, cache: Arc<CacheService>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("payment-reconciler/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build explorer HTTP client")?;

        let per_second = NonZeroU32::new(config.rate_limit_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http,
            cache,
            limiter: RateLimiter::keyed(Quota::per_second(per_second)),
            ttls: config.cache_ttls.clone(),
        })
    }

    pub fn ttl_for(&self, network: Network) -> Duration {
        self.ttls
            .get(&network)
            .copied()
            .unwrap_or_else(|| network.default_cache_ttl())
    }

    /// Fetches a JSON payload, serving it from cache while fresh.
    ///
    /// `validate` inspects a fresh payload before it is cached, so explorer
    /// error bodies served with a 200 are neither cached nor matched.
    pub async fn get_json<F>(
        &self,
        request: ExplorerRequest,
        validate: F,
    ) -> Result<Value, ExplorerError>
    where
        F: Fn(&Value) -> Result<(), ExplorerError>,
    {
        let key = request.cache_key();
        if let Some(cached) = self.cache.get::<Value>(&key).await {
            tracing::debug!(network = %request.network, url = %request.url, "Explorer cache hit");
            return Ok(cached);
        }

        self.limiter.until_key_ready(&request.network).await;

        let mut builder = self
            .http
            .get(&request.url)
            .query(&request.query)
            .query(&request.secret_query);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                network = %request.network,
                url = %request.url,
                status = status.as_u16(),
                "Explorer returned an error status"
            );
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ExplorerError::RateLimited);
            }
            return Err(ExplorerError::Status(status.as_u16()));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ExplorerError::Decode(e.to_string()))?;
        validate(&payload)?;

        if let Err(e) = self
            .cache
            .set(&key, &payload, self.ttl_for(request.network))
            .await
        {
            tracing::warn!("Failed to cache explorer response: {}", e);
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_is_not_part_of_the_cache_key() {
        let a = ExplorerRequest::new(Network::Ethereum, "https://x/api")
            .query("address", "0xabc")
            .secret("apikey", Some("one"));
        let b = ExplorerRequest::new(Network::Ethereum, "https://x/api")
            .query("address", "0xabc")
            .secret("apikey", Some("two"));
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn different_addresses_get_different_keys() {
        let a = ExplorerRequest::new(Network::Tron, "https://x/api").query("address", "T1");
        let b = ExplorerRequest::new(Network::Tron, "https://x/api").query("address", "T2");
        assert_ne!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("explorer:tron:"));
    }

    #[test]
    fn status_errors_read_like_api_errors() {
        assert_eq!(ExplorerError::Status(500).to_string(), "API error: 500");
        assert!(ExplorerError::RateLimited.to_string().starts_with("API error:"));
    }
}
