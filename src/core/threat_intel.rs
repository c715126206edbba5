//! Threat intelligence lookups for the network defense service.
//!
//! This module provides the reputation sources consulted before a block
//! decision: a static indicator list from configuration and an optional
//! HTTP reputation service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during threat intelligence lookups
#[derive(Debug, Error)]
pub enum ThreatIntelError {
    #[error("API request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A positive reputation match for an address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatIntelHit {
    pub indicator: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub source: String,
    pub category: Option<String>,
}

/// Indicator configured locally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticIndicator {
    pub indicator: String,
    pub confidence: f64,
    #[serde(default)]
    pub category: Option<String>,
}

/// Threat intelligence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatIntelConfig {
    /// Base URL of the reputation service; lookups are disabled when unset
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
    /// Most reputation answers kept in memory
    pub cache_capacity: usize,
    pub indicators: Vec<StaticIndicator>,
}

impl Default for ThreatIntelConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_seconds: 5,
            cache_ttl_seconds: 3600,
            cache_capacity: 10_000,
            indicators: Vec::new(),
        }
    }
}

/// Source of reputation data
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ThreatIntelProvider: Send + Sync {
    /// Look up `address`; `Ok(None)` means the address is not known bad
    async fn lookup(&self, address: &str) -> Result<Option<ThreatIntelHit>, ThreatIntelError>;

    fn name(&self) -> String;
}

/// Indicators loaded from configuration
pub struct StaticThreatIntel {
    indicators: HashMap<String, StaticIndicator>,
}

impl StaticThreatIntel {
    pub fn new(indicators: Vec<StaticIndicator>) -> Self {
        Self {
            indicators: indicators
                .into_iter()
                .map(|i| (i.indicator.clone(), i))
                .collect(),
        }
    }
}

#[async_trait]
impl ThreatIntelProvider for StaticThreatIntel {
    async fn lookup(&self, address: &str) -> Result<Option<ThreatIntelHit>, ThreatIntelError> {
        Ok(self.indicators.get(address).map(|i| ThreatIntelHit {
            indicator: i.indicator.clone(),
            confidence: i.confidence.clamp(0.0, 1.0),
            source: "static".to_string(),
            category: i.category.clone(),
        }))
    }

    fn name(&self) -> String {
        "static".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct ReputationEnvelope {
    data: ReputationData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReputationData {
    ip_address: String,
    abuse_confidence_score: u8,
    #[serde(default)]
    usage_type: Option<String>,
}

/// Convert a reputation service response body into a hit
fn hit_from_response(body: &str) -> Result<Option<ThreatIntelHit>, ThreatIntelError> {
    let envelope: ReputationEnvelope =
        serde_json::from_str(body).map_err(|e| ThreatIntelError::InvalidResponse(e.to_string()))?;
    let data = envelope.data;
    if data.abuse_confidence_score == 0 {
        return Ok(None);
    }
    if data.abuse_confidence_score > 100 {
        return Err(ThreatIntelError::InvalidResponse(format!(
            "confidence score {} out of range",
            data.abuse_confidence_score
        )));
    }
    Ok(Some(ThreatIntelHit {
        indicator: data.ip_address,
        confidence: data.abuse_confidence_score as f64 / 100.0,
        source: "reputation".to_string(),
        category: data.usage_type,
    }))
}

/// HTTP reputation service client
pub struct ReputationClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    cache_ttl: chrono::Duration,
    cache_capacity: usize,
    cache: DashMap<String, (Option<ThreatIntelHit>, DateTime<Utc>)>,
}

impl ReputationClient {
    /// Create a new reputation client instance
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration, cache_ttl: Duration) -> Result<Self, ThreatIntelError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            cache_ttl: chrono::Duration::from_std(cache_ttl).unwrap_or_else(|_| chrono::Duration::hours(1)),
            cache_capacity: 10_000,
            cache: DashMap::new(),
        })
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    /// Store an answer, evicting expired entries and then the oldest ones
    /// once the cache is full
    fn remember(&self, address: &str, hit: Option<ThreatIntelHit>, now: DateTime<Utc>) {
        if self.cache.len() >= self.cache_capacity && !self.cache.contains_key(address) {
            let ttl = self.cache_ttl;
            self.cache.retain(|_, (_, stored_at)| now - *stored_at < ttl);
            while self.cache.len() >= self.cache_capacity {
                let oldest = self
                    .cache
                    .iter()
                    .min_by_key(|e| e.value().1)
                    .map(|e| e.key().clone());
                match oldest {
                    Some(key) => {
                        self.cache.remove(&key);
                    }
                    None => break,
                }
            }
        }
        self.cache.insert(address.to_string(), (hit, now));
    }

    fn cached(&self, address: &str) -> Option<Option<ThreatIntelHit>> {
        let entry = self.cache.get(address)?;
        let (hit, stored_at) = entry.value();
        if Utc::now() - *stored_at < self.cache_ttl {
            Some(hit.clone())
        } else {
            None
        }
    }
}

#[async_trait]
impl ThreatIntelProvider for ReputationClient {
    async fn lookup(&self, address: &str) -> Result<Option<ThreatIntelHit>, ThreatIntelError> {
        if let Some(hit) = self.cached(address) {
            return Ok(hit);
        }

        let url = format!("{}/check", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .query(&[("ipAddress", address)])
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Key", key);
        }

        let response = request.send().await?.error_for_status()?;
        let body = response.text().await?;
        let hit = hit_from_response(&body)?;

        debug!("Reputation lookup for {}: {:?}", address, hit.as_ref().map(|h| h.confidence));
        self.remember(address, hit.clone(), Utc::now());
        Ok(hit)
    }

    fn name(&self) -> String {
        "reputation".to_string()
    }
}

/// Queries every provider and keeps the most confident hit
#[derive(Clone, Default)]
pub struct ThreatIntelChain {
    providers: Vec<Arc<dyn ThreatIntelProvider>>,
}

impl ThreatIntelChain {
    pub fn new(providers: Vec<Arc<dyn ThreatIntelProvider>>) -> Self {
        Self { providers }
    }

    /// Build the chain described by `config`
    pub fn from_config(config: &ThreatIntelConfig) -> Result<Self, ThreatIntelError> {
        let mut providers: Vec<Arc<dyn ThreatIntelProvider>> = Vec::new();
        if !config.indicators.is_empty() {
            providers.push(Arc::new(StaticThreatIntel::new(config.indicators.clone())));
        }
        if let Some(base_url) = &config.base_url {
            providers.push(Arc::new(ReputationClient::new(
                base_url.clone(),
                config.api_key.clone(),
                Duration::from_secs(config.timeout_seconds.max(1)),
                Duration::from_secs(config.cache_ttl_seconds),
            )?
            .with_cache_capacity(config.cache_capacity)));
        }
        Ok(Self::new(providers))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Lookup failures are logged and treated as "no intel"
    pub async fn lookup(&self, address: &str) -> Option<ThreatIntelHit> {
        let lookups = self.providers.iter().map(|p| async move { (p.name(), p.lookup(address).await) });
        let results = futures::future::join_all(lookups).await;

        let mut best: Option<ThreatIntelHit> = None;
        for (provider, result) in results {
            match result {
                Ok(Some(hit)) => {
                    if best.as_ref().map_or(true, |b| hit.confidence > b.confidence) {
                        best = Some(hit);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    metrics::increment_counter!("threat_intel_errors_total", "provider" => provider.clone());
                    warn!("Threat intel provider {} failed for {}: {}", provider, address, e);
                }
            }
        }
        best
    }
}
