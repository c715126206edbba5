use serde::{Deserialize, Serialize};

use crate::core::{
    AggregatorConfig, DdosDetectionConfig, DecisionConfig, FirewallConfig, PipelineConfig, SignatureThresholds,
    ThreatIntelConfig,
};

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Block and whitelist storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend (file or redis)
    pub backend: String,
    /// JSON document path for the file backend
    pub path: String,
    /// Key prefix for the redis backend
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            path: "data/blocks.json".to_string(),
            key_prefix: "netdefense".to_string(),
        }
    }
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to expose Prometheus metrics
    pub enabled: bool,
    /// Listen address of the Prometheus endpoint
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:9000".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Flow aggregation configuration
    pub aggregator: AggregatorConfig,
    /// Attack signature thresholds
    pub signatures: SignatureThresholds,
    /// DDoS detection configuration
    pub detection: DdosDetectionConfig,
    /// Auto-block decision configuration
    pub decision: DecisionConfig,
    /// Firewall configuration
    pub firewall: FirewallConfig,
    /// Threat intelligence configuration
    pub threat_intel: ThreatIntelConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
    /// Pipeline configuration
    pub pipeline: PipelineConfig,
}
