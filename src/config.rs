//! Engine configuration
//!
//! Single source of truth for every tunable: rate limits, reconnect
//! backoff, queue retries, cache bounds and sync cadence. Call sites never
//! carry their own constants; they receive a section of this config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the trading REST API
    pub rest_base_url: String,
    /// Streaming feed endpoint
    pub ws_url: String,
    pub rate_limit: RateLimitConfig,
    pub reconnect: ReconnectConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    /// Safety-net interval between background drain/sync passes, in seconds
    pub sync_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://api.crickstox.example".to_string(),
            ws_url: "wss://feed.crickstox.example/stream".to_string(),
            rate_limit: RateLimitConfig::default(),
            reconnect: ReconnectConfig::default(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            sync_interval_secs: 300,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&contents)
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok(config)
    }
}

/// Dual-control limiter settings: sustained rate plus burst gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum admissions per key within the trailing window
    pub max_requests: u32,
    /// Sliding window length in seconds
    pub window_secs: u64,
    /// Admissions allowed in quick succession before the burst gate closes
    pub burst_limit: u32,
    /// Seconds the burst gate stays closed once the limit is reached
    pub cooldown_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_secs: 60,
            burst_limit: 5,
            cooldown_secs: 10,
        }
    }
}

/// Streaming reconnect behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Base interval; attempt n waits `min(base * n, max)`
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Attempts before giving up until a manual connect (0 = unlimited)
    pub max_attempts: u32,
    pub heartbeat_interval_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1_000,
            max_interval_ms: 30_000,
            max_attempts: 10,
            heartbeat_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delivery attempts per mutation before it is marked permanently failed
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_retries: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime; freshness-for-display is the consumer's concern
    pub ttl_secs: u64,
    /// Size ceiling; oldest entries are evicted once exceeded
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            max_entries: 5_000,
        }
    }
}
