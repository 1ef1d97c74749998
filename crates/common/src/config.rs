use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level front end configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: Vec<String>,
    #[serde(default)]
    pub admin: AdminConfig,
    /// Capacity of each connection's outbound packet queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Longest accepted inbound frame, in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Fail dispatches whose packet type has no pipeline anywhere in its
    /// ancestry. When off, such packets are accepted and ignored.
    #[serde(default = "default_true")]
    pub throw_on_unregistered: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            throw_on_unregistered: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_tokens_per_period")]
    pub tokens_per_period: u64,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
}

impl RateLimitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: default_max_tokens(),
            tokens_per_period: default_tokens_per_period(),
            period_ms: default_period_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_lifetime")]
    pub default_lifetime_secs: u64,
    /// Background sweep interval; `0` leaves eviction purely lazy.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn default_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_lifetime_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_lifetime_secs: default_cache_lifetime(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

// Default value helpers
fn default_admin_listen() -> String {
    "127.0.0.1:9091".to_string()
}
fn default_true() -> bool {
    true
}
fn default_outbound_queue() -> usize {
    256
}
fn default_max_frame_bytes() -> usize {
    64 * 1024
}
fn default_max_tokens() -> u64 {
    20
}
fn default_tokens_per_period() -> u64 {
    10
}
fn default_period_ms() -> u64 {
    1_000
}
fn default_cache_lifetime() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    60
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML document.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.listen.is_empty() {
            anyhow::bail!("server.listen must have at least one address");
        }

        if self.server.outbound_queue == 0 {
            anyhow::bail!("server.outbound_queue must be greater than zero");
        }

        if self.rate_limit.enabled {
            let rl = &self.rate_limit;
            if rl.max_tokens == 0 || rl.tokens_per_period == 0 || rl.period_ms == 0 {
                anyhow::bail!(
                    "rate_limit values must be non-zero (max_tokens={}, tokens_per_period={}, period_ms={})",
                    rl.max_tokens,
                    rl.tokens_per_period,
                    rl.period_ms
                );
            }
        }

        if self.cache.default_lifetime_secs == 0 {
            anyhow::bail!("cache.default_lifetime_secs must be greater than zero");
        }

        Ok(())
    }
}
