use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// A preseeded throttle: requests matching the method and url prefix are
/// spaced at least `wait_duration` apart.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimit {
    pub url: String,
    pub method: String,
    #[serde(with = "humantime_serde")]
    pub wait_duration: Duration,
}

/// Cache TTL clamps applied to responses for urls under the given prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheOverride {
    pub url: String,
    #[serde(with = "humantime_serde")]
    pub min_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub rate_limits: Vec<RateLimit>,
    #[serde(default)]
    pub cache_overrides: Vec<CacheOverride>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse config file at {}", path.display()))
    }

    /// Returns the cache override whose url is the longest prefix of `url`, if any.
    pub fn cache_override_for_url(&self, url: &str) -> Option<&CacheOverride> {
        self.cache_overrides
            .iter()
            .filter(|override_| url.starts_with(override_.url.as_str()))
            .max_by_key(|override_| override_.url.len())
    }
}
