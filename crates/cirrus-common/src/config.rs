//! Configuration types for Cirrus
//!
//! The node binary loads these from a TOML file and merges CLI overrides
//! on top; everything here is plain data with serde defaults.

use crate::error::{Error, Result};
use crate::types::Watermarks;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Maintains cluster membership and accepts target registrations
    Proxy,
    /// Keeps the local object cache and serves file requests
    Target,
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "proxy" => Ok(Self::Proxy),
            "target" => Ok(Self::Target),
            other => Err(Error::configuration(format!(
                "invalid role {other:?}, expected \"proxy\" or \"target\""
            ))),
        }
    }
}

/// Cloud provider selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Amazon,
    Google,
    /// In-process store for development and tests
    Memory,
}

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Node identity and network configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Process role; required (no sensible default between the two)
    pub role: Option<Role>,
    /// Member ID; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Proxy base URL targets register with
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: None,
            id: None,
            listen: default_listen(),
            proxy_url: default_proxy_url(),
        }
    }
}

/// Cache layout and eviction configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Explicit mountpath roots; takes precedence over discovery/emulation
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Only mounts under this prefix become mountpaths when scanning
    /// /proc/mounts
    #[serde(default)]
    pub mount_prefix: Option<PathBuf>,
    /// Base directory for emulated mountpaths (testing without real mounts)
    #[serde(default)]
    pub emulate_path: Option<PathBuf>,
    /// Number of emulated mountpaths under `emulate_path`
    #[serde(default)]
    pub emulate_count: u32,
    /// Eviction watermarks
    #[serde(default)]
    pub watermarks: Watermarks,
    /// Seconds between eviction passes
    #[serde(default = "default_evict_interval")]
    pub evict_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            mount_prefix: None,
            emulate_path: None,
            emulate_count: 0,
            watermarks: Watermarks::default(),
            evict_interval_secs: default_evict_interval(),
        }
    }
}

/// Cloud backend configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_provider")]
    pub provider: Provider,
    /// Endpoint override (S3-compatible stores, emulators)
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
        }
    }
}

/// Statistics logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Seconds between stats log lines; 0 disables the stats runner
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval(),
        }
    }
}

impl Config {
    /// Validate cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        let role = self
            .node
            .role
            .ok_or_else(|| Error::configuration("node.role is required (proxy or target)"))?;

        Watermarks::new(
            self.cache.watermarks.low_percent,
            self.cache.watermarks.high_percent,
        )
        .map_err(Error::Configuration)?;

        if role == Role::Target
            && self.cache.paths.is_empty()
            && self.cache.mount_prefix.is_none()
            && (self.cache.emulate_path.is_none() || self.cache.emulate_count == 0)
        {
            return Err(Error::configuration(
                "target requires cache.paths, cache.mount_prefix, or \
                 cache.emulate_path with cache.emulate_count >= 1",
            ));
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_proxy_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_evict_interval() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    60
}

fn default_provider() -> Provider {
    Provider::Amazon
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_missing_is_rejected() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_target_needs_cache_layout() {
        let mut cfg = Config::default();
        cfg.node.role = Some(Role::Target);
        assert!(cfg.validate().is_err());

        cfg.cache.emulate_path = Some(PathBuf::from("/tmp/cirrus"));
        cfg.cache.emulate_count = 2;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_proxy_validates_without_cache() {
        let mut cfg = Config::default();
        cfg.node.role = Some(Role::Proxy);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bad_watermarks_rejected() {
        let mut cfg = Config::default();
        cfg.node.role = Some(Role::Proxy);
        cfg.cache.watermarks = Watermarks {
            low_percent: 95,
            high_percent: 80,
        };
        assert!(cfg.validate().is_err());
    }
}
