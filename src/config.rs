use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the node exporter.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Address of the node whose metrics are exported.
    #[serde(default)]
    pub node_address: String,

    /// Ethereum network name (e.g., mainnet, holesky). Used to locate
    /// rewards tree files.
    #[serde(default)]
    pub network: String,

    /// Execution client connection configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Beacon node connection configuration.
    #[serde(default)]
    pub beacon: BeaconConfig,

    /// Network state snapshot source.
    #[serde(default)]
    pub state: StateConfig,

    /// Rewards tree artifact location.
    #[serde(default)]
    pub rewards: RewardsConfig,

    /// Prometheus metrics server configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Execution client connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// JSON-RPC HTTP endpoint (e.g., "http://localhost:8545").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_client_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Beacon node connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BeaconConfig {
    /// Beacon node HTTP endpoint (e.g., "http://localhost:5052").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_client_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Network state snapshot configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Path of the JSON snapshot written by the state manager.
    #[serde(default)]
    pub path: PathBuf,

    /// How often the snapshot file is re-read. Default: 30s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

/// Rewards tree artifact configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RewardsConfig {
    /// Directory containing `rp-rewards-{network}-{index}.json` files.
    #[serde(default)]
    pub tree_dir: PathBuf,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Listen address. Default: ":9102".
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_client_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_metrics_addr() -> String {
    ":9102".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node_address: String::new(),
            network: String::new(),
            execution: ExecutionConfig::default(),
            beacon: BeaconConfig::default(),
            state: StateConfig::default(),
            rewards: RewardsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_client_timeout(),
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_client_timeout(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            addr: default_metrics_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node_address.is_empty() {
            bail!("node_address is required");
        }
        self.node_address()?;

        if self.network.is_empty() {
            bail!("network is required");
        }

        if self.execution.endpoint.is_empty() {
            bail!("execution.endpoint is required");
        }

        if self.beacon.endpoint.is_empty() {
            bail!("beacon.endpoint is required");
        }

        if self.state.path.as_os_str().is_empty() {
            bail!("state.path is required");
        }

        if self.state.refresh_interval.is_zero() {
            bail!("state.refresh_interval must be positive");
        }

        if self.rewards.tree_dir.as_os_str().is_empty() {
            bail!("rewards.tree_dir is required");
        }

        Ok(())
    }

    /// Parsed node address.
    pub fn node_address(&self) -> Result<Address> {
        Address::from_str(self.node_address.trim())
            .with_context(|| format!("invalid node_address {:?}", self.node_address))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const NODE: &str = "0x1111111111111111111111111111111111111111";

    fn valid_config() -> Config {
        Config {
            node_address: NODE.to_string(),
            network: "mainnet".to_string(),
            execution: ExecutionConfig {
                endpoint: "http://localhost:8545".to_string(),
                ..Default::default()
            },
            beacon: BeaconConfig {
                endpoint: "http://localhost:5052".to_string(),
                ..Default::default()
            },
            state: StateConfig {
                path: PathBuf::from("/data/state.json"),
                ..Default::default()
            },
            rewards: RewardsConfig {
                tree_dir: PathBuf::from("/data/rewards-trees"),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.state.refresh_interval, Duration::from_secs(30));
        assert_eq!(cfg.beacon.timeout, Duration::from_secs(10));
        assert_eq!(cfg.execution.timeout, Duration::from_secs(10));
        assert_eq!(cfg.metrics.addr, ":9102");
    }

    #[test]
    fn test_valid_config_passes() {
        let cfg = valid_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.node_address().expect("address"),
            Address::from_str(NODE).expect("address")
        );
    }

    #[test]
    fn test_validation_missing_node_address() {
        let cfg = Config {
            node_address: String::new(),
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("node_address"));
    }

    #[test]
    fn test_validation_invalid_node_address() {
        let cfg = Config {
            node_address: "0xnot-an-address".to_string(),
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid node_address"));
    }

    #[test]
    fn test_validation_missing_beacon() {
        let cfg = Config {
            beacon: BeaconConfig::default(),
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("beacon.endpoint"));
    }

    #[test]
    fn test_validation_missing_execution() {
        let cfg = Config {
            execution: ExecutionConfig::default(),
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("execution.endpoint"));
    }

    #[test]
    fn test_validation_zero_refresh_interval() {
        let cfg = Config {
            state: StateConfig {
                path: PathBuf::from("/data/state.json"),
                refresh_interval: Duration::ZERO,
            },
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("state.refresh_interval"));
    }

    #[test]
    fn test_validation_missing_tree_dir() {
        let cfg = Config {
            rewards: RewardsConfig::default(),
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("rewards.tree_dir"));
    }

    #[test]
    fn test_load_yaml() {
        let yaml = format!(
            "node_address: \"{NODE}\"\n\
             network: holesky\n\
             execution:\n  endpoint: http://el:8545\n  timeout: 5s\n\
             beacon:\n  endpoint: http://cl:5052\n\
             state:\n  path: /data/state.json\n  refresh_interval: 1m\n\
             rewards:\n  tree_dir: /data/trees\n\
             metrics:\n  addr: \"127.0.0.1:9999\"\n"
        );
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(yaml.as_bytes()).expect("write");

        let cfg = Config::load(file.path()).expect("should load");
        assert_eq!(cfg.network, "holesky");
        assert_eq!(cfg.execution.timeout, Duration::from_secs(5));
        assert_eq!(cfg.beacon.timeout, Duration::from_secs(10));
        assert_eq!(cfg.state.refresh_interval, Duration::from_secs(60));
        assert_eq!(cfg.metrics.addr, "127.0.0.1:9999");
    }
}
