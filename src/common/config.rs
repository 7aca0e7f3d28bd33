//! Configuration for repfs components

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Bind address for the control protocol
    pub bind_addr: SocketAddr,

    /// Target number of replicas per file
    #[serde(default = "default_replication")]
    pub replication: usize,

    /// Quorum / probe timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Period between automatic rebalance rounds in milliseconds
    #[serde(default = "default_rebalance_period_ms")]
    pub rebalance_period_ms: u64,

    /// Whether rebalance rounds may start at all (test harness switch)
    #[serde(default = "default_true")]
    pub auto_rebalance: bool,
}

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Bind address for the peer data plane
    pub bind_addr: SocketAddr,

    /// Controller address to join
    pub controller_addr: SocketAddr,

    /// Data-plane read / ack timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Directory holding the stored blobs (wiped on startup)
    pub data_dir: PathBuf,
}

fn default_replication() -> usize {
    3
}
fn default_timeout_ms() -> u64 {
    3_000
}
fn default_rebalance_period_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4000".parse().unwrap(),
            replication: default_replication(),
            timeout_ms: default_timeout_ms(),
            rebalance_period_ms: default_rebalance_period_ms(),
            auto_rebalance: true,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4100".parse().unwrap(),
            controller_addr: "127.0.0.1:4000".parse().unwrap(),
            timeout_ms: default_timeout_ms(),
            data_dir: PathBuf::from("./node-data"),
        }
    }
}

impl ControllerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rebalance_period(&self) -> Duration {
        Duration::from_millis(self.rebalance_period_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.replication == 0 {
            return Err(crate::Error::InvalidConfig(
                "replication factor must be at least 1".into(),
            ));
        }
        if self.timeout_ms == 0 || self.rebalance_period_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "timeout and rebalance period must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl NodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig("timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Optional file-based configuration, layered under CLI flags.
///
/// Read from `$REPFS_CONFIG` or `./repfs.toml` when present; CLI arguments
/// always take priority.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub controller: Option<ControllerConfig>,
    pub node: Option<NodeConfig>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load() -> Self {
        let path = std::env::var("REPFS_CONFIG").unwrap_or_else(|_| "repfs.toml".to_string());
        config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .build()
            .ok()
            .and_then(|c| c.try_deserialize().ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.replication, 3);
        assert!(cfg.auto_rebalance);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_replication() {
        let cfg = ControllerConfig {
            replication: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let cfg = ControllerConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = NodeConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
