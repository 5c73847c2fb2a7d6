//! Configuration for trackerd

use crate::protocol::{TrackerSettings, DEFAULT_MAX_DEFERRED_TOTAL, MESSAGE_WINDOW_MS};
use clap::Parser;
use host_tracker_core::types::{NodeId, PledgeRef};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// trackerd - Local Host Table membership tracker
#[derive(Parser, Debug, Clone)]
#[command(name = "trackerd")]
#[command(about = "Host membership tracker and delta gossip daemon")]
pub struct Config {
    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/trackerd")]
    pub data_dir: PathBuf,

    /// Declared identity seed (node id = BLAKE3(seed))
    #[arg(long, env = "TRACKER_IDENTITY_SEED")]
    pub identity_seed: String,

    /// This host's pledge transaction (64 hex chars)
    #[arg(long, env = "TRACKER_PLEDGE_TX")]
    pub pledge_tx: Option<String>,

    /// JSON array of ledger transaction records to seed the ledger view
    #[arg(long)]
    pub ledger_snapshot: Option<PathBuf>,

    /// Public address announced in this host's join (no join without it)
    #[arg(long, env = "TRACKER_PUBLIC_IP")]
    pub public_ip: Option<IpAddr>,

    /// Announced TCP port
    #[arg(long, default_value = "9300")]
    pub tcp_port: u16,

    /// Announced WebSocket port
    #[arg(long, default_value = "9301")]
    pub ws_port: u16,

    /// Announce this host as a gateway
    #[arg(long)]
    pub gateway: bool,

    /// Gossip drain interval in seconds
    #[arg(long, default_value = "5")]
    pub gossip_interval_secs: u64,

    /// Table save interval in seconds
    #[arg(long, default_value = "3600")]
    pub save_interval_secs: u64,

    /// Signatures required to declare a host failed
    #[arg(long, default_value = "3")]
    pub failure_quorum: usize,

    /// Failure signature collection deadline in seconds
    #[arg(long, default_value = "30")]
    pub failure_timeout_secs: u64,

    /// Acceptance window for message timestamps in milliseconds
    #[arg(long, default_value_t = MESSAGE_WINDOW_MS)]
    pub message_window_ms: u64,

    /// Minimum direct-connect neighbors
    #[arg(long, default_value = "3")]
    pub min_neighbors: usize,

    /// Parked updates per unknown host
    #[arg(long, default_value = "16")]
    pub max_deferred: usize,

    /// Parked updates across all unknown hosts
    #[arg(long, default_value_t = DEFAULT_MAX_DEFERRED_TOTAL)]
    pub max_deferred_total: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identity_seed.is_empty() {
            anyhow::bail!("Identity seed cannot be empty");
        }
        if self.failure_quorum == 0 {
            anyhow::bail!("Failure quorum must be at least 1");
        }
        if self.gossip_interval_secs == 0 || self.save_interval_secs == 0 {
            anyhow::bail!("Gossip and save intervals must be positive");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("Log format must be 'pretty' or 'json'");
        }
        self.pledge_ref()?;
        Ok(())
    }

    /// Parsed pledge reference, if configured
    pub fn pledge_ref(&self) -> anyhow::Result<Option<PledgeRef>> {
        let Some(hex_ref) = &self.pledge_tx else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_ref)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Pledge tx must be 32 bytes"))?;
        Ok(Some(PledgeRef(bytes)))
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            message_window_ms: self.message_window_ms,
            failure_quorum: self.failure_quorum,
            failure_timeout: Duration::from_secs(self.failure_timeout_secs),
            max_deferred_per_node: self.max_deferred,
            max_deferred_total: self.max_deferred_total,
            min_host_neighbors: self.min_neighbors,
        }
    }
}

/// Persisted node state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Signing keypair seed (deterministic recovery)
    pub keypair_seed: [u8; 32],
    /// Node id the keypair was created for
    pub node_id: [u8; 32],
}

impl NodeState {
    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["trackerd", "--identity-seed", "abc"])
    }

    #[test]
    fn test_defaults() {
        let config = base_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.save_interval_secs, 3600);

        let settings = config.tracker_settings();
        assert_eq!(settings.failure_quorum, 3);
        assert_eq!(settings.failure_timeout, Duration::from_secs(30));
        assert_eq!(settings.message_window_ms, 600_000);
        assert_eq!(settings.max_deferred_total, 1024);
    }

    #[test]
    fn test_pledge_ref_parsing() {
        let mut config = base_config();
        assert!(config.pledge_ref().unwrap().is_none());

        config.pledge_tx = Some("ab".repeat(32));
        assert_eq!(config.pledge_ref().unwrap(), Some(PledgeRef([0xab; 32])));

        config.pledge_tx = Some("abcd".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = base_config();
        config.failure_quorum = 0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.log_format = "xml".into();
        assert!(config.validate().is_err());
    }
}
