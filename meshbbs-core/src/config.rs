//! Operator configuration.
//!
//! Mirrors what an (out-of-scope) config loader would hand the running
//! instance: the peer set, tunable intervals and thresholds, the local
//! callsign, and transport framing limits. Loaded from TOML; the operator
//! passphrase is read from the environment, never serialized here.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// One operator-whitelisted federation peer.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// Transport-level node identifier (opaque string from the radio).
    pub node_id: String,
    /// Human callsign used in `user@CALLSIGN` addressing. Unique among peers.
    pub callsign: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Root configuration for a running instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This instance's own callsign.
    pub callsign: String,
    pub peers: Vec<PeerConfig>,

    pub max_hops: u8,
    pub unreachable_threshold: u32,
    pub dead_threshold: u32,
    pub heartbeat_interval_secs: u64,
    pub route_share_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub route_expiry_secs: u64,

    pub mail_retry_attempts: u32,
    pub mail_ack_timeout_secs: u64,
    pub mail_retry_backoff_secs: Vec<u64>,
    pub remote_body_max: usize,
    pub mail_max_chunks: u32,
    pub pending_delivery_expiry_secs: u64,

    pub max_synced_boards: u32,
    pub batch_threshold: u32,
    pub batch_interval_secs: u64,
    pub board_max_chunks: u32,
    pub sync_enabled: bool,

    pub session_idle_timeout_secs: u64,
    pub max_failed_logins: u32,
    pub lockout_minutes: u64,

    pub chunk_timeout_secs: u64,
    pub chunk_total_timeout_secs: u64,
    pub transport_payload_max: usize,

    pub unicast_min_interval_ms: u64,
    pub mail_chunk_interval_ms: u64,
    pub board_chunk_interval_ms: u64,
    pub sync_request_min_interval_secs: u64,

    /// Capability-broadcast interval. `0` disables the announcement tick.
    pub announcement_interval_secs: u64,
    /// Base cadence for maintenance sweeps (chunk-buffer cleanup, route
    /// expiry, pending-delivery expiry, board-sync trigger check) that the
    /// spec describes as "every tick" rather than naming their own interval.
    pub maintenance_tick_secs: u64,

    pub kdf: KdfConfig,
}

/// Argon2id tuning. Defaults match the spec's "~32 MiB, 3 iterations,
/// parallelism 1, 32-byte output, 16-byte salt".
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: 32 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            callsign: String::new(),
            peers: Vec::new(),
            max_hops: 5,
            unreachable_threshold: 2,
            dead_threshold: 5,
            heartbeat_interval_secs: 12 * 3600,
            route_share_interval_secs: 24 * 3600,
            heartbeat_timeout_secs: 60,
            route_expiry_secs: 48 * 3600,
            mail_retry_attempts: 3,
            mail_ack_timeout_secs: 30,
            mail_retry_backoff_secs: vec![60, 120, 240],
            remote_body_max: 450,
            mail_max_chunks: 3,
            pending_delivery_expiry_secs: 600,
            max_synced_boards: 3,
            batch_threshold: 10,
            batch_interval_secs: 3600,
            board_max_chunks: 32,
            sync_enabled: true,
            session_idle_timeout_secs: 30 * 60,
            max_failed_logins: 5,
            lockout_minutes: 15,
            chunk_timeout_secs: 120,
            chunk_total_timeout_secs: 600,
            transport_payload_max: 237,
            unicast_min_interval_ms: 3500,
            mail_chunk_interval_ms: 2400,
            board_chunk_interval_ms: 3000,
            sync_request_min_interval_secs: 300,
            announcement_interval_secs: 12 * 3600,
            maintenance_tick_secs: 30,
            kdf: KdfConfig::default(),
        }
    }
}

impl Config {
    /// Parse configuration from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(CoreError::Config)
    }

    /// Load configuration from a file on disk.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn route_share_interval(&self) -> Duration {
        Duration::from_secs(self.route_share_interval_secs)
    }

    pub fn mail_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.mail_ack_timeout_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn chunk_total_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_total_timeout_secs)
    }

    /// Max bytes of textual content per chunk, after the `[seq/total] `
    /// header reserve.
    pub fn content_size(&self) -> usize {
        self.transport_payload_max.saturating_sub(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.max_hops, 5);
        assert_eq!(cfg.mail_max_chunks, 3);
        assert_eq!(cfg.content_size(), 229);
    }

    #[test]
    fn parses_peer_list() {
        let toml = r#"
            callsign = "B0"

            [[peers]]
            node_id = "!a1b2c3"
            callsign = "B1"
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.callsign, "B0");
        assert_eq!(cfg.peers.len(), 1);
        assert_eq!(cfg.peers[0].callsign, "B1");
        assert!(cfg.peers[0].enabled);
    }
}
