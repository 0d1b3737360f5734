//! Configuration handling for the p2p node.
//!
//! Values come from the shared config file, then environment variables, then
//! command line flags.

use anyhow::Result;
use p2p_session::SessionManagerConfig;
use p2p_state::StoreMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// P2P node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Member name hosted by this node
    pub node_name: String,
    /// Member the demo traffic is sent to
    pub peer_name: String,
    /// Group both members belong to
    pub group_id: String,
    /// Storage mode: memory, file
    pub storage_mode: String,
    /// Data directory for file storage
    pub data_dir: String,
    /// Fsync frequency for file storage
    pub fsync_every: u32,
    /// Sessions kept per counterparty pair
    pub sessions_per_peer: usize,
    /// Lifetime of a session after its last write
    pub session_ttl: Duration,
    /// Time a negotiation may take before it is replaced
    pub handshake_timeout: Duration,
    /// Silence after a send before a session counts as dead
    pub dead_session_timeout: Duration,
    /// Random delay added to expiry deletions
    pub expiry_jitter: Duration,
    /// Revocation checks slower than this count as revoked
    pub revocation_check_timeout: Duration,
    /// Members treated as revoked
    pub revoked: Vec<String>,
    /// Demo messages to send
    pub message_count: usize,
    /// Delay between demo messages
    pub message_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let session = SessionManagerConfig::default();
        Self {
            node_name: "O=Alice".to_string(),
            peer_name: "O=Bob".to_string(),
            group_id: "default-group".to_string(),
            storage_mode: "memory".to_string(),
            data_dir: "./p2pdata".to_string(),
            fsync_every: 1,
            sessions_per_peer: session.sessions_per_peer,
            session_ttl: session.session_ttl,
            handshake_timeout: session.handshake_timeout,
            dead_session_timeout: session.dead_session_timeout,
            expiry_jitter: session.expiry_jitter,
            revocation_check_timeout: session.revocation_check_timeout,
            revoked: Vec::new(),
            message_count: 10,
            message_interval: Duration::from_secs(1),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    p2p: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

fn parse_duration(key: &str, value: &str) -> Option<Duration> {
    match humantime::parse_duration(value) {
        Ok(duration) => Some(duration),
        Err(e) => {
            warn!("Ignoring {}={}: {}", key, value, e);
            None
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(values) = root.services.and_then(|s| s.p2p).and_then(|p| p.config) {
                        for (key, value) in values {
                            config.apply_value(&key, value);
                        }
                    }
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?} ({}), using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_environment_overrides(std::env::vars());

        info!(
            "Final p2p configuration: node={}, peer={}, group={}, storage={}",
            config.node_name, config.peer_name, config.group_id, config.storage_mode
        );
        Ok(config)
    }

    /// Apply one `services.p2p.*` value
    fn apply_value(&mut self, key: &str, value: String) {
        let Some(name) = key.strip_prefix("services.p2p.") else {
            return;
        };
        match name {
            "node_name" => self.node_name = value,
            "peer_name" => self.peer_name = value,
            "group_id" => self.group_id = value,
            "storage_mode" => self.storage_mode = value.to_lowercase(),
            "data_dir" => self.data_dir = value,
            "fsync_every" => {
                if let Ok(n) = value.parse() {
                    self.fsync_every = n;
                }
            }
            "sessions_per_peer" => {
                if let Ok(n) = value.parse() {
                    self.sessions_per_peer = n;
                }
            }
            "message_count" => {
                if let Ok(n) = value.parse() {
                    self.message_count = n;
                }
            }
            "session_ttl" => {
                if let Some(d) = parse_duration(key, &value) {
                    self.session_ttl = d;
                }
            }
            "handshake_timeout" => {
                if let Some(d) = parse_duration(key, &value) {
                    self.handshake_timeout = d;
                }
            }
            "dead_session_timeout" => {
                if let Some(d) = parse_duration(key, &value) {
                    self.dead_session_timeout = d;
                }
            }
            "expiry_jitter" => {
                if let Some(d) = parse_duration(key, &value) {
                    self.expiry_jitter = d;
                }
            }
            "revocation_check_timeout" => {
                if let Some(d) = parse_duration(key, &value) {
                    self.revocation_check_timeout = d;
                }
            }
            "message_interval" => {
                if let Some(d) = parse_duration(key, &value) {
                    self.message_interval = d;
                }
            }
            "revoked" => {
                self.revoked = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            _ => {
                // Ignore unknown configuration keys
            }
        }
    }

    /// Apply `P2P_*` environment overrides
    fn apply_environment_overrides(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (name, value) in vars {
            let Some(field) = name.strip_prefix("P2P_") else {
                continue;
            };
            let key = format!("services.p2p.{}", field.to_lowercase());
            info!("{} overridden by environment", key);
            self.apply_value(&key, value);
        }
    }

    /// Store backend for the local member
    pub fn store_mode(&self) -> Result<StoreMode> {
        match self.storage_mode.as_str() {
            "memory" => Ok(StoreMode::InMemory),
            "file" => Ok(StoreMode::File {
                data_dir: self.data_dir.clone(),
                fsync_every: self.fsync_every,
            }),
            other => anyhow::bail!("Invalid storage mode: {}", other),
        }
    }

    /// Session manager tunables
    pub fn session_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            sessions_per_peer: self.sessions_per_peer,
            session_ttl: self.session_ttl,
            handshake_timeout: self.handshake_timeout,
            dead_session_timeout: self.dead_session_timeout,
            expiry_jitter: self.expiry_jitter,
            revocation_check_timeout: self.revocation_check_timeout,
            ..SessionManagerConfig::default()
        }
    }
}
