//! Configuration for one peer process.

use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::peer::PeerId;

/// Default per-abstraction worker tick and the failure-detector's derived
/// probe period (TIMEOUT/10), per spec.md §5.
pub const DEFAULT_TIMEOUT_MS: u64 = 1_000;

/// Default ERB delivered-message ring buffer capacity, per spec.md §3 and §4.5.
pub const DEFAULT_RING_BUFFER_CAPACITY: usize = 20;

/// Hard cap on a serialized link message, per spec.md §3.
pub const MAX_MESSAGE_BYTES: usize = 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Configuration {
    pub node: NodeConfig,
    pub peers: Vec<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// This peer's own process number.
    pub process_number: u64,
    /// Directory holding the `fairlosslink{n}.socket` files. Defaults to `/tmp`.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,
    /// Worker tick / heartbeat timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// ERB delivered-message ring buffer capacity.
    #[serde(default = "default_ring_buffer_capacity")]
    pub ring_buffer_capacity: usize,
}

fn default_socket_dir() -> String {
    "/tmp".to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_ring_buffer_capacity() -> usize {
    DEFAULT_RING_BUFFER_CAPACITY
}

impl NodeConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.process_number)
    }
}

impl Configuration {
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().copied().map(PeerId::new).collect()
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("configuration file does not exist: '{0}'")]
    FileDoesNotExist(String),
    #[error("failed to load configuration: {0}")]
    Load(String),
}

type Result<T> = std::result::Result<T, ConfigurationError>;

impl Configuration {
    /// Loads configuration from a TOML file, following the teacher's
    /// `config::Config::builder().add_source(config::File::from(path))` pattern.
    pub fn try_load(path: PathBuf) -> Result<Configuration> {
        if !path.exists() {
            return Err(ConfigurationError::FileDoesNotExist(
                path.to_string_lossy().to_string(),
            ));
        }

        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| ConfigurationError::Load(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Load(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ids_wraps_raw_numbers() {
        let config = Configuration {
            node: NodeConfig {
                process_number: 0,
                socket_dir: default_socket_dir(),
                timeout_ms: default_timeout_ms(),
                ring_buffer_capacity: default_ring_buffer_capacity(),
            },
            peers: vec![1, 2],
        };
        assert_eq!(config.peer_ids(), vec![PeerId::new(1), PeerId::new(2)]);
    }
}
