//! Node configuration
//!
//! Built from the command line; the bootstrap seed may also come from a
//! hosts file holding `<host> <port>` on its first line.

use crate::mining::MinerConfig;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default P2P port
pub const DEFAULT_PORT: u16 = 8333;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid hosts file: {0}")]
    InvalidHosts(String),
}

/// P2P node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Bootstrap peer as `host:port`
    pub seed: Option<String>,
    /// Longest wait for any single message from a peer
    pub message_timeout: Duration,
    /// Longest wait for an outbound TCP connect
    pub connect_timeout: Duration,
    /// Outbound handshakes allowed to run at once
    pub max_outbound: usize,
    /// Discovery hops followed from the seed
    pub max_discovery_depth: u32,
    /// Run the miner alongside the server
    pub mining: bool,
    pub miner: MinerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            seed: None,
            message_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_outbound: 8,
            max_discovery_depth: 3,
            mining: true,
            miner: MinerConfig::default(),
        }
    }
}

/// Read the seed peer from a hosts file.
///
/// Returns `None` for a missing or empty file.
pub fn read_hosts_file(path: &Path) -> Result<Option<String>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)?;
    let Some(line) = content.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Ok(None);
    };

    let mut parts = line.split_whitespace();
    let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ConfigError::InvalidHosts(format!(
            "expected '<host> <port>', got '{}'",
            line
        )));
    };

    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidHosts(format!("bad port '{}'", port)))?;

    Ok(Some(format!("{}:{}", host, port)))
}
