//! Mini-Peerd: the peer protocol engine of a mini-blockchain node
//!
//! This crate connects blockchain nodes over TCP and keeps their chains in
//! step:
//! - Version handshake that records peers by their observed address
//! - Peer discovery through `getaddr`/`addr` exchanges
//! - Full-history sync from genesis and unsolicited block/tx relay
//! - A background proof-of-work miner feeding the announcer
//!
//! # Example
//!
//! ```no_run
//! use mini_peerd::config::NodeConfig;
//! use mini_peerd::core::MemoryLedger;
//! use mini_peerd::mining::Miner;
//! use mini_peerd::network::Server;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), mini_peerd::network::PeerError> {
//! let config = NodeConfig {
//!     seed: Some("127.0.0.1:8333".to_string()),
//!     port: 8334,
//!     ..Default::default()
//! };
//! let ledger = Arc::new(MemoryLedger::new());
//! let miner = Arc::new(Miner::new(ledger.clone(), config.miner.clone()));
//!
//! let mut server = Server::bind(config, ledger, miner).await?;
//! server.start().await?;
//! server.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, NodeConfig};
pub use core::{Block, Ledger, LedgerError, MemoryLedger, Transaction};
pub use crypto::Hash256;
pub use mining::{Miner, MinerConfig};
pub use network::{Announcer, PeerAddress, PeerError, PeerRegistry, Server};
