//! Peer addresses, connection errors and the registry of known peers

use crate::network::message::{Message, MessageKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;
use tokio::sync::RwLock;

/// Peer connection errors.
///
/// Everything except `Bind` is local to one connection.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("Connection to {addr} failed: {reason}")]
    Connect { addr: PeerAddress, reason: String },
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

impl PeerError {
    /// A message arrived that the current protocol step does not allow
    pub fn unexpected(expected: MessageKind, got: &Message) -> Self {
        PeerError::Protocol(format!("expected {}, got {}", expected, got.kind()))
    }
}

/// Network address of a peer's listening endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Convert a socket address. IPv6 addresses are accepted only when
    /// they are IPv4-mapped.
    pub fn from_socket(addr: SocketAddr) -> Option<Self> {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => ip.to_ipv4_mapped()?,
        };
        Some(Self::new(ip, addr.port()))
    }

    pub fn to_socket(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    order: Vec<PeerAddress>,
    members: HashSet<PeerAddress>,
}

/// Known peer addresses, deduplicated and kept in insertion order
#[derive(Debug, Default)]
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, addr: &PeerAddress) -> bool {
        self.inner.read().await.members.contains(addr)
    }

    /// Record an address. Returns `false` if it was already known.
    pub async fn add(&self, addr: PeerAddress) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.members.insert(addr) {
            return false;
        }
        inner.order.push(addr);
        log::info!("Added peer: {} ({} known)", addr, inner.order.len());
        true
    }

    /// All known addresses in the order they were recorded
    pub async fn snapshot(&self) -> Vec<PeerAddress> {
        self.inner.read().await.order.clone()
    }

    /// The first `max` known addresses
    pub async fn snapshot_limited(&self, max: usize) -> Vec<PeerAddress> {
        let inner = self.inner.read().await;
        inner.order.iter().take(max).copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
