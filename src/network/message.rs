//! Network message types for P2P communication
//!
//! Defines the messages of the handshake and inventory protocols.

use crate::core::{Block, Transaction};
use crate::crypto::Hash256;
use crate::network::peer::PeerAddress;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x50, 0x45, 0x45, 0x52]; // "PEER"

/// Largest accepted message body
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Most addresses sent in one `addr` reply
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

bitflags! {
    /// Services a node offers
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServiceFlags: u64 {
        /// Serves the full block chain
        const NODE_NETWORK = 1;
        /// Produces blocks
        const MINING = 1 << 1;
    }
}

/// Version message exchanged in both directions of the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    /// The receiver's address as seen by the sender
    pub addr_recv: PeerAddress,
    /// The sender's address; only the port (its listening port) is trusted
    pub addr_from: PeerAddress,
    /// Random per-node value used to detect connections to ourselves
    pub nonce: u64,
    pub user_agent: String,
    /// Sender's chain length
    pub start_height: u32,
}

impl VersionMessage {
    pub fn new(addr_recv: PeerAddress, listen_port: u16, nonce: u64, start_height: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK.bits(),
            timestamp: chrono::Utc::now().timestamp(),
            addr_recv,
            addr_from: PeerAddress::new(Ipv4Addr::UNSPECIFIED, listen_port),
            nonce,
            user_agent: format!("mini-peerd/{}", env!("CARGO_PKG_VERSION")),
            start_height,
        }
    }

    pub fn services(&self) -> ServiceFlags {
        ServiceFlags::from_bits_truncate(self.services)
    }
}

/// Kind of an inventory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    Error,
    Transaction,
    Block,
}

impl InvKind {
    const fn code(self) -> u32 {
        match self {
            InvKind::Error => 0,
            InvKind::Transaction => 1,
            InvKind::Block => 2,
        }
    }
}

/// One inventory announcement.
///
/// Block and transaction entries announce how many items of that kind
/// follow the `inv` message. On the wire the count travels in the hash
/// field (little-endian, first four bytes), see [`Hash256::from_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "InvVector", try_from = "InvVector")]
pub enum InvEntry {
    /// Unknown fork point; carries the sender's tip hash
    Error(Hash256),
    Transactions(u32),
    Blocks(u32),
}

impl InvEntry {
    pub fn kind(&self) -> InvKind {
        match self {
            InvEntry::Error(_) => InvKind::Error,
            InvEntry::Transactions(_) => InvKind::Transaction,
            InvEntry::Blocks(_) => InvKind::Block,
        }
    }

    /// Announced item count, `None` for error entries
    pub fn count(&self) -> Option<u32> {
        match self {
            InvEntry::Error(_) => None,
            InvEntry::Transactions(n) | InvEntry::Blocks(n) => Some(*n),
        }
    }
}

/// Wire form of an inventory entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct InvVector {
    #[serde(rename = "type")]
    kind: u32,
    hash: Hash256,
}

impl From<InvEntry> for InvVector {
    fn from(entry: InvEntry) -> Self {
        let hash = match entry {
            InvEntry::Error(hash) => hash,
            InvEntry::Transactions(n) | InvEntry::Blocks(n) => Hash256::from_count(n),
        };
        Self {
            kind: entry.kind().code(),
            hash,
        }
    }
}

impl TryFrom<InvVector> for InvEntry {
    type Error = String;

    fn try_from(raw: InvVector) -> Result<Self, String> {
        match raw.kind {
            0 => Ok(InvEntry::Error(raw.hash)),
            1 => Ok(InvEntry::Transactions(raw.hash.to_count())),
            2 => Ok(InvEntry::Blocks(raw.hash.to_count())),
            other => Err(format!("unknown inventory type {}", other)),
        }
    }
}

/// Network message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "lowercase")]
pub enum Message {
    /// Opens the handshake
    Version(VersionMessage),

    /// Acknowledges a version
    Verack,

    /// Request list of known peers
    GetAddr,

    /// Response with peer addresses
    Addr(Vec<PeerAddress>),

    /// Request the blocks after the given hash
    GetBlocks { hash: Hash256 },

    /// Inventory announcement
    Inv(Vec<InvEntry>),

    /// One block, sent after an `inv`
    Block(Block),

    /// One transaction, sent after an `inv`
    Tx(Transaction),
}

/// Message kind without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Version,
    Verack,
    GetAddr,
    Addr,
    GetBlocks,
    Inv,
    Block,
    Tx,
}

impl MessageKind {
    /// Command name as used on the wire
    pub fn command(&self) -> &'static str {
        match self {
            MessageKind::Version => "version",
            MessageKind::Verack => "verack",
            MessageKind::GetAddr => "getaddr",
            MessageKind::Addr => "addr",
            MessageKind::GetBlocks => "getblocks",
            MessageKind::Inv => "inv",
            MessageKind::Block => "block",
            MessageKind::Tx => "tx",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Version(_) => MessageKind::Version,
            Message::Verack => MessageKind::Verack,
            Message::GetAddr => MessageKind::GetAddr,
            Message::Addr(_) => MessageKind::Addr,
            Message::GetBlocks { .. } => MessageKind::GetBlocks,
            Message::Inv(_) => MessageKind::Inv,
            Message::Block(_) => MessageKind::Block,
            Message::Tx(_) => MessageKind::Tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inventory_count_travels_in_hash_field() {
        let value = serde_json::to_value(InvEntry::Blocks(3)).unwrap();
        assert_eq!(value["type"], json!(2));
        assert_eq!(value["hash"], json!(Hash256::from_count(3).to_hex()));

        let entry: InvEntry = serde_json::from_value(value).unwrap();
        assert_eq!(entry, InvEntry::Blocks(3));
        assert_eq!(entry.count(), Some(3));
    }

    #[test]
    fn test_error_entry_keeps_hash() {
        let tip = crate::crypto::double_sha256(b"tip");
        let bytes = Message::Inv(vec![InvEntry::Error(tip)]).to_bytes().unwrap();

        match Message::from_bytes(&bytes).unwrap() {
            Message::Inv(entries) => {
                assert_eq!(entries, vec![InvEntry::Error(tip)]);
                assert_eq!(entries[0].kind(), InvKind::Error);
                assert_eq!(entries[0].count(), None);
            }
            other => panic!("Wrong message type: {:?}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_inventory_type_is_rejected() {
        let raw = json!({
            "command": "inv",
            "payload": [{ "type": 7, "hash": Hash256::zero().to_hex() }]
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(Message::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_command_names() {
        let bytes = Message::GetAddr.to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["command"], json!("getaddr"));

        let getblocks = Message::GetBlocks {
            hash: Hash256::zero(),
        };
        assert_eq!(getblocks.kind().to_string(), "getblocks");
        assert_eq!(Message::Verack.kind().command(), "verack");
    }

    #[test]
    fn test_version_message() {
        let remote = PeerAddress::new(Ipv4Addr::new(10, 0, 0, 1), 8333);
        let version = VersionMessage::new(remote, 9000, 42, 7);

        assert_eq!(version.version, PROTOCOL_VERSION);
        assert_eq!(version.addr_recv, remote);
        assert_eq!(version.addr_from.port, 9000);
        assert!(version.services().contains(ServiceFlags::NODE_NETWORK));
    }
}
