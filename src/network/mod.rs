//! P2P networking
//!
//! The peer protocol engine of a node:
//! - Length-prefixed JSON framing over TCP
//! - Version handshake with observed-address bookkeeping
//! - Recursive peer discovery with depth and concurrency caps
//! - Inventory sync (`getblocks` / `inv` / `block` / `tx`)
//! - Server lifecycle and block/transaction announcement

pub mod context;
pub mod discovery;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod server;
pub mod sync;
pub mod transport;

pub use context::NodeContext;
pub use discovery::{DialRequest, Discovery};
pub use handshake::{AcceptorOutcome, InitiatorOutcome};
pub use message::{
    InvEntry, InvKind, Message, MessageKind, ServiceFlags, VersionMessage, MAGIC,
    MAX_ADDR_PER_MESSAGE, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use peer::{PeerAddress, PeerError, PeerRegistry};
pub use server::{Announcer, Server};
pub use sync::{plan_getblocks_reply, BlockReply, SyncStats};
pub use transport::{connect, MessageCodec, Transport};
