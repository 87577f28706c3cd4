//! Version handshake, address exchange and initial sync
//!
//! Initiator:  version → verack ← version ← verack → getaddr → addr ←
//!             getblocks → inv ← block* ←
//! Acceptor:   the mirror image, entered when the first inbound message is
//!             `version`.
//!
//! A peer's IP address is always taken from the transport, never from the
//! peer's own version message; only its advertised listening port is used.

use crate::network::context::NodeContext;
use crate::network::message::{Message, MessageKind, VersionMessage, MAX_ADDR_PER_MESSAGE};
use crate::network::peer::{PeerAddress, PeerError};
use crate::network::sync::{self, SyncStats};
use crate::network::transport::Transport;
use tokio::io::{AsyncRead, AsyncWrite};

/// Result of an initiator run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatorOutcome {
    /// The peer as recorded in the registry
    pub peer: PeerAddress,
    /// Discovery dials queued from the peer's `addr` reply
    pub dials_queued: usize,
    pub sync: SyncStats,
}

/// Result of an acceptor run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptorOutcome {
    pub peer: PeerAddress,
    pub blocks_sent: usize,
}

/// Our own listening endpoint as seen from this link
fn observed_local<S>(ctx: &NodeContext, transport: &Transport<S>) -> Option<PeerAddress>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    PeerAddress::from_socket(transport.local_addr())
        .map(|local| PeerAddress::new(local.ip, ctx.listen_port))
}

fn check_version(ctx: &NodeContext, version: &VersionMessage) -> Result<(), PeerError> {
    if version.nonce == ctx.nonce {
        return Err(PeerError::Protocol("connected to ourselves".to_string()));
    }
    if version.addr_recv.port != ctx.listen_port {
        return Err(PeerError::Protocol(format!(
            "peer reached us on port {}, but we listen on {}",
            version.addr_recv.port, ctx.listen_port
        )));
    }
    Ok(())
}

/// Run the connection-initiating side over a freshly connected transport.
///
/// `depth` is the discovery depth of this connection; addresses learned
/// here are dialed at `depth + 1`.
pub async fn initiate<S>(
    ctx: &NodeContext,
    transport: &mut Transport<S>,
    depth: u32,
) -> Result<InitiatorOutcome, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = transport.observed_remote()?;

    transport
        .send(Message::Version(VersionMessage::new(
            remote,
            ctx.listen_port,
            ctx.nonce,
            ctx.ledger.chain_length(),
        )))
        .await?;

    match transport.receive().await? {
        Message::Verack => {}
        other => return Err(PeerError::unexpected(MessageKind::Verack, &other)),
    }

    let version = match transport.receive().await? {
        Message::Version(version) => version,
        other => return Err(PeerError::unexpected(MessageKind::Version, &other)),
    };
    if let Err(e) = check_version(ctx, &version) {
        if version.nonce == ctx.nonce {
            // We dialed one of our own addresses
            ctx.discovery.mark_local(remote).await;
        }
        return Err(e);
    }

    transport.send(Message::Verack).await?;

    let peer = PeerAddress::new(remote.ip, version.addr_from.port);
    ctx.record_peer(peer).await?;
    if let Some(local) = observed_local(ctx, transport) {
        ctx.discovery.mark_local(local).await;
    }
    log::info!(
        "Handshake with {} complete ({}, height {})",
        peer,
        version.user_agent,
        version.start_height
    );

    transport.send(Message::GetAddr).await?;
    let addrs = match transport.receive().await? {
        Message::Addr(addrs) => addrs,
        other => return Err(PeerError::unexpected(MessageKind::Addr, &other)),
    };
    let dials_queued = ctx.queue_dials(&addrs, depth + 1).await;
    log::debug!(
        "{} sent {} addresses, {} new",
        peer,
        addrs.len(),
        dials_queued
    );

    transport
        .send(Message::GetBlocks {
            hash: ctx.ledger.last_block_hash(),
        })
        .await?;
    let entries = match transport.receive().await? {
        Message::Inv(entries) => entries,
        other => return Err(PeerError::unexpected(MessageKind::Inv, &other)),
    };
    let sync = sync::receive_getblocks_reply(ctx, transport, &entries).await?;

    Ok(InitiatorOutcome {
        peer,
        dials_queued,
        sync,
    })
}

/// Run the accepting side after the first inbound message turned out to
/// be `version`.
pub async fn respond<S>(
    ctx: &NodeContext,
    transport: &mut Transport<S>,
    version: VersionMessage,
) -> Result<AcceptorOutcome, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = transport.observed_remote()?;
    let peer = PeerAddress::new(remote.ip, version.addr_from.port);
    check_version(ctx, &version)?;

    transport.send(Message::Verack).await?;
    // Tell the peer where we will reach it, so it can check its port
    transport
        .send(Message::Version(VersionMessage::new(
            peer,
            ctx.listen_port,
            ctx.nonce,
            ctx.ledger.chain_length(),
        )))
        .await?;

    match transport.receive().await? {
        Message::Verack => {}
        other => return Err(PeerError::unexpected(MessageKind::Verack, &other)),
    }
    if let Some(local) = observed_local(ctx, transport) {
        ctx.discovery.mark_local(local).await;
    }

    match transport.receive().await? {
        Message::GetAddr => {}
        other => return Err(PeerError::unexpected(MessageKind::GetAddr, &other)),
    }
    let addrs = ctx.registry.snapshot_limited(MAX_ADDR_PER_MESSAGE).await;
    transport.send(Message::Addr(addrs)).await?;

    ctx.record_peer(peer).await?;
    log::info!(
        "Accepted handshake from {} ({}, height {})",
        peer,
        version.user_agent,
        version.start_height
    );

    let hash = match transport.receive().await? {
        Message::GetBlocks { hash } => hash,
        other => return Err(PeerError::unexpected(MessageKind::GetBlocks, &other)),
    };
    let blocks_sent = sync::serve_getblocks(ctx, transport, hash).await?;

    Ok(AcceptorOutcome { peer, blocks_sent })
}
