//! Chain synchronization with peers
//!
//! Both sides of the inventory protocol: answering `getblocks`, reading
//! the blocks announced by an `inv`, and pushing unsolicited inventory.
//! Every `inv` entry announces exactly how many typed messages follow it.

use crate::core::{Block, Ledger, Transaction};
use crate::crypto::Hash256;
use crate::network::context::NodeContext;
use crate::network::message::{InvEntry, Message, MessageKind};
use crate::network::peer::PeerError;
use crate::network::transport::Transport;
use tokio::io::{AsyncRead, AsyncWrite};

/// What one inventory exchange did to the ledger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub blocks_received: usize,
    pub blocks_added: usize,
    pub txs_received: usize,
    pub txs_added: usize,
    /// Set when the peer did not know our tip; carries the peer's tip
    pub unknown_fork: Option<Hash256>,
}

impl SyncStats {
    fn merge(&mut self, other: SyncStats) {
        self.blocks_received += other.blocks_received;
        self.blocks_added += other.blocks_added;
        self.txs_received += other.txs_received;
        self.txs_added += other.txs_added;
        if other.unknown_fork.is_some() {
            self.unknown_fork = other.unknown_fork;
        }
    }
}

/// Reply to a `getblocks` request: the `inv` entry and the blocks that
/// follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReply {
    pub entry: InvEntry,
    pub blocks: Vec<Block>,
}

/// Decide how to answer `getblocks{hash}`.
///
/// - genesis hash: the full chain, count = chain length
/// - known hash at `index`: count = length - index + 1, no blocks
/// - unknown hash: an error entry carrying our tip
pub fn plan_getblocks_reply(ledger: &dyn Ledger, hash: &Hash256) -> BlockReply {
    if *hash == ledger.genesis_block_hash() {
        let blocks = ledger.blocks_after(None);
        return BlockReply {
            entry: InvEntry::Blocks(ledger.chain_length()),
            blocks,
        };
    }

    match ledger.find_index_by_hash(hash) {
        // The peer is expected to pull these separately
        Some(index) => BlockReply {
            entry: InvEntry::Blocks(ledger.chain_length().saturating_sub(index).saturating_add(1)),
            blocks: Vec::new(),
        },
        None => BlockReply {
            entry: InvEntry::Error(ledger.last_block_hash()),
            blocks: Vec::new(),
        },
    }
}

/// Answer a `getblocks` request. Returns the number of blocks sent.
pub async fn serve_getblocks<S>(
    ctx: &NodeContext,
    transport: &mut Transport<S>,
    hash: Hash256,
) -> Result<usize, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = plan_getblocks_reply(ctx.ledger.as_ref(), &hash);
    log::debug!(
        "getblocks {} from {}: replying {:?} with {} blocks",
        hash,
        transport.remote_addr(),
        reply.entry,
        reply.blocks.len()
    );

    transport.send(Message::Inv(vec![reply.entry])).await?;

    let sent = reply.blocks.len();
    for block in reply.blocks {
        transport.send(Message::Block(block)).await?;
    }
    Ok(sent)
}

/// Read the `inv` answering our `getblocks` and the blocks it announces.
///
/// Only a single entry is meaningful here.
pub async fn receive_getblocks_reply<S>(
    ctx: &NodeContext,
    transport: &mut Transport<S>,
    entries: &[InvEntry],
) -> Result<SyncStats, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match entries {
        [InvEntry::Error(tip)] => {
            log::info!(
                "{} does not know our tip (its tip is {})",
                transport.remote_addr(),
                tip
            );
            Ok(SyncStats {
                unknown_fork: Some(*tip),
                ..Default::default()
            })
        }
        [InvEntry::Blocks(amount)] => receive_blocks(ctx, transport, *amount).await,
        _ => Err(PeerError::Protocol(format!(
            "unsupported getblocks reply {:?}",
            entries
        ))),
    }
}

/// Consume an unsolicited inventory: for each entry read exactly the
/// announced number of items and hand them to the ledger in order.
pub async fn receive_inventory<S>(
    ctx: &NodeContext,
    transport: &mut Transport<S>,
    entries: &[InvEntry],
) -> Result<SyncStats, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stats = SyncStats::default();
    for entry in entries {
        match *entry {
            InvEntry::Blocks(amount) => stats.merge(receive_blocks(ctx, transport, amount).await?),
            InvEntry::Transactions(amount) => {
                stats.merge(receive_transactions(ctx, transport, amount).await?)
            }
            InvEntry::Error(hash) => {
                log::debug!(
                    "Ignoring error entry {} from {}",
                    hash,
                    transport.remote_addr()
                );
            }
        }
    }
    Ok(stats)
}

/// Serve an inbound relay link that opened with `inv`.
///
/// After the first inventory, further `inv` messages are accepted until
/// the peer closes the link or goes quiet.
pub async fn serve_relay<S>(
    ctx: &NodeContext,
    transport: &mut Transport<S>,
    first: Vec<InvEntry>,
) -> Result<SyncStats, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stats = receive_inventory(ctx, transport, &first).await?;

    loop {
        let msg = match transport.next_message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(PeerError::Timeout(_)) => {
                log::debug!("Relay link to {} idle, closing", transport.remote_addr());
                break;
            }
            Err(e) => return Err(e),
        };

        match msg {
            Message::Inv(entries) => stats.merge(receive_inventory(ctx, transport, &entries).await?),
            other => return Err(PeerError::unexpected(MessageKind::Inv, &other)),
        }
    }

    Ok(stats)
}

async fn receive_blocks<S>(
    ctx: &NodeContext,
    transport: &mut Transport<S>,
    amount: u32,
) -> Result<SyncStats, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let from = transport.remote_addr();
    let mut stats = SyncStats::default();

    for _ in 0..amount {
        let block = match transport.receive().await? {
            Message::Block(block) => block,
            other => return Err(PeerError::unexpected(MessageKind::Block, &other)),
        };
        stats.blocks_received += 1;
        if ctx.add_block(block, from).await? {
            stats.blocks_added += 1;
        }
    }

    log::info!(
        "Received {} blocks from {} ({} added), height now {}",
        stats.blocks_received,
        from,
        stats.blocks_added,
        ctx.ledger.chain_length()
    );
    Ok(stats)
}

async fn receive_transactions<S>(
    ctx: &NodeContext,
    transport: &mut Transport<S>,
    amount: u32,
) -> Result<SyncStats, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let from = transport.remote_addr();
    let mut stats = SyncStats::default();

    for _ in 0..amount {
        let tx = match transport.receive().await? {
            Message::Tx(tx) => tx,
            other => return Err(PeerError::unexpected(MessageKind::Tx, &other)),
        };
        stats.txs_received += 1;
        if ctx.add_tx(tx, from).await? {
            stats.txs_added += 1;
        }
    }

    log::debug!(
        "Received {} transactions from {}",
        stats.txs_received,
        from
    );
    Ok(stats)
}

/// Item count for an `inv` entry
fn announced_count(items: usize) -> Result<u32, PeerError> {
    u32::try_from(items)
        .map_err(|_| PeerError::Protocol(format!("cannot announce {} items in one entry", items)))
}

/// Announce blocks: one `inv` entry followed by the blocks
pub async fn send_blocks<S>(transport: &mut Transport<S>, blocks: Vec<Block>) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let count = announced_count(blocks.len())?;
    transport
        .send(Message::Inv(vec![InvEntry::Blocks(count)]))
        .await?;
    for block in blocks {
        transport.send(Message::Block(block)).await?;
    }
    Ok(())
}

/// Announce transactions: one `inv` entry followed by the transactions
pub async fn send_transactions<S>(
    transport: &mut Transport<S>,
    txs: Vec<Transaction>,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let count = announced_count(txs.len())?;
    transport
        .send(Message::Inv(vec![InvEntry::Transactions(count)]))
        .await?;
    for tx in txs {
        transport.send(Message::Tx(tx)).await?;
    }
    Ok(())
}
