//! State shared by every connection task
//!
//! All engine writes to the ledger and the peer registry go through
//! [`NodeContext`], which refuses them once shutdown has begun.

use crate::config::NodeConfig;
use crate::core::{Block, Ledger, LedgerError, Transaction};
use crate::network::discovery::{DialRequest, Discovery};
use crate::network::peer::{PeerAddress, PeerError, PeerRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

/// Capacity of the outbound dial queue
const DIAL_QUEUE_SIZE: usize = 256;

pub struct NodeContext {
    /// Port the listener is bound to
    pub listen_port: u16,
    /// Random value identifying this node in version messages
    pub nonce: u64,
    pub config: NodeConfig,
    pub ledger: Arc<dyn Ledger>,
    pub registry: Arc<PeerRegistry>,
    pub discovery: Discovery,
    shutdown: CancellationToken,
    /// Held shared by every mutation and exclusively while shutting down
    barrier: RwLock<()>,
    dials: mpsc::Sender<DialRequest>,
}

impl NodeContext {
    /// Create the context and the receiving end of its dial queue
    pub fn new(
        listen_port: u16,
        config: NodeConfig,
        ledger: Arc<dyn Ledger>,
    ) -> (Self, mpsc::Receiver<DialRequest>) {
        let registry = Arc::new(PeerRegistry::new());
        let discovery = Discovery::new(registry.clone(), config.max_discovery_depth);
        let (dials, dial_rx) = mpsc::channel(DIAL_QUEUE_SIZE);

        let ctx = Self {
            listen_port,
            nonce: rand::random(),
            config,
            ledger,
            registry,
            discovery,
            shutdown: CancellationToken::new(),
            barrier: RwLock::new(()),
            dials,
        };
        (ctx, dial_rx)
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn ensure_running(&self) -> Result<(), PeerError> {
        if self.is_stopping() {
            Err(PeerError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Cancel the shutdown token once no mutation is in progress. No
    /// mutation starts afterwards.
    pub async fn shut_down(&self) {
        let _barrier = self.barrier.write().await;
        self.shutdown.cancel();
    }

    async fn enter(&self) -> Result<RwLockReadGuard<'_, ()>, PeerError> {
        let barrier = self.barrier.read().await;
        self.ensure_running()?;
        Ok(barrier)
    }

    /// Record a verified peer address
    pub async fn record_peer(&self, addr: PeerAddress) -> Result<bool, PeerError> {
        let _barrier = self.enter().await?;
        Ok(self.registry.add(addr).await)
    }

    /// Hand a received block to the ledger. Returns whether it was
    /// accepted; a rejection is the ledger's decision, not a protocol
    /// failure.
    pub async fn add_block(&self, block: Block, from: SocketAddr) -> Result<bool, PeerError> {
        let _barrier = self.enter().await?;
        let index = block.index;
        match self.ledger.add_block(block) {
            Ok(()) => Ok(true),
            // Full-history replies always start with a block we hold
            Err(LedgerError::DuplicateBlock(hash)) => {
                log::debug!("Block {} ({}) from {} already known", index, hash, from);
                Ok(false)
            }
            Err(e) => {
                log::warn!("Block {} from {} not added: {}", index, from, e);
                Ok(false)
            }
        }
    }

    pub async fn add_tx(&self, tx: Transaction, from: SocketAddr) -> Result<bool, PeerError> {
        let _barrier = self.enter().await?;
        match self.ledger.add_tx(tx) {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("Transaction from {} not added: {}", from, e);
                Ok(false)
            }
        }
    }

    /// Queue outbound handshakes for addresses we have not seen yet.
    /// Returns the number of dials queued.
    pub async fn queue_dials(&self, addrs: &[PeerAddress], depth: u32) -> usize {
        if self.is_stopping() {
            return 0;
        }

        let mut queued = 0;
        for request in self.discovery.claim(addrs, depth).await {
            if let Err(e) = self.dials.try_send(request) {
                log::warn!("Dropping dial to {}: {}", request.addr, e);
                self.discovery.release(&request.addr).await;
                continue;
            }
            queued += 1;
        }
        queued
    }
}
