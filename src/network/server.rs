//! TCP server and connection handling
//!
//! Owns the listener, the outbound dialer and the miner. Every accepted or
//! dialed connection runs in its own task; a failure only ends that task.

use crate::config::NodeConfig;
use crate::core::{Block, Ledger, Transaction};
use crate::mining::Miner;
use crate::network::context::NodeContext;
use crate::network::discovery::DialRequest;
use crate::network::handshake;
use crate::network::message::Message;
use crate::network::peer::{PeerAddress, PeerError, PeerRegistry};
use crate::network::sync;
use crate::network::transport::{self, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// P2P server for one node
pub struct Server {
    ctx: Arc<NodeContext>,
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    dial_rx: Option<mpsc::Receiver<DialRequest>>,
    miner: Arc<Miner>,
}

impl Server {
    /// Bind the listener. Port 0 picks a free port.
    pub async fn bind(
        config: NodeConfig,
        ledger: Arc<dyn Ledger>,
        miner: Arc<Miner>,
    ) -> Result<Self, PeerError> {
        let port = config.port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| PeerError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| PeerError::Bind { port, source })?;
        log::info!("Server listening on {}", local_addr);

        let (ctx, dial_rx) = NodeContext::new(local_addr.port(), config, ledger);

        Ok(Self {
            ctx: Arc::new(ctx),
            local_addr,
            listener: Some(listener),
            dial_rx: Some(dial_rx),
            miner,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The port peers reach this node on
    pub fn port(&self) -> u16 {
        self.ctx.listen_port
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.ctx.registry.clone()
    }

    pub fn announcer(&self) -> Announcer {
        Announcer {
            ctx: self.ctx.clone(),
        }
    }

    /// Start accepting, dialing and mining, then dial the seed
    pub async fn start(&mut self) -> Result<(), PeerError> {
        self.ctx.ensure_running()?;
        let (Some(listener), Some(dial_rx)) = (self.listener.take(), self.dial_rx.take()) else {
            log::warn!("Server on port {} already started", self.port());
            return Ok(());
        };

        tokio::spawn(accept_loop(self.ctx.clone(), listener));

        let outbound = Arc::new(Semaphore::new(self.ctx.config.max_outbound.max(1)));
        tokio::spawn(dial_loop(self.ctx.clone(), dial_rx, outbound));

        if self.ctx.config.mining {
            self.miner.start();
        }

        if let Some(seed) = self.ctx.config.seed.clone() {
            match resolve_seed(&seed).await {
                Ok(Some(addr)) => {
                    log::info!("Bootstrapping from {}", addr);
                    self.ctx.queue_dials(&[addr], 0).await;
                }
                Ok(None) => log::warn!("Seed {} has no IPv4 address", seed),
                Err(e) => log::warn!("Cannot resolve seed {}: {}", seed, e),
            }
        }

        log::info!("Node started on port {}", self.port());
        Ok(())
    }

    /// Stop accepting and dialing. Connections still running can no
    /// longer change the ledger or the registry.
    pub async fn stop(&self) {
        if self.ctx.is_stopping() {
            return;
        }
        log::info!("Node shutting down...");
        self.ctx.shut_down().await;
        self.miner.stop();
    }

    /// Resolves once `stop` has been called
    pub async fn wait(&self) {
        self.ctx.shutdown_token().cancelled().await;
    }
}

/// Resolve `host:port` and keep the first IPv4 result
async fn resolve_seed(seed: &str) -> Result<Option<PeerAddress>, std::io::Error> {
    let mut addrs = tokio::net::lookup_host(seed).await?;
    Ok(addrs.find_map(PeerAddress::from_socket))
}

async fn accept_loop(ctx: Arc<NodeContext>, listener: TcpListener) {
    let shutdown = ctx.shutdown_token().clone();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        log::debug!("Incoming connection from {}", addr);

        let mut transport = match Transport::from_tcp(stream, ctx.config.message_timeout) {
            Ok(transport) => transport,
            Err(e) => {
                log::warn!("Dropping connection from {}: {}", addr, e);
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            match serve_inbound(&ctx, &mut transport).await {
                Ok(()) => log::debug!("Connection from {} finished", addr),
                Err(PeerError::ShuttingDown) => {
                    log::debug!("Connection from {} cut short by shutdown", addr)
                }
                Err(e) => log::warn!("Connection error with {}: {}", addr, e),
            }
        });
    }

    log::info!("Listener on port {} closed", ctx.listen_port);
}

/// Dispatch an inbound connection on its first message
pub(crate) async fn serve_inbound<S>(
    ctx: &NodeContext,
    transport: &mut Transport<S>,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match transport.receive().await? {
        Message::Version(version) => {
            let outcome = handshake::respond(ctx, transport, version).await?;
            log::debug!("Served {} blocks to {}", outcome.blocks_sent, outcome.peer);
        }
        Message::Inv(entries) => {
            let stats = sync::serve_relay(ctx, transport, entries).await?;
            log::debug!(
                "Relay from {} done: {} blocks, {} transactions",
                transport.remote_addr(),
                stats.blocks_received,
                stats.txs_received
            );
        }
        other => {
            return Err(PeerError::Protocol(format!(
                "connection opened with {}",
                other.kind()
            )))
        }
    }
    Ok(())
}

async fn dial_loop(
    ctx: Arc<NodeContext>,
    mut dial_rx: mpsc::Receiver<DialRequest>,
    outbound: Arc<Semaphore>,
) {
    let shutdown = ctx.shutdown_token().clone();

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = dial_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = outbound.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            dial(&ctx, request).await;
            ctx.discovery.release(&request.addr).await;
            drop(permit);
        });
    }

    log::debug!("Dialer stopped");
}

async fn dial(ctx: &NodeContext, request: DialRequest) {
    let DialRequest { addr, depth } = request;
    log::info!("Connecting to peer {} (depth {})", addr, depth);

    let connected = tokio::select! {
        _ = ctx.shutdown_token().cancelled() => return,
        connected = transport::connect(addr, ctx.config.connect_timeout, ctx.config.message_timeout) => connected,
    };

    let result = match connected {
        Ok(mut transport) => handshake::initiate(ctx, &mut transport, depth).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(outcome) => log::info!(
            "Synced with {}: {} of {} blocks added, {} new addresses",
            outcome.peer,
            outcome.sync.blocks_added,
            outcome.sync.blocks_received,
            outcome.dials_queued
        ),
        Err(PeerError::ShuttingDown) => log::debug!("Dial to {} cut short by shutdown", addr),
        Err(e) => log::warn!("Connection error with {}: {}", addr, e),
    }
}

enum Announcement {
    Block(Block),
    Tx(Transaction),
}

/// Pushes new blocks and transactions to every known peer
#[derive(Clone)]
pub struct Announcer {
    ctx: Arc<NodeContext>,
}

impl Announcer {
    /// Announce a block to every registered peer. Returns the number of
    /// peers contacted.
    pub async fn announce_block(&self, block: Block) -> usize {
        log::debug!("Announcing block {} ({})", block.index, block.hash);
        self.broadcast(Announcement::Block(block)).await
    }

    pub async fn announce_transaction(&self, tx: Transaction) -> usize {
        log::debug!("Announcing transaction {}", tx.id);
        self.broadcast(Announcement::Tx(tx)).await
    }

    async fn broadcast(&self, item: Announcement) -> usize {
        if self.ctx.is_stopping() {
            return 0;
        }

        let item = Arc::new(item);
        let peers = self.ctx.registry.snapshot().await;
        for peer in &peers {
            let ctx = self.ctx.clone();
            let item = item.clone();
            let peer = *peer;
            tokio::spawn(async move {
                if let Err(e) = deliver(&ctx, peer, &item).await {
                    log::warn!("Failed to announce to {}: {}", peer, e);
                }
            });
        }
        peers.len()
    }
}

async fn deliver(ctx: &NodeContext, peer: PeerAddress, item: &Announcement) -> Result<(), PeerError> {
    let mut transport =
        transport::connect(peer, ctx.config.connect_timeout, ctx.config.message_timeout).await?;
    match item {
        Announcement::Block(block) => sync::send_blocks(&mut transport, vec![block.clone()]).await,
        Announcement::Tx(tx) => sync::send_transactions(&mut transport, vec![tx.clone()]).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryLedger;
    use crate::network::context::tests::test_context;
    use crate::network::transport::tests::pair;
    use std::net::Ipv4Addr;

    fn test_config(seed: Option<String>) -> NodeConfig {
        NodeConfig {
            port: 0,
            seed,
            message_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            mining: false,
            ..Default::default()
        }
    }

    async fn test_server(ledger: Arc<MemoryLedger>, seed: Option<String>) -> Server {
        test_server_with(ledger, test_config(seed)).await
    }

    async fn test_server_with(ledger: Arc<MemoryLedger>, config: NodeConfig) -> Server {
        let miner = Arc::new(Miner::new(ledger.clone(), config.miner.clone()));
        Server::bind(config, ledger, miner).await.unwrap()
    }

    fn seed_for(server: &Server) -> Option<String> {
        Some(format!("127.0.0.1:{}", server.port()))
    }

    fn loopback(port: u16) -> PeerAddress {
        PeerAddress::new(Ipv4Addr::LOCALHOST, port)
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = test_server(Arc::new(MemoryLedger::new()), None).await;
        assert_ne!(server.port(), 0);
        assert_eq!(server.local_addr().port(), server.port());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = test_server(Arc::new(MemoryLedger::new()), None).await;
        let ledger = Arc::new(MemoryLedger::new());
        let config = NodeConfig {
            port: first.port(),
            ..test_config(None)
        };
        let miner = Arc::new(Miner::new(ledger.clone(), config.miner.clone()));

        let result = Server::bind(config, ledger, miner).await;
        assert!(matches!(result, Err(PeerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_nodes_sync_over_loopback() {
        let a_ledger = Arc::new(MemoryLedger::new());
        a_ledger.extend_with_empty_blocks(3).unwrap();
        let mut a = test_server(a_ledger.clone(), None).await;
        a.start().await.unwrap();

        let b_ledger = Arc::new(MemoryLedger::new());
        let seed = format!("127.0.0.1:{}", a.port());
        let mut b = test_server(b_ledger.clone(), Some(seed)).await;
        b.start().await.unwrap();

        let synced = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if a.registry().len().await == 1
                    && b.registry().len().await == 1
                    && b_ledger.chain_length() == 4
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(synced.is_ok(), "nodes did not sync");

        assert_eq!(a.registry().snapshot().await, vec![loopback(b.port())]);
        assert_eq!(b.registry().snapshot().await, vec![loopback(a.port())]);
        assert_eq!(b_ledger.last_block_hash(), a_ledger.last_block_hash());

        // New block on A reaches B through the announcer
        let block = Block::new(a_ledger.chain_length(), a_ledger.last_block_hash(), vec![], 0);
        a_ledger.add_block(block.clone()).unwrap();
        assert_eq!(a.announcer().announce_block(block.clone()).await, 1);

        let relayed = tokio::time::timeout(Duration::from_secs(5), async {
            while b_ledger.chain_length() < 5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(relayed.is_ok(), "announced block not received");
        assert_eq!(b_ledger.last_block_hash(), block.hash);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_silent_peer_does_not_stall_others() {
        let a_ledger = Arc::new(MemoryLedger::new());
        a_ledger.extend_with_empty_blocks(3).unwrap();
        let config = NodeConfig {
            message_timeout: Duration::from_secs(10),
            ..test_config(None)
        };
        let mut a = test_server_with(a_ledger.clone(), config).await;
        a.start().await.unwrap();

        // Connected but never sends anything
        let _silent = tokio::net::TcpStream::connect(("127.0.0.1", a.port()))
            .await
            .unwrap();

        let b_ledger = Arc::new(MemoryLedger::new());
        let mut b = test_server(b_ledger.clone(), seed_for(&a)).await;
        b.start().await.unwrap();

        // Well inside A's message timeout
        let synced = tokio::time::timeout(Duration::from_secs(3), async {
            while b_ledger.chain_length() < 4 || a.registry().len().await < 1 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(synced.is_ok(), "silent connection blocked other peers");
        assert_eq!(a.registry().snapshot().await, vec![loopback(b.port())]);
        assert_eq!(b_ledger.last_block_hash(), a_ledger.last_block_hash());
    }

    #[tokio::test]
    async fn test_discovery_follows_addr_replies() {
        let a_ledger = Arc::new(MemoryLedger::new());
        a_ledger.extend_with_empty_blocks(3).unwrap();
        let mut a = test_server(a_ledger.clone(), None).await;
        a.start().await.unwrap();

        let mut b = test_server(Arc::new(MemoryLedger::new()), seed_for(&a)).await;
        b.start().await.unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            while !b.registry().contains(&loopback(a.port())).await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(joined.is_ok(), "B did not reach A");

        // C only knows B; A is learned from B's addr reply
        let c_ledger = Arc::new(MemoryLedger::new());
        let mut c = test_server(c_ledger.clone(), seed_for(&b)).await;
        c.start().await.unwrap();

        let discovered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let c_knows_a = c.registry().contains(&loopback(a.port())).await;
                let a_knows_c = a.registry().contains(&loopback(c.port())).await;
                if c_knows_a && a_knows_c && c_ledger.chain_length() == 4 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(discovered.is_ok(), "C did not discover A through B");

        let c_peers = c.registry().snapshot().await;
        assert_eq!(c_peers.len(), 2);
        assert_eq!(c_peers[0], loopback(b.port()));
        assert_eq!(c_ledger.last_block_hash(), a_ledger.last_block_hash());

        a.stop().await;
        b.stop().await;
        c.stop().await;
    }

    #[tokio::test]
    async fn test_announced_transaction_reaches_mempool() {
        let a_ledger = Arc::new(MemoryLedger::new());
        let b_ledger = Arc::new(MemoryLedger::new());
        let mut a = test_server(a_ledger, None).await;
        let mut b = test_server(b_ledger.clone(), None).await;
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.registry().add(loopback(b.port())).await;
        let tx = Transaction::new("alice", "bob", 5);
        assert_eq!(a.announcer().announce_transaction(tx.clone()).await, 1);

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            while b_ledger.pending_count() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(received.is_ok(), "announced transaction not received");
        assert_eq!(b_ledger.pending(), vec![tx]);
    }

    #[tokio::test]
    async fn test_stop_refuses_mutations() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut server = test_server(ledger.clone(), None).await;
        server.start().await.unwrap();

        server.stop().await;
        tokio::time::timeout(Duration::from_secs(1), server.wait())
            .await
            .unwrap();

        assert!(matches!(
            server.ctx.record_peer(loopback(1)).await,
            Err(PeerError::ShuttingDown)
        ));
        assert!(matches!(server.start().await, Err(PeerError::ShuttingDown)));
        assert_eq!(
            server
                .announcer()
                .announce_transaction(Transaction::new("a", "b", 1))
                .await,
            0
        );
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_inbound_must_open_with_version_or_inv() {
        let (ctx, _) = test_context(8333, Arc::new(MemoryLedger::new()));
        let (mut peer, mut inbound) = pair("10.0.0.2:50000", "10.0.0.1:8333", Duration::from_secs(2));

        peer.send(Message::Verack).await.unwrap();
        assert!(matches!(
            serve_inbound(&ctx, &mut inbound).await,
            Err(PeerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_inbound_relay_ends_on_close() {
        let ledger = Arc::new(MemoryLedger::new());
        let (ctx, _) = test_context(8333, ledger.clone());
        let (mut peer, mut inbound) = pair("10.0.0.2:50000", "10.0.0.1:8333", Duration::from_secs(2));

        let block = Block::new(1, ledger.last_block_hash(), vec![], 0);
        sync::send_blocks(&mut peer, vec![block]).await.unwrap();
        drop(peer);

        serve_inbound(&ctx, &mut inbound).await.unwrap();
        assert_eq!(ledger.chain_length(), 2);
    }
}
