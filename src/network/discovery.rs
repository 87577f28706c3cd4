//! Peer discovery bookkeeping
//!
//! Decides which addresses learned from `addr` replies are worth dialing:
//! - not already in the registry
//! - not already being dialed
//! - not one of our own addresses
//! - not past the recursion depth limit

use crate::network::peer::{PeerAddress, PeerRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A queued outbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialRequest {
    pub addr: PeerAddress,
    /// 0 for the bootstrap seed, +1 per discovery hop
    pub depth: u32,
}

/// Discovery coordinator wrapped around the peer registry
#[derive(Debug)]
pub struct Discovery {
    registry: Arc<PeerRegistry>,
    /// Addresses with a dial queued or in flight
    pending: Mutex<HashSet<PeerAddress>>,
    /// Our own addresses as reported by peers
    local: RwLock<HashSet<PeerAddress>>,
    max_depth: u32,
}

impl Discovery {
    pub fn new(registry: Arc<PeerRegistry>, max_depth: u32) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashSet::new()),
            local: RwLock::new(HashSet::new()),
            max_depth,
        }
    }

    /// Select the addresses to dial at `depth` and mark them pending.
    ///
    /// Calling this again with the same addresses before they are
    /// released, or after they were recorded, returns nothing.
    pub async fn claim(&self, addrs: &[PeerAddress], depth: u32) -> Vec<DialRequest> {
        if depth > self.max_depth {
            log::debug!(
                "Not dialing {} addresses beyond depth {}",
                addrs.len(),
                self.max_depth
            );
            return Vec::new();
        }

        let local = self.local.read().await;
        let mut pending = self.pending.lock().await;
        let mut claimed = Vec::new();

        for addr in addrs {
            if local.contains(addr) || pending.contains(addr) || self.registry.contains(addr).await
            {
                continue;
            }
            pending.insert(*addr);
            claimed.push(DialRequest { addr: *addr, depth });
        }

        claimed
    }

    /// Forget a finished dial, successful or not
    pub async fn release(&self, addr: &PeerAddress) {
        self.pending.lock().await.remove(addr);
    }

    /// Remember an address that reaches this node
    pub async fn mark_local(&self, addr: PeerAddress) {
        if self.local.write().await.insert(addr) {
            log::debug!("Learned local address {}", addr);
        }
    }

    pub async fn is_local(&self, addr: &PeerAddress) -> bool {
        self.local.read().await.contains(addr)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
