//! Ledger interface and in-memory chain
//!
//! The network engine only talks to the [`Ledger`] trait. [`MemoryLedger`]
//! is the chain the node binary runs with.

use crate::core::block::Block;
use crate::core::transaction::Transaction;
use crate::crypto::Hash256;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Ledger-related errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Block {index} does not extend the tip (expected index {expected}, previous {tip})")]
    NotConnected {
        index: u32,
        expected: u32,
        tip: Hash256,
    },
    #[error("Duplicate block {0}")]
    DuplicateBlock(Hash256),
    #[error("Invalid block hash {0}")]
    InvalidBlockHash(Hash256),
    #[error("Duplicate transaction {0}")]
    DuplicateTransaction(Hash256),
    #[error("Invalid transaction id {0}")]
    InvalidTransaction(Hash256),
}

/// Chain storage and position queries used by the peer protocol.
///
/// Implementations serialize their own mutations; the network engine calls
/// these from many connection tasks at once.
pub trait Ledger: Send + Sync {
    /// Hash of the canonical genesis block
    fn genesis_block_hash(&self) -> Hash256;

    /// Hash of the current tip
    fn last_block_hash(&self) -> Hash256;

    /// Number of blocks, genesis included
    fn chain_length(&self) -> u32;

    /// Position of the block with the given hash
    fn find_index_by_hash(&self, hash: &Hash256) -> Option<u32>;

    /// Blocks strictly after `index`, in chain order. `None` yields the
    /// full history.
    fn blocks_after(&self, index: Option<u32>) -> Vec<Block>;

    fn add_block(&self, block: Block) -> Result<(), LedgerError>;

    fn add_tx(&self, tx: Transaction) -> Result<(), LedgerError>;

    /// Pending transactions handed to the miner
    fn take_pending_transactions(&self, _max: usize) -> Vec<Transaction> {
        Vec::new()
    }
}

#[derive(Debug)]
struct ChainState {
    blocks: Vec<Block>,
    known: HashSet<Hash256>,
    mempool: Vec<Transaction>,
}

impl ChainState {
    fn tip(&self) -> &Block {
        // The chain is created with the genesis block and never shrinks
        &self.blocks[self.blocks.len() - 1]
    }
}

/// In-memory blockchain with a simple transaction pool
#[derive(Debug)]
pub struct MemoryLedger {
    state: RwLock<ChainState>,
}

impl MemoryLedger {
    /// Create a new chain holding only the genesis block
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let mut known = HashSet::new();
        known.insert(genesis.hash);

        Self {
            state: RwLock::new(ChainState {
                blocks: vec![genesis],
                known,
                mempool: Vec::new(),
            }),
        }
    }

    /// Append `count` freshly built blocks on top of the tip
    pub fn extend_with_empty_blocks(&self, count: u32) -> Result<(), LedgerError> {
        for _ in 0..count {
            let block = Block::new(self.chain_length(), self.last_block_hash(), vec![], 0);
            self.add_block(block)?;
        }
        Ok(())
    }

    /// Number of transactions waiting for a block
    pub fn pending_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .mempool
            .len()
    }

    /// Copy of the pending transactions in arrival order
    pub fn pending(&self) -> Vec<Transaction> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .mempool
            .clone()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger for MemoryLedger {
    fn genesis_block_hash(&self) -> Hash256 {
        Block::genesis_hash()
    }

    fn last_block_hash(&self) -> Hash256 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tip()
            .hash
    }

    fn chain_length(&self) -> u32 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.blocks.len() as u32
    }

    fn find_index_by_hash(&self, hash: &Hash256) -> Option<u32> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .blocks
            .iter()
            .position(|b| b.hash == *hash)
            .map(|i| i as u32)
    }

    fn blocks_after(&self, index: Option<u32>) -> Vec<Block> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let start = index.map(|i| i as usize + 1).unwrap_or(0);
        state.blocks.iter().skip(start).cloned().collect()
    }

    fn add_block(&self, block: Block) -> Result<(), LedgerError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.known.contains(&block.hash) {
            return Err(LedgerError::DuplicateBlock(block.hash));
        }
        if !block.verify_hash() {
            return Err(LedgerError::InvalidBlockHash(block.hash));
        }

        let expected = state.blocks.len() as u32;
        let tip = state.tip().hash;
        if block.index != expected || block.header.previous_hash != tip {
            return Err(LedgerError::NotConnected {
                index: block.index,
                expected,
                tip,
            });
        }

        let included: HashSet<Hash256> = block.transactions.iter().map(|tx| tx.id).collect();
        state.mempool.retain(|tx| !included.contains(&tx.id));
        state.known.insert(block.hash);
        log::debug!("Ledger appended block {} ({})", block.index, block.hash);
        state.blocks.push(block);

        Ok(())
    }

    fn add_tx(&self, tx: Transaction) -> Result<(), LedgerError> {
        if !tx.verify_id() {
            return Err(LedgerError::InvalidTransaction(tx.id));
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.mempool.iter().any(|pending| pending.id == tx.id) {
            return Err(LedgerError::DuplicateTransaction(tx.id));
        }
        state.mempool.push(tx);
        Ok(())
    }

    fn take_pending_transactions(&self, max: usize) -> Vec<Transaction> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.mempool.iter().take(max).cloned().collect()
    }
}
