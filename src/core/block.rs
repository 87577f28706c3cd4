//! Block implementation for the blockchain
//!
//! A block contains a header with metadata and a list of transactions.

use crate::core::transaction::Transaction;
use crate::crypto::{double_sha256, meets_difficulty, Hash256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current block version
pub const BLOCK_VERSION: u32 = 1;

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: u32,
    /// Hash of the previous block
    pub previous_hash: Hash256,
    /// Root over all transaction ids
    pub tx_root: Hash256,
    /// Block creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Difficulty target (number of leading zero bits required)
    pub difficulty: u32,
    /// Nonce used for proof of work
    pub nonce: u64,
}

impl BlockHeader {
    /// Calculate the hash of the block header
    pub fn hash(&self) -> Hash256 {
        let data = format!(
            "{}{}{}{}{}{}",
            self.version,
            self.previous_hash,
            self.tx_root,
            self.timestamp.timestamp(),
            self.difficulty,
            self.nonce
        );
        double_sha256(data.as_bytes())
    }
}

/// A block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block index/height
    pub index: u32,
    /// Block header
    pub header: BlockHeader,
    /// Block hash (cached for efficiency)
    pub hash: Hash256,
    /// List of transactions in the block
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a new block (unmined)
    pub fn new(
        index: u32,
        previous_hash: Hash256,
        transactions: Vec<Transaction>,
        difficulty: u32,
    ) -> Self {
        let header = BlockHeader {
            version: BLOCK_VERSION,
            previous_hash,
            tx_root: Self::calculate_tx_root(&transactions),
            timestamp: Utc::now(),
            difficulty,
            nonce: 0,
        };

        let hash = header.hash();

        Self {
            index,
            header,
            hash,
            transactions,
        }
    }

    /// The genesis block.
    ///
    /// Every field is fixed so that all nodes agree on its hash without
    /// exchanging it.
    pub fn genesis() -> Self {
        let header = BlockHeader {
            version: BLOCK_VERSION,
            previous_hash: Hash256::zero(),
            tx_root: Self::calculate_tx_root(&[]),
            timestamp: DateTime::<Utc>::default(),
            difficulty: 0,
            nonce: 0,
        };

        Self {
            index: 0,
            hash: header.hash(),
            header,
            transactions: Vec::new(),
        }
    }

    /// Canonical hash of the genesis block
    pub fn genesis_hash() -> Hash256 {
        Self::genesis().hash
    }

    fn calculate_tx_root(transactions: &[Transaction]) -> Hash256 {
        let mut data = Vec::with_capacity(transactions.len() * 32);
        for tx in transactions {
            data.extend_from_slice(tx.id.as_bytes());
        }
        double_sha256(&data)
    }

    /// Mine the block (find a valid nonce)
    pub fn mine(&mut self) -> u64 {
        let mut attempts = 0u64;

        loop {
            self.header.nonce = attempts;
            self.hash = self.header.hash();

            if self.is_valid_pow() {
                return attempts;
            }

            attempts += 1;

            // Prevent infinite loop in case of very high difficulty
            if attempts == u64::MAX {
                break;
            }
        }

        attempts
    }

    /// Check if the proof of work is valid
    pub fn is_valid_pow(&self) -> bool {
        meets_difficulty(self.hash.as_bytes(), self.header.difficulty)
    }

    /// Verify the block hash and the transaction root
    pub fn verify_hash(&self) -> bool {
        self.hash == self.header.hash()
            && self.header.tx_root == Self::calculate_tx_root(&self.transactions)
    }

    /// Get number of transactions in this block
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}
