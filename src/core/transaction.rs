//! Transaction data relayed between peers
//!
//! Only the fields needed to identify and relay a transfer. Signature and
//! balance checks belong to the ledger, not the network layer.

use crate::crypto::{double_sha256, Hash256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sender used for block reward transactions
pub const COINBASE_SENDER: &str = "coinbase";

/// A value transfer between two addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hash of the transaction contents
    pub id: Hash256,
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// Create a new transaction stamped with the current time
    pub fn new(sender: &str, recipient: &str, amount: u64) -> Self {
        let mut tx = Self {
            id: Hash256::zero(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            timestamp: Utc::now(),
        };
        tx.id = tx.calculate_hash();
        tx
    }

    /// Create a block reward transaction
    pub fn coinbase(recipient: &str, amount: u64) -> Self {
        Self::new(COINBASE_SENDER, recipient, amount)
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender == COINBASE_SENDER
    }

    /// Calculate the transaction hash from its contents
    pub fn calculate_hash(&self) -> Hash256 {
        let data = format!(
            "{}{}{}{}",
            self.sender,
            self.recipient,
            self.amount,
            self.timestamp.timestamp_nanos_opt().unwrap_or_default()
        );
        double_sha256(data.as_bytes())
    }

    /// Check that `id` matches the contents
    pub fn verify_id(&self) -> bool {
        self.id == self.calculate_hash()
    }
}
