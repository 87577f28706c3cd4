//! Core blockchain components
//!
//! This module contains the chain data the network layer moves around:
//! - Transactions
//! - Blocks (with proof of work and a deterministic genesis)
//! - The ledger interface and an in-memory chain

pub mod block;
pub mod ledger;
pub mod transaction;

pub use block::{Block, BlockHeader, BLOCK_VERSION};
pub use ledger::{Ledger, LedgerError, MemoryLedger};
pub use transaction::{Transaction, COINBASE_SENDER};
