//! Mining module for block creation

pub mod miner;

pub use miner::{Miner, MinerConfig, MiningStats, BLOCK_REWARD};
