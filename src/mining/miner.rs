//! Mining engine for the blockchain
//!
//! Produces blocks on top of the ledger tip in a background task.

use crate::core::{Block, Ledger, LedgerError, Transaction};
use log::info;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Block reward in coins
pub const BLOCK_REWARD: u64 = 50;

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

/// Miner settings
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Miner's address for receiving rewards
    pub address: String,
    /// Leading zero bits required of a block hash
    pub difficulty: u32,
    /// Pause between two mined blocks
    pub interval: Duration,
    /// Maximum pending transactions per block
    pub max_block_txs: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            address: "miner".to_string(),
            difficulty: 12,
            interval: Duration::from_secs(10),
            max_block_txs: 100,
        }
    }
}

/// Miner for creating new blocks
pub struct Miner {
    config: MinerConfig,
    ledger: Arc<dyn Ledger>,
    /// Receives every block this miner appended
    announcements: Option<mpsc::Sender<Block>>,
    running: Mutex<Option<CancellationToken>>,
}

impl Miner {
    /// Create a new miner
    pub fn new(ledger: Arc<dyn Ledger>, config: MinerConfig) -> Self {
        Self {
            config,
            ledger,
            announcements: None,
            running: Mutex::new(None),
        }
    }

    /// Forward mined blocks to `tx`
    pub fn with_announcements(mut self, tx: mpsc::Sender<Block>) -> Self {
        self.announcements = Some(tx);
        self
    }

    /// Mine one block on the current tip and append it to the ledger
    pub fn mine_block(&self) -> Result<(Block, MiningStats), LedgerError> {
        mine_on(self.ledger.as_ref(), &self.config)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start mining in the background. Does nothing if already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *running = Some(token.clone());
        drop(running);

        let ledger = Arc::clone(&self.ledger);
        let config = self.config.clone();
        let announcements = self.announcements.clone();

        info!(
            "Miner started (difficulty {}, every {:?})",
            config.difficulty, config.interval
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(config.interval) => {}
                }

                let ledger = Arc::clone(&ledger);
                let job_config = config.clone();
                let mined =
                    tokio::task::spawn_blocking(move || mine_on(ledger.as_ref(), &job_config))
                        .await;

                match mined {
                    Ok(Ok((block, _))) => {
                        if let Some(tx) = &announcements {
                            if tx.send(block).await.is_err() {
                                log::debug!("Block announcements closed");
                            }
                        }
                    }
                    // Lost a race against a block received from a peer
                    Ok(Err(e)) => log::debug!("Mined block discarded: {}", e),
                    Err(e) => {
                        log::error!("Mining task failed: {}", e);
                        break;
                    }
                }
            }
            info!("Miner stopped");
        });
    }

    /// Stop the background miner
    pub fn stop(&self) {
        if let Some(token) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

fn mine_on(ledger: &dyn Ledger, config: &MinerConfig) -> Result<(Block, MiningStats), LedgerError> {
    let start = Instant::now();

    // Create coinbase transaction
    let coinbase = Transaction::coinbase(&config.address, BLOCK_REWARD);

    // Combine coinbase with other transactions
    let mut all_transactions = vec![coinbase];
    all_transactions.extend(ledger.take_pending_transactions(config.max_block_txs));

    // Create new block
    let mut block = Block::new(
        ledger.chain_length(),
        ledger.last_block_hash(),
        all_transactions,
        config.difficulty,
    );

    info!(
        "Mining block {} with difficulty {}...",
        block.index, block.header.difficulty
    );

    // Mine the block (CPU-intensive)
    let attempts = block.mine();

    let elapsed = start.elapsed().as_millis();
    let hash_rate = if elapsed > 0 {
        (attempts as f64) / (elapsed as f64 / 1000.0)
    } else {
        attempts as f64
    };

    let stats = MiningStats {
        hash_attempts: attempts,
        time_ms: elapsed,
        hash_rate,
    };

    // Add to blockchain
    ledger.add_block(block.clone())?;

    info!(
        "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
        block.index, elapsed, attempts, hash_rate
    );

    Ok((block, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryLedger;

    fn test_config() -> MinerConfig {
        MinerConfig {
            difficulty: 4,
            interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_miner() {
        let ledger = Arc::new(MemoryLedger::new());
        let miner = Miner::new(ledger.clone(), test_config());

        let (block, stats) = miner.mine_block().unwrap();

        assert_eq!(block.index, 1);
        assert!(block.is_valid_pow());
        assert!(stats.hash_attempts < u64::MAX);
        assert_eq!(ledger.chain_length(), 2);
        assert_eq!(ledger.last_block_hash(), block.hash);
    }

    #[test]
    fn test_miner_includes_pending_transactions() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.add_tx(Transaction::new("alice", "bob", 7)).unwrap();
        let miner = Miner::new(ledger.clone(), test_config());

        let (block, _) = miner.mine_block().unwrap();
        assert_eq!(block.tx_count(), 2);
        assert_eq!(ledger.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let ledger = Arc::new(MemoryLedger::new());
        let (tx, mut rx) = mpsc::channel(4);
        let miner = Miner::new(ledger.clone(), test_config()).with_announcements(tx);

        miner.start();
        assert!(miner.is_running());

        let block = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.index, 1);

        miner.stop();
        assert!(!miner.is_running());
    }
}
