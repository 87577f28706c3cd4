//! Mini-Peerd node
//!
//! Runs one P2P node: listener, discovery, sync and a background miner.

use clap::{Parser, Subcommand};
use mini_peerd::config::{read_hosts_file, NodeConfig, DEFAULT_PORT};
use mini_peerd::core::{Block, MemoryLedger};
use mini_peerd::mining::{Miner, MinerConfig};
use mini_peerd::network::Server;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "peerd")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer protocol engine for a mini-blockchain node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the P2P node
    Start {
        /// Port to listen on (0 picks a free port)
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Bootstrap peer as host:port (overrides the hosts file)
        #[arg(short, long)]
        seed: Option<String>,

        /// File holding '<host> <port>' of the bootstrap peer
        #[arg(long, default_value = "hosts")]
        hosts: PathBuf,

        /// Do not run the miner
        #[arg(long)]
        no_mine: bool,

        /// Mining difficulty (number of leading zero bits)
        #[arg(short, long)]
        difficulty: Option<u32>,

        /// Address receiving block rewards
        #[arg(long)]
        miner_address: Option<String>,

        /// Seconds between mined blocks
        #[arg(long)]
        mine_interval_secs: Option<u64>,

        /// Seconds to wait for a peer message
        #[arg(long, default_value = "30")]
        timeout_secs: u64,

        /// Seconds to wait for an outbound connect
        #[arg(long, default_value = "10")]
        connect_timeout_secs: u64,

        /// Concurrent outbound handshakes
        #[arg(long, default_value = "8")]
        max_outbound: usize,

        /// Discovery hops followed from the seed
        #[arg(long, default_value = "3")]
        max_depth: u32,
    },

    /// Print the genesis block hash shared by every node
    Genesis,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Genesis => {
            let genesis = Block::genesis();
            println!("🧱 Genesis block");
            println!("   Hash:      {}", genesis.hash);
            println!("   Timestamp: {}", genesis.header.timestamp);
        }

        Commands::Start {
            port,
            seed,
            hosts,
            no_mine,
            difficulty,
            miner_address,
            mine_interval_secs,
            timeout_secs,
            connect_timeout_secs,
            max_outbound,
            max_depth,
        } => {
            let seed = match seed {
                Some(seed) => Some(seed),
                None => read_hosts_file(&hosts)?,
            };

            let defaults = MinerConfig::default();
            let miner = MinerConfig {
                address: miner_address.unwrap_or(defaults.address),
                difficulty: difficulty.unwrap_or(defaults.difficulty),
                interval: mine_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.interval),
                ..defaults
            };

            let config = NodeConfig {
                port,
                seed,
                message_timeout: Duration::from_secs(timeout_secs),
                connect_timeout: Duration::from_secs(connect_timeout_secs),
                max_outbound,
                max_discovery_depth: max_depth,
                mining: !no_mine,
                miner,
            };

            run_node(config)?;
        }
    }

    Ok(())
}

fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        match &config.seed {
            Some(seed) => println!("🌐 Starting P2P node on port {} (seed {})...", config.port, seed),
            None => println!("🌐 Starting P2P node on port {}...", config.port),
        }

        let ledger = Arc::new(MemoryLedger::new());
        let (mined_tx, mut mined_rx) = mpsc::channel::<Block>(16);
        let miner = Arc::new(
            Miner::new(ledger.clone(), config.miner.clone()).with_announcements(mined_tx),
        );

        let mut server = Server::bind(config, ledger, miner).await?;
        server.start().await?;

        // Relay every block we mine
        let announcer = server.announcer();
        tokio::spawn(async move {
            while let Some(block) = mined_rx.recv().await {
                let peers = announcer.announce_block(block).await;
                log::debug!("Mined block announced to {} peers", peers);
            }
        });

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("Cannot listen for Ctrl+C: {}", e);
                }
                println!("\n📴 Shutting down node...");
                server.stop().await;
            }
            _ = server.wait() => {}
        }

        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}
