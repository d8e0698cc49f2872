//! A single-node miner for the provenance ledger.

use anyhow::Context;
use clap::Parser;
use provenance_chain::error::{Error, MiningError};
use provenance_chain::{Config, Node, Wallet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Mines blocks continuously until interrupted")]
struct Args {
    /// TOML configuration file, layered under PROVENANCE_* environment variables.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Pause between blocks.
    #[arg(long, default_value_t = 0)]
    pause_ms: u64,
    /// Stop after this many blocks.
    #[arg(long)]
    blocks: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let wallet = if config.wallet_path.exists() {
        Wallet::load(&config.wallet_path).context("failed to load miner wallet")?
    } else {
        let wallet = Wallet::generate_at(&config.wallet_path)?;
        info!(address = wallet.address(), "created miner wallet");
        wallet
    };
    let node = Node::open_sled(&config)?;
    info!(
        blocks = node.chain.len(),
        difficulty = node.chain.difficulty(),
        miner = wallet.address(),
        "node started"
    );

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        shutdown.cancel();
    });

    let mut mined = 0u64;
    while !token.is_cancelled() && args.blocks.map_or(true, |limit| mined < limit) {
        let chain = node.chain.clone();
        let miner = wallet.address().to_string();
        let cancel = token.clone();
        let result =
            tokio::task::spawn_blocking(move || chain.mine_block_with_abort(&miner, &cancel)).await?;
        match result {
            Ok(block) => {
                mined += 1;
                info!(index = block.index, hash = %block.hash, "mined");
            }
            Err(Error::Mining(MiningError::Aborted { attempts })) => {
                info!(attempts, "mining aborted");
                break;
            }
            Err(Error::Mining(MiningError::PersistFailed { index, source })) => {
                error!(index, error = %source, "storage unavailable, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e.into()),
        }
        if args.pause_ms > 0 {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(args.pause_ms)) => {}
            }
        }
    }

    let stats = node.chain.stats();
    info!(
        blocks = stats.blocks,
        average_block_time_ms = stats.average_block_time_ms,
        valid = node.chain.validate_chain(),
        "node stopped"
    );
    Ok(())
}
