//! SQLChain Node
//!
//! Opens the local store, creates the chain if needed and keeps minting
//! blocks from the transaction pool until interrupted.

use anyhow::Context;
use sqlchain_core::config::NodeConfig;
use sqlchain_core::crypto::{PrivateKey, PubKeyHash};
use sqlchain_core::node::{MintQueue, Node};
use sqlchain_core::storage::SledStore;
use sqlchain_core::validation::TracingExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_file = std::env::args().nth(1);
    let config = NodeConfig::load(config_file.as_deref()).context("loading node configuration")?;
    let consensus = config.consensus().context("loading consensus rules")?;

    let signing_key = if config.signing_key.is_empty() {
        None
    } else {
        let bytes: [u8; 32] = hex::decode(&config.signing_key)
            .context("decoding signing key")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("signing key must be 32 bytes"))?;
        Some(PrivateKey::from_bytes(&bytes).context("parsing signing key")?)
    };

    let minter = if !config.minter_address.is_empty() {
        PubKeyHash::from_address(&config.minter_address).context("parsing minter address")?
    } else if let Some(key) = &signing_key {
        key.public_key().pubkey_hash()
    } else {
        let key = PrivateKey::generate();
        let pkh = key.public_key().pubkey_hash();
        info!(address = %pkh.to_address(), "no minter address configured, generated a key");
        pkh
    };

    let store = SledStore::open(&config.data_dir)
        .with_context(|| format!("opening store at {}", config.data_dir.display()))?;
    let (queue, receiver) = MintQueue::new(config.mint_queue_depth);
    let mut node = Node::new(Arc::new(store), Arc::new(TracingExecutor), consensus, Some(minter))
        .with_mint_queue(queue.clone());
    if let Some(key) = signing_key {
        node = node.with_signing_key(key);
    }

    if let Some(genesis) = node.init_blockchain(&minter)? {
        info!(%genesis, "genesis block created");
    }
    let state = node.get_node_state()?;
    info!(
        blocks = state.blocks,
        unapproved = state.unapproved,
        unspent = state.unspent,
        data_dir = %config.data_dir.display(),
        "node started"
    );

    let worker = MintQueue::spawn_worker(node.clone(), receiver);
    let interval = Duration::from_secs(config.mint_interval_secs.max(1));
    let ticker = tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            queue.notify(None);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping node");
    node.minter().stop();
    ticker.abort();
    worker.abort();
    Ok(())
}
