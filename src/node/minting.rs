//! Background block minting
//!
//! New transactions post a hint into a bounded queue. A single worker drains
//! it and runs the blocking mint attempt off the async runtime. Hints posted
//! while the queue is full are dropped, the next one covers them.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::Node;
use crate::crypto::Hash;

/// A request to try to make a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintHint {
    /// Transaction that triggered the attempt, if any
    pub new_tx: Option<Hash>,
}

/// Receiving end consumed by [`MintQueue::spawn_worker`]
pub struct MintReceiver(mpsc::Receiver<MintHint>);

#[derive(Clone)]
pub struct MintQueue {
    sender: mpsc::Sender<MintHint>,
}

impl MintQueue {
    pub fn new(depth: usize) -> (Self, MintReceiver) {
        let (sender, receiver) = mpsc::channel(depth.max(1));
        (Self { sender }, MintReceiver(receiver))
    }

    /// Post a hint without waiting. Returns false if it was dropped.
    pub fn notify(&self, new_tx: Option<Hash>) -> bool {
        match self.sender.try_send(MintHint { new_tx }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(?new_tx, "mint queue full, hint dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("mint worker stopped, hint dropped");
                false
            }
        }
    }

    /// Run mint attempts one at a time until every queue handle is dropped
    pub fn spawn_worker(node: Node, receiver: MintReceiver) -> JoinHandle<()> {
        let MintReceiver(mut receiver) = receiver;
        tokio::spawn(async move {
            while let Some(hint) = receiver.recv().await {
                let node = node.clone();
                let attempt = tokio::task::spawn_blocking(move || node.try_to_make_block(hint.new_tx)).await;
                match attempt {
                    Ok(Ok(Some(hash))) => info!(%hash, "block minted"),
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => warn!(error = %e, "mint attempt failed"),
                    Err(e) => error!(error = %e, "mint task panicked"),
                }
            }
            debug!("mint worker finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsensusConfig, PowSettings};
    use crate::crypto::PrivateKey;
    use crate::storage::MemoryStore;
    use crate::validation::{RecordingExecutor, SqlUpdate, Transaction};
    use std::sync::Arc;

    #[test]
    fn test_full_queue_drops_hints() {
        let (queue, _receiver) = MintQueue::new(1);
        assert!(queue.notify(None));
        assert!(!queue.notify(None));
    }

    #[test]
    fn test_closed_queue_drops_hints() {
        let (queue, receiver) = MintQueue::new(4);
        drop(receiver);
        assert!(!queue.notify(None));
    }

    #[tokio::test]
    async fn test_worker_mints_from_hint() {
        let key = PrivateKey::generate();
        let pkh = key.public_key().pubkey_hash();
        let consensus = ConsensusConfig {
            settings: PowSettings {
                complexity_bits: 2,
                complexity_bits_step2: 2,
                min_tx_per_block: 1,
                max_tx_per_block: 10,
                minimum_block_building_time_secs: 0,
                max_nonce: 1_000_000,
                ..PowSettings::default()
            },
            ..ConsensusConfig::default()
        };
        let node = Node::new(Arc::new(MemoryStore::new()), Arc::new(RecordingExecutor::new()), consensus, Some(pkh));
        node.init_blockchain(&pkh).unwrap();

        let sql = SqlUpdate::new("t:*", "CREATE TABLE t", "DROP TABLE t");
        let tx = Transaction::signed(&key, vec![], vec![], Some(sql));
        node.received_new_transaction(&tx).unwrap();

        let (queue, receiver) = MintQueue::new(4);
        let worker = MintQueue::spawn_worker(node.clone(), receiver);
        assert!(queue.notify(Some(tx.id)));
        drop(queue);
        worker.await.unwrap();

        assert_eq!(node.blockchain().get_best_height().unwrap(), 1);
        assert_eq!(node.transactions().get_unapproved_count().unwrap(), 0);
    }
}
