//! Bounded holding area for transactions received from peers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use alloy_primitives::B256;
use chain::types::Transaction;
use parking_lot::Mutex;
use sync::fetcher::{TxBatch, TxQueues};
use sync::peer::short_id;
use sync::PeerSet;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Transactions kept before the oldest are evicted.
pub const TX_POOL_CAPACITY: usize = 4096;

/// Insertion-ordered transaction set. No validation happens here.
pub struct TxPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

#[derive(Default)]
struct PoolInner {
    txs: HashMap<B256, Transaction>,
    order: VecDeque<B256>,
}

impl TxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Adds unseen transactions, returning how many were new.
    pub fn add(&self, txs: Vec<Transaction>) -> usize {
        let mut inner = self.inner.lock();
        let mut added = 0;
        for tx in txs {
            let hash = tx.hash();
            if inner.txs.contains_key(&hash) {
                continue;
            }
            if inner.order.len() >= self.capacity {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.txs.remove(&oldest);
                }
            }
            inner.order.push_back(hash);
            inner.txs.insert(hash, tx);
            added += 1;
        }
        added
    }

    pub fn contains(&self, hash: &B256) -> bool {
        self.inner.lock().txs.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forwards transaction requests to peers and feeds received batches into
/// the pool until shutdown.
pub async fn run_tx_queues(
    pool: Arc<TxPool>,
    peers: Arc<PeerSet>,
    mut queues: TxQueues,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            request = queues.requests.recv() => {
                let Some(request) = request else { break };
                let sent = peers
                    .peer(&request.peer)
                    .is_some_and(|peer| peer.request_txs(request.hashes.clone()));
                if !sent {
                    debug!(peer = %short_id(&request.peer), count = request.hashes.len(), "tx request not sent");
                }
            }
            batch = queues.pool.recv() => {
                let Some(TxBatch { peer, txs, direct }) = batch else { break };
                let count = txs.len();
                let added = pool.add(txs);
                trace!(peer = %short_id(&peer), count, added, direct, "queued transactions");
            }
        }
    }
    debug!(pooled = pool.len(), "transaction queue stopped");
}
