//! Announcement-driven retrieval of single blocks and transactions.
//!
//! The handler talks to fetchers through [`BlockFetcher`] and [`TxFetcher`].
//! Both are called from many peer tasks at once and must never block: all
//! hand-offs use bounded queues and reject new work when full.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::B256;
use chain::types::{transactions_root, uncle_hash, Block, BlockBody, BlockHeader, Transaction};
use parking_lot::Mutex;
use prometheus::IntCounter;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::FetcherError;
use crate::peer::{short_id, PeerId};

/// Outstanding announcements a single peer may have.
pub const MAX_ANNOUNCES_PER_PEER: usize = 256;

/// Announcements not answered within this window are forgotten.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Transaction hashes remembered before the set is reset.
pub const MAX_KNOWN_TXS: usize = 32_768;

/// Requests the header of an announced block from the announcing peer.
pub type HeaderRequestFn = Arc<dyn Fn(B256) -> bool + Send + Sync>;

/// Requests the bodies of the given blocks from the announcing peer.
pub type BodiesRequestFn = Arc<dyn Fn(Vec<B256>) -> bool + Send + Sync>;

pub trait BlockFetcher: Send + Sync + 'static {
    /// Records that `peer` announced `hash` and starts retrieving it.
    fn notify(
        &self,
        peer: &PeerId,
        hash: B256,
        number: u64,
        time: Instant,
        header_fn: HeaderRequestFn,
        bodies_fn: BodiesRequestFn,
    ) -> Result<(), FetcherError>;

    /// Queues a fully propagated block for import.
    fn enqueue(&self, peer: &PeerId, block: Block) -> Result<(), FetcherError>;

    /// Claims headers this fetcher asked for; returns the rest.
    fn filter_headers(&self, peer: &PeerId, headers: Vec<BlockHeader>, time: Instant) -> Vec<BlockHeader>;

    /// Claims bodies this fetcher asked for; returns the rest.
    fn filter_bodies(
        &self,
        peer: &PeerId,
        transactions: Vec<Vec<Transaction>>,
        uncles: Vec<Vec<BlockHeader>>,
        time: Instant,
    ) -> (Vec<Vec<Transaction>>, Vec<Vec<BlockHeader>>);
}

pub trait TxFetcher: Send + Sync + 'static {
    fn notify(&self, peer: &PeerId, hashes: Vec<B256>) -> Result<(), FetcherError>;

    /// `direct` marks replies to our own requests, as opposed to broadcasts.
    fn enqueue(&self, peer: &PeerId, txs: Vec<Transaction>, direct: bool) -> Result<(), FetcherError>;
}

// ============================================================================
// Block fetcher
// ============================================================================

/// A block ready for import, with the peer that supplied it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportBlock {
    pub origin: PeerId,
    pub block: Block,
}

struct Announce {
    origin: PeerId,
    number: u64,
    time: Instant,
    bodies_fn: BodiesRequestFn,
}

struct Completing {
    origin: PeerId,
    header: BlockHeader,
    time: Instant,
}

#[derive(Default)]
struct FetcherState {
    per_peer: HashMap<PeerId, usize>,
    fetching: HashMap<B256, Announce>,
    completing: HashMap<B256, Completing>,
}

impl FetcherState {
    fn release(&mut self, peer: &PeerId) {
        if let Some(count) = self.per_peer.get_mut(peer) {
            *count -= 1;
            if *count == 0 {
                self.per_peer.remove(peer);
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        let stale: Vec<(B256, PeerId)> = self
            .fetching
            .iter()
            .filter(|(_, a)| now.saturating_duration_since(a.time) > FETCH_TIMEOUT)
            .map(|(hash, a)| (*hash, a.origin))
            .chain(
                self.completing
                    .iter()
                    .filter(|(_, c)| now.saturating_duration_since(c.time) > FETCH_TIMEOUT)
                    .map(|(hash, c)| (*hash, c.origin)),
            )
            .collect();
        for (hash, origin) in stale {
            self.fetching.remove(&hash);
            self.completing.remove(&hash);
            self.release(&origin);
        }
    }
}

/// Bounded block fetcher. Announced blocks are retrieved header first, then
/// body, and handed to the import queue once complete.
pub struct AnnounceFetcher {
    state: Mutex<FetcherState>,
    import: mpsc::Sender<ImportBlock>,
    rejected: IntCounter,
}

impl AnnounceFetcher {
    pub fn new(buffer: usize, rejected: IntCounter) -> (Self, mpsc::Receiver<ImportBlock>) {
        let (import, import_rx) = mpsc::channel(buffer.max(1));
        let fetcher = Self {
            state: Mutex::new(FetcherState::default()),
            import,
            rejected,
        };
        (fetcher, import_rx)
    }

    fn import(&self, origin: PeerId, block: Block) -> Result<(), FetcherError> {
        self.import
            .try_send(ImportBlock { origin, block })
            .map_err(|e| {
                self.rejected.inc();
                match e {
                    mpsc::error::TrySendError::Full(b) => {
                        debug!(peer = %short_id(&origin), number = b.block.number(), "import queue full, dropping block");
                        FetcherError::QueueFull
                    }
                    mpsc::error::TrySendError::Closed(_) => FetcherError::Terminated,
                }
            })
    }

    /// Announcements still waiting for a header or body.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.fetching.len() + state.completing.len()
    }
}

impl BlockFetcher for AnnounceFetcher {
    fn notify(
        &self,
        peer: &PeerId,
        hash: B256,
        number: u64,
        time: Instant,
        header_fn: HeaderRequestFn,
        bodies_fn: BodiesRequestFn,
    ) -> Result<(), FetcherError> {
        {
            let mut state = self.state.lock();
            state.expire(time);
            if state.fetching.contains_key(&hash) || state.completing.contains_key(&hash) {
                return Ok(());
            }
            let count = state.per_peer.entry(*peer).or_insert(0);
            if *count >= MAX_ANNOUNCES_PER_PEER {
                self.rejected.inc();
                debug!(peer = %short_id(peer), number, "peer exceeded announcement limit");
                return Err(FetcherError::AnnounceLimit);
            }
            *count += 1;
            state.fetching.insert(
                hash,
                Announce {
                    origin: *peer,
                    number,
                    time,
                    bodies_fn,
                },
            );
        }

        if !header_fn(hash) {
            let mut state = self.state.lock();
            if state.fetching.remove(&hash).is_some() {
                state.release(peer);
            }
            debug!(peer = %short_id(peer), number, "header request not sent");
        }
        Ok(())
    }

    fn enqueue(&self, peer: &PeerId, block: Block) -> Result<(), FetcherError> {
        self.import(*peer, block)
    }

    fn filter_headers(&self, peer: &PeerId, headers: Vec<BlockHeader>, time: Instant) -> Vec<BlockHeader> {
        let mut unclaimed = Vec::new();
        let mut complete = Vec::new();
        let mut bodies: Vec<(BodiesRequestFn, B256)> = Vec::new();
        {
            let mut state = self.state.lock();
            for header in headers {
                let hash = header.hash();
                let claim = state
                    .fetching
                    .get(&hash)
                    .is_some_and(|a| a.origin == *peer && a.number == header.number);
                if !claim {
                    unclaimed.push(header);
                    continue;
                }
                let Some(announce) = state.fetching.remove(&hash) else {
                    continue;
                };
                if header.has_empty_body() {
                    state.release(peer);
                    complete.push(Block::new(header, BlockBody::default()));
                } else {
                    bodies.push((announce.bodies_fn, hash));
                    state.completing.insert(
                        hash,
                        Completing {
                            origin: *peer,
                            header,
                            time,
                        },
                    );
                }
            }
        }

        for block in complete {
            let _ = self.import(*peer, block);
        }
        for (bodies_fn, hash) in bodies {
            if !bodies_fn(vec![hash]) {
                let mut state = self.state.lock();
                if state.completing.remove(&hash).is_some() {
                    state.release(peer);
                }
            }
        }
        unclaimed
    }

    fn filter_bodies(
        &self,
        peer: &PeerId,
        transactions: Vec<Vec<Transaction>>,
        uncles: Vec<Vec<BlockHeader>>,
        _time: Instant,
    ) -> (Vec<Vec<Transaction>>, Vec<Vec<BlockHeader>>) {
        let mut rest_txs = Vec::new();
        let mut rest_uncles = Vec::new();
        let mut complete = Vec::new();
        {
            let mut state = self.state.lock();
            for (txs, uncle_list) in transactions.into_iter().zip(uncles) {
                let ommers = uncle_hash(&uncle_list);
                let tx_root = transactions_root(&txs);
                let matched = state
                    .completing
                    .iter()
                    .find(|(_, c)| {
                        c.origin == *peer
                            && c.header.transactions_root == tx_root
                            && c.header.uncle_hash == ommers
                    })
                    .map(|(hash, _)| *hash);

                match matched.and_then(|hash| state.completing.remove(&hash)) {
                    Some(entry) => {
                        state.release(peer);
                        complete.push(Block::new(
                            entry.header,
                            BlockBody {
                                transactions: txs,
                                uncles: uncle_list,
                            },
                        ));
                    }
                    None => {
                        rest_txs.push(txs);
                        rest_uncles.push(uncle_list);
                    }
                }
            }
        }

        for block in complete {
            let _ = self.import(*peer, block);
        }
        (rest_txs, rest_uncles)
    }
}

// ============================================================================
// Transaction fetcher
// ============================================================================

/// Hashes to request from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub peer: PeerId,
    pub hashes: Vec<B256>,
}

/// Transactions received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TxBatch {
    pub peer: PeerId,
    pub txs: Vec<Transaction>,
    pub direct: bool,
}

pub struct TxQueues {
    pub requests: mpsc::Receiver<TxRequest>,
    pub pool: mpsc::Receiver<TxBatch>,
}

/// Bounded transaction fetcher. Unknown announced hashes become requests,
/// received transactions go to the pool queue.
pub struct TxAnnounceQueue {
    known: Mutex<HashSet<B256>>,
    requests: mpsc::Sender<TxRequest>,
    pool: mpsc::Sender<TxBatch>,
    rejected: IntCounter,
}

impl TxAnnounceQueue {
    pub fn new(buffer: usize, rejected: IntCounter) -> (Self, TxQueues) {
        let (requests, requests_rx) = mpsc::channel(buffer.max(1));
        let (pool, pool_rx) = mpsc::channel(buffer.max(1));
        let queue = Self {
            known: Mutex::new(HashSet::new()),
            requests,
            pool,
            rejected,
        };
        let queues = TxQueues {
            requests: requests_rx,
            pool: pool_rx,
        };
        (queue, queues)
    }

    fn remember(&self, hashes: impl IntoIterator<Item = B256>) -> Vec<B256> {
        let mut known = self.known.lock();
        if known.len() >= MAX_KNOWN_TXS {
            known.clear();
        }
        hashes.into_iter().filter(|h| known.insert(*h)).collect()
    }

    fn reject<T>(&self, e: mpsc::error::TrySendError<T>) -> FetcherError {
        self.rejected.inc();
        match e {
            mpsc::error::TrySendError::Full(_) => FetcherError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => FetcherError::Terminated,
        }
    }
}

impl TxFetcher for TxAnnounceQueue {
    fn notify(&self, peer: &PeerId, hashes: Vec<B256>) -> Result<(), FetcherError> {
        let unknown = self.remember(hashes);
        if unknown.is_empty() {
            return Ok(());
        }
        self.requests
            .try_send(TxRequest {
                peer: *peer,
                hashes: unknown,
            })
            .map_err(|e| self.reject(e))
    }

    fn enqueue(&self, peer: &PeerId, txs: Vec<Transaction>, direct: bool) -> Result<(), FetcherError> {
        self.remember(txs.iter().map(Transaction::hash));
        self.pool
            .try_send(TxBatch {
                peer: *peer,
                txs,
                direct,
            })
            .map_err(|e| self.reject(e))
    }
}
