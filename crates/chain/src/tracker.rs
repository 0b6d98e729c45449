use std::collections::HashMap;

use alloy_primitives::{B256, U256};
use forks::ChainConfig;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::ChainError;
use crate::event::{Feed, Subscription};
use crate::types::BlockHeader;

/// Published whenever the canonical head moves.
#[derive(Debug, Clone)]
pub struct ChainHeadEvent {
    pub header: BlockHeader,
}

/// Read access to local chain storage used by the sync subsystem.
pub trait ChainReader: Send + Sync + 'static {
    fn config(&self) -> &ChainConfig;

    fn genesis_hash(&self) -> B256;

    fn current_header(&self) -> BlockHeader;

    /// Total difficulty of the current head.
    fn head_td(&self) -> U256;

    fn has_block(&self, hash: B256, number: u64) -> bool;

    fn subscribe_chain_head(
        &self,
        buffer: usize,
    ) -> (Subscription, mpsc::Receiver<ChainHeadEvent>);
}

struct StoredHeader {
    header: BlockHeader,
    td: U256,
}

struct TrackerState {
    headers: HashMap<B256, StoredHeader>,
    head_hash: B256,
    head_td: U256,
}

/// In-memory header store. Tracks total difficulty per header and follows
/// the heaviest known head.
pub struct ChainTracker {
    config: ChainConfig,
    genesis_hash: B256,
    state: RwLock<TrackerState>,
    /// Held from commit until the head event is published, so subscribers
    /// see heads in commit order.
    insert_lock: tokio::sync::Mutex<()>,
    head_feed: Feed<ChainHeadEvent>,
}

impl ChainTracker {
    pub fn new(config: ChainConfig, genesis: BlockHeader) -> Self {
        let genesis_hash = genesis.hash();
        let td = genesis.difficulty;
        info!(hash = %genesis_hash, network_id = config.network_id, "chain tracker initialized");

        let mut headers = HashMap::new();
        headers.insert(genesis_hash, StoredHeader { header: genesis, td });

        Self {
            config,
            genesis_hash,
            state: RwLock::new(TrackerState {
                headers,
                head_hash: genesis_hash,
                head_td: td,
            }),
            insert_lock: tokio::sync::Mutex::new(()),
            head_feed: Feed::new(),
        }
    }

    /// Stores a header whose parent is known. Returns true if it became the
    /// new head, in which case a [`ChainHeadEvent`] is published.
    pub async fn insert(&self, header: BlockHeader) -> Result<bool, ChainError> {
        let hash = header.hash();
        let _guard = self.insert_lock.lock().await;
        let event = {
            let mut state = self.state.write();
            if state.headers.contains_key(&hash) {
                return Ok(false);
            }
            let parent_td = state
                .headers
                .get(&header.parent_hash)
                .map(|p| p.td)
                .ok_or(ChainError::UnknownParent(header.parent_hash))?;
            let td = parent_td + header.difficulty;

            let is_head = td > state.head_td;
            if is_head {
                state.head_hash = hash;
                state.head_td = td;
            }
            state.headers.insert(
                hash,
                StoredHeader {
                    header: header.clone(),
                    td,
                },
            );
            is_head.then_some(ChainHeadEvent { header })
        };

        match event {
            Some(event) => {
                debug!(number = event.header.number, hash = %hash, "new chain head");
                self.head_feed.send(event).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn header(&self, hash: &B256) -> Option<BlockHeader> {
        self.state.read().headers.get(hash).map(|s| s.header.clone())
    }

    pub fn td(&self, hash: &B256) -> Option<U256> {
        self.state.read().headers.get(hash).map(|s| s.td)
    }

    pub fn head_hash(&self) -> B256 {
        self.state.read().head_hash
    }

    /// Closes the head feed. Subscribers must unsubscribe before this.
    pub fn stop(&self) {
        self.head_feed.close();
        info!("chain tracker stopped");
    }
}

impl ChainReader for ChainTracker {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn genesis_hash(&self) -> B256 {
        self.genesis_hash
    }

    fn current_header(&self) -> BlockHeader {
        let state = self.state.read();
        state
            .headers
            .get(&state.head_hash)
            .map(|s| s.header.clone())
            .unwrap_or_default()
    }

    fn head_td(&self) -> U256 {
        self.state.read().head_td
    }

    fn has_block(&self, hash: B256, number: u64) -> bool {
        self.state
            .read()
            .headers
            .get(&hash)
            .is_some_and(|s| s.header.number == number)
    }

    fn subscribe_chain_head(
        &self,
        buffer: usize,
    ) -> (Subscription, mpsc::Receiver<ChainHeadEvent>) {
        self.head_feed.subscribe(buffer)
    }
}
