//! Dispatch of inbound `etd` packets and reconciliation against local trust
//! anchors.
//!
//! [`Handler`] owns the shared state and the sync reactor. Protocol-specific
//! entry points are exposed through the [`EtdHandler`] and [`SnapHandler`]
//! views, which hold nothing but a reference to that shared state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::{B256, U256};
use chain::types::{Block, BlockHeader, Transaction};
use chain::ChainReader;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointTable, Whitelist};
use crate::chainsync::{ChainSync, SyncFlags};
use crate::downloader::{Downloader, SyncMode};
use crate::error::{ConfigError, DeliveryError, HandlerError};
use crate::fetcher::{BlockFetcher, BodiesRequestFn, HeaderRequestFn, TxFetcher};
use crate::metrics::{DeliveryCounters, SyncMetrics};
use crate::packet::{
    decode_message, Message, Packet, ETD_PROTOCOL_NAME, ETD_VERSIONS, SNAP1, SNAP_PROTOCOL_NAME,
};
use crate::peer::{short_id, EtdPeer, PeerId, PeerInfo, SnapPeer, SnapPeerInfo, SyncDrop};
use crate::peerset::PeerSet;

/// Time a peer has to answer the checkpoint challenge.
pub const SYNC_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(15);

/// A sub-protocol advertised to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: &'static str,
    pub version: u32,
}

pub struct HandlerConfig {
    pub chain: Arc<dyn ChainReader>,
    pub downloader: Arc<dyn Downloader>,
    pub block_fetcher: Arc<dyn BlockFetcher>,
    pub tx_fetcher: Arc<dyn TxFetcher>,
    pub metrics: SyncMetrics,
    pub sync_mode: SyncMode,
    /// Explicit checkpoint; overrides the table.
    pub checkpoint: Option<Checkpoint>,
    pub checkpoints: CheckpointTable,
    pub whitelist: Whitelist,
    /// Advertise the `snap` protocol.
    pub snapshot: bool,
    pub challenge_timeout: Duration,
}

impl HandlerConfig {
    /// Config with no trust anchors, full sync and the default challenge timeout.
    pub fn new(
        chain: Arc<dyn ChainReader>,
        downloader: Arc<dyn Downloader>,
        block_fetcher: Arc<dyn BlockFetcher>,
        tx_fetcher: Arc<dyn TxFetcher>,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            chain,
            downloader,
            block_fetcher,
            tx_fetcher,
            metrics,
            sync_mode: SyncMode::Full,
            checkpoint: None,
            checkpoints: CheckpointTable::new(),
            whitelist: Whitelist::new(),
            snapshot: false,
            challenge_timeout: SYNC_CHALLENGE_TIMEOUT,
        }
    }
}

/// State shared by the handler, its protocol views and peer timers.
pub struct HandlerShared {
    peers: Arc<PeerSet>,
    chain: Arc<dyn ChainReader>,
    downloader: Arc<dyn Downloader>,
    block_fetcher: Arc<dyn BlockFetcher>,
    tx_fetcher: Arc<dyn TxFetcher>,
    chain_sync: Arc<ChainSync>,
    flags: Arc<SyncFlags>,
    checkpoint: Option<Checkpoint>,
    whitelist: Whitelist,
    metrics: SyncMetrics,
    snapshot: bool,
    challenge_timeout: Duration,
}

impl HandlerShared {
    // ========================================================================
    // Peer lifecycle
    // ========================================================================

    fn run_etd_peer(self: &Arc<Self>, peer: Arc<EtdPeer>) -> Result<(), HandlerError> {
        self.peers.register(peer.clone())?;
        let (head, td) = peer.head();
        debug!(peer = %short_id(peer.id()), version = peer.version(), head = %head, td = %td, "etd peer connected");

        if let Some(checkpoint) = self.checkpoint {
            if !peer.request_headers_by_number(checkpoint.number, 1, 0, false) {
                debug!(peer = %short_id(peer.id()), "checkpoint challenge not sent");
            }
            let shared = Arc::downgrade(self);
            let target = peer.clone();
            let timeout = self.challenge_timeout;
            // The timer only starts counting once the drop is armed on the peer.
            let (armed_tx, armed_rx) = oneshot::channel::<()>();
            let timer = tokio::spawn(async move {
                if armed_rx.await.is_err() {
                    return;
                }
                tokio::time::sleep(timeout).await;
                if let Some(shared) = shared.upgrade() {
                    shared.sync_challenge_expired(&target);
                }
            });
            peer.arm_sync_drop(SyncDrop::new(timer));
            let _ = armed_tx.send(());
        }

        self.chain_sync.handle_peer_event();
        Ok(())
    }

    fn sync_challenge_expired(&self, peer: &Arc<EtdPeer>) {
        // Whoever takes the drop owns the outcome; a late header may have won.
        if peer.retire_sync_drop().is_none() {
            return;
        }
        self.metrics.sync_drops_fired.inc();
        warn!(peer = %short_id(peer.id()), "checkpoint challenge timed out, dropping");
        self.remove_peer(peer.id());
    }

    fn run_snap_peer(&self, snap: Arc<SnapPeer>) -> Result<(), HandlerError> {
        self.peers.register_snap(snap.clone())?;
        debug!(peer = %short_id(snap.id()), "snap peer attached");
        Ok(())
    }

    pub fn remove_peer(&self, id: &PeerId) {
        match self.peers.unregister(id) {
            Ok(peer) => {
                if let Some(drop) = peer.retire_sync_drop() {
                    drop.stop();
                }
                peer.disconnect();
                debug!(peer = %short_id(id), "removed etd peer");
            }
            Err(e) => debug!(peer = %short_id(id), err = %e, "peer removal skipped"),
        }
    }

    fn peer_info(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.peer(id).map(|p| p.info())
    }

    fn snap_info(&self, id: &PeerId) -> Option<SnapPeerInfo> {
        self.peers.peer(id)?.snap().map(|s| s.info())
    }

    // ========================================================================
    // Packet dispatch
    // ========================================================================

    fn handle(&self, peer: &Arc<EtdPeer>, packet: Packet) -> Result<(), HandlerError> {
        match packet {
            Packet::BlockHeaders(headers) => self.handle_headers(peer, headers),
            Packet::BlockBodies {
                transactions,
                uncles,
            } => {
                self.handle_bodies(peer, transactions, uncles);
                Ok(())
            }
            Packet::NodeData(data) => {
                let items = data.len();
                let result = self.downloader.deliver_node_data(peer.id(), data);
                self.record_delivery(peer, &self.metrics.states, items, result, "node data");
                Ok(())
            }
            Packet::Receipts(receipts) => {
                let items = receipts.len();
                let result = self.downloader.deliver_receipts(peer.id(), receipts);
                self.record_delivery(peer, &self.metrics.receipts, items, result, "receipts");
                Ok(())
            }
            Packet::NewBlockHashes(announces) => {
                self.handle_block_announces(peer, announces);
                Ok(())
            }
            Packet::NewBlock { block, td } => {
                self.handle_block_broadcast(peer, block, td);
                Ok(())
            }
            Packet::NewPooledTransactionHashes(hashes) => {
                if !self.flags.accept_txs() {
                    return Ok(());
                }
                if let Err(e) = self.tx_fetcher.notify(peer.id(), hashes) {
                    debug!(peer = %short_id(peer.id()), err = %e, "tx announcement rejected");
                }
                Ok(())
            }
            Packet::Transactions(txs) => {
                self.handle_transactions(peer, txs, false);
                Ok(())
            }
            Packet::PooledTransactions(txs) => {
                self.handle_transactions(peer, txs, true);
                Ok(())
            }
        }
    }

    fn handle_headers(&self, peer: &Arc<EtdPeer>, mut headers: Vec<BlockHeader>) -> Result<(), HandlerError> {
        if headers.is_empty() {
            if let Some(drop) = peer.retire_sync_drop() {
                drop.stop();
                // Fast sync must enforce the checkpoint; unsynced peers may
                // connect once we are done.
                if self.flags.fast_sync() {
                    warn!(peer = %short_id(peer.id()), "dropping unsynced node during sync");
                    return Err(HandlerError::UnsyncedPeer);
                }
            }
        }

        let filter = headers.len() == 1;
        if filter {
            let header = &headers[0];
            let number = header.number;
            if let Some(checkpoint) = self.checkpoint.filter(|c| c.number == number) {
                if let Some(drop) = peer.retire_sync_drop() {
                    drop.stop();
                    let got = header.hash();
                    if got != checkpoint.hash {
                        return Err(HandlerError::CheckpointMismatch {
                            number,
                            expected: checkpoint.hash,
                            got,
                        });
                    }
                    self.metrics.checkpoint_verified.inc();
                    debug!(peer = %short_id(peer.id()), number, "checkpoint verified");
                    return Ok(());
                }
            }
            if let Some(want) = self.whitelist.get(number) {
                let got = header.hash();
                if got != want {
                    info!(peer = %short_id(peer.id()), number, hash = %got, want = %want, "whitelist mismatch, dropping peer");
                    return Err(HandlerError::WhitelistMismatch {
                        number,
                        expected: want,
                        got,
                    });
                }
                debug!(peer = %short_id(peer.id()), number, hash = %want, "whitelist block verified");
            }
            headers = self
                .block_fetcher
                .filter_headers(peer.id(), headers, Instant::now());
        }

        if !headers.is_empty() || !filter {
            let items = headers.len();
            let result = self.downloader.deliver_headers(peer.id(), headers);
            self.record_delivery(peer, &self.metrics.headers, items, result, "headers");
        }
        Ok(())
    }

    fn handle_bodies(
        &self,
        peer: &Arc<EtdPeer>,
        mut transactions: Vec<Vec<Transaction>>,
        mut uncles: Vec<Vec<BlockHeader>>,
    ) {
        let filter = !transactions.is_empty() || !uncles.is_empty();
        if filter {
            (transactions, uncles) =
                self.block_fetcher
                    .filter_bodies(peer.id(), transactions, uncles, Instant::now());
        }
        if !transactions.is_empty() || !uncles.is_empty() || !filter {
            let items = transactions.len();
            let result = self.downloader.deliver_bodies(peer.id(), transactions, uncles);
            self.record_delivery(peer, &self.metrics.bodies, items, result, "bodies");
        }
    }

    fn handle_block_announces(&self, peer: &Arc<EtdPeer>, announces: Vec<(B256, u64)>) {
        for (hash, number) in announces {
            if self.chain.has_block(hash, number) {
                continue;
            }
            let header_peer = peer.clone();
            let header_fn: HeaderRequestFn = Arc::new(move |hash| header_peer.request_one_header(hash));
            let bodies_peer = peer.clone();
            let bodies_fn: BodiesRequestFn = Arc::new(move |hashes| bodies_peer.request_bodies(hashes));
            if let Err(e) = self.block_fetcher.notify(
                peer.id(),
                hash,
                number,
                Instant::now(),
                header_fn,
                bodies_fn,
            ) {
                debug!(peer = %short_id(peer.id()), number, err = %e, "block announcement rejected");
            }
        }
    }

    fn handle_block_broadcast(&self, peer: &Arc<EtdPeer>, block: Block, td: U256) {
        let parent = block.parent_hash();
        let difficulty = block.difficulty();
        if let Err(e) = self.block_fetcher.enqueue(peer.id(), block) {
            debug!(peer = %short_id(peer.id()), err = %e, "block broadcast rejected");
        }

        // The peer must have at least the parent of any block it propagates.
        // Neither the parent nor the declared td are verified here.
        let implied_td = td.saturating_sub(difficulty);
        if implied_td > peer.td() {
            peer.set_head(parent, implied_td);
            self.chain_sync.handle_peer_event();
        }
    }

    fn handle_transactions(&self, peer: &Arc<EtdPeer>, txs: Vec<Transaction>, direct: bool) {
        if !self.flags.accept_txs() {
            return;
        }
        if let Err(e) = self.tx_fetcher.enqueue(peer.id(), txs, direct) {
            debug!(peer = %short_id(peer.id()), err = %e, direct, "transactions rejected");
        }
    }

    fn record_delivery(
        &self,
        peer: &Arc<EtdPeer>,
        counters: &DeliveryCounters,
        items: usize,
        result: Result<(), DeliveryError>,
        what: &'static str,
    ) {
        counters.record(items, result.is_ok());
        if let Err(e) = result {
            if e == DeliveryError::Busy {
                self.metrics.throttle.inc();
            }
            debug!(peer = %short_id(peer.id()), err = %e, items, "failed to deliver {}", what);
        }
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Owner of the sync subsystem's shared state and background reactor.
pub struct Handler {
    shared: Arc<HandlerShared>,
    shutdown: watch::Sender<bool>,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl Handler {
    pub fn new(config: HandlerConfig) -> Result<Self, HandlerError> {
        let genesis = config.chain.genesis_hash();
        let checkpoint = config
            .checkpoint
            .or_else(|| config.checkpoints.lookup(&genesis));
        if let Some(cp) = checkpoint {
            if config.whitelist.get(cp.number).is_some_and(|h| h != cp.hash) {
                return Err(ConfigError::ConflictingAnchor(cp.number).into());
            }
            info!(number = cp.number, hash = %cp.hash, "checkpoint challenge enabled");
        }

        let head = config.chain.current_header().number;
        let fast_sync = match config.sync_mode {
            SyncMode::Fast if head > 0 => {
                warn!(head, "switch sync mode from fast sync to full sync");
                false
            }
            SyncMode::Fast => true,
            SyncMode::Full => false,
        };

        let peers = Arc::new(PeerSet::new());
        let flags = Arc::new(SyncFlags::new(fast_sync));
        let chain_sync = Arc::new(ChainSync::new(
            peers.clone(),
            config.chain.clone(),
            config.downloader.clone(),
            flags.clone(),
        ));
        let shared = Arc::new(HandlerShared {
            peers,
            chain: config.chain,
            downloader: config.downloader,
            block_fetcher: config.block_fetcher,
            tx_fetcher: config.tx_fetcher,
            chain_sync,
            flags,
            checkpoint,
            whitelist: config.whitelist,
            metrics: config.metrics,
            snapshot: config.snapshot,
            challenge_timeout: config.challenge_timeout,
        });
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared,
            shutdown,
            reactor: Mutex::new(None),
        })
    }

    pub fn etd(&self) -> EtdHandler {
        EtdHandler(self.shared.clone())
    }

    pub fn snap(&self) -> SnapHandler {
        SnapHandler(self.shared.clone())
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.shared.peers
    }

    pub fn chain_sync(&self) -> &Arc<ChainSync> {
        &self.shared.chain_sync
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.shared.checkpoint
    }

    pub fn fast_sync(&self) -> bool {
        self.shared.flags.fast_sync()
    }

    pub fn accept_txs(&self) -> bool {
        self.shared.flags.accept_txs()
    }

    pub fn set_accept_txs(&self, enabled: bool) {
        self.shared.flags.set_accept_txs(enabled);
    }

    pub fn run_peer(&self, peer: Arc<EtdPeer>) -> Result<(), HandlerError> {
        self.shared.run_etd_peer(peer)
    }

    /// Unregisters and disconnects the peer. Removing an unknown peer is a no-op.
    pub fn remove_peer(&self, id: &PeerId) {
        self.shared.remove_peer(id);
    }

    pub fn handle(&self, peer: &Arc<EtdPeer>, packet: Packet) -> Result<(), HandlerError> {
        self.shared.handle(peer, packet)
    }

    pub fn peer_info(&self, id: &PeerId) -> Option<PeerInfo> {
        self.shared.peer_info(id)
    }

    pub fn peers_info(&self) -> Vec<(PeerId, PeerInfo)> {
        self.shared
            .peers
            .snapshot()
            .into_iter()
            .map(|p| (*p.id(), p.info()))
            .collect()
    }

    /// Sub-protocols to advertise, most preferred first.
    pub fn protocols(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = ETD_VERSIONS
            .iter()
            .map(|&version| Capability {
                name: ETD_PROTOCOL_NAME,
                version,
            })
            .collect();
        if self.shared.snapshot {
            caps.push(Capability {
                name: SNAP_PROTOCOL_NAME,
                version: SNAP1,
            });
        }
        caps
    }

    /// Spawns the sync reactor.
    pub fn start(&self, max_peers: usize) -> Result<(), HandlerError> {
        if max_peers == 0 {
            return Err(ConfigError::NoPeerSlots.into());
        }
        let mut reactor = self.reactor.lock();
        if reactor.is_some() {
            return Ok(());
        }
        let chain_sync = self.shared.chain_sync.clone();
        let shutdown = self.shutdown.subscribe();
        *reactor = Some(tokio::spawn(async move {
            chain_sync.run(max_peers, shutdown).await;
        }));
        info!(max_peers, "sync handler started");
        Ok(())
    }

    /// Stops the reactor, then closes the peer set and disconnects everyone.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let reactor = self.reactor.lock().take();
        if let Some(reactor) = reactor {
            let _ = reactor.await;
        }
        self.shared.peers.close();
        for peer in self.shared.peers.snapshot() {
            self.shared.remove_peer(peer.id());
        }
        info!("sync handler stopped");
    }
}

// ============================================================================
// Protocol views
// ============================================================================

/// The handler as seen by the `etd` protocol.
#[derive(Clone)]
pub struct EtdHandler(Arc<HandlerShared>);

impl EtdHandler {
    pub fn chain(&self) -> &Arc<dyn ChainReader> {
        &self.0.chain
    }

    pub fn accept_txs(&self) -> bool {
        self.0.flags.accept_txs()
    }

    pub fn run_peer(&self, peer: Arc<EtdPeer>) -> Result<(), HandlerError> {
        self.0.run_etd_peer(peer)
    }

    pub fn peer_info(&self, id: &PeerId) -> Option<PeerInfo> {
        self.0.peer_info(id)
    }

    pub fn handle(&self, peer: &Arc<EtdPeer>, packet: Packet) -> Result<(), HandlerError> {
        self.0.handle(peer, packet)
    }

    /// Decodes and handles one raw message. A fatal error removes the peer
    /// before being returned.
    pub fn handle_message(&self, peer: &Arc<EtdPeer>, code: u64, payload: &[u8]) -> Result<(), HandlerError> {
        let result = match decode_message(peer.version(), code, payload) {
            Ok(Message::Packet(packet)) => self.0.handle(peer, packet),
            Ok(Message::Request { .. }) => Ok(()),
            Err(e) => Err(HandlerError::UnexpectedPacket(e)),
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                self.0.metrics.peer_drops.inc();
                debug!(peer = %short_id(peer.id()), err = %e, "dropping peer");
                self.0.remove_peer(peer.id());
            }
        }
        result
    }
}

/// The handler as seen by the `snap` protocol.
#[derive(Clone)]
pub struct SnapHandler(Arc<HandlerShared>);

impl SnapHandler {
    /// Attaches a `snap` connection to the matching `etd` peer.
    pub fn run_peer(&self, snap: Arc<SnapPeer>) -> Result<(), HandlerError> {
        self.0.run_snap_peer(snap)
    }

    pub fn peer_info(&self, id: &PeerId) -> Option<SnapPeerInfo> {
        self.0.snap_info(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::ChannelDownloader;
    use crate::fetcher::{AnnounceFetcher, TxAnnounceQueue};
    use chain::ChainTracker;
    use forks::ChainConfig;
    use prometheus::Registry;

    fn handler(snapshot: bool) -> Handler {
        let metrics = SyncMetrics::new(&Registry::new()).unwrap();
        let genesis = BlockHeader {
            difficulty: U256::from(1u64),
            ..Default::default()
        };
        let chain = Arc::new(ChainTracker::new(ChainConfig::dev(), genesis));
        let (downloader, _) = ChannelDownloader::new(1);
        let (fetcher, _) = AnnounceFetcher::new(1, metrics.fetcher_rejected.clone());
        let (txs, _) = TxAnnounceQueue::new(1, metrics.fetcher_rejected.clone());
        let mut config = HandlerConfig::new(
            chain,
            Arc::new(downloader),
            Arc::new(fetcher),
            Arc::new(txs),
            metrics,
        );
        config.snapshot = snapshot;
        Handler::new(config).unwrap()
    }

    #[test]
    fn protocols_include_snap_only_when_enabled() {
        let names = |h: &Handler| -> Vec<(&'static str, u32)> {
            h.protocols().iter().map(|c| (c.name, c.version)).collect()
        };
        assert_eq!(names(&handler(false)), vec![("etd", 66), ("etd", 65)]);
        assert_eq!(
            names(&handler(true)),
            vec![("etd", 66), ("etd", 65), ("snap", 1)]
        );
    }

    #[tokio::test]
    async fn start_requires_peer_slots() {
        let h = handler(false);
        assert!(matches!(
            h.start(0),
            Err(HandlerError::Config(ConfigError::NoPeerSlots))
        ));
        h.start(10).unwrap();
        h.stop().await;
        assert!(h.peers().is_closed());
    }

    #[tokio::test]
    async fn table_checkpoint_applies_to_matching_genesis() {
        use crate::checkpoint::TrustedCheckpoint;

        let metrics = SyncMetrics::new(&Registry::new()).unwrap();
        let genesis = BlockHeader::default();
        let chain = Arc::new(ChainTracker::new(ChainConfig::dev(), genesis.clone()));
        let (downloader, _) = ChannelDownloader::new(1);
        let (fetcher, _) = AnnounceFetcher::new(1, metrics.fetcher_rejected.clone());
        let (txs, _) = TxAnnounceQueue::new(1, metrics.fetcher_rejected.clone());
        let mut config = HandlerConfig::new(chain, Arc::new(downloader), Arc::new(fetcher), Arc::new(txs), metrics);
        config
            .checkpoints
            .insert(
                genesis.hash(),
                TrustedCheckpoint {
                    section_index: 2,
                    section_head: B256::repeat_byte(3),
                    cht_root: B256::ZERO,
                    bloom_root: B256::ZERO,
                },
            )
            .unwrap();
        let handler = Handler::new(config).unwrap();
        assert_eq!(
            handler.checkpoint(),
            Some(Checkpoint {
                number: 98_303,
                hash: B256::repeat_byte(3),
            })
        );
    }

    #[tokio::test]
    async fn conflicting_anchors_are_rejected() {
        let metrics = SyncMetrics::new(&Registry::new()).unwrap();
        let chain = Arc::new(ChainTracker::new(ChainConfig::dev(), BlockHeader::default()));
        let (downloader, _) = ChannelDownloader::new(1);
        let (fetcher, _) = AnnounceFetcher::new(1, metrics.fetcher_rejected.clone());
        let (txs, _) = TxAnnounceQueue::new(1, metrics.fetcher_rejected.clone());
        let mut config = HandlerConfig::new(chain, Arc::new(downloader), Arc::new(fetcher), Arc::new(txs), metrics);
        config.checkpoint = Some(Checkpoint {
            number: 100,
            hash: B256::repeat_byte(1),
        });
        config.whitelist.insert(100, B256::repeat_byte(2));
        assert!(matches!(
            Handler::new(config),
            Err(HandlerError::Config(ConfigError::ConflictingAnchor(100)))
        ));
    }
}
