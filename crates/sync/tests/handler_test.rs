use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use prometheus::Registry;
use tokio::sync::{mpsc, Notify};

use chain::types::{Block, BlockBody, BlockHeader, Transaction};
use chain::{ChainReader, ChainTracker};
use devp2p::rlp::RlpItem;
use forks::ChainConfig;
use sync::error::{DeliveryError, FetcherError, HandlerError, PeerSetError, SyncError};
use sync::fetcher::{BodiesRequestFn, HeaderRequestFn};
use sync::handler::SYNC_CHALLENGE_TIMEOUT;
use sync::packet::{HashOrNumber, NEW_BLOCK_HASHES_MSG};
use sync::{
    BlockFetcher, Checkpoint, Downloader, EtdPeer, Handler, HandlerConfig, Packet, PeerCommand,
    PeerId, SnapPeer, SyncMetrics, SyncMode, TxFetcher, Whitelist,
};

// ---------------------------------------------------------------------------
// Mock implementations
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Delivered {
    Headers(PeerId, Vec<BlockHeader>),
    Bodies(PeerId, usize),
    Receipts(PeerId, usize),
    NodeData(PeerId, usize),
}

#[derive(Clone, Debug, PartialEq)]
struct SyncCall {
    peer: PeerId,
    head: B256,
    td: U256,
    mode: SyncMode,
}

#[derive(Default)]
struct MockDownloader {
    delivered: Arc<Mutex<Vec<Delivered>>>,
    syncs: Arc<Mutex<Vec<SyncCall>>>,
    /// Error returned for every delivery after the first of each kind.
    reject_repeats: AtomicBool,
    /// Keep sync cycles running until aborted.
    hold: AtomicBool,
    /// Park the next sync cycle until `release` fires, then end it with
    /// `fail_with` if set.
    park: AtomicBool,
    release: Notify,
    fail_with: Mutex<Option<SyncError>>,
}

impl MockDownloader {
    fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }

    fn record(&self, delivery: Delivered) -> Result<(), DeliveryError> {
        let mut delivered = self.delivered.lock().unwrap();
        let repeat = delivered
            .iter()
            .any(|d| std::mem::discriminant(d) == std::mem::discriminant(&delivery));
        delivered.push(delivery);
        if repeat && self.reject_repeats.load(Ordering::SeqCst) {
            return Err(DeliveryError::NoFetchesPending);
        }
        Ok(())
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    fn deliver_headers(&self, peer: &PeerId, headers: Vec<BlockHeader>) -> Result<(), DeliveryError> {
        self.record(Delivered::Headers(*peer, headers))
    }

    fn deliver_bodies(
        &self,
        peer: &PeerId,
        transactions: Vec<Vec<Transaction>>,
        _uncles: Vec<Vec<BlockHeader>>,
    ) -> Result<(), DeliveryError> {
        self.record(Delivered::Bodies(*peer, transactions.len()))
    }

    fn deliver_receipts(&self, peer: &PeerId, receipts: Vec<Vec<RlpItem>>) -> Result<(), DeliveryError> {
        self.record(Delivered::Receipts(*peer, receipts.len()))
    }

    fn deliver_node_data(&self, peer: &PeerId, data: Vec<Vec<u8>>) -> Result<(), DeliveryError> {
        self.record(Delivered::NodeData(*peer, data.len()))
    }

    async fn synchronise(
        &self,
        peer: Arc<EtdPeer>,
        head: B256,
        td: U256,
        mode: SyncMode,
    ) -> Result<(), SyncError> {
        self.syncs.lock().unwrap().push(SyncCall {
            peer: *peer.id(),
            head,
            td,
            mode,
        });
        if self.park.swap(false, Ordering::SeqCst) {
            self.release.notified().await;
            if let Some(e) = self.fail_with.lock().unwrap().take() {
                return Err(e);
            }
        }
        if self.hold.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockBlockFetcher {
    notified: Arc<Mutex<Vec<(PeerId, B256, u64)>>>,
    header_fns: Arc<Mutex<Vec<HeaderRequestFn>>>,
    enqueued: Arc<Mutex<Vec<(PeerId, B256)>>>,
    filtered_headers: Arc<Mutex<Vec<usize>>>,
    filtered_bodies: Arc<Mutex<Vec<usize>>>,
    /// Claim every header offered to the filter.
    claim_headers: AtomicBool,
}

impl BlockFetcher for MockBlockFetcher {
    fn notify(
        &self,
        peer: &PeerId,
        hash: B256,
        number: u64,
        _time: Instant,
        header_fn: HeaderRequestFn,
        _bodies_fn: BodiesRequestFn,
    ) -> Result<(), FetcherError> {
        self.notified.lock().unwrap().push((*peer, hash, number));
        self.header_fns.lock().unwrap().push(header_fn);
        Ok(())
    }

    fn enqueue(&self, peer: &PeerId, block: Block) -> Result<(), FetcherError> {
        self.enqueued.lock().unwrap().push((*peer, block.hash()));
        Ok(())
    }

    fn filter_headers(&self, _peer: &PeerId, headers: Vec<BlockHeader>, _time: Instant) -> Vec<BlockHeader> {
        self.filtered_headers.lock().unwrap().push(headers.len());
        if self.claim_headers.load(Ordering::SeqCst) {
            return Vec::new();
        }
        headers
    }

    fn filter_bodies(
        &self,
        _peer: &PeerId,
        transactions: Vec<Vec<Transaction>>,
        uncles: Vec<Vec<BlockHeader>>,
        _time: Instant,
    ) -> (Vec<Vec<Transaction>>, Vec<Vec<BlockHeader>>) {
        self.filtered_bodies.lock().unwrap().push(transactions.len());
        (transactions, uncles)
    }
}

#[derive(Default)]
struct MockTxFetcher {
    notified: Arc<Mutex<Vec<(PeerId, Vec<B256>)>>>,
    enqueued: Arc<Mutex<Vec<(PeerId, usize, bool)>>>,
}

impl TxFetcher for MockTxFetcher {
    fn notify(&self, peer: &PeerId, hashes: Vec<B256>) -> Result<(), FetcherError> {
        self.notified.lock().unwrap().push((*peer, hashes));
        Ok(())
    }

    fn enqueue(&self, peer: &PeerId, txs: Vec<Transaction>, direct: bool) -> Result<(), FetcherError> {
        self.enqueued.lock().unwrap().push((*peer, txs.len(), direct));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

const CHECKPOINT_NUMBER: u64 = 32_767;

#[derive(Default)]
struct Options {
    mode: SyncMode,
    checkpoint: Option<Checkpoint>,
    whitelist: Whitelist,
    timeout: Option<Duration>,
}

struct Harness {
    handler: Handler,
    chain: Arc<ChainTracker>,
    downloader: Arc<MockDownloader>,
    fetcher: Arc<MockBlockFetcher>,
    txs: Arc<MockTxFetcher>,
    metrics: SyncMetrics,
}

fn genesis() -> BlockHeader {
    BlockHeader {
        difficulty: U256::from(1_000u64),
        ..Default::default()
    }
}

fn harness(opts: Options) -> Harness {
    let chain = Arc::new(ChainTracker::new(ChainConfig::dev(), genesis()));
    let downloader = Arc::new(MockDownloader::default());
    let fetcher = Arc::new(MockBlockFetcher::default());
    let txs = Arc::new(MockTxFetcher::default());
    let metrics = SyncMetrics::new(&Registry::new()).unwrap();

    let mut config = HandlerConfig::new(
        chain.clone(),
        downloader.clone(),
        fetcher.clone(),
        txs.clone(),
        metrics.clone(),
    );
    config.sync_mode = opts.mode;
    config.checkpoint = opts.checkpoint;
    config.whitelist = opts.whitelist;
    if let Some(timeout) = opts.timeout {
        config.challenge_timeout = timeout;
    }

    Harness {
        handler: Handler::new(config).unwrap(),
        chain,
        downloader,
        fetcher,
        txs,
        metrics,
    }
}

fn checkpoint_header() -> BlockHeader {
    BlockHeader {
        number: CHECKPOINT_NUMBER,
        difficulty: U256::from(131_072u64),
        extra_data: b"checkpoint".to_vec(),
        ..Default::default()
    }
}

fn checkpointed(mode: SyncMode, timeout: Option<Duration>) -> Harness {
    harness(Options {
        mode,
        checkpoint: Some(Checkpoint {
            number: CHECKPOINT_NUMBER,
            hash: checkpoint_header().hash(),
        }),
        timeout,
        ..Default::default()
    })
}

fn new_peer(id: u8, td: u64) -> (Arc<EtdPeer>, mpsc::Receiver<PeerCommand>) {
    EtdPeer::new([id; 64], 66, B256::repeat_byte(id), U256::from(td))
}

// ---------------------------------------------------------------------------
// Peer set
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_peer_is_rejected() {
    let h = harness(Options::default());
    let (peer, _rx) = new_peer(1, 10);
    let (twin, _twin_rx) = new_peer(1, 20);

    h.handler.run_peer(peer).unwrap();
    let err = h.handler.run_peer(twin).unwrap_err();
    assert!(matches!(err, HandlerError::Peer(PeerSetError::AlreadyRegistered)));
    assert!(!err.is_fatal());
    assert_eq!(h.handler.peers().len(), 1);
    assert_eq!(h.handler.peer_info(&[1; 64]).unwrap().difficulty, U256::from(10u64));
}

#[tokio::test]
async fn test_repeated_removal_is_noop() {
    let h = harness(Options::default());
    let (peer, mut rx) = new_peer(1, 10);
    h.handler.run_peer(peer).unwrap();

    h.handler.remove_peer(&[1; 64]);
    h.handler.remove_peer(&[1; 64]);
    h.handler.remove_peer(&[9; 64]);

    assert!(h.handler.peers().is_empty());
    assert_eq!(rx.recv().await, Some(PeerCommand::Disconnect));
}

#[tokio::test]
async fn test_peers_info_snapshot() {
    let h = harness(Options::default());
    let (a, _ra) = new_peer(1, 10);
    let (b, _rb) = new_peer(2, 20);
    h.handler.run_peer(a).unwrap();
    h.handler.run_peer(b).unwrap();

    let mut infos = h.handler.peers_info();
    infos.sort_by_key(|(id, _)| *id);
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[1].1.difficulty, U256::from(20u64));
    assert_eq!(infos[0].1.version, 66);
}

#[tokio::test]
async fn test_snap_extension_attaches_to_etd_peer() {
    let h = harness(Options::default());
    let snap = h.handler.snap();
    assert!(snap.run_peer(Arc::new(SnapPeer::new([1; 64], 1))).is_err());

    let (peer, _rx) = new_peer(1, 10);
    h.handler.etd().run_peer(peer).unwrap();
    snap.run_peer(Arc::new(SnapPeer::new([1; 64], 1))).unwrap();
    assert_eq!(snap.peer_info(&[1; 64]).unwrap().version, 1);

    h.handler.remove_peer(&[1; 64]);
    assert!(snap.peer_info(&[1; 64]).is_none());
}

// ---------------------------------------------------------------------------
// Checkpoint challenge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_checkpoint_challenge_is_requested() {
    let h = checkpointed(SyncMode::Full, None);
    let (peer, mut rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    match rx.recv().await.unwrap() {
        PeerCommand::GetBlockHeaders {
            origin,
            amount,
            skip,
            reverse,
            ..
        } => {
            assert_eq!(origin, HashOrNumber::Number(CHECKPOINT_NUMBER));
            assert_eq!(amount, 1);
            assert_eq!(skip, 0);
            assert!(!reverse);
        }
        other => panic!("unexpected command {:?}", other),
    }
    assert!(peer.has_sync_drop());
}

#[tokio::test]
async fn test_checkpoint_match_retains_peer() {
    let h = checkpointed(SyncMode::Fast, None);
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    h.handler
        .handle(&peer, Packet::BlockHeaders(vec![checkpoint_header()]))
        .unwrap();

    assert!(!peer.has_sync_drop());
    assert!(h.handler.peers().peer(&[1; 64]).is_some());
    assert_eq!(h.metrics.checkpoint_verified.get(), 1);
    // The challenge answer is consumed, not forwarded.
    assert!(h.downloader.delivered().is_empty());
    assert!(h.fetcher.filtered_headers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_checkpoint_mismatch_fails_peer() {
    let h = checkpointed(SyncMode::Fast, None);
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    let forged = BlockHeader {
        extra_data: b"forged".to_vec(),
        ..checkpoint_header()
    };
    let err = h
        .handler
        .handle(&peer, Packet::BlockHeaders(vec![forged]))
        .unwrap_err();
    assert!(matches!(err, HandlerError::CheckpointMismatch { number: CHECKPOINT_NUMBER, .. }));
    assert!(err.is_fatal());
    assert!(!peer.has_sync_drop());
}

#[tokio::test]
async fn test_fatal_message_removes_peer() {
    let h = checkpointed(SyncMode::Fast, None);
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    let forged = BlockHeader {
        extra_data: b"forged".to_vec(),
        ..checkpoint_header()
    };
    let payload = RlpItem::List(vec![RlpItem::uint(1), RlpItem::List(vec![forged.to_rlp()])]).encode();
    let err = h
        .handler
        .etd()
        .handle_message(&peer, sync::packet::BLOCK_HEADERS_MSG, &payload)
        .unwrap_err();

    assert!(matches!(err, HandlerError::CheckpointMismatch { .. }));
    assert!(h.handler.peers().is_empty());
    assert_eq!(h.metrics.peer_drops.get(), 1);
}

#[tokio::test]
async fn test_unknown_message_is_protocol_error() {
    let h = harness(Options::default());
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    let err = h
        .handler
        .etd()
        .handle_message(&peer, 0x21, &RlpItem::List(vec![]).encode())
        .unwrap_err();
    assert!(matches!(err, HandlerError::UnexpectedPacket(_)));
    assert!(h.handler.peers().is_empty());
}

#[tokio::test]
async fn test_request_messages_are_not_handled_here() {
    let h = harness(Options::default());
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    let payload = RlpItem::List(vec![RlpItem::uint(1), RlpItem::List(vec![])]).encode();
    h.handler
        .etd()
        .handle_message(&peer, sync::packet::GET_BLOCK_BODIES_MSG, &payload)
        .unwrap();
    assert!(h.downloader.delivered().is_empty());
    assert_eq!(h.handler.peers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_challenge_drops_peer() {
    let h = checkpointed(SyncMode::Fast, None);
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    tokio::time::sleep(SYNC_CHALLENGE_TIMEOUT + Duration::from_secs(1)).await;

    assert!(h.handler.peers().is_empty());
    assert_eq!(h.metrics.sync_drops_fired.get(), 1);
    assert!(!peer.has_sync_drop());

    // A late answer no longer counts as a challenge response.
    h.handler
        .handle(&peer, Packet::BlockHeaders(vec![checkpoint_header()]))
        .unwrap();
    assert_eq!(h.metrics.checkpoint_verified.get(), 0);
    assert_eq!(*h.fetcher.filtered_headers.lock().unwrap(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_answered_challenge_cancels_timer() {
    let h = checkpointed(SyncMode::Fast, None);
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    h.handler
        .handle(&peer, Packet::BlockHeaders(vec![checkpoint_header()]))
        .unwrap();
    tokio::time::sleep(SYNC_CHALLENGE_TIMEOUT * 2).await;

    assert_eq!(h.handler.peers().len(), 1);
    assert_eq!(h.metrics.sync_drops_fired.get(), 0);
    assert_eq!(h.metrics.checkpoint_verified.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_challenge_retired_exactly_once_under_race() {
    for round in 0..40u8 {
        let timeout = Duration::from_millis(2);
        let h = checkpointed(SyncMode::Full, Some(timeout));
        let (peer, _rx) = new_peer(round.wrapping_add(1), 10);
        h.handler.run_peer(peer.clone()).unwrap();

        tokio::time::sleep(timeout).await;
        h.handler
            .handle(&peer, Packet::BlockHeaders(vec![checkpoint_header()]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let verified = h.metrics.checkpoint_verified.get();
        let fired = h.metrics.sync_drops_fired.get();
        assert_eq!(verified + fired, 1, "round {}: verified={} fired={}", round, verified, fired);
        assert_eq!(h.handler.peers().is_empty(), fired == 1);
        assert!(!peer.has_sync_drop());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_timeout_challenge_still_drops_peer() {
    for round in 0..40u8 {
        let h = checkpointed(SyncMode::Full, Some(Duration::ZERO));
        let (peer, _rx) = new_peer(round.wrapping_add(1), 10);
        h.handler.run_peer(peer.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(h.handler.peers().is_empty(), "round {}: peer kept", round);
        assert_eq!(h.metrics.sync_drops_fired.get(), 1);
        assert!(!peer.has_sync_drop());
    }
}

// ---------------------------------------------------------------------------
// Empty header batches
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_answer_during_fast_sync_fails_peer() {
    let h = checkpointed(SyncMode::Fast, None);
    assert!(h.handler.fast_sync());
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    let err = h
        .handler
        .handle(&peer, Packet::BlockHeaders(vec![]))
        .unwrap_err();
    assert!(matches!(err, HandlerError::UnsyncedPeer));
    assert_eq!(err.to_string(), "unsynced node cannot serve sync");
    assert!(!peer.has_sync_drop());
}

#[tokio::test]
async fn test_empty_answer_during_full_sync_retains_peer() {
    let h = checkpointed(SyncMode::Full, None);
    assert!(!h.handler.fast_sync());
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    h.handler.handle(&peer, Packet::BlockHeaders(vec![])).unwrap();

    assert!(!peer.has_sync_drop());
    assert_eq!(h.handler.peers().len(), 1);
    assert_eq!(h.downloader.delivered(), vec![Delivered::Headers([1; 64], vec![])]);
}

#[tokio::test]
async fn test_fast_sync_disabled_on_non_empty_chain() {
    let chain = Arc::new(ChainTracker::new(ChainConfig::dev(), genesis()));
    chain
        .insert(BlockHeader {
            parent_hash: chain.head_hash(),
            number: 1,
            difficulty: U256::from(1u64),
            ..Default::default()
        })
        .await
        .unwrap();
    let metrics = SyncMetrics::new(&Registry::new()).unwrap();
    let mut config = HandlerConfig::new(
        chain,
        Arc::new(MockDownloader::default()),
        Arc::new(MockBlockFetcher::default()),
        Arc::new(MockTxFetcher::default()),
        metrics,
    );
    config.sync_mode = SyncMode::Fast;
    let handler = Handler::new(config).unwrap();
    assert!(!handler.fast_sync());
}

// ---------------------------------------------------------------------------
// Whitelist
// ---------------------------------------------------------------------------

fn whitelisted(header: &BlockHeader) -> Harness {
    let mut whitelist = Whitelist::new();
    whitelist.insert(header.number, header.hash());
    harness(Options {
        whitelist,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_whitelist_match_passes_through() {
    let pinned = BlockHeader {
        number: 1_920_000,
        ..Default::default()
    };
    let h = whitelisted(&pinned);
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    h.handler
        .handle(&peer, Packet::BlockHeaders(vec![pinned.clone()]))
        .unwrap();
    assert_eq!(*h.fetcher.filtered_headers.lock().unwrap(), vec![1]);
    assert_eq!(h.downloader.delivered(), vec![Delivered::Headers([1; 64], vec![pinned])]);
}

#[tokio::test]
async fn test_whitelist_mismatch_fails_peer() {
    let pinned = BlockHeader {
        number: 1_920_000,
        ..Default::default()
    };
    let h = whitelisted(&pinned);
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    let fork = BlockHeader {
        extra_data: b"dao-fork".to_vec(),
        ..pinned
    };
    let err = h
        .handler
        .handle(&peer, Packet::BlockHeaders(vec![fork]))
        .unwrap_err();
    assert!(matches!(err, HandlerError::WhitelistMismatch { number: 1_920_000, .. }));
    assert!(err.is_fatal());
    assert!(h.downloader.delivered().is_empty());
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_claimed_single_header_is_not_delivered() {
    let h = harness(Options::default());
    h.fetcher.claim_headers.store(true, Ordering::SeqCst);
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    let header = BlockHeader {
        number: 42,
        ..Default::default()
    };
    h.handler
        .handle(&peer, Packet::BlockHeaders(vec![header]))
        .unwrap();
    assert!(h.downloader.delivered().is_empty());
}

#[tokio::test]
async fn test_header_batches_skip_the_fetcher() {
    let h = harness(Options::default());
    h.fetcher.claim_headers.store(true, Ordering::SeqCst);
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    let batch: Vec<BlockHeader> = (1..=3)
        .map(|number| BlockHeader {
            number,
            ..Default::default()
        })
        .collect();
    h.handler
        .handle(&peer, Packet::BlockHeaders(batch.clone()))
        .unwrap();
    assert!(h.fetcher.filtered_headers.lock().unwrap().is_empty());
    assert_eq!(h.downloader.delivered(), vec![Delivered::Headers([1; 64], batch)]);
    assert_eq!(h.metrics.headers.delivered.get(), 3);
}

#[tokio::test]
async fn test_bodies_are_filtered_then_delivered() {
    let h = harness(Options::default());
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    h.handler
        .handle(
            &peer,
            Packet::BlockBodies {
                transactions: vec![vec![], vec![]],
                uncles: vec![vec![], vec![]],
            },
        )
        .unwrap();
    h.handler
        .handle(
            &peer,
            Packet::BlockBodies {
                transactions: vec![],
                uncles: vec![],
            },
        )
        .unwrap();

    assert_eq!(*h.fetcher.filtered_bodies.lock().unwrap(), vec![2]);
    assert_eq!(
        h.downloader.delivered(),
        vec![Delivered::Bodies([1; 64], 2), Delivered::Bodies([1; 64], 0)]
    );
}

#[tokio::test]
async fn test_duplicate_receipts_never_surface() {
    let h = harness(Options::default());
    h.downloader.reject_repeats.store(true, Ordering::SeqCst);
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    let receipts = vec![vec![RlpItem::Bytes(vec![1])]];
    h.handler
        .handle(&peer, Packet::Receipts(receipts.clone()))
        .unwrap();
    h.handler.handle(&peer, Packet::Receipts(receipts)).unwrap();

    assert_eq!(h.downloader.delivered().len(), 2);
    assert_eq!(h.metrics.receipts.delivered.get(), 1);
    assert_eq!(h.metrics.receipts.dropped.get(), 1);
    assert_eq!(h.handler.peers().len(), 1);
}

#[tokio::test]
async fn test_node_data_is_delivered() {
    let h = harness(Options::default());
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    h.handler
        .handle(&peer, Packet::NodeData(vec![vec![0xde, 0xad]]))
        .unwrap();
    assert_eq!(h.downloader.delivered(), vec![Delivered::NodeData([1; 64], 1)]);
    assert_eq!(h.metrics.states.delivered.get(), 1);
}

// ---------------------------------------------------------------------------
// Announcements and broadcasts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_announcements_reach_the_fetcher() {
    let h = harness(Options::default());
    let (peer, mut rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();

    let known = (h.chain.head_hash(), 0);
    let unknown = (B256::repeat_byte(0x77), 5);
    let payload = RlpItem::List(
        [known, unknown]
            .iter()
            .map(|(hash, number)| RlpItem::List(vec![RlpItem::hash(hash), RlpItem::uint(*number)]))
            .collect(),
    )
    .encode();
    h.handler
        .etd()
        .handle_message(&peer, NEW_BLOCK_HASHES_MSG, &payload)
        .unwrap();

    assert_eq!(
        *h.fetcher.notified.lock().unwrap(),
        vec![([1; 64], unknown.0, unknown.1)]
    );

    let header_fn = h.fetcher.header_fns.lock().unwrap()[0].clone();
    assert!(header_fn(unknown.0));
    match rx.recv().await.unwrap() {
        PeerCommand::GetBlockHeaders { origin, amount, .. } => {
            assert_eq!(origin, HashOrNumber::Hash(unknown.0));
            assert_eq!(amount, 1);
        }
        other => panic!("unexpected command {:?}", other),
    }
}

fn broadcast(parent: B256, difficulty: u64) -> Block {
    Block::new(
        BlockHeader {
            parent_hash: parent,
            number: 100,
            difficulty: U256::from(difficulty),
            ..Default::default()
        },
        BlockBody::default(),
    )
}

#[tokio::test]
async fn test_broadcast_raises_peer_head_when_heavier() {
    let h = harness(Options::default());
    let (peer, _rx) = new_peer(1, 1_000);
    h.handler.run_peer(peer.clone()).unwrap();

    let parent = B256::repeat_byte(0x42);
    let block = broadcast(parent, 100);
    h.handler
        .handle(
            &peer,
            Packet::NewBlock {
                block: block.clone(),
                td: U256::from(1_200u64),
            },
        )
        .unwrap();

    assert_eq!(peer.head(), (parent, U256::from(1_100u64)));
    assert_eq!(*h.fetcher.enqueued.lock().unwrap(), vec![([1; 64], block.hash())]);
}

#[tokio::test]
async fn test_broadcast_keeps_peer_head_when_not_heavier() {
    let h = harness(Options::default());
    let (peer, _rx) = new_peer(1, 1_000);
    h.handler.run_peer(peer.clone()).unwrap();

    for td in [1_100u64, 1_050, 50] {
        h.handler
            .handle(
                &peer,
                Packet::NewBlock {
                    block: broadcast(B256::repeat_byte(0x42), 100),
                    td: U256::from(td),
                },
            )
            .unwrap();
    }

    assert_eq!(peer.head(), (B256::repeat_byte(1), U256::from(1_000u64)));
    assert_eq!(h.fetcher.enqueued.lock().unwrap().len(), 3);
}

/// A peer can claim any head by broadcasting a block on top of a parent it
/// never showed us, with an inflated td. The implied head is recorded as-is
/// and becomes the sync target; the downloader is what rejects it later.
#[tokio::test]
async fn test_implied_head_is_trusted_without_proof() {
    let h = harness(Options::default());
    let (honest, _rh) = new_peer(1, 5_000);
    let (spoofer, _rs) = new_peer(2, 10);
    h.handler.run_peer(honest).unwrap();
    h.handler.run_peer(spoofer.clone()).unwrap();

    let phantom_parent = B256::repeat_byte(0xee);
    assert!(h.chain.header(&phantom_parent).is_none());
    h.handler
        .handle(
            &spoofer,
            Packet::NewBlock {
                block: broadcast(phantom_parent, 1),
                td: U256::from(u64::MAX),
            },
        )
        .unwrap();

    assert_eq!(spoofer.head(), (phantom_parent, U256::from(u64::MAX - 1)));
    let op = h.handler.chain_sync().next_sync_op(1).unwrap();
    assert_eq!(op.peer.id(), &[2; 64]);
    assert_eq!(op.head, phantom_parent);
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transactions_gated_until_synced() {
    let h = harness(Options::default());
    let (peer, _rx) = new_peer(1, 10);
    h.handler.run_peer(peer.clone()).unwrap();
    let tx = Transaction::from_rlp(RlpItem::Bytes(vec![2, 0xc0]));

    h.handler
        .handle(&peer, Packet::Transactions(vec![tx.clone()]))
        .unwrap();
    h.handler
        .handle(&peer, Packet::NewPooledTransactionHashes(vec![tx.hash()]))
        .unwrap();
    assert!(h.txs.enqueued.lock().unwrap().is_empty());
    assert!(h.txs.notified.lock().unwrap().is_empty());

    h.handler.set_accept_txs(true);
    h.handler
        .handle(&peer, Packet::Transactions(vec![tx.clone()]))
        .unwrap();
    h.handler
        .handle(&peer, Packet::PooledTransactions(vec![tx.clone(), tx.clone()]))
        .unwrap();
    h.handler
        .handle(&peer, Packet::NewPooledTransactionHashes(vec![tx.hash()]))
        .unwrap();

    assert_eq!(
        *h.txs.enqueued.lock().unwrap(),
        vec![([1; 64], 1, false), ([1; 64], 2, true)]
    );
    assert_eq!(*h.txs.notified.lock().unwrap(), vec![([1; 64], vec![tx.hash()])]);
}

// ---------------------------------------------------------------------------
// Sync reactor
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_forced_sync_with_single_peer() {
    let h = harness(Options {
        mode: SyncMode::Fast,
        ..Default::default()
    });
    h.handler.start(25).unwrap();
    let (peer, _rx) = new_peer(1, 50_000);
    h.handler.run_peer(peer).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.downloader.syncs.lock().unwrap().is_empty());

    tokio::time::sleep(sync::chainsync::FORCE_SYNC_CYCLE).await;
    assert_eq!(
        *h.downloader.syncs.lock().unwrap(),
        vec![SyncCall {
            peer: [1; 64],
            head: B256::repeat_byte(1),
            td: U256::from(50_000u64),
            mode: SyncMode::Fast,
        }]
    );
    assert!(!h.handler.fast_sync());
    assert!(h.handler.accept_txs());

    h.handler.stop().await;
    assert!(h.handler.peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sync_starts_once_enough_peers_join() {
    let h = harness(Options::default());
    h.downloader.hold.store(true, Ordering::SeqCst);
    h.handler.start(3).unwrap();
    let mut rxs = Vec::new();
    for id in 1..=3u8 {
        let (peer, rx) = new_peer(id, 2_000 + id as u64);
        rxs.push(rx);
        h.handler.run_peer(peer).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let syncs = h.downloader.syncs.lock().unwrap().clone();
    assert_eq!(syncs.len(), 1);
    assert_eq!(syncs[0].peer, [3; 64]);
    assert_eq!(syncs[0].mode, SyncMode::Full);
    assert!(h.handler.chain_sync().is_syncing());

    h.handler.stop().await;
    assert!(!h.handler.chain_sync().is_syncing());
    assert!(!h.handler.accept_txs());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_sync_peer_hands_over_to_next_best() {
    let h = harness(Options::default());
    h.downloader.park.store(true, Ordering::SeqCst);
    let (a, mut rx_a) = new_peer(1, 50_000);
    let (b, _rx_b) = new_peer(2, 40_000);
    h.handler.run_peer(a).unwrap();
    h.handler.run_peer(b).unwrap();
    h.handler.start(1).unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.downloader.syncs.lock().unwrap().len(), 1);
    assert_eq!(h.downloader.syncs.lock().unwrap()[0].peer, [1; 64]);

    // Blocks imported before the peer went away.
    let imported = BlockHeader {
        parent_hash: h.chain.head_hash(),
        number: 1,
        difficulty: U256::from(5_000u64),
        ..Default::default()
    };
    assert!(h.chain.insert(imported.clone()).await.unwrap());

    h.downloader.hold.store(true, Ordering::SeqCst);
    h.handler.remove_peer(&[1; 64]);
    *h.downloader.fail_with.lock().unwrap() = Some(SyncError::PeerDropped);
    h.downloader.release.notify_one();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let syncs = h.downloader.syncs.lock().unwrap().clone();
    assert_eq!(syncs.len(), 2);
    assert_eq!(syncs[1].peer, [2; 64]);
    assert_eq!(syncs[1].td, U256::from(40_000u64));
    assert_eq!(rx_a.recv().await, Some(PeerCommand::Disconnect));

    assert_eq!(h.chain.head_hash(), imported.hash());
    assert_eq!(h.chain.head_td(), U256::from(6_000u64));

    h.handler.stop().await;
}
