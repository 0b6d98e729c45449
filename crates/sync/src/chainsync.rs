//! Decides when to sync and with whom.
//!
//! The reactor wakes on peer events, on a periodic force tick and on sync
//! completion. Each wake-up re-evaluates [`ChainSync::next_sync_op`].

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{B256, U256};
use chain::ChainReader;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::downloader::{Downloader, SyncMode};
use crate::error::SyncError;
use crate::peer::{short_id, EtdPeer};
use crate::peerset::PeerSet;

/// Interval after which a sync is forced with fewer peers.
pub const FORCE_SYNC_CYCLE: Duration = Duration::from_secs(10);

/// Peers required before a sync starts, unless forced.
pub const DEFAULT_MIN_SYNC_PEERS: usize = 5;

/// Process-wide sync state shared by the handler and the reactor.
#[derive(Debug, Default)]
pub struct SyncFlags {
    fast_sync: AtomicBool,
    accept_txs: AtomicBool,
}

impl SyncFlags {
    pub fn new(fast_sync: bool) -> Self {
        Self {
            fast_sync: AtomicBool::new(fast_sync),
            accept_txs: AtomicBool::new(false),
        }
    }

    pub fn fast_sync(&self) -> bool {
        self.fast_sync.load(Ordering::SeqCst)
    }

    pub fn set_fast_sync(&self, enabled: bool) {
        self.fast_sync.store(enabled, Ordering::SeqCst);
    }

    pub fn accept_txs(&self) -> bool {
        self.accept_txs.load(Ordering::SeqCst)
    }

    pub fn set_accept_txs(&self, enabled: bool) {
        self.accept_txs.store(enabled, Ordering::SeqCst);
    }
}

/// A sync cycle to run against one peer.
#[derive(Debug, Clone)]
pub struct SyncOp {
    pub peer: Arc<EtdPeer>,
    pub head: B256,
    pub td: U256,
    pub mode: SyncMode,
}

pub struct ChainSync {
    peers: Arc<PeerSet>,
    chain: Arc<dyn ChainReader>,
    downloader: Arc<dyn Downloader>,
    flags: Arc<SyncFlags>,
    syncing: AtomicBool,
    peer_event_tx: mpsc::Sender<()>,
    peer_event_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ChainSync {
    pub fn new(
        peers: Arc<PeerSet>,
        chain: Arc<dyn ChainReader>,
        downloader: Arc<dyn Downloader>,
        flags: Arc<SyncFlags>,
    ) -> Self {
        let (peer_event_tx, peer_event_rx) = mpsc::channel(1);
        Self {
            peers,
            chain,
            downloader,
            flags,
            syncing: AtomicBool::new(false),
            peer_event_tx,
            peer_event_rx: Mutex::new(Some(peer_event_rx)),
        }
    }

    /// Wakes the reactor. Bursts of events collapse into one wake-up.
    pub fn handle_peer_event(&self) {
        let _ = self.peer_event_tx.try_send(());
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// The sync to start now, if any.
    pub fn next_sync_op(&self, min_peers: usize) -> Option<SyncOp> {
        if self.is_syncing() {
            return None;
        }
        if self.peers.len() < min_peers {
            return None;
        }
        let peer = self.peers.peer_with_highest_td()?;
        let (head, td) = peer.head();
        if td <= self.chain.head_td() {
            return None;
        }
        let mode = if self.flags.fast_sync() {
            SyncMode::Fast
        } else {
            SyncMode::Full
        };
        Some(SyncOp {
            peer,
            head,
            td,
            mode,
        })
    }

    fn start_sync(&self, op: SyncOp) -> JoinHandle<(SyncOp, Result<(), SyncError>)> {
        self.syncing.store(true, Ordering::SeqCst);
        info!(
            peer = %short_id(op.peer.id()),
            head = %op.head,
            td = %op.td,
            mode = %op.mode,
            "starting sync"
        );
        let downloader = self.downloader.clone();
        tokio::spawn(async move {
            let result = downloader
                .synchronise(op.peer.clone(), op.head, op.td, op.mode)
                .await;
            (op, result)
        })
    }

    fn finish_sync(&self, op: &SyncOp, result: Result<(), SyncError>) {
        self.syncing.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                if op.mode == SyncMode::Fast {
                    info!("fast sync complete, auto disabling");
                }
                self.flags.set_fast_sync(false);
                self.flags.set_accept_txs(true);
                op.peer.reset_failures();
                debug!(peer = %short_id(op.peer.id()), "sync cycle finished");
            }
            Err(e) => {
                let failures = op.peer.record_failure();
                warn!(peer = %short_id(op.peer.id()), err = %e, failures, "sync cycle failed");
            }
        }
    }

    /// Runs the reactor until `shutdown` flips to true. A running sync task
    /// is aborted and awaited before returning.
    pub async fn run(&self, max_peers: usize, mut shutdown: watch::Receiver<bool>) {
        let Some(mut peer_events) = self.peer_event_rx.lock().take() else {
            warn!("chain sync reactor already running");
            return;
        };
        let default_min_peers = DEFAULT_MIN_SYNC_PEERS.min(max_peers);
        let mut min_peers = default_min_peers;
        let mut force = interval_at(Instant::now() + FORCE_SYNC_CYCLE, FORCE_SYNC_CYCLE);
        force.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut running: Option<JoinHandle<(SyncOp, Result<(), SyncError>)>> = None;

        loop {
            if running.is_none() {
                if let Some(op) = self.next_sync_op(min_peers) {
                    running = Some(self.start_sync(op));
                    min_peers = default_min_peers;
                    force.reset();
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                event = peer_events.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
                _ = force.tick() => {
                    debug!("forcing sync with fewer peers");
                    min_peers = 1;
                }
                joined = wait(&mut running) => {
                    running = None;
                    match joined {
                        Ok((op, result)) => self.finish_sync(&op, result),
                        Err(e) => {
                            self.syncing.store(false, Ordering::SeqCst);
                            warn!(err = %e, "sync task failed");
                        }
                    }
                }
            }
        }

        if let Some(task) = running {
            task.abort();
            let _ = task.await;
            self.syncing.store(false, Ordering::SeqCst);
        }
        debug!("chain sync reactor stopped");
    }
}

async fn wait<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => pending().await,
    }
}
