use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use alloy_primitives::{B256, U256};
use devp2p::enr::NodeId;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::packet::HashOrNumber;

pub type PeerId = NodeId;

/// Failed requests after which a peer is considered throttled.
pub const MAX_FAILED_REQUESTS: u32 = 3;

/// Queue depth of outbound commands per peer.
pub const PEER_COMMAND_BUFFER: usize = 64;

/// Short hex prefix for log fields.
pub fn short_id(id: &PeerId) -> String {
    hex::encode(&id[..8])
}

/// Requests the sync layer hands to the transport for a given peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    GetBlockHeaders {
        request_id: u64,
        origin: HashOrNumber,
        amount: u64,
        skip: u64,
        reverse: bool,
    },
    GetBlockBodies {
        request_id: u64,
        hashes: Vec<B256>,
    },
    GetPooledTransactions {
        request_id: u64,
        hashes: Vec<B256>,
    },
    Disconnect,
}

/// `etd` metadata reported for a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub version: u32,
    pub difficulty: U256,
    pub head: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapPeerInfo {
    pub version: u32,
}

/// Satellite `snap` connection attached to an `etd` peer.
#[derive(Debug)]
pub struct SnapPeer {
    id: PeerId,
    version: u32,
}

impl SnapPeer {
    pub fn new(id: PeerId, version: u32) -> Self {
        Self { id, version }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn info(&self) -> SnapPeerInfo {
        SnapPeerInfo {
            version: self.version,
        }
    }
}

/// Pending connection drop armed while a checkpoint probe is outstanding.
#[derive(Debug)]
pub struct SyncDrop {
    timer: JoinHandle<()>,
}

impl SyncDrop {
    pub fn new(timer: JoinHandle<()>) -> Self {
        Self { timer }
    }

    /// Cancels the timer. Has no effect on a timer that already fired.
    pub fn stop(self) {
        self.timer.abort();
    }
}

#[derive(Debug)]
struct PeerHead {
    hash: B256,
    td: U256,
}

#[derive(Debug, Default)]
struct PeerExtras {
    snap: Option<Arc<SnapPeer>>,
    sync_drop: Option<SyncDrop>,
}

/// A connected peer speaking `etd`.
#[derive(Debug)]
pub struct EtdPeer {
    id: PeerId,
    version: u32,
    head: RwLock<PeerHead>,
    extras: RwLock<PeerExtras>,
    registered_seq: AtomicU64,
    failed_requests: AtomicU32,
    next_request_id: AtomicU64,
    cmd_tx: mpsc::Sender<PeerCommand>,
}

impl EtdPeer {
    /// Creates a peer from its handshake status. Commands are delivered on
    /// the returned receiver, which the transport drains.
    pub fn new(
        id: PeerId,
        version: u32,
        head: B256,
        td: U256,
    ) -> (Arc<Self>, mpsc::Receiver<PeerCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(PEER_COMMAND_BUFFER);
        let peer = Arc::new(Self {
            id,
            version,
            head: RwLock::new(PeerHead { hash: head, td }),
            extras: RwLock::new(PeerExtras::default()),
            registered_seq: AtomicU64::new(u64::MAX),
            failed_requests: AtomicU32::new(0),
            next_request_id: AtomicU64::new(1),
            cmd_tx,
        });
        (peer, cmd_rx)
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn head(&self) -> (B256, U256) {
        let head = self.head.read();
        (head.hash, head.td)
    }

    pub fn td(&self) -> U256 {
        self.head.read().td
    }

    pub fn set_head(&self, hash: B256, td: U256) {
        let mut head = self.head.write();
        head.hash = hash;
        head.td = td;
    }

    pub fn info(&self) -> PeerInfo {
        let (hash, td) = self.head();
        PeerInfo {
            version: self.version,
            difficulty: td,
            head: hash.to_string(),
        }
    }

    pub(crate) fn set_registered_seq(&self, seq: u64) {
        self.registered_seq.store(seq, Ordering::SeqCst);
    }

    /// Registration order within the peer set; lower registered earlier.
    pub fn registered_seq(&self) -> u64 {
        self.registered_seq.load(Ordering::SeqCst)
    }

    pub fn record_failure(&self) -> u32 {
        self.failed_requests.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_failures(&self) {
        self.failed_requests.store(0, Ordering::SeqCst);
    }

    pub fn is_throttled(&self) -> bool {
        self.failed_requests.load(Ordering::SeqCst) >= MAX_FAILED_REQUESTS
    }

    pub fn snap(&self) -> Option<Arc<SnapPeer>> {
        self.extras.read().snap.clone()
    }

    pub(crate) fn attach_snap(&self, snap: Arc<SnapPeer>) -> bool {
        let mut extras = self.extras.write();
        if extras.snap.is_some() {
            return false;
        }
        extras.snap = Some(snap);
        true
    }

    pub(crate) fn detach_snap(&self) -> Option<Arc<SnapPeer>> {
        self.extras.write().snap.take()
    }

    pub(crate) fn arm_sync_drop(&self, drop: SyncDrop) {
        if let Some(old) = self.extras.write().sync_drop.replace(drop) {
            old.stop();
        }
    }

    /// Takes the pending sync drop. Only one caller ever receives it.
    pub fn retire_sync_drop(&self) -> Option<SyncDrop> {
        self.extras.write().sync_drop.take()
    }

    pub fn has_sync_drop(&self) -> bool {
        self.extras.read().sync_drop.is_some()
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues a command without waiting. Returns false if the queue is full
    /// or the transport is gone.
    pub fn send(&self, cmd: PeerCommand) -> bool {
        self.cmd_tx.try_send(cmd).is_ok()
    }

    pub fn request_headers_by_number(&self, origin: u64, amount: u64, skip: u64, reverse: bool) -> bool {
        self.send(PeerCommand::GetBlockHeaders {
            request_id: self.next_request_id(),
            origin: HashOrNumber::Number(origin),
            amount,
            skip,
            reverse,
        })
    }

    pub fn request_one_header(&self, hash: B256) -> bool {
        self.send(PeerCommand::GetBlockHeaders {
            request_id: self.next_request_id(),
            origin: HashOrNumber::Hash(hash),
            amount: 1,
            skip: 0,
            reverse: false,
        })
    }

    pub fn request_bodies(&self, hashes: Vec<B256>) -> bool {
        self.send(PeerCommand::GetBlockBodies {
            request_id: self.next_request_id(),
            hashes,
        })
    }

    pub fn request_txs(&self, hashes: Vec<B256>) -> bool {
        self.send(PeerCommand::GetPooledTransactions {
            request_id: self.next_request_id(),
            hashes,
        })
    }

    pub fn disconnect(&self) {
        let _ = self.cmd_tx.try_send(PeerCommand::Disconnect);
    }
}
