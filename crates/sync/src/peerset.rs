use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::PeerSetError;
use crate::peer::{short_id, EtdPeer, PeerId, SnapPeer};

#[derive(Default)]
struct PeerSetInner {
    peers: HashMap<PeerId, Arc<EtdPeer>>,
    next_seq: u64,
    closed: bool,
}

/// Active `etd` peers, keyed by node id.
#[derive(Default)]
pub struct PeerSet {
    inner: RwLock<PeerSetInner>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: Arc<EtdPeer>) -> Result<(), PeerSetError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(PeerSetError::Closed);
        }
        if inner.peers.contains_key(peer.id()) {
            return Err(PeerSetError::AlreadyRegistered);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        peer.set_registered_seq(seq);
        inner.peers.insert(*peer.id(), peer);
        Ok(())
    }

    /// Removes the peer and releases its satellite `snap` connection.
    pub fn unregister(&self, id: &PeerId) -> Result<Arc<EtdPeer>, PeerSetError> {
        let peer = self
            .inner
            .write()
            .peers
            .remove(id)
            .ok_or(PeerSetError::NotRegistered)?;
        if peer.detach_snap().is_some() {
            debug!(peer = %short_id(id), "released snap extension");
        }
        Ok(peer)
    }

    /// Attaches a `snap` connection to an already registered `etd` peer.
    pub fn register_snap(&self, snap: Arc<SnapPeer>) -> Result<(), PeerSetError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(PeerSetError::Closed);
        }
        let peer = inner
            .peers
            .get(snap.id())
            .ok_or(PeerSetError::NotRegistered)?;
        if !peer.attach_snap(snap) {
            return Err(PeerSetError::AlreadyRegistered);
        }
        Ok(())
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<EtdPeer>> {
        self.inner.read().peers.get(id).cloned()
    }

    /// Point-in-time copy of all peers.
    pub fn snapshot(&self) -> Vec<Arc<EtdPeer>> {
        self.inner.read().peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best sync candidate: the non-throttled peer with the highest total
    /// difficulty, earliest registration breaking ties.
    pub fn peer_with_highest_td(&self) -> Option<Arc<EtdPeer>> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| !p.is_throttled())
            .max_by(|a, b| {
                a.td()
                    .cmp(&b.td())
                    .then_with(|| b.registered_seq().cmp(&a.registered_seq()))
            })
            .cloned()
    }

    /// Rejects further registrations and disconnects every peer.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        for peer in inner.peers.values() {
            peer.disconnect();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }
}
