//! The bulk downloader as seen by the handler and the sync reactor.
//!
//! The downloader's own phase machinery lives behind [`Downloader`]; the
//! sync layer only hands it data and asks it to sync towards a peer's head.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use chain::types::{BlockHeader, Transaction};
use devp2p::rlp::RlpItem;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{ConfigError, DeliveryError, SyncError};
use crate::peer::{short_id, EtdPeer, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Full,
    Fast,
}

impl FromStr for SyncMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncMode::Full),
            "fast" => Ok(SyncMode::Fast),
            other => Err(ConfigError::UnknownSyncMode(other.to_string())),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Fast => f.write_str("fast"),
        }
    }
}

#[async_trait]
pub trait Downloader: Send + Sync + 'static {
    fn deliver_headers(&self, peer: &PeerId, headers: Vec<BlockHeader>) -> Result<(), DeliveryError>;

    fn deliver_bodies(
        &self,
        peer: &PeerId,
        transactions: Vec<Vec<Transaction>>,
        uncles: Vec<Vec<BlockHeader>>,
    ) -> Result<(), DeliveryError>;

    fn deliver_receipts(&self, peer: &PeerId, receipts: Vec<Vec<RlpItem>>) -> Result<(), DeliveryError>;

    fn deliver_node_data(&self, peer: &PeerId, data: Vec<Vec<u8>>) -> Result<(), DeliveryError>;

    /// Syncs towards `head` using `peer` as the primary source.
    async fn synchronise(
        &self,
        peer: Arc<EtdPeer>,
        head: B256,
        td: U256,
        mode: SyncMode,
    ) -> Result<(), SyncError>;
}

/// Data handed over by [`ChannelDownloader`].
#[derive(Debug)]
pub enum Delivery {
    Headers {
        peer: PeerId,
        headers: Vec<BlockHeader>,
    },
    Bodies {
        peer: PeerId,
        transactions: Vec<Vec<Transaction>>,
        uncles: Vec<Vec<BlockHeader>>,
    },
    Receipts {
        peer: PeerId,
        receipts: Vec<Vec<RlpItem>>,
    },
    NodeData {
        peer: PeerId,
        data: Vec<Vec<u8>>,
    },
}

/// A sync cycle handed over by [`ChannelDownloader`]. The consumer reports
/// the outcome on `done`.
#[derive(Debug)]
pub struct SyncRequest {
    pub peer: Arc<EtdPeer>,
    pub head: B256,
    pub td: U256,
    pub mode: SyncMode,
    pub done: oneshot::Sender<Result<(), SyncError>>,
}

/// Receiving ends of a [`ChannelDownloader`].
pub struct DownloaderQueues {
    pub deliveries: mpsc::Receiver<Delivery>,
    pub requests: mpsc::Receiver<SyncRequest>,
}

/// Forwards deliveries and sync cycles to a downloader task over bounded
/// queues. Deliveries are only accepted while a cycle is running.
pub struct ChannelDownloader {
    deliveries: mpsc::Sender<Delivery>,
    requests: mpsc::Sender<SyncRequest>,
    syncing: AtomicBool,
}

impl ChannelDownloader {
    pub fn new(buffer: usize) -> (Self, DownloaderQueues) {
        let (delivery_tx, delivery_rx) = mpsc::channel(buffer.max(1));
        let (request_tx, request_rx) = mpsc::channel(1);
        let downloader = Self {
            deliveries: delivery_tx,
            requests: request_tx,
            syncing: AtomicBool::new(false),
        };
        let queues = DownloaderQueues {
            deliveries: delivery_rx,
            requests: request_rx,
        };
        (downloader, queues)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    fn push(&self, delivery: Delivery) -> Result<(), DeliveryError> {
        if !self.is_syncing() {
            return Err(DeliveryError::NoFetchesPending);
        }
        self.deliveries.try_send(delivery).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Busy,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Terminated,
        })
    }
}

#[async_trait]
impl Downloader for ChannelDownloader {
    fn deliver_headers(&self, peer: &PeerId, headers: Vec<BlockHeader>) -> Result<(), DeliveryError> {
        self.push(Delivery::Headers {
            peer: *peer,
            headers,
        })
    }

    fn deliver_bodies(
        &self,
        peer: &PeerId,
        transactions: Vec<Vec<Transaction>>,
        uncles: Vec<Vec<BlockHeader>>,
    ) -> Result<(), DeliveryError> {
        self.push(Delivery::Bodies {
            peer: *peer,
            transactions,
            uncles,
        })
    }

    fn deliver_receipts(&self, peer: &PeerId, receipts: Vec<Vec<RlpItem>>) -> Result<(), DeliveryError> {
        self.push(Delivery::Receipts {
            peer: *peer,
            receipts,
        })
    }

    fn deliver_node_data(&self, peer: &PeerId, data: Vec<Vec<u8>>) -> Result<(), DeliveryError> {
        self.push(Delivery::NodeData { peer: *peer, data })
    }

    async fn synchronise(
        &self,
        peer: Arc<EtdPeer>,
        head: B256,
        td: U256,
        mode: SyncMode,
    ) -> Result<(), SyncError> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Downloader("sync already running".to_string()));
        }
        debug!(peer = %short_id(peer.id()), head = %head, td = %td, mode = %mode, "starting sync cycle");

        let (done_tx, done_rx) = oneshot::channel();
        let request = SyncRequest {
            peer,
            head,
            td,
            mode,
            done: done_tx,
        };
        let result = match self.requests.send(request).await {
            Ok(()) => done_rx
                .await
                .unwrap_or_else(|_| Err(SyncError::Downloader("downloader task gone".to_string()))),
            Err(_) => Err(SyncError::Downloader("downloader task gone".to_string())),
        };
        self.syncing.store(false, Ordering::SeqCst);
        result
    }
}
