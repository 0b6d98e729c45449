//! Block and transaction synchronization with untrusted `etd` peers.
//!
//! Inbound packets are dispatched by the [`Handler`], which checks them
//! against the configured checkpoint and whitelist before handing data to
//! the fetchers or the bulk [`Downloader`]. [`ChainSync`] picks the peer to
//! sync with, and the [`discovery`] module keeps the advertised fork id
//! current while filtering dial candidates by fork compatibility.

pub mod chainsync;
pub mod checkpoint;
pub mod discovery;
pub mod downloader;
pub mod error;
pub mod fetcher;
pub mod handler;
pub mod metrics;
pub mod packet;
pub mod peer;
pub mod peerset;

pub use chainsync::{ChainSync, SyncFlags, SyncOp};
pub use checkpoint::{Checkpoint, CheckpointTable, TrustedCheckpoint, Whitelist};
pub use downloader::{Downloader, SyncMode};
pub use error::{ConfigError, DeliveryError, FetcherError, HandlerError, PeerSetError, SyncError};
pub use fetcher::{BlockFetcher, TxFetcher};
pub use handler::{EtdHandler, Handler, HandlerConfig, SnapHandler};
pub use metrics::SyncMetrics;
pub use packet::Packet;
pub use peer::{EtdPeer, PeerCommand, PeerId, PeerInfo, SnapPeer};
pub use peerset::PeerSet;
