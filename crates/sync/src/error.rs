use alloy_primitives::B256;
use thiserror::Error;

use crate::packet::PacketError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerSetError {
    #[error("peer already registered")]
    AlreadyRegistered,
    #[error("peer not registered")]
    NotRegistered,
    #[error("peer set closed")]
    Closed,
}

/// Invalid operator-supplied trust anchors or handler options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid entry {entry:?}: expected <number>=<0xhash>")]
    MalformedEntry { entry: String },
    #[error("invalid block number in {0:?}")]
    BadNumber(String),
    #[error("invalid block hash in {0:?}")]
    BadHash(String),
    #[error("duplicate whitelist entry for block {0}")]
    DuplicateWhitelist(u64),
    #[error("unknown sync mode {0:?}")]
    UnknownSyncMode(String),
    #[error("checkpoint and whitelist disagree on block {0}")]
    ConflictingAnchor(u64),
    #[error("max peers must be positive")]
    NoPeerSlots,
    #[error("trusted section {0} ends past the last block number")]
    SectionOutOfRange(u64),
}

/// Errors returned while handling a peer's packet. Fatal variants mean the
/// caller must disconnect the peer.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("checkpoint mismatch at block {number}: want {expected}, got {got}")]
    CheckpointMismatch { number: u64, expected: B256, got: B256 },
    #[error("whitelist block {number} mismatch: want {expected}, got {got}")]
    WhitelistMismatch { number: u64, expected: B256, got: B256 },
    #[error("unsynced node cannot serve sync")]
    UnsyncedPeer,
    #[error("unexpected packet: {0}")]
    UnexpectedPacket(#[from] PacketError),
    #[error(transparent)]
    Peer(#[from] PeerSetError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HandlerError {
    pub fn is_fatal(&self) -> bool {
        match self {
            HandlerError::CheckpointMismatch { .. }
            | HandlerError::WhitelistMismatch { .. }
            | HandlerError::UnsyncedPeer
            | HandlerError::UnexpectedPacket(_) => true,
            HandlerError::Peer(_) | HandlerError::Config(_) => false,
        }
    }
}

/// Rejections reported by the downloader when it did not ask for the data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no fetches pending")]
    NoFetchesPending,
    #[error("delivery queue full")]
    Busy,
    #[error("downloader terminated")]
    Terminated,
}

/// Failure of a synchronisation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("peer dropped during sync")]
    PeerDropped,
    #[error("sync timed out")]
    Timeout,
    #[error("sync cancelled")]
    Cancelled,
    #[error("downloader: {0}")]
    Downloader(String),
}

/// Reasons a fetcher refuses an announcement or delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetcherError {
    #[error("peer exceeded announcement limit")]
    AnnounceLimit,
    #[error("fetcher queue full")]
    QueueFull,
    #[error("fetcher terminated")]
    Terminated,
}
