use std::sync::atomic::{AtomicI32, Ordering};

use alloy_primitives::Address;
use thiserror::Error;
use tracing::info;

use crate::types::BlockHeader;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot recover author of block {number}: {reason}")]
    UnknownAuthor { number: u64, reason: String },
}

/// Consensus engine as seen by the node. Validation rules live elsewhere.
pub trait Engine: Send + Sync + 'static {
    /// Address credited with producing the block.
    fn author(&self, header: &BlockHeader) -> Result<Address, EngineError>;

    /// Thread-count control, if the engine mines locally.
    fn threaded(&self) -> Option<&dyn Threaded> {
        None
    }

    fn close(&self) {}
}

pub trait Threaded: Send + Sync {
    /// Sets the number of mining threads; negative disables mining.
    fn set_threads(&self, threads: i32);

    fn threads(&self) -> i32;
}

/// Proof-of-work engine: the coinbase is the author.
#[derive(Debug, Default)]
pub struct Ethash {
    threads: AtomicI32,
}

impl Ethash {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for Ethash {
    fn author(&self, header: &BlockHeader) -> Result<Address, EngineError> {
        Ok(header.coinbase)
    }

    fn threaded(&self) -> Option<&dyn Threaded> {
        Some(self)
    }

    fn close(&self) {
        self.threads.store(-1, Ordering::SeqCst);
        info!("ethash engine closed");
    }
}

impl Threaded for Ethash {
    fn set_threads(&self, threads: i32) {
        self.threads.store(threads, Ordering::SeqCst);
    }

    fn threads(&self) -> i32 {
        self.threads.load(Ordering::SeqCst)
    }
}

/// Engine that accepts blocks without a sealer, as used by dev chains and tests.
#[derive(Debug, Default)]
pub struct Faker;

impl Engine for Faker {
    fn author(&self, header: &BlockHeader) -> Result<Address, EngineError> {
        if header.coinbase == Address::ZERO {
            return Err(EngineError::UnknownAuthor {
                number: header.number,
                reason: "zero coinbase".to_string(),
            });
        }
        Ok(header.coinbase)
    }
}
