pub mod engine;
pub mod error;
pub mod event;
pub mod tracker;
pub mod trie;
pub mod types;

pub use tracker::{ChainHeadEvent, ChainReader, ChainTracker};
pub use types::{Block, BlockBody, BlockHeader, Transaction};
