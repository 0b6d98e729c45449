use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Rlp(#[from] devp2p::error::Error),
    #[error("{what}: expected at least {expected_min} fields, got {got}")]
    FieldCount {
        what: &'static str,
        expected_min: usize,
        got: usize,
    },
    #[error("{0}: unexpected end of fields")]
    Truncated(&'static str),
    #[error("unknown parent {0}")]
    UnknownParent(alloy_primitives::B256),
}
