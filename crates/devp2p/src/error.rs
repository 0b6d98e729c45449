use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RLP error: {0}")]
    Rlp(String),
    #[error("ENR error: {0}")]
    Enr(String),
    #[error("ENR entry {key:?} missing")]
    MissingEntry { key: &'static str },
    #[error("fork id error: {0}")]
    ForkId(String),
    #[error("discovery error: {0}")]
    Discovery(String),
    #[error("DNS error: {0}")]
    Dns(String),
}
