pub mod discovery;
pub mod dns_discovery;
pub mod enr;
pub mod error;
pub mod forkid;
pub mod rlp;
