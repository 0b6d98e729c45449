use alloy_primitives::{b256, B256};

pub const MAINNET_NETWORK_ID: u64 = 1;
pub const MAINNET_CHAIN_ID: u64 = 61;
pub const MAINNET_GENESIS_HASH: B256 =
    b256!("d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3");

pub const MORDOR_NETWORK_ID: u64 = 7;
pub const MORDOR_CHAIN_ID: u64 = 63;
pub const MORDOR_GENESIS_HASH: B256 =
    b256!("a68ebde7932eccb177d38d55dcc6461a019dd795a681e59b5a3e4f3a7259a3f1");

/// Block interval of one canonical hash trie section.
pub const CHT_FREQUENCY: u64 = 32_768;
