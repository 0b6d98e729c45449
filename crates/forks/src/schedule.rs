use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::{
    MAINNET_CHAIN_ID, MAINNET_GENESIS_HASH, MAINNET_NETWORK_ID, MORDOR_CHAIN_ID,
    MORDOR_GENESIS_HASH, MORDOR_NETWORK_ID,
};

/// Protocol-affecting hard forks, in activation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fork {
    Homestead,
    Tangerine,
    Spurious,
    Gotham,
    DifficultyBombDefuse,
    Atlantis,
    Agharta,
    Phoenix,
    Thanos,
    Magneto,
    Mystique,
    Spiral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Mordor,
    Dev,
}

#[derive(Debug, Error)]
#[error("unknown network {0:?}")]
pub struct UnknownNetwork(pub String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "classic" => Ok(Network::Mainnet),
            "mordor" => Ok(Network::Mordor),
            "dev" => Ok(Network::Dev),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Mordor => "mordor",
            Network::Dev => "dev",
        };
        f.write_str(name)
    }
}

impl Network {
    /// Well-known genesis hash. Dev chains derive theirs from the local genesis header.
    pub fn genesis_hash(&self) -> Option<B256> {
        match self {
            Network::Mainnet => Some(MAINNET_GENESIS_HASH),
            Network::Mordor => Some(MORDOR_GENESIS_HASH),
            Network::Dev => None,
        }
    }

    pub fn chain_config(&self) -> ChainConfig {
        match self {
            Network::Mainnet => ChainConfig::mainnet(),
            Network::Mordor => ChainConfig::mordor(),
            Network::Dev => ChainConfig::dev(),
        }
    }
}

/// Network identity plus fork activation blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub network_id: u64,
    pub chain_id: u64,
    pub forks: BTreeMap<Fork, u64>,
}

impl ChainConfig {
    pub fn mainnet() -> Self {
        Self {
            network_id: MAINNET_NETWORK_ID,
            chain_id: MAINNET_CHAIN_ID,
            forks: BTreeMap::from([
                (Fork::Homestead, 1_150_000),
                (Fork::Tangerine, 2_500_000),
                (Fork::Spurious, 3_000_000),
                (Fork::Gotham, 5_000_000),
                (Fork::DifficultyBombDefuse, 5_900_000),
                (Fork::Atlantis, 8_772_000),
                (Fork::Agharta, 9_573_000),
                (Fork::Phoenix, 10_500_839),
                (Fork::Thanos, 11_700_000),
                (Fork::Magneto, 13_189_133),
                (Fork::Mystique, 14_525_000),
                (Fork::Spiral, 19_250_000),
            ]),
        }
    }

    pub fn mordor() -> Self {
        Self {
            network_id: MORDOR_NETWORK_ID,
            chain_id: MORDOR_CHAIN_ID,
            forks: BTreeMap::from([
                (Fork::Homestead, 0),
                (Fork::Tangerine, 0),
                (Fork::Spurious, 0),
                (Fork::Atlantis, 0),
                (Fork::Agharta, 301_243),
                (Fork::Phoenix, 999_983),
                (Fork::Thanos, 2_520_000),
                (Fork::Magneto, 3_985_893),
                (Fork::Mystique, 5_520_000),
                (Fork::Spiral, 9_957_000),
            ]),
        }
    }

    /// Every fork active from genesis.
    pub fn dev() -> Self {
        Self {
            network_id: 1337,
            chain_id: 1337,
            forks: BTreeMap::from([
                (Fork::Homestead, 0),
                (Fork::Atlantis, 0),
                (Fork::Agharta, 0),
                (Fork::Phoenix, 0),
                (Fork::Magneto, 0),
                (Fork::Mystique, 0),
                (Fork::Spiral, 0),
            ]),
        }
    }

    /// Activation blocks as fed into fork id computation (unsorted, may contain 0).
    pub fn fork_blocks(&self) -> Vec<u64> {
        self.forks.values().copied().collect()
    }

    pub fn is_active(&self, fork: Fork, block_number: u64) -> bool {
        self.forks
            .get(&fork)
            .is_some_and(|&activation| block_number >= activation)
    }
}
