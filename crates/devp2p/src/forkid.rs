//! EIP-2124 fork identifiers.
//!
//! A fork id is the CRC32 of the genesis hash extended with every passed fork
//! block number (big-endian u64), plus the next scheduled fork block.

use thiserror::Error;

use crate::error::Error;
use crate::rlp::RlpItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForkId {
    pub fork_hash: [u8; 4],
    pub fork_next: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ForkIdError {
    /// Remote is on a different chain, or we are stale and don't know it.
    #[error("local incompatible or needs update")]
    LocalIncompatibleOrStale,
    /// Remote runs a known subset of our forks but announces a wrong next fork.
    #[error("remote needs update")]
    RemoteStale,
}

impl ForkId {
    /// Fork id of a chain with the given genesis and fork blocks at `head`.
    pub fn new(genesis_hash: &[u8; 32], fork_blocks: &[u64], head: u64) -> ForkId {
        let mut hash = crc32fast::hash(genesis_hash);
        for fork in gather_forks(fork_blocks) {
            if fork <= head {
                hash = checksum_update(hash, fork);
                continue;
            }
            return ForkId {
                fork_hash: hash.to_be_bytes(),
                fork_next: fork,
            };
        }
        ForkId {
            fork_hash: hash.to_be_bytes(),
            fork_next: 0,
        }
    }

    pub fn to_rlp(&self) -> RlpItem {
        RlpItem::List(vec![
            RlpItem::Bytes(self.fork_hash.to_vec()),
            RlpItem::uint(self.fork_next),
        ])
    }

    pub fn from_rlp(item: RlpItem) -> Result<ForkId, Error> {
        let mut fields = item.into_list()?.into_iter();
        let (Some(hash), Some(next)) = (fields.next(), fields.next()) else {
            return Err(Error::ForkId("fork id needs hash and next".to_string()));
        };
        Ok(ForkId {
            fork_hash: hash
                .into_fixed::<4>()
                .map_err(|e| Error::ForkId(format!("fork hash: {}", e)))?,
            fork_next: next.into_u64()?,
        })
    }
}

/// Sorted, deduplicated fork blocks with genesis-time forks removed.
pub fn gather_forks(fork_blocks: &[u64]) -> Vec<u64> {
    let mut forks = fork_blocks.to_vec();
    forks.sort_unstable();
    forks.dedup();
    forks.retain(|&b| b != 0);
    forks
}

fn checksum_update(hash: u32, fork: u64) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(hash);
    hasher.update(&fork.to_be_bytes());
    hasher.finalize()
}

/// Validates remote fork ids against the local fork schedule.
#[derive(Debug, Clone)]
pub struct ForkFilter {
    /// `sums[i]` is the checksum before `forks[i]` activates.
    sums: Vec<[u8; 4]>,
    /// Fork blocks terminated by a `u64::MAX` sentinel.
    forks: Vec<u64>,
}

impl ForkFilter {
    pub fn new(genesis_hash: &[u8; 32], fork_blocks: &[u64]) -> Self {
        let mut forks = gather_forks(fork_blocks);

        let mut hash = crc32fast::hash(genesis_hash);
        let mut sums = Vec::with_capacity(forks.len() + 1);
        sums.push(hash.to_be_bytes());
        for &fork in &forks {
            hash = checksum_update(hash, fork);
            sums.push(hash.to_be_bytes());
        }
        forks.push(u64::MAX);

        Self { sums, forks }
    }

    pub fn validate(&self, remote: &ForkId, head: u64) -> Result<(), ForkIdError> {
        for (i, &fork) in self.forks.iter().enumerate() {
            if head >= fork {
                continue;
            }
            // Same checksum: reject only if the remote's next fork is already behind us.
            if self.sums[i] == remote.fork_hash {
                if remote.fork_next > 0 && head >= remote.fork_next {
                    return Err(ForkIdError::LocalIncompatibleOrStale);
                }
                return Ok(());
            }
            // Remote is on a past state of ours.
            for j in 0..i {
                if self.sums[j] == remote.fork_hash {
                    if self.forks[j] != remote.fork_next {
                        return Err(ForkIdError::RemoteStale);
                    }
                    return Ok(());
                }
            }
            // Remote is ahead of us on our own schedule.
            if self.sums[i + 1..].contains(&remote.fork_hash) {
                return Ok(());
            }
            return Err(ForkIdError::LocalIncompatibleOrStale);
        }
        // Unreachable while the sentinel is in place.
        Err(ForkIdError::LocalIncompatibleOrStale)
    }
}
