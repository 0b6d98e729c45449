//! Trust anchors checked against peer-supplied headers.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use alloy_primitives::B256;
use forks::params::CHT_FREQUENCY;

use crate::error::ConfigError;

/// A canonical hash trie section announced as trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedCheckpoint {
    pub section_index: u64,
    pub section_head: B256,
    pub cht_root: B256,
    pub bloom_root: B256,
}

impl TrustedCheckpoint {
    /// Last block covered by the section. Fails for section indices whose
    /// last block does not fit a block number.
    pub fn checkpoint(&self) -> Result<Checkpoint, ConfigError> {
        let number = self
            .section_index
            .checked_add(1)
            .and_then(|sections| sections.checked_mul(CHT_FREQUENCY))
            .map(|end| end - 1)
            .ok_or(ConfigError::SectionOutOfRange(self.section_index))?;
        Ok(Checkpoint {
            number,
            hash: self.section_head,
        })
    }
}

/// Block every peer must agree with before it may serve sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub number: u64,
    pub hash: B256,
}

impl FromStr for Checkpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, hash) = parse_entry(s)?;
        Ok(Checkpoint { number, hash })
    }
}

/// Trusted checkpoints keyed by genesis hash, consulted when no explicit
/// checkpoint is configured.
///
/// No networks are built in. Embedders that ship hardcoded sections register
/// them with [`CheckpointTable::insert`] before handing the table to
/// [`HandlerConfig`](crate::HandlerConfig).
#[derive(Debug, Clone, Default)]
pub struct CheckpointTable {
    entries: HashMap<B256, Checkpoint>,
}

impl CheckpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the section for a network, replacing any earlier one.
    pub fn insert(&mut self, genesis: B256, trusted: TrustedCheckpoint) -> Result<(), ConfigError> {
        self.entries.insert(genesis, trusted.checkpoint()?);
        Ok(())
    }

    pub fn lookup(&self, genesis: &B256) -> Option<Checkpoint> {
        self.entries.get(genesis).copied()
    }
}

/// Operator-pinned block hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    entries: BTreeMap<u64, B256>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `<number>=<0xhash>` entries. Conflicting duplicates are rejected.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, ConfigError> {
        let mut whitelist = Whitelist::new();
        for entry in entries {
            let (number, hash) = parse_entry(entry.as_ref())?;
            match whitelist.entries.insert(number, hash) {
                Some(previous) if previous != hash => {
                    return Err(ConfigError::DuplicateWhitelist(number))
                }
                _ => {}
            }
        }
        Ok(whitelist)
    }

    pub fn insert(&mut self, number: u64, hash: B256) {
        self.entries.insert(number, hash);
    }

    pub fn get(&self, number: u64) -> Option<B256> {
        self.entries.get(&number).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_entry(entry: &str) -> Result<(u64, B256), ConfigError> {
    let (number, hash) = entry
        .split_once('=')
        .ok_or_else(|| ConfigError::MalformedEntry {
            entry: entry.to_string(),
        })?;
    let number = number
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::BadNumber(entry.to_string()))?;
    let hash = hash
        .trim()
        .parse::<B256>()
        .map_err(|_| ConfigError::BadHash(entry.to_string()))?;
    Ok((number, hash))
}
