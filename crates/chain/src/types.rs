use alloy_primitives::{b256, Address, B256, U256};
use devp2p::rlp::{self, RlpItem};
use sha3::{Digest, Keccak256};

use crate::error::ChainError;

/// 8-byte nonce used in PoW.
pub type BlockNonce = [u8; 8];

/// 256-byte bloom filter.
pub type Bloom = [u8; 256];

/// keccak256(rlp([])).
pub const EMPTY_UNCLE_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

/// Root of an empty transaction trie.
pub const EMPTY_ROOT_HASH: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

pub fn keccak(data: &[u8]) -> B256 {
    B256::from_slice(&Keccak256::digest(data))
}

/// Block header with all PoW fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub coinbase: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: B256,
    pub nonce: BlockNonce,
    pub base_fee: Option<U256>,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            parent_hash: B256::ZERO,
            uncle_hash: EMPTY_UNCLE_HASH,
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: EMPTY_ROOT_HASH,
            receipts_root: EMPTY_ROOT_HASH,
            logs_bloom: [0u8; 256],
            difficulty: U256::ZERO,
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Vec::new(),
            mix_hash: B256::ZERO,
            nonce: [0u8; 8],
            base_fee: None,
        }
    }
}

impl BlockHeader {
    /// keccak256 of the RLP encoding.
    pub fn hash(&self) -> B256 {
        keccak(&self.to_rlp().encode())
    }

    /// True when the header commits to no transactions and no uncles.
    pub fn has_empty_body(&self) -> bool {
        self.transactions_root == EMPTY_ROOT_HASH && self.uncle_hash == EMPTY_UNCLE_HASH
    }

    pub fn to_rlp(&self) -> RlpItem {
        let mut fields = vec![
            RlpItem::hash(&self.parent_hash),
            RlpItem::hash(&self.uncle_hash),
            RlpItem::Bytes(self.coinbase.as_slice().to_vec()),
            RlpItem::hash(&self.state_root),
            RlpItem::hash(&self.transactions_root),
            RlpItem::hash(&self.receipts_root),
            RlpItem::Bytes(self.logs_bloom.to_vec()),
            RlpItem::u256(&self.difficulty),
            RlpItem::uint(self.number),
            RlpItem::uint(self.gas_limit),
            RlpItem::uint(self.gas_used),
            RlpItem::uint(self.timestamp),
            RlpItem::Bytes(self.extra_data.clone()),
            RlpItem::hash(&self.mix_hash),
            RlpItem::Bytes(self.nonce.to_vec()),
        ];
        if let Some(base_fee) = &self.base_fee {
            fields.push(RlpItem::u256(base_fee));
        }
        RlpItem::List(fields)
    }

    /// Pre-London headers carry 15 fields, London adds the base fee.
    pub fn from_rlp(item: RlpItem) -> Result<Self, ChainError> {
        let fields = item.into_list()?;
        if fields.len() < 15 {
            return Err(ChainError::FieldCount {
                what: "header",
                expected_min: 15,
                got: fields.len(),
            });
        }
        let mut it = fields.into_iter();
        let mut next = || it.next().ok_or(ChainError::Truncated("header"));

        Ok(BlockHeader {
            parent_hash: next()?.into_b256()?,
            uncle_hash: next()?.into_b256()?,
            coinbase: Address::from(next()?.into_fixed::<20>()?),
            state_root: next()?.into_b256()?,
            transactions_root: next()?.into_b256()?,
            receipts_root: next()?.into_b256()?,
            logs_bloom: next()?.into_fixed::<256>()?,
            difficulty: next()?.into_u256()?,
            number: next()?.into_u64()?,
            gas_limit: next()?.into_u64()?,
            gas_used: next()?.into_u64()?,
            timestamp: next()?.into_u64()?,
            extra_data: next()?.into_bytes()?,
            mix_hash: next()?.into_b256()?,
            nonce: next()?.into_fixed::<8>()?,
            base_fee: match it.next() {
                Some(item) => Some(item.into_u256()?),
                None => None,
            },
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self, ChainError> {
        Self::from_rlp(rlp::decode(data)?)
    }
}

/// A transaction kept in its network envelope. Legacy transactions are RLP
/// lists, typed ones are byte strings holding `type || payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    envelope: RlpItem,
}

impl Transaction {
    pub fn from_rlp(envelope: RlpItem) -> Self {
        Self { envelope }
    }

    pub fn to_rlp(&self) -> RlpItem {
        self.envelope.clone()
    }

    pub fn hash(&self) -> B256 {
        match &self.envelope {
            RlpItem::List(_) => keccak(&self.envelope.encode()),
            RlpItem::Bytes(typed) => keccak(typed),
        }
    }

    /// The bytes stored in the transactions trie: the RLP list for legacy
    /// transactions, `type || payload` for typed ones.
    pub fn trie_bytes(&self) -> Vec<u8> {
        match &self.envelope {
            RlpItem::List(_) => self.envelope.encode(),
            RlpItem::Bytes(typed) => typed.clone(),
        }
    }
}

/// Transactions root a header commits to for the given body transactions.
pub fn transactions_root(txs: &[Transaction]) -> B256 {
    let items: Vec<Vec<u8>> = txs.iter().map(Transaction::trie_bytes).collect();
    crate::trie::ordered_trie_root(&items)
}

/// keccak256 of the RLP list of uncle headers.
pub fn uncle_hash(uncles: &[BlockHeader]) -> B256 {
    if uncles.is_empty() {
        return EMPTY_UNCLE_HASH;
    }
    let list = RlpItem::List(uncles.iter().map(BlockHeader::to_rlp).collect());
    keccak(&list.encode())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<BlockHeader>,
}

impl BlockBody {
    pub fn to_rlp(&self) -> RlpItem {
        RlpItem::List(vec![
            RlpItem::List(self.transactions.iter().map(Transaction::to_rlp).collect()),
            RlpItem::List(self.uncles.iter().map(BlockHeader::to_rlp).collect()),
        ])
    }

    /// Body = [transactions, uncles].
    pub fn from_rlp(item: RlpItem) -> Result<Self, ChainError> {
        let mut fields = item.into_list()?.into_iter();
        let (Some(txs), Some(uncles)) = (fields.next(), fields.next()) else {
            return Err(ChainError::Truncated("body"));
        };
        Ok(BlockBody {
            transactions: txs.into_list()?.into_iter().map(Transaction::from_rlp).collect(),
            uncles: uncles
                .into_list()?
                .into_iter()
                .map(BlockHeader::from_rlp)
                .collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<BlockHeader>,
}

impl Block {
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self {
            header,
            transactions: body.transactions,
            uncles: body.uncles,
        }
    }

    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    pub fn difficulty(&self) -> U256 {
        self.header.difficulty
    }

    pub fn to_rlp(&self) -> RlpItem {
        RlpItem::List(vec![
            self.header.to_rlp(),
            RlpItem::List(self.transactions.iter().map(Transaction::to_rlp).collect()),
            RlpItem::List(self.uncles.iter().map(BlockHeader::to_rlp).collect()),
        ])
    }

    /// Block = [header, transactions, uncles].
    pub fn from_rlp(item: RlpItem) -> Result<Self, ChainError> {
        let mut fields = item.into_list()?.into_iter();
        let header = fields.next().ok_or(ChainError::Truncated("block"))?;
        let body = BlockBody::from_rlp(RlpItem::List(fields.collect()))?;
        Ok(Block::new(BlockHeader::from_rlp(header)?, body))
    }
}
