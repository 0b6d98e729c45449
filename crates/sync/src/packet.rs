//! `etd` wire messages as seen by the sync layer.
//!
//! Everything a peer can push at us is decoded into the closed [`Packet`]
//! enum. Request messages are answered by the serving side of the transport
//! and surface here only as [`Message::Request`].

use alloy_primitives::{B256, U256};
use chain::types::{Block, BlockBody, BlockHeader, Transaction};
use devp2p::rlp::{self, RlpItem};
use thiserror::Error;

use crate::peer::PeerCommand;

pub const ETD_PROTOCOL_NAME: &str = "etd";
pub const SNAP_PROTOCOL_NAME: &str = "snap";

pub const ETD66: u32 = 66;
pub const ETD65: u32 = 65;
pub const SNAP1: u32 = 1;

/// Supported `etd` versions, most preferred first.
pub const ETD_VERSIONS: [u32; 2] = [ETD66, ETD65];

pub const STATUS_MSG: u64 = 0x00;
pub const NEW_BLOCK_HASHES_MSG: u64 = 0x01;
pub const TRANSACTIONS_MSG: u64 = 0x02;
pub const GET_BLOCK_HEADERS_MSG: u64 = 0x03;
pub const BLOCK_HEADERS_MSG: u64 = 0x04;
pub const GET_BLOCK_BODIES_MSG: u64 = 0x05;
pub const BLOCK_BODIES_MSG: u64 = 0x06;
pub const NEW_BLOCK_MSG: u64 = 0x07;
pub const NEW_POOLED_TRANSACTION_HASHES_MSG: u64 = 0x08;
pub const GET_POOLED_TRANSACTIONS_MSG: u64 = 0x09;
pub const POOLED_TRANSACTIONS_MSG: u64 = 0x0a;
pub const GET_NODE_DATA_MSG: u64 = 0x0d;
pub const NODE_DATA_MSG: u64 = 0x0e;
pub const GET_RECEIPTS_MSG: u64 = 0x0f;
pub const RECEIPTS_MSG: u64 = 0x10;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("unknown message code {0:#04x}")]
    UnknownMessage(u64),
    #[error("status message after handshake")]
    UnexpectedStatus,
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

fn malformed(what: &'static str) -> impl Fn(String) -> PacketError {
    move |reason| PacketError::Malformed { what, reason }
}

/// Origin of a header request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(B256),
    Number(u64),
}

impl HashOrNumber {
    pub fn to_rlp(&self) -> RlpItem {
        match self {
            HashOrNumber::Hash(hash) => RlpItem::hash(hash),
            HashOrNumber::Number(number) => RlpItem::uint(*number),
        }
    }
}

/// Data pushed to us by a peer, either as a reply or unsolicited.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    BlockHeaders(Vec<BlockHeader>),
    BlockBodies {
        transactions: Vec<Vec<Transaction>>,
        uncles: Vec<Vec<BlockHeader>>,
    },
    Receipts(Vec<Vec<RlpItem>>),
    NodeData(Vec<Vec<u8>>),
    NewBlockHashes(Vec<(B256, u64)>),
    NewBlock {
        block: Block,
        td: U256,
    },
    NewPooledTransactionHashes(Vec<B256>),
    Transactions(Vec<Transaction>),
    PooledTransactions(Vec<Transaction>),
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::BlockHeaders(_) => "BlockHeaders",
            Packet::BlockBodies { .. } => "BlockBodies",
            Packet::Receipts(_) => "Receipts",
            Packet::NodeData(_) => "NodeData",
            Packet::NewBlockHashes(_) => "NewBlockHashes",
            Packet::NewBlock { .. } => "NewBlock",
            Packet::NewPooledTransactionHashes(_) => "NewPooledTransactionHashes",
            Packet::Transactions(_) => "Transactions",
            Packet::PooledTransactions(_) => "PooledTransactions",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Packet(Packet),
    /// A request the transport answers from local storage.
    Request { code: u64 },
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes an `etd` message body. From version 66 on, replies are wrapped as
/// `[request_id, payload]`; the id is matched by the transport and dropped.
pub fn decode_message(version: u32, code: u64, payload: &[u8]) -> Result<Message, PacketError> {
    let packet = match code {
        STATUS_MSG => return Err(PacketError::UnexpectedStatus),
        GET_BLOCK_HEADERS_MSG | GET_BLOCK_BODIES_MSG | GET_POOLED_TRANSACTIONS_MSG
        | GET_NODE_DATA_MSG | GET_RECEIPTS_MSG => return Ok(Message::Request { code }),
        BLOCK_HEADERS_MSG => {
            let items = reply_body(version, payload, "BlockHeaders")?;
            Packet::BlockHeaders(decode_headers(items, "BlockHeaders")?)
        }
        BLOCK_BODIES_MSG => {
            let items = reply_body(version, payload, "BlockBodies")?;
            let mut transactions = Vec::with_capacity(items.len());
            let mut uncles = Vec::with_capacity(items.len());
            for item in items {
                let body = BlockBody::from_rlp(item).map_err(|e| PacketError::Malformed {
                    what: "BlockBodies",
                    reason: e.to_string(),
                })?;
                transactions.push(body.transactions);
                uncles.push(body.uncles);
            }
            Packet::BlockBodies {
                transactions,
                uncles,
            }
        }
        RECEIPTS_MSG => {
            let items = reply_body(version, payload, "Receipts")?;
            let receipts = items
                .into_iter()
                .map(RlpItem::into_list)
                .collect::<Result<_, _>>()
                .map_err(|e| malformed("Receipts")(e.to_string()))?;
            Packet::Receipts(receipts)
        }
        NODE_DATA_MSG => {
            let items = reply_body(version, payload, "NodeData")?;
            let data = items
                .into_iter()
                .map(RlpItem::into_bytes)
                .collect::<Result<_, _>>()
                .map_err(|e| malformed("NodeData")(e.to_string()))?;
            Packet::NodeData(data)
        }
        NEW_BLOCK_HASHES_MSG => {
            let items = list(payload, "NewBlockHashes")?;
            let mut announces = Vec::with_capacity(items.len());
            for item in items {
                let fields = item
                    .into_list()
                    .map_err(|e| malformed("NewBlockHashes")(e.to_string()))?;
                let mut fields = fields.into_iter();
                let (Some(hash), Some(number)) = (fields.next(), fields.next()) else {
                    return Err(malformed("NewBlockHashes")("announce needs hash and number".to_string()));
                };
                let hash = hash
                    .into_b256()
                    .map_err(|e| malformed("NewBlockHashes")(e.to_string()))?;
                let number = number
                    .into_u64()
                    .map_err(|e| malformed("NewBlockHashes")(e.to_string()))?;
                announces.push((hash, number));
            }
            Packet::NewBlockHashes(announces)
        }
        NEW_BLOCK_MSG => {
            let mut fields = list(payload, "NewBlock")?.into_iter();
            let (Some(block), Some(td)) = (fields.next(), fields.next()) else {
                return Err(malformed("NewBlock")("expected [block, td]".to_string()));
            };
            let block = Block::from_rlp(block).map_err(|e| malformed("NewBlock")(e.to_string()))?;
            let td = td
                .into_u256()
                .map_err(|e| malformed("NewBlock")(e.to_string()))?;
            Packet::NewBlock { block, td }
        }
        NEW_POOLED_TRANSACTION_HASHES_MSG => {
            let hashes = list(payload, "NewPooledTransactionHashes")?
                .into_iter()
                .map(RlpItem::into_b256)
                .collect::<Result<_, _>>()
                .map_err(|e| malformed("NewPooledTransactionHashes")(e.to_string()))?;
            Packet::NewPooledTransactionHashes(hashes)
        }
        TRANSACTIONS_MSG => {
            let txs = list(payload, "Transactions")?;
            Packet::Transactions(txs.into_iter().map(Transaction::from_rlp).collect())
        }
        POOLED_TRANSACTIONS_MSG => {
            let txs = reply_body(version, payload, "PooledTransactions")?;
            Packet::PooledTransactions(txs.into_iter().map(Transaction::from_rlp).collect())
        }
        other => return Err(PacketError::UnknownMessage(other)),
    };
    Ok(Message::Packet(packet))
}

fn list(payload: &[u8], what: &'static str) -> Result<Vec<RlpItem>, PacketError> {
    rlp::decode(payload)
        .and_then(RlpItem::into_list)
        .map_err(|e| malformed(what)(e.to_string()))
}

fn reply_body(version: u32, payload: &[u8], what: &'static str) -> Result<Vec<RlpItem>, PacketError> {
    let items = list(payload, what)?;
    if version < ETD66 {
        return Ok(items);
    }
    let mut items = items.into_iter();
    let (Some(_request_id), Some(body)) = (items.next(), items.next()) else {
        return Err(malformed(what)("expected [request_id, payload]".to_string()));
    };
    body.into_list().map_err(|e| malformed(what)(e.to_string()))
}

fn decode_headers(items: Vec<RlpItem>, what: &'static str) -> Result<Vec<BlockHeader>, PacketError> {
    items
        .into_iter()
        .map(BlockHeader::from_rlp)
        .collect::<Result<_, _>>()
        .map_err(|e| malformed(what)(e.to_string()))
}

// ============================================================================
// Request encoding
// ============================================================================

impl PeerCommand {
    /// Message code and RLP body for the given protocol version, or `None`
    /// for commands that are not wire messages.
    pub fn encode(&self, version: u32) -> Option<(u64, Vec<u8>)> {
        let (code, request_id, body) = match self {
            PeerCommand::GetBlockHeaders {
                request_id,
                origin,
                amount,
                skip,
                reverse,
            } => (
                GET_BLOCK_HEADERS_MSG,
                *request_id,
                RlpItem::List(vec![
                    origin.to_rlp(),
                    RlpItem::uint(*amount),
                    RlpItem::uint(*skip),
                    RlpItem::uint(u64::from(*reverse)),
                ]),
            ),
            PeerCommand::GetBlockBodies { request_id, hashes } => (
                GET_BLOCK_BODIES_MSG,
                *request_id,
                RlpItem::List(hashes.iter().map(RlpItem::hash).collect()),
            ),
            PeerCommand::GetPooledTransactions { request_id, hashes } => (
                GET_POOLED_TRANSACTIONS_MSG,
                *request_id,
                RlpItem::List(hashes.iter().map(RlpItem::hash).collect()),
            ),
            PeerCommand::Disconnect => return None,
        };
        let message = if version >= ETD66 {
            RlpItem::List(vec![RlpItem::uint(request_id), body])
        } else {
            body
        };
        Some((code, message.encode()))
    }
}
