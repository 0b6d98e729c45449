use alloy_primitives::{B256, U256};

use crate::error::Error;

const MAX_RLP_DEPTH: usize = 16;

mod consts {
    pub const SINGLE_BYTE_MAX: u8 = 0x7f;
    pub const SHORT_STRING_PREFIX: u8 = 0x80;
    pub const LONG_STRING_PREFIX: u8 = 0xb7;
    pub const SHORT_STRING_MAX: u8 = 0xb7;
    pub const LONG_STRING_MAX: u8 = 0xbf;
    pub const SHORT_LIST_PREFIX: u8 = 0xc0;
    pub const LONG_LIST_PREFIX: u8 = 0xf7;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RlpItem {
    Bytes(Vec<u8>),
    List(Vec<RlpItem>),
}

impl RlpItem {
    /// Unsigned integer in minimal big-endian form.
    pub fn uint(value: u64) -> RlpItem {
        RlpItem::Bytes(encode_uint(value))
    }

    pub fn u256(value: &U256) -> RlpItem {
        let buf = value.to_be_bytes::<32>();
        let start = buf.iter().position(|&b| b != 0).unwrap_or(32);
        RlpItem::Bytes(buf[start..].to_vec())
    }

    pub fn hash(value: &B256) -> RlpItem {
        RlpItem::Bytes(value.as_slice().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            RlpItem::Bytes(bytes) => encode_bytes(bytes),
            RlpItem::List(items) => {
                let mut payload: Vec<u8> = Vec::new();
                for item in items {
                    payload.extend(item.encode());
                }
                encode_list_payload(&payload)
            }
        }
    }

    pub fn into_list(self) -> Result<Vec<RlpItem>, Error> {
        match self {
            RlpItem::List(items) => Ok(items),
            RlpItem::Bytes(_) => Err(Error::Rlp("expected list, got bytes".to_string())),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, Error> {
        match self {
            RlpItem::Bytes(bytes) => Ok(bytes),
            RlpItem::List(_) => Err(Error::Rlp("expected bytes, got list".to_string())),
        }
    }

    pub fn into_u64(self) -> Result<u64, Error> {
        decode_uint(&self.into_bytes()?)
    }

    pub fn into_u256(self) -> Result<U256, Error> {
        let bytes = self.into_bytes()?;
        if bytes.len() > 32 {
            return Err(Error::Rlp(format!(
                "integer too large: {} bytes",
                bytes.len()
            )));
        }
        let mut buf = [0u8; 32];
        buf[32 - bytes.len()..].copy_from_slice(&bytes);
        Ok(U256::from_be_bytes(buf))
    }

    pub fn into_fixed<const N: usize>(self) -> Result<[u8; N], Error> {
        let bytes = self.into_bytes()?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Rlp(format!("expected {} bytes, got {}", N, bytes.len())))
    }

    pub fn into_b256(self) -> Result<B256, Error> {
        Ok(B256::from(self.into_fixed::<32>()?))
    }
}

/// Minimal big-endian encoding, zero is the empty string.
pub fn encode_uint(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(8);
    bytes[start..].to_vec()
}

pub fn decode_uint(bytes: &[u8]) -> Result<u64, Error> {
    if bytes.len() > 8 {
        return Err(Error::Rlp(format!(
            "integer too large for u64: {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] <= consts::SINGLE_BYTE_MAX {
        vec![bytes[0]]
    } else if bytes.len() < 56 {
        let mut result: Vec<u8> = vec![consts::SHORT_STRING_PREFIX + bytes.len() as u8];
        result.extend_from_slice(bytes);
        result
    } else {
        let len_bytes = encode_uint(bytes.len() as u64);
        let mut result: Vec<u8> = vec![consts::LONG_STRING_PREFIX + len_bytes.len() as u8];
        result.extend(len_bytes);
        result.extend_from_slice(bytes);
        result
    }
}

pub fn encode_list_payload(payload: &[u8]) -> Vec<u8> {
    if payload.len() < 56 {
        let mut result: Vec<u8> = vec![consts::SHORT_LIST_PREFIX + payload.len() as u8];
        result.extend_from_slice(payload);
        result
    } else {
        let len_bytes = encode_uint(payload.len() as u64);
        let mut result: Vec<u8> = vec![consts::LONG_LIST_PREFIX + len_bytes.len() as u8];
        result.extend(len_bytes);
        result.extend_from_slice(payload);
        result
    }
}

/// Decode exactly one item; trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<RlpItem, Error> {
    if data.is_empty() {
        return Err(Error::Rlp("empty data".to_string()));
    }

    let (item, consumed) = decode_with_depth(data, 0)?;
    if consumed != data.len() {
        return Err(Error::Rlp(format!(
            "{} trailing bytes after item",
            data.len() - consumed
        )));
    }
    Ok(item)
}

fn decode_with_depth(data: &[u8], depth: usize) -> Result<(RlpItem, usize), Error> {
    if depth > MAX_RLP_DEPTH {
        return Err(Error::Rlp("RLP nesting too deep".to_string()));
    }

    let first = *data
        .first()
        .ok_or_else(|| Error::Rlp("empty data".to_string()))?;

    if first <= consts::SINGLE_BYTE_MAX {
        Ok((RlpItem::Bytes(vec![first]), 1))
    } else if first <= consts::SHORT_STRING_MAX {
        let len = (first - consts::SHORT_STRING_PREFIX) as usize;
        let body = take(data, 1, len)?;
        Ok((RlpItem::Bytes(body.to_vec()), 1 + len))
    } else if first <= consts::LONG_STRING_MAX {
        let len_of_len = (first - consts::LONG_STRING_PREFIX) as usize;
        let len = decode_length(take(data, 1, len_of_len)?)?;
        let body = take(data, 1 + len_of_len, len)?;
        Ok((RlpItem::Bytes(body.to_vec()), 1 + len_of_len + len))
    } else if first <= consts::LONG_LIST_PREFIX {
        let len = (first - consts::SHORT_LIST_PREFIX) as usize;
        let payload = take(data, 1, len)?;
        let items = decode_list_payload(payload, depth + 1)?;
        Ok((RlpItem::List(items), 1 + len))
    } else {
        let len_of_len = (first - consts::LONG_LIST_PREFIX) as usize;
        let len = decode_length(take(data, 1, len_of_len)?)?;
        let payload = take(data, 1 + len_of_len, len)?;
        let items = decode_list_payload(payload, depth + 1)?;
        Ok((RlpItem::List(items), 1 + len_of_len + len))
    }
}

fn take(data: &[u8], offset: usize, len: usize) -> Result<&[u8], Error> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| Error::Rlp("data too short".to_string()))
}

fn decode_list_payload(payload: &[u8], depth: usize) -> Result<Vec<RlpItem>, Error> {
    let mut items: Vec<RlpItem> = Vec::new();
    let mut offset: usize = 0;

    while offset < payload.len() {
        let (item, consumed) = decode_with_depth(&payload[offset..], depth)?;
        items.push(item);
        offset += consumed;
    }

    Ok(items)
}

fn decode_length(bytes: &[u8]) -> Result<usize, Error> {
    if bytes.len() > std::mem::size_of::<usize>() {
        return Err(Error::Rlp("length prefix overflow".to_string()));
    }
    Ok(bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize))
}
