//! Ethereum node records (EIP-778).
//!
//! Only the parts needed for discovery are modelled: the identity key, the
//! endpoint, and an open map of key/value entries that protocol crates read
//! through [`EnrEntry`].

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{EncodedPoint, PublicKey};
use parking_lot::RwLock;

use crate::error::Error;
use crate::rlp::{self, RlpItem};

/// Uncompressed secp256k1 public key without the 0x04 prefix.
pub type NodeId = [u8; 64];

/// A typed record entry stored under a fixed key.
pub trait EnrEntry: Sized {
    const KEY: &'static str;

    fn to_rlp(&self) -> RlpItem;

    fn from_rlp(item: RlpItem) -> Result<Self, Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub seq: u64,
    pub id: NodeId,
    pub ip: Option<Ipv4Addr>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    entries: BTreeMap<String, RlpItem>,
}

impl NodeRecord {
    pub fn new(id: NodeId) -> Self {
        Self {
            seq: 0,
            id,
            ip: None,
            tcp_port: None,
            udp_port: None,
            entries: BTreeMap::new(),
        }
    }

    /// Parse the `enr:<base64>` text form.
    pub fn from_text(txt: &str) -> Result<Self, Error> {
        let encoded = txt
            .strip_prefix("enr:")
            .ok_or_else(|| Error::Enr("invalid ENR prefix".to_string()))?;
        let decoded = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::Enr(format!("base64 decode failed: {}", e)))?;
        Self::from_rlp_bytes(&decoded)
    }

    pub fn from_rlp_bytes(data: &[u8]) -> Result<Self, Error> {
        let items = rlp::decode(data)?.into_list()?;
        if items.len() < 2 || items.len() % 2 != 0 {
            return Err(Error::Enr(format!("malformed record: {} items", items.len())));
        }

        let mut items = items.into_iter().skip(1);
        let seq = items
            .next()
            .ok_or_else(|| Error::Enr("missing seq".to_string()))?
            .into_u64()?;

        let mut ip = None;
        let mut tcp_port = None;
        let mut udp_port = None;
        let mut id = None;
        let mut entries = BTreeMap::new();

        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            let key = String::from_utf8(key.into_bytes()?)
                .map_err(|_| Error::Enr("non-utf8 key".to_string()))?;
            match key.as_str() {
                "ip" => {
                    let octets = value.clone().into_fixed::<4>()?;
                    ip = Some(Ipv4Addr::from(octets));
                }
                "tcp" => tcp_port = Some(decode_port(value.clone())?),
                "udp" => udp_port = Some(decode_port(value.clone())?),
                "secp256k1" => id = Some(decompress_pubkey(&value.clone().into_bytes()?)?),
                _ => {}
            }
            entries.insert(key, value);
        }

        Ok(Self {
            seq,
            id: id.ok_or_else(|| Error::Enr("missing secp256k1 key".to_string()))?,
            ip,
            tcp_port,
            udp_port,
            entries,
        })
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip?.into(), self.tcp_port?))
    }

    pub fn entry(&self, key: &str) -> Option<&RlpItem> {
        self.entries.get(key)
    }

    pub fn load<E: EnrEntry>(&self) -> Result<E, Error> {
        let item = self
            .entries
            .get(E::KEY)
            .ok_or(Error::MissingEntry { key: E::KEY })?;
        E::from_rlp(item.clone())
    }

    pub fn set<E: EnrEntry>(&mut self, entry: &E) {
        self.entries.insert(E::KEY.to_string(), entry.to_rlp());
    }
}

fn decode_port(item: RlpItem) -> Result<u16, Error> {
    let value = item.into_u64()?;
    u16::try_from(value).map_err(|_| Error::Enr(format!("port out of range: {}", value)))
}

fn decompress_pubkey(compressed: &[u8]) -> Result<NodeId, Error> {
    let point = EncodedPoint::from_bytes(compressed)
        .map_err(|e| Error::Enr(format!("invalid compressed pubkey: {}", e)))?;
    let pubkey = Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
        .ok_or_else(|| Error::Enr("failed to decompress pubkey".to_string()))?;

    let uncompressed = pubkey.to_encoded_point(false);
    uncompressed.as_bytes()[1..]
        .try_into()
        .map_err(|_| Error::Enr("unexpected uncompressed pubkey length".to_string()))
}

/// The node's own record. Entries are replaced in place and every change
/// bumps the sequence number.
pub struct LocalNode {
    record: RwLock<NodeRecord>,
}

impl LocalNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            record: RwLock::new(NodeRecord::new(id)),
        }
    }

    pub fn set<E: EnrEntry>(&self, entry: &E) {
        let value = entry.to_rlp();
        let mut record = self.record.write();
        if record.entries.get(E::KEY) == Some(&value) {
            return;
        }
        record.entries.insert(E::KEY.to_string(), value);
        record.seq += 1;
    }

    pub fn seq(&self) -> u64 {
        self.record.read().seq
    }

    pub fn load<E: EnrEntry>(&self) -> Result<E, Error> {
        self.record.read().load()
    }

    pub fn record(&self) -> NodeRecord {
        self.record.read().clone()
    }
}
