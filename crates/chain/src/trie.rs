//! Merkle-Patricia root over an ordered list, as used for a block's
//! transactions root. Keys are `RLP(index)`, values are the raw items.
//!
//! The whole trie is built in memory and hashed once; only roots are
//! needed, never proofs or lookups.

use alloy_primitives::B256;
use devp2p::rlp::{self, RlpItem};

use crate::types::{keccak, EMPTY_ROOT_HASH};

/// Root of the trie mapping `RLP(i)` to `items[i]`.
pub fn ordered_trie_root(items: &[Vec<u8>]) -> B256 {
    let entries = items
        .iter()
        .enumerate()
        .map(|(i, item)| (rlp::encode_bytes(&rlp::encode_uint(i as u64)), item.as_slice()));
    trie_root(entries)
}

/// Root of the trie holding the given key/value pairs. Later duplicates of a
/// key are ignored.
pub fn trie_root<'a>(entries: impl IntoIterator<Item = (Vec<u8>, &'a [u8])>) -> B256 {
    let mut leaves: Vec<(Vec<u8>, &[u8])> = entries
        .into_iter()
        .map(|(key, value)| (nibbles(&key), value))
        .collect();
    if leaves.is_empty() {
        return EMPTY_ROOT_HASH;
    }
    leaves.sort_by(|a, b| a.0.cmp(&b.0));
    leaves.dedup_by(|later, earlier| later.0 == earlier.0);
    keccak(&build(&leaves, 0).encode())
}

fn nibbles(key: &[u8]) -> Vec<u8> {
    key.iter().flat_map(|b| [b >> 4, b & 0x0f]).collect()
}

/// Hex-prefix encoding of a nibble path, with the leaf flag in the high
/// nibble of the first byte.
fn compact(path: &[u8], leaf: bool) -> Vec<u8> {
    let flag = if leaf { 0x20 } else { 0x00 };
    let mut out = Vec::with_capacity(path.len() / 2 + 1);
    let rest = if path.len() % 2 == 1 {
        out.push(flag | 0x10 | path[0]);
        &path[1..]
    } else {
        out.push(flag);
        path
    };
    out.extend(rest.chunks(2).map(|pair| (pair[0] << 4) | pair[1]));
    out
}

/// Builds the node covering `leaves`, which are sorted, distinct and share
/// their first `depth` nibbles.
fn build(leaves: &[(Vec<u8>, &[u8])], depth: usize) -> RlpItem {
    if let [(path, value)] = leaves {
        return RlpItem::List(vec![
            RlpItem::Bytes(compact(&path[depth..], true)),
            RlpItem::Bytes(value.to_vec()),
        ]);
    }

    let shared = shared_prefix(leaves, depth);
    if shared > 0 {
        let path = &leaves[0].0[depth..depth + shared];
        return RlpItem::List(vec![
            RlpItem::Bytes(compact(path, false)),
            reference(build(leaves, depth + shared)),
        ]);
    }

    let mut slots = Vec::with_capacity(17);
    let mut value = Vec::new();
    let mut rest = leaves;
    if let Some((path, v)) = rest.first() {
        if path.len() == depth {
            value = v.to_vec();
            rest = &rest[1..];
        }
    }
    for nibble in 0..16u8 {
        let end = rest.iter().take_while(|(path, _)| path[depth] == nibble).count();
        let (group, tail) = rest.split_at(end);
        slots.push(if group.is_empty() {
            RlpItem::Bytes(Vec::new())
        } else {
            reference(build(group, depth + 1))
        });
        rest = tail;
    }
    slots.push(RlpItem::Bytes(value));
    RlpItem::List(slots)
}

fn shared_prefix(leaves: &[(Vec<u8>, &[u8])], depth: usize) -> usize {
    let first = &leaves[0].0;
    let mut len = 0;
    while depth + len < first.len()
        && leaves
            .iter()
            .all(|(path, _)| path.len() > depth + len && path[depth + len] == first[depth + len])
    {
        len += 1;
    }
    len
}

/// Children shorter than a hash are embedded, the rest are referenced by
/// their keccak.
fn reference(node: RlpItem) -> RlpItem {
    let encoded = node.encode();
    if encoded.len() < 32 {
        node
    } else {
        RlpItem::Bytes(keccak(&encoded).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    #[test]
    fn empty_trie_is_the_empty_root() {
        assert_eq!(ordered_trie_root(&[]), EMPTY_ROOT_HASH);
    }

    #[test]
    fn single_item_is_one_hashed_leaf() {
        // leaf [compact(8,0), 0xc0] = c5 82 20 80 81 c0
        let expected = keccak(&[0xc5, 0x82, 0x20, 0x80, 0x81, 0xc0]);
        assert_eq!(ordered_trie_root(&[vec![0xc0]]), expected);
    }

    #[test]
    fn known_key_value_roots() {
        let root = trie_root([
            (b"doe".to_vec(), &b"reindeer"[..]),
            (b"dog".to_vec(), &b"puppy"[..]),
            (b"dogglesworth".to_vec(), &b"cat"[..]),
        ]);
        assert_eq!(
            root,
            b256!("8aad789dff2f538bca5d8ea56e8abe10f4c7ba3a5dea95fea4cd6e7c3a1168d3")
        );

        let root = trie_root([
            (b"do".to_vec(), &b"verb"[..]),
            (b"dog".to_vec(), &b"puppy"[..]),
            (b"doge".to_vec(), &b"coin"[..]),
            (b"horse".to_vec(), &b"stallion"[..]),
        ]);
        assert_eq!(
            root,
            b256!("5991bb8c6514148a29db676a14ac506cd2cd5775ace63c30a4fe457715e9ac84")
        );
    }

    #[test]
    fn ordered_roots_depend_on_position() {
        let ab = ordered_trie_root(&[vec![0xaa], vec![0xbb]]);
        let ba = ordered_trie_root(&[vec![0xbb], vec![0xaa]]);
        assert_eq!(
            ab,
            b256!("2afe451d91f747747158b10af31b1c1add78ef36d4e5c74f3ae3fb93d1befe5a")
        );
        assert_ne!(ab, ba);
    }

    #[test]
    fn long_lists_cross_the_single_byte_keys() {
        let items: Vec<Vec<u8>> = (0..200u64)
            .map(|i| {
                let mut item = vec![0xf8, 0x40];
                item.extend_from_slice(&i.to_be_bytes());
                item
            })
            .collect();
        assert_eq!(
            ordered_trie_root(&items),
            b256!("9e0b613563df57dcdc4d2b1abb74746d462cac7bee5380b3d2b1b081f0c2b15f")
        );
    }

    #[test]
    fn compact_paths() {
        assert_eq!(compact(&[1, 2, 3, 4], false), vec![0x00, 0x12, 0x34]);
        assert_eq!(compact(&[1, 2, 3], false), vec![0x11, 0x23]);
        assert_eq!(compact(&[0, 1], true), vec![0x20, 0x01]);
        assert_eq!(compact(&[1], true), vec![0x31]);
    }
}
