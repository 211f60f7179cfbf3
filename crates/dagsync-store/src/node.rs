//! Reference Merkle-node encoding and its address walker.
//!
//! Layout: `[ref_count: u32 LE]` then `ref_count` entries of
//! `[address: 32 bytes][leaf_flag: u8]`, followed by the node payload. The
//! leaf flag marks targets known to have no outbound edges; consumers treat
//! it as a hint.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::address::{Address, ADDRESS_LEN};
use crate::chunk::Chunk;
use crate::error::{StoreError, StoreResult};

/// Encodes a Merkle node with the given outbound references and payload.
pub fn encode_node(refs: &[(Address, bool)], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + refs.len() * (ADDRESS_LEN + 1) + payload.len());
    buf.extend_from_slice(&(refs.len() as u32).to_le_bytes());
    for (addr, leaf) in refs {
        buf.extend_from_slice(addr.as_bytes());
        buf.push(u8::from(*leaf));
    }
    buf.extend_from_slice(payload);
    buf
}

/// Decodes a Merkle node into its references and payload slice.
pub fn decode_node(data: &[u8]) -> StoreResult<(Vec<(Address, bool)>, &[u8])> {
    let mut cur = Cursor::new(data);
    let count = cur
        .read_u32::<LittleEndian>()
        .map_err(|_| corrupt("node truncated before ref count"))? as usize;

    let refs_end = 4usize
        .checked_add(count.checked_mul(ADDRESS_LEN + 1).ok_or_else(|| corrupt("ref count overflow"))?)
        .ok_or_else(|| corrupt("ref count overflow"))?;
    if data.len() < refs_end {
        return Err(corrupt("node truncated inside ref table"));
    }

    let mut refs = Vec::with_capacity(count);
    let mut off = 4;
    for _ in 0..count {
        let mut raw = [0u8; ADDRESS_LEN];
        raw.copy_from_slice(&data[off..off + ADDRESS_LEN]);
        off += ADDRESS_LEN;
        let leaf = match data[off] {
            0 => false,
            1 => true,
            other => return Err(corrupt(&format!("invalid leaf flag {other}"))),
        };
        off += 1;
        refs.push((Address::from_bytes(raw), leaf));
    }

    Ok((refs, &data[refs_end..]))
}

/// Walks a chunk's outbound references, invoking `emit` exactly once per
/// reference with the address and its leaf flag.
pub fn walk_node_refs(
    chunk: &Chunk,
    emit: &mut dyn FnMut(Address, bool) -> StoreResult<()>,
) -> StoreResult<()> {
    let (refs, _) = decode_node(chunk.data())?;
    for (addr, leaf) in refs {
        emit(addr, leaf)?;
    }
    Ok(())
}

fn corrupt(msg: &str) -> StoreError {
    StoreError::Corrupt { msg: msg.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressSet;

    #[test]
    fn encode_decode_roundtrip() {
        let refs = vec![
            (Address::of(b"a"), true),
            (Address::of(b"b"), false),
            (Address::of(b"c"), true),
        ];
        let encoded = encode_node(&refs, b"payload bytes");
        let (decoded, payload) = decode_node(&encoded).unwrap();
        assert_eq!(decoded, refs);
        assert_eq!(payload, b"payload bytes");
    }

    #[test]
    fn walk_emits_original_address_set() {
        let refs = vec![(Address::of(b"x"), false), (Address::of(b"y"), true)];
        let chunk = Chunk::new(encode_node(&refs, b"n"));

        let mut seen = AddressSet::new();
        walk_node_refs(&chunk, &mut |addr, _leaf| {
            seen.insert(addr);
            Ok(())
        })
        .unwrap();

        let expected: AddressSet = refs.iter().map(|(a, _)| *a).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn leafless_node_walks_nothing() {
        let chunk = Chunk::new(encode_node(&[], b"leaf payload"));
        let mut count = 0;
        walk_node_refs(&chunk, &mut |_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn truncated_node_is_corrupt() {
        let refs = vec![(Address::of(b"a"), false)];
        let mut encoded = encode_node(&refs, b"");
        encoded.truncate(10);
        let chunk = Chunk::new(encoded);
        let err = walk_node_refs(&chunk, &mut |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn invalid_leaf_flag_is_corrupt() {
        let mut encoded = encode_node(&[(Address::of(b"a"), false)], b"");
        encoded[4 + ADDRESS_LEN] = 9;
        assert!(matches!(
            decode_node(&encoded),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn walker_error_propagates() {
        let chunk = Chunk::new(encode_node(&[(Address::of(b"a"), false)], b""));
        let err = walk_node_refs(&chunk, &mut |_, _| {
            Err(StoreError::Backend { msg: "stop".into() })
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::Backend { .. }));
    }
}
