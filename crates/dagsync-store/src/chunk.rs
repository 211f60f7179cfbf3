//! Chunks and the compressed-chunk codec.
//!
//! A chunk is raw bytes plus the address that is their digest. The wire and
//! on-disk form is an lz4 frame with the uncompressed size prepended; the
//! compressed byte length is the unit of fetch accounting.

use crate::address::Address;
use crate::error::{StoreError, StoreResult};

/// A raw chunk: bytes plus their content address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    address: Address,
    data: Vec<u8>,
}

impl Chunk {
    /// Creates a chunk, computing its address from the data.
    pub fn new(data: Vec<u8>) -> Self {
        let address = Address::of(&data);
        Chunk { address, data }
    }

    /// Assembles a chunk from an already-known address and its bytes.
    ///
    /// The address is trusted; callers verify identity where required.
    pub fn from_parts(address: Address, data: Vec<u8>) -> Self {
        Chunk { address, data }
    }

    /// The chunk's content address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The raw bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Raw byte length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the chunk holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A chunk in compressed wire/disk form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedChunk {
    address: Address,
    payload: Vec<u8>,
}

impl CompressedChunk {
    /// Compresses a raw chunk.
    pub fn compress(chunk: &Chunk) -> Self {
        CompressedChunk {
            address: *chunk.address(),
            payload: lz4_flex::compress_prepend_size(chunk.data()),
        }
    }

    /// Assembles a compressed chunk from its address and opaque payload.
    pub fn from_parts(address: Address, payload: Vec<u8>) -> Self {
        CompressedChunk { address, payload }
    }

    /// The address the payload is expected to decompress to.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The opaque compressed payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Compressed byte length, the unit of fetch accounting.
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Decompresses into a raw chunk.
    ///
    /// Fails with [`StoreError::Corrupt`] if the payload framing is damaged.
    pub fn decompress(&self) -> StoreResult<Chunk> {
        let data = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| StoreError::Corrupt { msg: e.to_string() })?;
        Ok(Chunk::from_parts(self.address, data))
    }
}
