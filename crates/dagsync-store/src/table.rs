//! Table files: packed containers of compressed chunks.
//!
//! A table file is the unit of upload and manifest registration. The writer
//! appends chunk records to a temp file, then `finish` seals it with an
//! index and footer and yields its id (the blake3 content hash of the whole
//! file), chunk count, final length, and a content MD5 for the upload
//! contract. The backing temp file is deleted on drop, so abandoned writers
//! clean up after themselves.
//!
//! Layout:
//!
//! ```text
//! records:  chunk_count x [address 32B][payload_len u32 LE][payload]
//! index:    chunk_count x [address 32B][record_offset u64 LE][payload_len u32 LE]
//! footer:   [index_len u64 LE][chunk_count u32 LE][version u8][magic u32 LE]
//! ```

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use md5::{Digest, Md5};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::address::{Address, ADDRESS_LEN};
use crate::chunk::CompressedChunk;
use crate::error::{StoreError, StoreResult};

/// Magic value closing every table file.
pub const TABLE_FILE_MAGIC: u32 = 0x4C42_5444;

/// Current table-file format version.
pub const TABLE_FILE_VERSION: u8 = 1;

const FOOTER_LEN: usize = 8 + 4 + 1 + 4;
const RECORD_HEADER_LEN: usize = ADDRESS_LEN + 4;
const INDEX_ENTRY_LEN: usize = ADDRESS_LEN + 8 + 4;

/// Identity and totals of a finished table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFileMeta {
    /// Content hash of the whole file, in hex. Deterministic over the
    /// ordered chunk sequence written.
    pub id: String,
    /// Number of chunk records in the file.
    pub chunk_count: u32,
    /// Final file length, index and footer included.
    pub content_length: u64,
    /// MD5 of the full file contents.
    pub content_md5: [u8; 16],
}

struct IndexEntry {
    address: Address,
    offset: u64,
    len: u32,
}

/// Append-only writer packing compressed chunks into a temp file.
///
/// States run Open → Finished → Consumed: appending after [`finish`]
/// fails with [`StoreError::WriterFinalized`], and [`remove`] (idempotent)
/// deletes the backing file.
///
/// [`finish`]: TableFileWriter::finish
/// [`remove`]: TableFileWriter::remove
pub struct TableFileWriter {
    file: Option<NamedTempFile>,
    index: Vec<IndexEntry>,
    content_length: u64,
    id_hasher: blake3::Hasher,
    md5: Md5,
    meta: Option<TableFileMeta>,
}

impl TableFileWriter {
    /// Opens a new writer backed by a temp file in `dir`.
    pub fn new_in(dir: &Path) -> StoreResult<Self> {
        let file = NamedTempFile::new_in(dir)?;
        Ok(TableFileWriter {
            file: Some(file),
            index: Vec::new(),
            content_length: 0,
            id_hasher: blake3::Hasher::new(),
            md5: Md5::new(),
            meta: None,
        })
    }

    /// Appends one compressed chunk. The writer does not deduplicate;
    /// appending the same chunk twice writes two records.
    pub fn add_compressed_chunk(&mut self, chunk: &CompressedChunk) -> StoreResult<()> {
        if self.meta.is_some() {
            return Err(StoreError::WriterFinalized);
        }
        let offset = self.content_length;
        let len = chunk.payload().len() as u32;

        let mut header = [0u8; RECORD_HEADER_LEN];
        header[..ADDRESS_LEN].copy_from_slice(chunk.address().as_bytes());
        header[ADDRESS_LEN..].copy_from_slice(&len.to_le_bytes());

        self.write_bytes(&header)?;
        self.write_bytes(chunk.payload())?;
        self.index.push(IndexEntry {
            address: *chunk.address(),
            offset,
            len,
        });
        Ok(())
    }

    /// Number of chunks written so far. Monotonically non-decreasing.
    pub fn chunk_count(&self) -> u32 {
        self.index.len() as u32
    }

    /// Bytes written so far. Before `finish` this covers chunk records
    /// only; `finish` appends the index and footer on top.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Seals the file: appends index and footer, computes the id and MD5.
    ///
    /// Fails with [`StoreError::WriterFinalized`] if called twice.
    pub fn finish(&mut self) -> StoreResult<TableFileMeta> {
        if self.meta.is_some() {
            return Err(StoreError::WriterFinalized);
        }

        let mut tail = Vec::with_capacity(self.index.len() * INDEX_ENTRY_LEN + FOOTER_LEN);
        for entry in &self.index {
            tail.extend_from_slice(entry.address.as_bytes());
            tail.extend_from_slice(&entry.offset.to_le_bytes());
            tail.extend_from_slice(&entry.len.to_le_bytes());
        }
        let index_len = (self.index.len() * INDEX_ENTRY_LEN) as u64;
        tail.extend_from_slice(&index_len.to_le_bytes());
        tail.extend_from_slice(&self.chunk_count().to_le_bytes());
        tail.push(TABLE_FILE_VERSION);
        tail.extend_from_slice(&TABLE_FILE_MAGIC.to_le_bytes());

        self.write_bytes(&tail)?;
        match self.file.as_mut() {
            Some(f) => f.as_file_mut().flush()?,
            None => return Err(StoreError::WriterRemoved),
        }

        let meta = TableFileMeta {
            id: self.id_hasher.finalize().to_hex().to_string(),
            chunk_count: self.chunk_count(),
            content_length: self.content_length,
            content_md5: self.md5.clone().finalize().into(),
        };
        debug!(id = %meta.id, chunks = meta.chunk_count, bytes = meta.content_length, "table file finished");
        self.meta = Some(meta.clone());
        Ok(meta)
    }

    /// Identity and totals, available once the writer is finished.
    pub fn meta(&self) -> Option<&TableFileMeta> {
        self.meta.as_ref()
    }

    /// Opens a fresh, independently-positioned read handle over the full
    /// file. Callable more than once to support upload retries.
    pub fn reader(&self) -> StoreResult<File> {
        if self.meta.is_none() {
            return Err(StoreError::WriterNotFinished);
        }
        match &self.file {
            Some(f) => Ok(f.reopen()?),
            None => Err(StoreError::WriterRemoved),
        }
    }

    /// Deletes the backing temp file. Idempotent.
    pub fn remove(&mut self) -> StoreResult<()> {
        if let Some(file) = self.file.take() {
            file.close()?;
        }
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> StoreResult<()> {
        let file = self.file.as_mut().ok_or(StoreError::WriterRemoved)?;
        file.as_file_mut().write_all(bytes)?;
        self.id_hasher.update(bytes);
        self.md5.update(bytes);
        self.content_length += bytes.len() as u64;
        Ok(())
    }
}

/// Parses a finished table file back into its compressed chunks, in record
/// order. Validates magic, version, and index consistency.
pub fn read_table_file(bytes: &[u8]) -> StoreResult<Vec<CompressedChunk>> {
    if bytes.len() < FOOTER_LEN {
        return Err(corrupt("table file shorter than footer"));
    }
    let footer = &bytes[bytes.len() - FOOTER_LEN..];
    let mut cur = Cursor::new(footer);
    let index_len = cur.read_u64::<LittleEndian>().map_err(io_corrupt)? as usize;
    let chunk_count = cur.read_u32::<LittleEndian>().map_err(io_corrupt)? as usize;
    let version = cur.read_u8().map_err(io_corrupt)?;
    let magic = cur.read_u32::<LittleEndian>().map_err(io_corrupt)?;

    if magic != TABLE_FILE_MAGIC {
        return Err(corrupt("bad table-file magic"));
    }
    if version != TABLE_FILE_VERSION {
        return Err(corrupt(&format!("unsupported table-file version {version}")));
    }
    if index_len != chunk_count * INDEX_ENTRY_LEN {
        return Err(corrupt("index length does not match chunk count"));
    }
    let records_end = bytes
        .len()
        .checked_sub(FOOTER_LEN + index_len)
        .ok_or_else(|| corrupt("index longer than file"))?;

    let mut chunks = Vec::with_capacity(chunk_count);
    let index = &bytes[records_end..bytes.len() - FOOTER_LEN];
    let mut cur = Cursor::new(index);
    for _ in 0..chunk_count {
        let mut raw = [0u8; ADDRESS_LEN];
        std::io::Read::read_exact(&mut cur, &mut raw).map_err(io_corrupt)?;
        let offset = cur.read_u64::<LittleEndian>().map_err(io_corrupt)? as usize;
        let len = cur.read_u32::<LittleEndian>().map_err(io_corrupt)? as usize;

        let payload_start = offset
            .checked_add(RECORD_HEADER_LEN)
            .ok_or_else(|| corrupt("record offset overflow"))?;
        let payload_end = payload_start
            .checked_add(len)
            .ok_or_else(|| corrupt("record offset overflow"))?;
        if payload_end > records_end {
            return Err(corrupt("chunk record extends past index"));
        }
        if bytes[offset..offset + ADDRESS_LEN] != raw {
            return Err(corrupt("record address disagrees with index"));
        }
        chunks.push(CompressedChunk::from_parts(
            Address::from_bytes(raw),
            bytes[payload_start..payload_end].to_vec(),
        ));
    }
    Ok(chunks)
}

fn corrupt(msg: &str) -> StoreError {
    StoreError::Corrupt { msg: msg.to_string() }
}

fn io_corrupt(_: std::io::Error) -> StoreError {
    corrupt("table file truncated")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use std::io::Read;

    fn cmp(n: u8) -> CompressedChunk {
        CompressedChunk::compress(&Chunk::new(vec![n; 128]))
    }

    fn read_all(mut f: File) -> Vec<u8> {
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn counts_and_length_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut wr = TableFileWriter::new_in(dir.path()).unwrap();
        assert_eq!(wr.chunk_count(), 0);
        assert_eq!(wr.content_length(), 0);

        let mut last_len = 0;
        for n in 0..5 {
            wr.add_compressed_chunk(&cmp(n)).unwrap();
            assert_eq!(wr.chunk_count(), u32::from(n) + 1);
            assert!(wr.content_length() > last_len);
            last_len = wr.content_length();
        }
    }

    #[test]
    fn finish_appends_index_and_footer() {
        let dir = tempfile::tempdir().unwrap();
        let mut wr = TableFileWriter::new_in(dir.path()).unwrap();
        wr.add_compressed_chunk(&cmp(1)).unwrap();
        let before = wr.content_length();
        let meta = wr.finish().unwrap();
        assert!(meta.content_length > before);
        assert_eq!(meta.content_length, wr.content_length());
        assert_eq!(meta.chunk_count, 1);
    }

    #[test]
    fn id_is_deterministic_over_chunk_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = [cmp(1), cmp(2), cmp(3)];

        let mut a = TableFileWriter::new_in(dir.path()).unwrap();
        let mut b = TableFileWriter::new_in(dir.path()).unwrap();
        for c in &chunks {
            a.add_compressed_chunk(c).unwrap();
            b.add_compressed_chunk(c).unwrap();
        }
        let meta_a = a.finish().unwrap();
        let meta_b = b.finish().unwrap();
        assert_eq!(meta_a.id, meta_b.id);
        assert_eq!(meta_a.content_md5, meta_b.content_md5);

        let mut c = TableFileWriter::new_in(dir.path()).unwrap();
        for ch in chunks.iter().rev() {
            c.add_compressed_chunk(ch).unwrap();
        }
        assert_ne!(c.finish().unwrap().id, meta_a.id);
    }

    #[test]
    fn duplicate_chunks_are_not_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let mut wr = TableFileWriter::new_in(dir.path()).unwrap();
        wr.add_compressed_chunk(&cmp(9)).unwrap();
        wr.add_compressed_chunk(&cmp(9)).unwrap();
        assert_eq!(wr.chunk_count(), 2);
    }

    #[test]
    fn add_after_finish_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut wr = TableFileWriter::new_in(dir.path()).unwrap();
        wr.add_compressed_chunk(&cmp(1)).unwrap();
        wr.finish().unwrap();
        assert!(matches!(
            wr.add_compressed_chunk(&cmp(2)),
            Err(StoreError::WriterFinalized)
        ));
        assert!(matches!(wr.finish(), Err(StoreError::WriterFinalized)));
    }

    #[test]
    fn reader_before_finish_fails() {
        let dir = tempfile::tempdir().unwrap();
        let wr = TableFileWriter::new_in(dir.path()).unwrap();
        assert!(matches!(wr.reader(), Err(StoreError::WriterNotFinished)));
    }

    #[test]
    fn readers_are_independent_and_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let mut wr = TableFileWriter::new_in(dir.path()).unwrap();
        wr.add_compressed_chunk(&cmp(1)).unwrap();
        let meta = wr.finish().unwrap();

        let first = read_all(wr.reader().unwrap());
        let second = read_all(wr.reader().unwrap());
        assert_eq!(first, second);
        assert_eq!(first.len() as u64, meta.content_length);

        let digest: [u8; 16] = Md5::digest(&first).into();
        assert_eq!(digest, meta.content_md5);
    }

    #[test]
    fn remove_is_idempotent_and_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut wr = TableFileWriter::new_in(dir.path()).unwrap();
        wr.add_compressed_chunk(&cmp(1)).unwrap();
        wr.finish().unwrap();
        wr.remove().unwrap();
        wr.remove().unwrap();
        assert!(matches!(wr.reader(), Err(StoreError::WriterRemoved)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn drop_deletes_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wr = TableFileWriter::new_in(dir.path()).unwrap();
            wr.add_compressed_chunk(&cmp(1)).unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn read_table_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut wr = TableFileWriter::new_in(dir.path()).unwrap();
        let chunks = [cmp(1), cmp(2), cmp(1)];
        for c in &chunks {
            wr.add_compressed_chunk(c).unwrap();
        }
        wr.finish().unwrap();

        let parsed = read_table_file(&read_all(wr.reader().unwrap())).unwrap();
        assert_eq!(parsed, chunks.to_vec());
    }

    #[test]
    fn read_rejects_bad_magic_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let mut wr = TableFileWriter::new_in(dir.path()).unwrap();
        wr.add_compressed_chunk(&cmp(1)).unwrap();
        wr.finish().unwrap();
        let mut bytes = read_all(wr.reader().unwrap());

        let n = bytes.len();
        bytes[n - 1] ^= 0xff;
        assert!(matches!(
            read_table_file(&bytes),
            Err(StoreError::Corrupt { .. })
        ));

        assert!(matches!(
            read_table_file(&[0u8; 4]),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
