//! Splitting of a payload into chunks that each fit in one backend item, and reassembly.
//!
//! Every stored chunk is a record of `[total:u32][index:u32][crc:u32][bytes]`, big endian, so a
//! chunk read on its own can be checked for integrity and placed in its set.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};
use std::io::Cursor;
use std::mem::size_of;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("incomplete chunk set: expected {expected} chunks, found {found}")]
    IncompleteChunkSet { expected: u32, found: usize },

    #[error("chunk {index} checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChunkChecksumMismatch {
        index: u32,
        expected: u32,
        actual: u32,
    },

    #[error(
        "reassembled payload does not match its meta: expected {expected_len} bytes with \
         checksum {expected_checksum:#010x}, got {actual_len} bytes with checksum \
         {actual_checksum:#010x}"
    )]
    PayloadMismatch {
        expected_len: u64,
        expected_checksum: u32,
        actual_len: u64,
        actual_checksum: u32,
    },

    #[error("chunk record of {0} bytes is shorter than its header")]
    TruncatedRecord(usize),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Length of the framing in front of every chunk's bytes
pub const RECORD_HEADER_LEN: usize = 3 * size_of::<u32>();

/// One piece of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedPayload {
    pub total_chunks: u32,
    pub chunk_index: u32,
    pub checksum: u32,
    pub bytes: Bytes,
}

impl ChunkedPayload {
    fn new(total_chunks: u32, chunk_index: u32, bytes: Bytes) -> Self {
        Self {
            total_chunks,
            chunk_index,
            checksum: crc32fast::hash(&bytes),
            bytes,
        }
    }

    pub fn is_valid(&self) -> bool {
        crc32fast::hash(&self.bytes) == self.checksum
    }
}

/// The largest number of payload bytes per chunk for a backend whose items may be at most
/// `ceiling` bytes, reserving `overhead` bytes for the key and the record header.
pub fn chunk_size_for(ceiling: usize, overhead: usize) -> usize {
    ceiling
        .saturating_sub(overhead)
        .saturating_sub(RECORD_HEADER_LEN)
        .max(1)
}

/// Split `payload` into chunks of at most `max_chunk_bytes`. An empty payload yields a single
/// empty chunk.
pub fn split(payload: &Bytes, max_chunk_bytes: usize) -> Vec<ChunkedPayload> {
    let max_chunk_bytes = max_chunk_bytes.max(1);
    if payload.is_empty() {
        return vec![ChunkedPayload::new(1, 0, Bytes::new())];
    }

    let total = payload.len().div_ceil(max_chunk_bytes);
    (0..total)
        .map(|index| {
            let start = index * max_chunk_bytes;
            let end = (start + max_chunk_bytes).min(payload.len());
            ChunkedPayload::new(total as u32, index as u32, payload.slice(start..end))
        })
        .collect()
}

/// Reassemble a payload from its chunks, in any order.
pub fn join(chunks: &[ChunkedPayload]) -> Result<Bytes> {
    let Some(first) = chunks.first() else {
        return Err(Error::IncompleteChunkSet {
            expected: 1,
            found: 0,
        });
    };
    let expected = first.total_chunks;
    let belongs = |chunk: &ChunkedPayload| {
        chunk.total_chunks == expected && chunk.chunk_index < expected
    };

    // headers are not covered by the chunk checksums, so the count is only trusted once every
    // chunk agrees with it
    if expected as usize != chunks.len() || !chunks.iter().all(belongs) {
        return Err(Error::IncompleteChunkSet {
            expected,
            found: chunks.iter().filter(|c| belongs(c)).count(),
        });
    }

    let mut slots: Vec<Option<&ChunkedPayload>> = vec![None; chunks.len()];
    for chunk in chunks {
        slots[chunk.chunk_index as usize] = Some(chunk);
    }
    let found = slots.iter().filter(|s| s.is_some()).count();
    if found != expected as usize {
        return Err(Error::IncompleteChunkSet { expected, found });
    }

    let mut payload = BytesMut::with_capacity(chunks.iter().map(|c| c.bytes.len()).sum());
    for chunk in slots.into_iter().flatten() {
        let actual = crc32fast::hash(&chunk.bytes);
        if actual != chunk.checksum {
            return Err(Error::ChunkChecksumMismatch {
                index: chunk.chunk_index,
                expected: chunk.checksum,
                actual,
            });
        }
        payload.extend_from_slice(&chunk.bytes);
    }
    Ok(payload.freeze())
}

/// The stored form of a chunk.
pub fn encode_record(chunk: &ChunkedPayload) -> Bytes {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + chunk.bytes.len());
    // writes into a Vec cannot fail
    let _ = buf.write_u32::<BigEndian>(chunk.total_chunks);
    let _ = buf.write_u32::<BigEndian>(chunk.chunk_index);
    let _ = buf.write_u32::<BigEndian>(chunk.checksum);
    buf.extend_from_slice(&chunk.bytes);
    Bytes::from(buf)
}

/// Parse a stored chunk record. The checksum is verified by [`join`], not here.
pub fn decode_record(record: Bytes) -> Result<ChunkedPayload> {
    if record.len() < RECORD_HEADER_LEN {
        return Err(Error::TruncatedRecord(record.len()));
    }
    let (total_chunks, chunk_index, checksum) = read_header(&record[..RECORD_HEADER_LEN])
        .map_err(|_| Error::TruncatedRecord(record.len()))?;

    Ok(ChunkedPayload {
        total_chunks,
        chunk_index,
        checksum,
        bytes: record.slice(RECORD_HEADER_LEN..),
    })
}

fn read_header(header: &[u8]) -> std::io::Result<(u32, u32, u32)> {
    let mut cursor = Cursor::new(header);
    Ok((
        cursor.read_u32::<BigEndian>()?,
        cursor.read_u32::<BigEndian>()?,
        cursor.read_u32::<BigEndian>()?,
    ))
}
