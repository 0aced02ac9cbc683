//! Key layout of a vault inside a namespace and the records stored under those keys.
//!
//! ```text
//! vault_meta          VaultMeta as JSON, written last to commit a flush
//! vault_chunk_<i>     chunk records of the encoded snapshot payload
//! vault_diff          VaultDiffLog as JSON, relative to the payload named by the meta
//! vault               legacy single-key vault, read once by the migration
//! ```

use crate::chunk::{self, ChunkedPayload};
use crate::{Error, Result, serialize};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tabvault_backend::item_cost;
use tabvault_time::Time;
use tabvault_types::{CompressionTier, Fragment, VaultDiffLog, VaultSnapshot};

pub const META_KEY: &str = "vault_meta";
pub const DIFF_KEY: &str = "vault_diff";
pub const LEGACY_KEY: &str = "vault";
const CHUNK_KEY_PREFIX: &str = "vault_chunk_";

pub fn chunk_key(index: u32) -> String {
    format!("{CHUNK_KEY_PREFIX}{index}")
}

/// The commit record of a stored vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultMeta {
    pub version: u32,
    pub total_chunks: u32,
    pub payload_checksum: u32,
    pub payload_len: u64,
    pub compression_tier: CompressionTier,
    pub stored_at: Time,
}

impl VaultMeta {
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|source| Error::Encode {
                what: META_KEY,
                source,
            })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|source| Error::CorruptRecord {
            key: META_KEY.to_string(),
            source,
        })
    }

    /// Bytes charged for the chunks this meta names, without the diff and the meta itself
    pub fn estimated_chunk_bytes(&self) -> u64 {
        let per_chunk = (chunk_key(self.total_chunks).len() + chunk::RECORD_HEADER_LEN) as u64;
        self.payload_len + u64::from(self.total_chunks) * per_chunk
    }
}

/// Encode `log` with its fragments reduced to what `tier` keeps.
pub fn encode_diff(log: &VaultDiffLog, tier: CompressionTier) -> Result<Bytes> {
    let mut log = log.clone();
    for entry in &mut log.entries {
        match &mut entry.payload {
            Some(Fragment::Group(group)) => serialize::reduce_group(group, tier),
            Some(Fragment::Tab(tab)) => serialize::reduce_tab(tab, tier),
            None => {}
        }
    }
    serde_json::to_vec(&log)
        .map(Bytes::from)
        .map_err(|source| Error::Encode {
            what: DIFF_KEY,
            source,
        })
}

pub fn decode_diff(bytes: &[u8]) -> Result<VaultDiffLog> {
    serde_json::from_slice(bytes).map_err(|source| Error::CorruptRecord {
        key: DIFF_KEY.to_string(),
        source,
    })
}

/// A payload prepared for writing: its chunk records and the meta that commits them.
#[derive(Debug, Clone)]
pub struct PreparedPayload {
    pub meta: VaultMeta,
    /// `(key, checksum of the record, record)` per chunk, in index order
    pub records: Vec<(String, u32, Bytes)>,
}

impl PreparedPayload {
    pub fn new(
        snapshot: &VaultSnapshot,
        tier: CompressionTier,
        max_chunk_bytes: usize,
        stored_at: Time,
    ) -> Result<Self> {
        let payload = serialize::encode(snapshot, tier)?;
        let chunks = chunk::split(&payload, max_chunk_bytes);
        let meta = VaultMeta {
            version: snapshot.version,
            total_chunks: chunks.len() as u32,
            payload_checksum: serialize::checksum(&payload),
            payload_len: payload.len() as u64,
            compression_tier: tier,
            stored_at,
        };
        let records = chunks
            .iter()
            .map(|c| {
                let record = chunk::encode_record(c);
                (chunk_key(c.chunk_index), crc32fast::hash(&record), record)
            })
            .collect();
        Ok(Self { meta, records })
    }

    pub fn payload_len(&self) -> u64 {
        self.meta.payload_len
    }

    /// Bytes charged for all chunk records
    pub fn chunk_bytes(&self) -> u64 {
        self.records
            .iter()
            .map(|(key, _, record)| item_cost(key, record))
            .sum()
    }
}

/// A vault read back from a namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVault {
    pub snapshot: VaultSnapshot,
    pub tier: CompressionTier,
    /// Checksums of the chunk records as stored, by index
    pub record_checksums: Vec<u32>,
    /// Bytes charged for the chunk records
    pub chunk_bytes: u64,
}

/// Reassemble and decode the payload named by `meta` from its chunk records, which must be given
/// in index order with `None` for missing keys.
pub fn assemble(meta: &VaultMeta, records: Vec<Option<Bytes>>) -> Result<StoredVault> {
    let mut chunks: Vec<ChunkedPayload> = Vec::with_capacity(records.len());
    let mut record_checksums = Vec::with_capacity(records.len());
    let mut chunk_bytes = 0;
    for (index, record) in records.into_iter().enumerate() {
        let Some(record) = record else {
            continue;
        };
        record_checksums.push(crc32fast::hash(&record));
        chunk_bytes += item_cost(&chunk_key(index as u32), &record);
        chunks.push(chunk::decode_record(record)?);
    }
    if chunks.len() != meta.total_chunks as usize {
        return Err(chunk::Error::IncompleteChunkSet {
            expected: meta.total_chunks,
            found: chunks.len(),
        }
        .into());
    }

    let payload = chunk::join(&chunks)?;
    let actual_checksum = serialize::checksum(&payload);
    if payload.len() as u64 != meta.payload_len || actual_checksum != meta.payload_checksum {
        return Err(chunk::Error::PayloadMismatch {
            expected_len: meta.payload_len,
            expected_checksum: meta.payload_checksum,
            actual_len: payload.len() as u64,
            actual_checksum,
        }
        .into());
    }

    let (snapshot, tier) = serialize::decode(&payload)?;
    Ok(StoredVault {
        snapshot,
        tier,
        record_checksums,
        chunk_bytes,
    })
}

/// What the engine knows is physically stored in one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredLayout {
    /// Checksum of the record under each chunk key, `None` where unknown
    pub records: Vec<Option<u32>>,
    pub has_diff: bool,
    /// Bytes charged for everything the vault keeps in the namespace
    pub vault_bytes: u64,
    /// Chunk records were rewritten after the stored meta was, so the meta may name a mixed set
    pub torn: bool,
}

impl StoredLayout {
    /// Layout of a namespace whose meta was read but whose chunks were not
    pub fn from_meta(meta: &VaultMeta, meta_bytes: u64) -> Self {
        Self {
            records: vec![None; meta.total_chunks as usize],
            has_diff: true,
            vault_bytes: meta.estimated_chunk_bytes() + meta_bytes,
            torn: false,
        }
    }

    /// True if the record stored at `index` is known to have `checksum`
    pub fn is_stored(&self, index: usize, checksum: u32) -> bool {
        self.records.get(index).copied().flatten() == Some(checksum)
    }

    pub fn record_written(&mut self, index: usize, checksum: u32) {
        if self.records.len() <= index {
            self.records.resize(index + 1, None);
        }
        self.records[index] = Some(checksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::tests::sample_snapshot;
    use pretty_assertions::assert_eq;
    use tabvault_types::{DiffSequenceNumber, VaultDiffEntry, VaultOp};

    fn prepare(max_chunk_bytes: usize) -> PreparedPayload {
        PreparedPayload::new(
            &sample_snapshot(),
            CompressionTier::Full,
            max_chunk_bytes,
            Time::from_timestamp_millis(42),
        )
        .unwrap()
    }

    #[test]
    fn chunk_keys() {
        assert_eq!(chunk_key(0), "vault_chunk_0");
        assert_eq!(chunk_key(12), "vault_chunk_12");
    }

    #[test]
    fn prepared_payload_assembles() {
        let prepared = prepare(64);
        assert!(prepared.records.len() > 1);
        assert_eq!(prepared.meta.total_chunks as usize, prepared.records.len());
        assert_eq!(prepared.meta.stored_at, Time::from_timestamp_millis(42));

        let records = prepared
            .records
            .iter()
            .map(|(_, _, record)| Some(record.clone()))
            .collect();
        let stored = assemble(&prepared.meta, records).unwrap();
        assert_eq!(stored.snapshot, sample_snapshot());
        assert_eq!(stored.tier, CompressionTier::Full);
        assert_eq!(stored.chunk_bytes, prepared.chunk_bytes());
        let checksums: Vec<_> = prepared.records.iter().map(|(_, crc, _)| *crc).collect();
        assert_eq!(stored.record_checksums, checksums);
    }

    #[test]
    fn assemble_detects_missing_and_swapped_chunks() {
        let prepared = prepare(64);
        let mut records: Vec<_> = prepared
            .records
            .iter()
            .map(|(_, _, record)| Some(record.clone()))
            .collect();

        let mut missing = records.clone();
        missing[1] = None;
        let err = assemble(&prepared.meta, missing).unwrap_err();
        assert!(matches!(
            err,
            Error::ChunkCorruption(chunk::Error::IncompleteChunkSet { .. })
        ));
        assert!(err.is_corruption());

        // a chunk from a different payload of the same shape
        let other = PreparedPayload::new(
            &VaultSnapshot::empty(Time::from_timestamp_millis(1)),
            CompressionTier::Full,
            64,
            Time::from_timestamp_millis(1),
        )
        .unwrap();
        let mut corrupt = other.records[0].2.to_vec();
        corrupt[chunk::RECORD_HEADER_LEN] ^= 0x01;
        records[0] = Some(Bytes::from(corrupt));
        let err = assemble(&prepared.meta, records).unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn meta_round_trip_and_corruption() {
        let meta = prepare(usize::MAX).meta;
        assert_eq!(meta.total_chunks, 1);
        assert_eq!(VaultMeta::decode(&meta.encode().unwrap()).unwrap(), meta);
        assert!(matches!(
            VaultMeta::decode(b"{not json"),
            Err(Error::CorruptRecord { .. })
        ));
    }

    #[test]
    fn diff_is_reduced_to_tier() {
        let tab = sample_snapshot().tab("t1").unwrap().clone();
        let log = VaultDiffLog {
            entries: vec![VaultDiffEntry::new(
                DiffSequenceNumber::new(1),
                VaultOp::update_tab(tab),
                Time::from_timestamp_millis(5),
            )],
            ..Default::default()
        };

        let full = decode_diff(&encode_diff(&log, CompressionTier::Full).unwrap()).unwrap();
        assert_eq!(full, log);

        let reduced =
            decode_diff(&encode_diff(&log, CompressionTier::NoFavicons).unwrap()).unwrap();
        let Some(Fragment::Tab(tab)) = &reduced.entries[0].payload else {
            panic!("expected a tab fragment");
        };
        assert_eq!(tab.favicon_data, None);
        assert_eq!(tab.fav_icon_url, None);
        assert_eq!(tab.title, "An article");
    }

    #[test]
    fn layout_tracks_written_records() {
        let mut layout = StoredLayout::default();
        assert!(!layout.is_stored(0, 1));
        layout.record_written(2, 7);
        assert_eq!(layout.records, vec![None, None, Some(7)]);
        assert!(layout.is_stored(2, 7));
        assert!(!layout.is_stored(2, 8));
    }
}
