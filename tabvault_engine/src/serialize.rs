//! Encoding of a [`VaultSnapshot`] into the payload that is chunked into storage.
//!
//! A payload starts with a file type identifier, followed by the compression tier it was
//! encoded at and a big-endian CRC32 of the body. The body is the snapshot record as JSON,
//! compressed with raw Snappy. Record fields use short names because every byte counts against
//! the synchronized quota.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::mem::size_of;
use std::sync::Arc;
use tabvault_time::Time;
use tabvault_types::{CompressionTier, Group, Tab, VAULT_SCHEMA_VERSION, VaultSnapshot};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid vault payload identifier")]
    InvalidFileType,

    #[error("payload of {0} bytes is shorter than its header")]
    Truncated(usize),

    #[error("unknown compression tier byte {0}")]
    UnknownTier(u8),

    #[error("crc32 checksum mismatch: header has {expected:#010x}, body hashes to {actual:#010x}")]
    Crc32Mismatch { expected: u32, actual: u32 },

    #[error("snappy error: {0}")]
    Snappy(#[from] snap::Error),

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload schema version {0} is newer than this engine supports")]
    UnsupportedVersion(u32),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The first bytes of every payload, identifying it and its layout version.
const FILE_TYPE_IDENTIFIER: &[u8] = b"tvault03";

const CHECKSUM_LEN: usize = size_of::<u32>();

/// Length of the identifier, tier byte and checksum that precede the body
pub const HEADER_LEN: usize = FILE_TYPE_IDENTIFIER.len() + 1 + CHECKSUM_LEN;

/// CRC32 of a complete payload, as recorded in the vault meta.
pub fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

pub fn encode(snapshot: &VaultSnapshot, tier: CompressionTier) -> Result<Bytes> {
    let record = SnapshotRecord::new(snapshot, tier);
    let json = serde_json::to_vec(&record)?;
    let body = snap::raw::Encoder::new().compress_vec(&json)?;

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(FILE_TYPE_IDENTIFIER);
    buf.push(tier.as_u8());
    buf.extend_from_slice(&checksum(&body).to_be_bytes());
    buf.extend_from_slice(&body);

    Ok(Bytes::from(buf))
}

/// Decode a payload produced by [`encode`] at any tier.
pub fn decode(payload: &[u8]) -> Result<(VaultSnapshot, CompressionTier)> {
    if payload.len() < HEADER_LEN {
        return Err(Error::Truncated(payload.len()));
    }

    let pos = FILE_TYPE_IDENTIFIER.len();
    if &payload[..pos] != FILE_TYPE_IDENTIFIER {
        return Err(Error::InvalidFileType);
    }

    let tier = CompressionTier::from_u8(payload[pos]).ok_or(Error::UnknownTier(payload[pos]))?;

    let mut cursor = Cursor::new(&payload[pos + 1..HEADER_LEN]);
    let expected = cursor.read_u32::<BigEndian>()?;

    let body = &payload[HEADER_LEN..];
    let actual = checksum(body);
    if actual != expected {
        return Err(Error::Crc32Mismatch { expected, actual });
    }

    let json = snap::raw::Decoder::new().decompress_vec(body)?;
    let record: SnapshotRecord = serde_json::from_slice(&json)?;
    if record.version > VAULT_SCHEMA_VERSION {
        return Err(Error::UnsupportedVersion(record.version));
    }

    Ok((record.into(), tier))
}

/// Strip the fields of `group` that `tier` does not keep.
pub fn reduce_group(group: &mut Group, tier: CompressionTier) {
    if tier == CompressionTier::Minimal {
        group.color = None;
        group.collapsed = false;
    }
}

/// Strip the fields of `tab` that `tier` does not keep.
pub fn reduce_tab(tab: &mut Tab, tier: CompressionTier) {
    if tier >= CompressionTier::NoFavicons {
        tab.fav_icon_url = None;
        tab.favicon_data = None;
    }
    if tier == CompressionTier::Minimal {
        tab.title.clear();
        tab.pinned = false;
        tab.last_accessed = None;
    }
}

/// A copy of `snapshot` holding only what survives an encode at `tier`.
pub fn reduce(snapshot: &VaultSnapshot, tier: CompressionTier) -> VaultSnapshot {
    let mut reduced = snapshot.clone();
    reduced
        .groups
        .iter_mut()
        .for_each(|g| reduce_group(g, tier));
    reduced.tabs.iter_mut().for_each(|t| reduce_tab(t, tier));
    reduced
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    #[serde(rename = "v")]
    version: u32,
    #[serde(rename = "u", default)]
    updated_at: Time,
    #[serde(rename = "g", default)]
    groups: Vec<GroupRecord>,
    #[serde(rename = "t", default)]
    tabs: Vec<TabRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupRecord {
    #[serde(rename = "i")]
    id: Arc<str>,
    #[serde(rename = "n", default)]
    title: String,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    color: Option<String>,
    #[serde(rename = "x", default, skip_serializing_if = "is_false")]
    collapsed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct TabRecord {
    #[serde(rename = "i")]
    id: Arc<str>,
    #[serde(rename = "g", default, skip_serializing_if = "Option::is_none")]
    group_id: Option<Arc<str>>,
    #[serde(rename = "u")]
    url: String,
    #[serde(rename = "n", default, skip_serializing_if = "String::is_empty")]
    title: String,
    #[serde(rename = "p", default, skip_serializing_if = "is_false")]
    pinned: bool,
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    fav_icon_url: Option<String>,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    favicon_data: Option<String>,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    last_accessed: Option<Time>,
}

impl SnapshotRecord {
    fn new(snapshot: &VaultSnapshot, tier: CompressionTier) -> Self {
        Self {
            version: snapshot.version,
            updated_at: snapshot.updated_at,
            groups: snapshot
                .groups
                .iter()
                .map(|g| {
                    let mut g = g.clone();
                    reduce_group(&mut g, tier);
                    GroupRecord::from(g)
                })
                .collect(),
            tabs: snapshot
                .tabs
                .iter()
                .map(|t| {
                    let mut t = t.clone();
                    reduce_tab(&mut t, tier);
                    TabRecord::from(t)
                })
                .collect(),
        }
    }
}

impl From<SnapshotRecord> for VaultSnapshot {
    fn from(record: SnapshotRecord) -> Self {
        Self {
            version: record.version,
            groups: record.groups.into_iter().map(Into::into).collect(),
            tabs: record.tabs.into_iter().map(Into::into).collect(),
            updated_at: record.updated_at,
        }
    }
}

impl From<Group> for GroupRecord {
    fn from(group: Group) -> Self {
        Self {
            id: group.id,
            title: group.title,
            color: group.color,
            collapsed: group.collapsed,
        }
    }
}

impl From<GroupRecord> for Group {
    fn from(record: GroupRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            color: record.color,
            collapsed: record.collapsed,
        }
    }
}

impl From<Tab> for TabRecord {
    fn from(tab: Tab) -> Self {
        Self {
            id: tab.id,
            group_id: tab.group_id,
            url: tab.url,
            title: tab.title,
            pinned: tab.pinned,
            fav_icon_url: tab.fav_icon_url,
            favicon_data: tab.favicon_data,
            last_accessed: tab.last_accessed,
        }
    }
}

impl From<TabRecord> for Tab {
    fn from(record: TabRecord) -> Self {
        Self {
            id: record.id,
            group_id: record.group_id,
            url: record.url,
            title: record.title,
            pinned: record.pinned,
            fav_icon_url: record.fav_icon_url,
            favicon_data: record.favicon_data,
            last_accessed: record.last_accessed,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn sample_snapshot() -> VaultSnapshot {
        let mut group = Group::new("g1", "Reading");
        group.color = Some("blue".to_string());
        group.collapsed = true;

        let mut tab = Tab::new("t1", "https://example.com/article")
            .in_group("g1")
            .with_title("An article");
        tab.pinned = true;
        tab.fav_icon_url = Some("https://example.com/favicon.ico".to_string());
        tab.favicon_data = Some(format!("data:image/png;base64,{}", "A".repeat(512)));
        tab.last_accessed = Some(Time::from_timestamp_millis(1_700_000_000_000));

        VaultSnapshot {
            version: VAULT_SCHEMA_VERSION,
            groups: vec![group, Group::new("g2", "Later")],
            tabs: vec![
                tab,
                Tab::new("t2", "https://example.org").with_title("Example"),
            ],
            updated_at: Time::from_timestamp_millis(1_700_000_100_000),
        }
    }

    #[test]
    fn full_tier_round_trips_everything() {
        let snapshot = sample_snapshot();
        let payload = encode(&snapshot, CompressionTier::Full).unwrap();
        let (decoded, tier) = decode(&payload).unwrap();
        assert_eq!(tier, CompressionTier::Full);
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn no_favicons_tier_drops_only_favicons() {
        let snapshot = sample_snapshot();
        let payload = encode(&snapshot, CompressionTier::NoFavicons).unwrap();
        let (decoded, tier) = decode(&payload).unwrap();
        assert_eq!(tier, CompressionTier::NoFavicons);

        let tab = decoded.tab("t1").unwrap();
        assert_eq!(tab.fav_icon_url, None);
        assert_eq!(tab.favicon_data, None);
        assert_eq!(tab.title, "An article");
        assert!(tab.pinned);
        assert_eq!(decoded.groups, snapshot.groups);
    }

    #[test]
    fn minimal_tier_keeps_structure_and_order() {
        let snapshot = sample_snapshot();
        let full = encode(&snapshot, CompressionTier::Full).unwrap();
        let minimal = encode(&snapshot, CompressionTier::Minimal).unwrap();
        assert!(minimal.len() < full.len());

        let (decoded, tier) = decode(&minimal).unwrap();
        assert_eq!(tier, CompressionTier::Minimal);
        assert_eq!(decoded, reduce(&snapshot, CompressionTier::Minimal));

        let ids: Vec<_> = decoded.tabs.iter().map(|t| t.id.as_ref()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        let tab = decoded.tab("t1").unwrap();
        assert_eq!(tab.group_id.as_deref(), Some("g1"));
        assert_eq!(tab.url, "https://example.com/article");
        assert_eq!(tab.title, "");
        assert_eq!(tab.last_accessed, None);
        let group = decoded.group("g1").unwrap();
        assert_eq!(group.title, "Reading");
        assert_eq!(group.color, None);
    }

    #[test]
    fn detects_corruption() {
        let payload = encode(&sample_snapshot(), CompressionTier::Full).unwrap();

        let mut flipped = payload.to_vec();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        assert!(matches!(
            decode(&flipped),
            Err(Error::Crc32Mismatch { .. })
        ));

        let mut wrong_type = payload.to_vec();
        wrong_type[0] = b'x';
        assert!(matches!(decode(&wrong_type), Err(Error::InvalidFileType)));

        let mut wrong_tier = payload.to_vec();
        wrong_tier[FILE_TYPE_IDENTIFIER.len()] = 9;
        assert!(matches!(decode(&wrong_tier), Err(Error::UnknownTier(9))));

        assert!(matches!(decode(&payload[..5]), Err(Error::Truncated(5))));
    }

    #[test]
    fn rejects_newer_schema() {
        let mut snapshot = sample_snapshot();
        snapshot.version = VAULT_SCHEMA_VERSION + 1;
        let payload = encode(&snapshot, CompressionTier::Full).unwrap();
        assert!(matches!(
            decode(&payload),
            Err(Error::UnsupportedVersion(v)) if v == VAULT_SCHEMA_VERSION + 1
        ));
    }

    #[test]
    fn absent_fields_take_defaults() {
        let json = br#"{"v":3,"t":[{"i":"t1","u":"https://example.com"}]}"#;
        let body = snap::raw::Encoder::new().compress_vec(json).unwrap();
        let mut payload = FILE_TYPE_IDENTIFIER.to_vec();
        payload.push(CompressionTier::Minimal.as_u8());
        payload.extend_from_slice(&checksum(&body).to_be_bytes());
        payload.extend_from_slice(&body);

        let (decoded, _) = decode(&payload).unwrap();
        assert!(decoded.groups.is_empty());
        assert_eq!(decoded.tabs, vec![Tab::new("t1", "https://example.com")]);
        assert_eq!(decoded.updated_at, Time::UNIX_EPOCH);
    }
}
