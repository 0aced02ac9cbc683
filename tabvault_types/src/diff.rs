use crate::{Group, Tab, VAULT_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use tabvault_time::Time;

/// The sequence number of an entry in a [`VaultDiffLog`].
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DiffSequenceNumber(u64);

impl DiffSequenceNumber {
    pub const ZERO: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for DiffSequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffOp {
    Add,
    Remove,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    Group,
    Tab,
}

/// The encoded body carried by an `Add` or `Update` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fragment {
    Group(Group),
    Tab(Tab),
}

impl Fragment {
    pub fn kind(&self) -> TargetKind {
        match self {
            Self::Group(_) => TargetKind::Group,
            Self::Tab(_) => TargetKind::Tab,
        }
    }

    pub fn id(&self) -> &Arc<str> {
        match self {
            Self::Group(g) => &g.id,
            Self::Tab(t) => &t.id,
        }
    }
}

/// A mutation submitted to the engine, before it has been given a sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultOp {
    pub op: DiffOp,
    pub target_kind: TargetKind,
    pub target_id: Arc<str>,
    pub payload: Option<Fragment>,
}

impl VaultOp {
    fn with_fragment(op: DiffOp, fragment: Fragment) -> Self {
        Self {
            op,
            target_kind: fragment.kind(),
            target_id: Arc::clone(fragment.id()),
            payload: Some(fragment),
        }
    }

    pub fn add_group(group: Group) -> Self {
        Self::with_fragment(DiffOp::Add, Fragment::Group(group))
    }

    pub fn update_group(group: Group) -> Self {
        Self::with_fragment(DiffOp::Update, Fragment::Group(group))
    }

    pub fn remove_group(id: impl Into<Arc<str>>) -> Self {
        Self {
            op: DiffOp::Remove,
            target_kind: TargetKind::Group,
            target_id: id.into(),
            payload: None,
        }
    }

    pub fn add_tab(tab: Tab) -> Self {
        Self::with_fragment(DiffOp::Add, Fragment::Tab(tab))
    }

    pub fn update_tab(tab: Tab) -> Self {
        Self::with_fragment(DiffOp::Update, Fragment::Tab(tab))
    }

    pub fn remove_tab(id: impl Into<Arc<str>>) -> Self {
        Self {
            op: DiffOp::Remove,
            target_kind: TargetKind::Tab,
            target_id: id.into(),
            payload: None,
        }
    }
}

/// A sequenced, immutable entry of the diff log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultDiffEntry {
    #[serde(rename = "seq")]
    pub sequence: DiffSequenceNumber,
    pub op: DiffOp,
    #[serde(rename = "kind")]
    pub target_kind: TargetKind,
    #[serde(rename = "id")]
    pub target_id: Arc<str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Fragment>,
    #[serde(rename = "t")]
    pub time: Time,
}

impl VaultDiffEntry {
    pub fn new(sequence: DiffSequenceNumber, op: VaultOp, time: Time) -> Self {
        Self {
            sequence,
            op: op.op,
            target_kind: op.target_kind,
            target_id: op.target_id,
            payload: op.payload,
            time,
        }
    }
}

/// The ordered record of changes made since the base snapshot was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultDiffLog {
    pub base_version: u32,
    /// Payload checksum of the base snapshot this log applies to
    pub base_checksum: u32,
    pub entries: Vec<VaultDiffEntry>,
}

impl Default for VaultDiffLog {
    fn default() -> Self {
        Self {
            base_version: VAULT_SCHEMA_VERSION,
            base_checksum: 0,
            entries: vec![],
        }
    }
}

impl VaultDiffLog {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn last_sequence(&self) -> DiffSequenceNumber {
        self.entries
            .last()
            .map(|e| e.sequence)
            .unwrap_or(DiffSequenceNumber::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn op_constructors_derive_target() {
        let op = VaultOp::update_tab(Tab::new("t9", "https://example.com"));
        assert_eq!(op.op, DiffOp::Update);
        assert_eq!(op.target_kind, TargetKind::Tab);
        assert_eq!(op.target_id.as_ref(), "t9");

        let op = VaultOp::remove_group("g1");
        assert_eq!(op.target_kind, TargetKind::Group);
        assert!(op.payload.is_none());
    }

    #[test]
    fn entry_serializes_with_short_keys() {
        let entry = VaultDiffEntry::new(
            DiffSequenceNumber::new(4),
            VaultOp::remove_tab("t1"),
            Time::from_timestamp_millis(10),
        );
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"seq":4,"op":"Remove","kind":"Tab","id":"t1","t":10}"#);
        let back: VaultDiffEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn empty_log_has_zero_sequence() {
        let log = VaultDiffLog::default();
        assert!(log.is_empty());
        assert_eq!(log.last_sequence(), DiffSequenceNumber::ZERO);
        assert_eq!(log.base_version, VAULT_SCHEMA_VERSION);
    }
}
