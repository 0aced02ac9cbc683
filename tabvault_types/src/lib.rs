//! Shared types for the tab vault: the domain snapshot, diff log entries and the enums that
//! describe where and how a snapshot is stored.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use tabvault_time::Time;

mod diff;
pub use diff::*;

/// The on-disk schema generation written by this version of the engine.
pub const VAULT_SCHEMA_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: Arc<str>,
    pub title: String,
    pub color: Option<String>,
    pub collapsed: bool,
}

impl Group {
    pub fn new(id: impl Into<Arc<str>>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            color: None,
            collapsed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: Arc<str>,
    pub group_id: Option<Arc<str>>,
    pub url: String,
    pub title: String,
    pub pinned: bool,
    pub fav_icon_url: Option<String>,
    /// Inline favicon image, usually a `data:` URI
    pub favicon_data: Option<String>,
    pub last_accessed: Option<Time>,
}

impl Tab {
    pub fn new(id: impl Into<Arc<str>>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group_id: None,
            url: url.into(),
            title: String::new(),
            pinned: false,
            fav_icon_url: None,
            favicon_data: None,
            last_accessed: None,
        }
    }

    pub fn in_group(mut self, group_id: impl Into<Arc<str>>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// A complete, self-consistent state of the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub version: u32,
    pub groups: Vec<Group>,
    pub tabs: Vec<Tab>,
    pub updated_at: Time,
}

impl VaultSnapshot {
    pub fn empty(updated_at: Time) -> Self {
        Self {
            version: VAULT_SCHEMA_VERSION,
            groups: vec![],
            tabs: vec![],
            updated_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.tabs.is_empty()
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id.as_ref() == id)
    }

    pub fn tab(&self, id: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id.as_ref() == id)
    }

    /// Tabs belonging to the given group, in vault order
    pub fn tabs_in_group<'a>(&'a self, group_id: &'a str) -> impl Iterator<Item = &'a Tab> + 'a {
        self.tabs
            .iter()
            .filter(move |t| t.group_id.as_deref() == Some(group_id))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Fidelity level used when encoding a snapshot.
///
/// Ordered from highest to lowest fidelity, so `Full < NoFavicons < Minimal`.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CompressionTier {
    #[default]
    Full,
    NoFavicons,
    Minimal,
}

impl CompressionTier {
    pub const ALL: [Self; 3] = [Self::Full, Self::NoFavicons, Self::Minimal];

    /// The next lower fidelity tier, `None` once at [`CompressionTier::Minimal`]
    pub fn lower(&self) -> Option<Self> {
        match self {
            Self::Full => Some(Self::NoFavicons),
            Self::NoFavicons => Some(Self::Minimal),
            Self::Minimal => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Full => 0,
            Self::NoFavicons => 1,
            Self::Minimal => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_u8() == value)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::NoFavicons => "no_favicons",
            Self::Minimal => "minimal",
        }
    }
}

impl Display for CompressionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "compression tier",
                value: s.to_string(),
            })
    }
}

/// The two storage namespaces the vault can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Cross-device store with strict per-item and total quotas
    Synchronized,
    /// Device-local store, effectively unbounded
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synchronized => "synchronized",
            Self::Local => "local",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
