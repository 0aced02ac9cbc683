//! Conversion of the legacy single-key vault formats into the current snapshot.
//!
//! Version 1 nests each group's tabs inside the group and keeps ungrouped tabs in a separate
//! list. Version 2 has flat `groups` and `tabs` arrays. Both use camelCase field names.

use serde::Deserialize;
use std::sync::Arc;
use tabvault_time::Time;
use tabvault_types::{BackendKind, Group, Tab, VAULT_SCHEMA_VERSION, VaultSnapshot};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("legacy vault is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("legacy vault has no version number")]
    MissingVersion,

    #[error("legacy vault version {0} cannot be migrated")]
    UnsupportedVersion(u64),

    #[error("migrated vault was written to the {0} backend but its meta could not be read back")]
    Unconfirmed(BackendKind),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A legacy vault converted to the current schema.
#[derive(Debug, Clone, PartialEq)]
pub struct MigratedVault {
    pub from_version: u32,
    pub snapshot: VaultSnapshot,
}

/// Parse a legacy vault blob. `now` stamps vaults that never recorded a save time.
pub fn parse_legacy(bytes: &[u8], now: Time) -> Result<MigratedVault> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let version = value
        .get("version")
        .ok_or(Error::MissingVersion)?
        .as_u64()
        .ok_or(Error::MissingVersion)?;

    let (from_version, snapshot) = match version {
        1 => (1, serde_json::from_value::<LegacyV1>(value)?.into_snapshot(now)),
        2 => (2, serde_json::from_value::<LegacyV2>(value)?.into_snapshot(now)),
        v => return Err(Error::UnsupportedVersion(v)),
    };
    Ok(MigratedVault {
        from_version,
        snapshot,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyV1 {
    #[serde(default)]
    groups: Vec<LegacyV1Group>,
    #[serde(default)]
    ungrouped: Vec<LegacyTab>,
    saved_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyV1Group {
    id: String,
    #[serde(default, alias = "name")]
    title: String,
    color: Option<String>,
    #[serde(default)]
    collapsed: bool,
    #[serde(default)]
    tabs: Vec<LegacyTab>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyV2 {
    #[serde(default)]
    groups: Vec<LegacyGroup>,
    #[serde(default)]
    tabs: Vec<LegacyTab>,
    updated_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyGroup {
    id: String,
    #[serde(default)]
    title: String,
    color: Option<String>,
    #[serde(default)]
    collapsed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyTab {
    id: String,
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    pinned: bool,
    group_id: Option<String>,
    fav_icon_url: Option<String>,
    favicon_data: Option<String>,
    last_accessed: Option<i64>,
}

impl LegacyTab {
    fn into_tab(self, group_id: Option<Arc<str>>) -> Tab {
        Tab {
            id: self.id.into(),
            group_id: group_id.or_else(|| self.group_id.map(Into::into)),
            url: self.url,
            title: self.title,
            pinned: self.pinned,
            fav_icon_url: self.fav_icon_url,
            favicon_data: self.favicon_data,
            last_accessed: self.last_accessed.map(Time::from_timestamp_millis),
        }
    }
}

impl LegacyV1 {
    fn into_snapshot(self, now: Time) -> VaultSnapshot {
        let mut groups = Vec::with_capacity(self.groups.len());
        let mut tabs = vec![];
        for group in self.groups {
            let id: Arc<str> = group.id.into();
            tabs.extend(
                group
                    .tabs
                    .into_iter()
                    .map(|t| t.into_tab(Some(Arc::clone(&id)))),
            );
            groups.push(Group {
                id,
                title: group.title,
                color: group.color,
                collapsed: group.collapsed,
            });
        }
        tabs.extend(self.ungrouped.into_iter().map(|t| t.into_tab(None)));

        VaultSnapshot {
            version: VAULT_SCHEMA_VERSION,
            groups,
            tabs,
            updated_at: self.saved_at.map(Time::from_timestamp_millis).unwrap_or(now),
        }
    }
}

impl LegacyV2 {
    fn into_snapshot(self, now: Time) -> VaultSnapshot {
        VaultSnapshot {
            version: VAULT_SCHEMA_VERSION,
            groups: self
                .groups
                .into_iter()
                .map(|g| Group {
                    id: g.id.into(),
                    title: g.title,
                    color: g.color,
                    collapsed: g.collapsed,
                })
                .collect(),
            tabs: self.tabs.into_iter().map(|t| t.into_tab(None)).collect(),
            updated_at: self.updated_at.map(Time::from_timestamp_millis).unwrap_or(now),
        }
    }
}
