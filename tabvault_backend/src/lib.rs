//! Key-value storage capability used by the vault engine.
//!
//! The engine only ever talks to a [`StorageBackend`]. Two namespaces exist, described by
//! [`BackendKind`]: a synchronized one with strict per-item and total byte quotas, and a local
//! one that is treated as unbounded. Both are exposed through the same trait so the engine can
//! switch between them at runtime.
//!
//! Implementations provided here:
//!
//! * [`memory::InMemory`]: quota-enforcing store held in memory, with fault injection for tests.
//! * [`file::FileBackend`]: one file per key in a directory, optionally quota-limited so that a
//!   directory can stand in for the synchronized namespace.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;

pub mod file;
pub mod memory;

pub use tabvault_types::BackendKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("quota exceeded writing {key}: {needed} bytes needed, {available} bytes available")]
    QuotaExceeded {
        key: String,
        needed: u64,
        available: u64,
    },

    #[error("item {key} is {size} bytes, exceeding the per-item limit of {limit} bytes")]
    ItemTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },

    #[error("{backend} backend unavailable: {reason}")]
    Unavailable { backend: BackendKind, reason: String },

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the write pipeline should react to a backend [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a backoff
    Transient,
    /// The namespace is out of room for this write
    QuotaExceeded,
    /// The namespace cannot be used at all right now
    Unavailable,
    /// Anything else, surfaced to the caller
    Fatal,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::QuotaExceeded { .. } | Self::ItemTooLarge { .. } => ErrorClass::QuotaExceeded,
            Self::Unavailable { .. } => ErrorClass::Unavailable,
            Self::InvalidKey(_) => ErrorClass::Fatal,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock => ErrorClass::Transient,
                std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                    ErrorClass::QuotaExceeded
                }
                _ => ErrorClass::Fatal,
            },
        }
    }
}

/// Raw byte usage as reported by a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendQuota {
    pub used: u64,
    pub total: u64,
}

impl BackendQuota {
    pub fn unbounded(used: u64) -> Self {
        Self {
            used,
            total: u64::MAX,
        }
    }

    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

/// Per-item and total byte ceilings enforced by a quota-limited namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_item_bytes: usize,
    pub total_bytes: u64,
}

impl QuotaLimits {
    /// The limits of a browser's synchronized extension storage area
    pub const SYNC_STORAGE: Self = Self {
        max_item_bytes: 8_192,
        total_bytes: 102_400,
    };
}

/// The bytes a namespace charges for storing `value` under `key`.
pub fn item_cost(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

#[async_trait]
pub trait StorageBackend: Debug + Send + Sync + 'static {
    /// Which namespace this backend represents
    fn kind(&self) -> BackendKind;

    /// The per-item ceiling, if this namespace enforces one
    fn max_item_bytes(&self) -> Option<usize>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Remove `key`. Removing a key that does not exist is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    async fn query_quota(&self) -> Result<BackendQuota>;
}

/// Check that a write of `cost` bytes replacing `existing_cost` bytes fits in `limits`.
pub(crate) fn check_limits(
    limits: &QuotaLimits,
    key: &str,
    value_len: usize,
    used: u64,
    existing_cost: u64,
) -> Result<()> {
    let size = key.len() + value_len;
    if size > limits.max_item_bytes {
        return Err(Error::ItemTooLarge {
            key: key.to_string(),
            size,
            limit: limits.max_item_bytes,
        });
    }
    let cost = size as u64;
    let used_without = used.saturating_sub(existing_cost);
    if used_without + cost > limits.total_bytes {
        return Err(Error::QuotaExceeded {
            key: key.to_string(),
            needed: cost,
            available: limits.total_bytes.saturating_sub(used_without),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes() {
        assert_eq!(
            Error::Transient("timeout".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            Error::ItemTooLarge {
                key: "k".into(),
                size: 10,
                limit: 5
            }
            .class(),
            ErrorClass::QuotaExceeded
        );
        assert_eq!(
            Error::Unavailable {
                backend: BackendKind::Synchronized,
                reason: "signed out".into()
            }
            .class(),
            ErrorClass::Unavailable
        );
        assert_eq!(
            Error::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            Error::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn limits_charge_key_and_value() {
        let limits = QuotaLimits {
            max_item_bytes: 10,
            total_bytes: 20,
        };
        assert!(check_limits(&limits, "abc", 7, 0, 0).is_ok());
        assert!(matches!(
            check_limits(&limits, "abc", 8, 0, 0),
            Err(Error::ItemTooLarge { size: 11, .. })
        ));
        // replacing an existing 10 byte item frees its bytes first
        assert!(check_limits(&limits, "abc", 7, 20, 10).is_ok());
        assert!(matches!(
            check_limits(&limits, "abc", 7, 20, 0),
            Err(Error::QuotaExceeded { available: 0, .. })
        ));
    }
}
