//! The vault storage engine.
//!
//! A [`VaultEngine`] owns the vault snapshot and persists it into one of two key-value
//! namespaces. Mutations are appended to a diff log and flushed after a debounce period: the
//! snapshot is encoded at a compression tier ([`serialize`]), split into item-sized chunks
//! ([`chunk`]) and written together with the pending log and a meta record that commits the
//! write. Quota pressure ([`quota`]) lowers the tier and finally moves the vault from the
//! synchronized namespace to the local one. Vaults in the legacy single-key format are migrated
//! on startup ([`migration`]).

use tabvault_backend::{BackendKind, ErrorClass};
use thiserror::Error;

pub mod backoff;
pub mod chunk;
mod config;
pub mod coordinator;
pub mod diff;
pub mod migration;
pub mod quota;
pub mod serialize;
pub mod store;

pub use config::{VaultConfig, defaults};
pub use coordinator::{
    EngineStatus, LoadReport, LoadSource, SyncState, VaultEngine, VaultEngineArgs,
    VaultStorageOutcome,
};
pub use quota::{QuotaInfo, QuotaMonitor, WarningLevel};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{backend} backend kept failing after {attempts} attempts: {source}")]
    TransientTransport {
        backend: BackendKind,
        attempts: u32,
        source: tabvault_backend::Error,
    },

    #[error("quota exceeded on the {backend} backend: {reason}")]
    QuotaExceeded { backend: BackendKind, reason: String },

    #[error("synchronized storage is unavailable: {0}")]
    SyncUnavailable(tabvault_backend::Error),

    #[error("stored chunks are unreadable: {0}")]
    ChunkCorruption(#[from] chunk::Error),

    #[error("stored payload is unreadable: {0}")]
    CorruptPayload(#[from] serialize::Error),

    #[error("stored {key} record is unreadable: {source}")]
    CorruptRecord {
        key: String,
        source: serde_json::Error,
    },

    #[error("legacy vault migration failed: {0}")]
    Migration(#[from] migration::Error),

    #[error("storage backend error: {0}")]
    Backend(tabvault_backend::Error),

    #[error("error encoding {what}: {source}")]
    Encode {
        what: &'static str,
        source: serde_json::Error,
    },

    #[error("vault engine is shut down")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Map a backend failure to the engine error that decides how the write pipeline reacts.
    pub fn from_backend(
        backend: BackendKind,
        attempts: u32,
        source: tabvault_backend::Error,
    ) -> Self {
        match (source.class(), backend) {
            (ErrorClass::Transient, _) => Self::TransientTransport {
                backend,
                attempts,
                source,
            },
            (ErrorClass::QuotaExceeded, _) => Self::QuotaExceeded {
                backend,
                reason: source.to_string(),
            },
            (ErrorClass::Unavailable, BackendKind::Synchronized) => Self::SyncUnavailable(source),
            _ => Self::Backend(source),
        }
    }

    /// Errors that mean what is stored cannot be read back, as opposed to I/O trouble
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChunkCorruption(_) | Self::CorruptPayload(_) | Self::CorruptRecord { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_to_pipeline_reactions() {
        let transient = Error::from_backend(
            BackendKind::Synchronized,
            6,
            tabvault_backend::Error::Transient("timeout".into()),
        );
        assert!(matches!(
            transient,
            Error::TransientTransport { attempts: 6, .. }
        ));

        let quota = Error::from_backend(
            BackendKind::Synchronized,
            1,
            tabvault_backend::Error::ItemTooLarge {
                key: "vault_diff".into(),
                size: 9000,
                limit: 8192,
            },
        );
        assert!(matches!(
            quota,
            Error::QuotaExceeded {
                backend: BackendKind::Synchronized,
                ..
            }
        ));

        let unavailable = |backend| tabvault_backend::Error::Unavailable {
            backend,
            reason: "signed out".into(),
        };
        assert!(matches!(
            Error::from_backend(
                BackendKind::Synchronized,
                1,
                unavailable(BackendKind::Synchronized)
            ),
            Error::SyncUnavailable(_)
        ));
        assert!(matches!(
            Error::from_backend(BackendKind::Local, 1, unavailable(BackendKind::Local)),
            Error::Backend(_)
        ));
    }
}
