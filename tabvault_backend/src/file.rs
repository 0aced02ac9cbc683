//! A [`StorageBackend`] that keeps one file per key inside a directory.

use crate::{
    BackendKind, BackendQuota, Error, QuotaLimits, Result, StorageBackend, check_limits, item_cost,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
pub struct FileBackend {
    kind: BackendKind,
    root: PathBuf,
    limits: Option<QuotaLimits>,
}

impl FileBackend {
    /// Open (creating if needed) a namespace rooted at `root`.
    pub async fn open(
        kind: BackendKind,
        root: impl Into<PathBuf>,
        limits: Option<QuotaLimits>,
    ) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), %kind, ?limits, "opened file backend");
        Ok(Self { kind, root, limits })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(Error::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    /// Bytes charged for every stored key, skipping in-progress temp files.
    async fn used(&self) -> Result<u64> {
        let mut used = 0;
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                used += name.len() as u64 + metadata.len();
            }
        }
        Ok(used)
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn max_item_bytes(&self) -> Option<usize> {
        self.limits.map(|l| l.max_item_bytes)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(limits) = &self.limits {
            let existing = match tokio::fs::metadata(&path).await {
                Ok(m) => key.len() as u64 + m.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            check_limits(limits, key, value.len(), self.used().await?, existing)?;
        }

        // write then rename so a reader never observes a half written value
        let tmp = self.root.join(format!("{key}{TEMP_SUFFIX}"));
        tokio::fs::write(&tmp, &value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(key, bytes = item_cost(key, &value), kind = %self.kind, "stored item");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn query_quota(&self) -> Result<BackendQuota> {
        let used = self.used().await?;
        Ok(match self.limits {
            Some(limits) => BackendQuota {
                used,
                total: limits.total_bytes,
            },
            None => BackendQuota::unbounded(used),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorClass;

    #[test_log::test(tokio::test)]
    async fn round_trip_and_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackend::open(BackendKind::Local, dir.path(), None)
            .await
            .unwrap();

        assert!(store.get("vault_meta").await.unwrap().is_none());
        store
            .set("vault_meta", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(
            store.get("vault_meta").await.unwrap().unwrap(),
            Bytes::from_static(b"{}")
        );
        store.remove("vault_meta").await.unwrap();
        store.remove("vault_meta").await.unwrap();
        assert!(store.get("vault_meta").await.unwrap().is_none());

        let quota = store.query_quota().await.unwrap();
        assert_eq!(quota, BackendQuota::unbounded(0));
    }

    #[test_log::test(tokio::test)]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackend::open(BackendKind::Local, dir.path(), None)
            .await
            .unwrap();
        for key in ["", "../escape", "a/b", "dot.ted"] {
            let err = store.set(key, Bytes::new()).await.unwrap_err();
            assert!(matches!(err, Error::InvalidKey(_)), "{key}");
        }
    }

    #[test_log::test(tokio::test)]
    async fn limited_directory_enforces_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackend::open(
            BackendKind::Synchronized,
            dir.path(),
            Some(QuotaLimits {
                max_item_bytes: 64,
                total_bytes: 100,
            }),
        )
        .await
        .unwrap();
        assert_eq!(store.max_item_bytes(), Some(64));

        store.set("a", Bytes::from(vec![1; 49])).await.unwrap();
        store.set("b", Bytes::from(vec![1; 49])).await.unwrap();
        assert_eq!(store.query_quota().await.unwrap().used, 100);

        let err = store.set("c", Bytes::from(vec![1; 1])).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::QuotaExceeded);
        let err = store.set("a", Bytes::from(vec![1; 64])).await.unwrap_err();
        assert!(matches!(err, Error::ItemTooLarge { .. }));

        // shrinking an existing key is allowed when full
        store.set("a", Bytes::from(vec![1; 10])).await.unwrap();
        assert_eq!(store.query_quota().await.unwrap().used, 61);
    }
}
