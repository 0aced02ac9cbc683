//! An in-memory [`StorageBackend`] that enforces the same quota rules as the synchronized
//! namespace and can be told to fail, which makes it the reference double for engine tests.

use crate::{
    BackendKind, BackendQuota, Error, QuotaLimits, Result, StorageBackend, check_limits, item_cost,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// A failure to inject into the next `set` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    QuotaExceeded,
    Unavailable,
}

/// A mutating call observed by an [`InMemory`] backend, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Set(String),
    Remove(String),
}

#[derive(Debug)]
pub struct InMemory {
    kind: BackendKind,
    limits: Option<QuotaLimits>,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    items: BTreeMap<String, Bytes>,
    /// One entry per upcoming `set`, `None` letting that call through
    faults: VecDeque<Option<Fault>>,
    unavailable: bool,
    operations: Vec<Operation>,
}

impl State {
    fn used(&self) -> u64 {
        self.items.iter().map(|(k, v)| item_cost(k, v)).sum()
    }
}

impl InMemory {
    /// An unbounded local namespace
    pub fn local() -> Self {
        Self::new(BackendKind::Local, None)
    }

    /// A synchronized namespace with the given limits
    pub fn synchronized(limits: QuotaLimits) -> Self {
        Self::new(BackendKind::Synchronized, Some(limits))
    }

    pub fn new(kind: BackendKind, limits: Option<QuotaLimits>) -> Self {
        Self {
            kind,
            limits,
            state: Mutex::new(State::default()),
        }
    }

    /// Fail the next `n` calls to `set` with `fault`, after any faults already queued.
    pub fn fail_next_sets(&self, n: usize, fault: Fault) {
        self.fail_sets_after(0, n, fault);
    }

    /// Let `skip` calls to `set` through, then fail the `n` after them with `fault`. Counting
    /// starts after any faults already queued.
    pub fn fail_sets_after(&self, skip: usize, n: usize, fault: Fault) {
        let mut state = self.state.lock();
        state.faults.extend(std::iter::repeat_n(None, skip));
        state.faults.extend(std::iter::repeat_n(Some(fault), n));
    }

    /// Make every call fail with [`Error::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Store `value` without quota checks, fault injection or operation tracking
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.state.lock().items.insert(key.into(), value.into());
    }

    /// A copy of the stored value without going through the async API
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        self.state.lock().items.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().items.keys().cloned().collect()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state.lock().operations.clear();
    }

    /// The number of successful `set` calls so far
    pub fn set_count(&self) -> usize {
        self.state
            .lock()
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::Set(_)))
            .count()
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used()
    }

    fn unavailable_error(&self) -> Error {
        Error::Unavailable {
            backend: self.kind,
            reason: "storage area disconnected".to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for InMemory {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn max_item_bytes(&self) -> Option<usize> {
        self.limits.map(|l| l.max_item_bytes)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(self.unavailable_error());
        }
        Ok(state.items.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(self.unavailable_error());
        }
        if let Some(fault) = state.faults.pop_front().flatten() {
            debug!(key, ?fault, kind = %self.kind, "injecting fault into set");
            return Err(match fault {
                Fault::Transient => Error::Transient(format!("injected timeout writing {key}")),
                Fault::QuotaExceeded => Error::QuotaExceeded {
                    key: key.to_string(),
                    needed: item_cost(key, &value),
                    available: 0,
                },
                Fault::Unavailable => self.unavailable_error(),
            });
        }
        if let Some(limits) = &self.limits {
            let existing = state
                .items
                .get(key)
                .map(|v| item_cost(key, v))
                .unwrap_or_default();
            check_limits(limits, key, value.len(), state.used(), existing)?;
        }
        state.items.insert(key.to_string(), value);
        state.operations.push(Operation::Set(key.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(self.unavailable_error());
        }
        state.items.remove(key);
        state.operations.push(Operation::Remove(key.to_string()));
        Ok(())
    }

    async fn query_quota(&self) -> Result<BackendQuota> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(self.unavailable_error());
        }
        let used = state.used();
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

    #[tokio::test]
    async fn set_get_remove() {
        let store = InMemory::local();
        assert!(store.get("a").await.unwrap().is_none());
        store.set("a", Bytes::from_static(b"123")).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap(), Bytes::from_static(b"123"));
        store.remove("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(
            store.operations(),
            vec![
                Operation::Set("a".into()),
                Operation::Remove("a".into()),
                Operation::Remove("a".into())
            ]
        );
    }

    #[tokio::test]
    async fn quota_accounts_for_keys_and_replacements() {
        let store = InMemory::synchronized(QuotaLimits {
            max_item_bytes: 16,
            total_bytes: 24,
        });
        store.set("k1", Bytes::from(vec![0; 10])).await.unwrap();
        assert_eq!(
            store.query_quota().await.unwrap(),
            BackendQuota {
                used: 12,
                total: 24
            }
        );

        // overwrite of the same key only charges the difference
        store.set("k1", Bytes::from(vec![0; 14])).await.unwrap();
        assert_eq!(store.used_bytes(), 16);

        let err = store.set("k2", Bytes::from(vec![0; 10])).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::QuotaExceeded);
        let err = store.set("k3", Bytes::from(vec![0; 15])).await.unwrap_err();
        assert!(matches!(err, Error::ItemTooLarge { size: 17, .. }));
        assert_eq!(store.keys(), vec!["k1".to_string()]);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let store = InMemory::local();
        store.fail_next_sets(1, Fault::Transient);
        store.fail_next_sets(1, Fault::QuotaExceeded);

        let first = store.set("a", Bytes::new()).await.unwrap_err();
        assert_eq!(first.class(), ErrorClass::Transient);
        let second = store.set("a", Bytes::new()).await.unwrap_err();
        assert_eq!(second.class(), ErrorClass::QuotaExceeded);
        store.set("a", Bytes::new()).await.unwrap();
        assert_eq!(store.set_count(), 1);
    }

    #[tokio::test]
    async fn faults_can_skip_calls() {
        let store = InMemory::local();
        store.fail_sets_after(1, 2, Fault::Transient);

        store.set("a", Bytes::new()).await.unwrap();
        assert!(store.set("b", Bytes::new()).await.is_err());
        assert!(store.set("b", Bytes::new()).await.is_err());
        store.set("b", Bytes::new()).await.unwrap();
        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn unavailable_rejects_everything() {
        let store = InMemory::synchronized(QuotaLimits::SYNC_STORAGE);
        store.set_unavailable(true);
        assert_eq!(
            store.get("a").await.unwrap_err().class(),
            ErrorClass::Unavailable
        );
        assert_eq!(
            store.query_quota().await.unwrap_err().class(),
            ErrorClass::Unavailable
        );
        store.set_unavailable(false);
        assert!(store.query_quota().await.is_ok());
    }
}
