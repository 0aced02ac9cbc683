//! The write pipeline that owns the vault and keeps it persisted.
//!
//! Mutations are appended to the pending [`DiffManager`] under a short synchronous lock and
//! never wait on storage. A background task debounces them and then flushes: the base snapshot
//! (or a compaction of it) is encoded at the current tier, chunk records that differ from what
//! the namespace already holds are written, then the diff log, then the meta record that
//! commits the flush. Only one flush runs at a time.
//!
//! Transient failures are retried with exponential backoff. Quota pressure lowers the tier one
//! step at a time. A synchronized namespace that stays unusable is abandoned for the local one
//! until sync is enabled again.

use crate::backoff::{self, Backoff};
use crate::diff::{self, DiffManager};
use crate::migration::{self, MigratedVault};
use crate::quota::{QuotaInfo, QuotaMonitor, WarningLevel};
use crate::store::{self, PreparedPayload, StoredLayout, StoredVault, VaultMeta};
use crate::{Error, Result, VaultConfig, chunk};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tabvault_backend::{BackendKind, BackendQuota, StorageBackend, item_cost};
use tabvault_time::TimeProvider;
use tabvault_types::{
    CompressionTier, DiffSequenceNumber, VaultDiffLog, VaultOp, VaultSnapshot,
};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the write pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Nothing pending
    Idle,
    /// Mutations are waiting for the debounce period to pass
    Debouncing,
    Flushing,
    /// Waiting out a backoff delay after a transient failure
    Retrying,
    /// Re-encoding at a lower compression tier after quota pressure
    Downgrading,
    /// Moving from the synchronized namespace to the local one
    FallingBack,
    /// The last flush was committed
    Committed,
}

impl Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Debouncing => "debouncing",
            Self::Flushing => "flushing",
            Self::Retrying => "retrying",
            Self::Downgrading => "downgrading",
            Self::FallingBack => "falling back",
            Self::Committed => "committed",
        })
    }
}

/// The state published to subscribers whenever it changes.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: SyncState,
    pub backend: BackendKind,
    pub tier: CompressionTier,
    /// True while the synchronized namespace has been abandoned for the local one
    pub fell_back: bool,
    /// Quota of the active namespace after the last committed flush
    pub quota: Option<QuotaInfo>,
    /// The error of the last failed flush, cleared by the next commit
    pub last_error: Option<String>,
}

/// The result of a committed flush.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultStorageOutcome {
    pub backend: BackendKind,
    pub tier: CompressionTier,
    pub fell_back: bool,
    /// True if the diff log was folded into the stored snapshot
    pub compacted: bool,
    pub total_chunks: u32,
    /// Chunk records actually written, unchanged ones are skipped
    pub chunks_written: usize,
    pub quota: QuotaInfo,
}

/// Where the vault came from when the engine started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Nothing readable was stored
    Empty,
    Stored {
        backend: BackendKind,
        tier: CompressionTier,
    },
    /// Converted from the legacy single-key format
    Migrated { from_version: u32 },
}

#[derive(Debug)]
pub struct LoadReport {
    /// The namespace flushes go to
    pub backend: BackendKind,
    pub tier: CompressionTier,
    pub source: LoadSource,
    /// Stored diff entries replayed on top of the stored snapshot
    pub diff_entries: usize,
    /// Set when a stored vault existed but could not be read. The engine then starts empty and
    /// leaves storage untouched until the next mutation.
    pub error: Option<Error>,
}

#[derive(Debug)]
pub struct VaultEngineArgs {
    pub config: VaultConfig,
    pub time_provider: Arc<dyn TimeProvider>,
    pub local: Arc<dyn StorageBackend>,
    pub sync: Arc<dyn StorageBackend>,
    pub sync_enabled: bool,
}

#[derive(Debug)]
pub struct VaultEngine {
    shared: Arc<Shared>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl VaultEngine {
    /// Migrate and load the vault, then start the background flush task.
    ///
    /// Fails if a legacy vault cannot be migrated or the local namespace cannot be read.
    pub async fn open(args: VaultEngineArgs) -> Result<(Self, LoadReport)> {
        let VaultEngineArgs {
            config,
            time_provider,
            local,
            sync,
            sync_enabled,
        } = args;

        let now = time_provider.now();
        let writer = Writer {
            sync_enabled,
            fell_back: false,
            tier: CompressionTier::Full,
            layouts: HashMap::new(),
        };
        let (status, _) = watch::channel(EngineStatus {
            state: SyncState::Idle,
            backend: writer.active(),
            tier: writer.tier,
            fell_back: false,
            quota: None,
            last_error: None,
        });

        let shared = Arc::new(Shared {
            config,
            monitor: QuotaMonitor::from_config(&config),
            pending: Mutex::new(Pending::new(
                VaultSnapshot::empty(now),
                DiffManager::new(&config, now),
            )),
            writer: tokio::sync::Mutex::new(writer),
            time_provider,
            local,
            sync,
            status,
            mutated: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let report = shared.load().await?;
        info!(
            backend = %report.backend,
            tier = %report.tier,
            source = ?report.source,
            diff_entries = report.diff_entries,
            error = report.error.as_ref().map(tracing::field::display),
            "vault loaded"
        );

        let background = tokio::spawn(background_flush(Arc::clone(&shared)));
        Ok((
            Self {
                shared,
                background: Mutex::new(Some(background)),
            },
            report,
        ))
    }

    /// The current vault, including mutations that have not been flushed yet.
    pub fn snapshot(&self) -> Arc<VaultSnapshot> {
        Arc::clone(&self.shared.pending.lock().current)
    }

    /// Record a mutation. It is applied to [`Self::snapshot`] immediately and persisted by the
    /// next flush.
    pub fn apply(&self, op: VaultOp) -> DiffSequenceNumber {
        let now = self.shared.time_provider.now();
        let sequence = {
            let mut pending = self.shared.pending.lock();
            let sequence = pending.diff.append(op, now);
            if let Some(entry) = pending.diff.log().entries.last().cloned() {
                diff::apply_entry(Arc::make_mut(&mut pending.current), &entry);
            }
            sequence
        };
        debug!(%sequence, "vault mutation recorded");

        self.shared.status.send_if_modified(|status| {
            if matches!(status.state, SyncState::Idle | SyncState::Committed) {
                status.state = SyncState::Debouncing;
                true
            } else {
                false
            }
        });
        self.shared.mutated.notify_one();
        sequence
    }

    /// Entries in the pending diff log, flushed or not
    pub fn pending_entries(&self) -> usize {
        self.shared.pending.lock().diff.len()
    }

    /// Flush now, without waiting for the debounce period.
    pub async fn flush_now(&self) -> Result<VaultStorageOutcome> {
        self.ensure_running()?;
        self.shared.flush(FlushMode::Always).await
    }

    /// Flush now, folding the whole diff log into the stored snapshot.
    pub async fn compact_now(&self) -> Result<VaultStorageOutcome> {
        self.ensure_running()?;
        self.shared.flush(FlushMode::Compact).await
    }

    /// Switch between the synchronized and the local namespace and flush into the new one.
    /// Enabling sync clears an earlier fallback.
    pub async fn set_sync_enabled(&self, enabled: bool) -> Result<VaultStorageOutcome> {
        self.ensure_running()?;
        let shared = &self.shared;
        let mut writer = shared.writer.lock().await;

        let previous = writer.active();
        writer.sync_enabled = enabled;
        if enabled {
            writer.fell_back = false;
        }
        let active = writer.active();
        if active != previous {
            info!(from = %previous, to = %active, "switching vault backend");
            writer.tier = CompressionTier::Full;
            match shared.read_meta(active).await {
                Ok(Some((meta, meta_bytes))) => {
                    writer
                        .layouts
                        .insert(active, StoredLayout::from_meta(&meta, meta_bytes));
                }
                Ok(None) => {
                    writer.layouts.insert(active, StoredLayout::default());
                }
                Err(e) => {
                    warn!(%e, backend = %active, "could not read existing vault meta");
                    writer.layouts.remove(&active);
                }
            }
        }

        let result = shared.flush_locked(&mut writer, FlushMode::Always).await;
        shared.finish_flush(&writer, result)
    }

    /// Quota of the active namespace.
    pub async fn query_quota(&self) -> Result<QuotaInfo> {
        let backend = self.shared.status.borrow().backend;
        let quota = self.shared.query_backend_quota(backend).await?;
        Ok(self
            .shared
            .monitor
            .evaluate(quota, self.shared.config.reserved_settings_bytes))
    }

    pub fn state(&self) -> SyncState {
        self.shared.status.borrow().state
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.shared.status.subscribe()
    }

    /// Stop the debounce timer and the idle compaction ticker. Pending mutations are not
    /// flushed.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let background = self.background.lock().take();
        if let Some(background) = background {
            if let Err(e) = background.await {
                error!(%e, "vault background task failed");
            }
        }
        info!("vault engine shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }
}

impl Drop for VaultEngine {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushMode {
    Always,
    /// Always flush, folding the log into the snapshot
    Compact,
}

#[derive(Debug)]
struct Pending {
    /// The snapshot the diff log applies to
    base: Arc<VaultSnapshot>,
    /// `base` with the whole log applied
    current: Arc<VaultSnapshot>,
    diff: DiffManager,
}

impl Pending {
    fn new(base: VaultSnapshot, diff: DiffManager) -> Self {
        let current = diff::apply_entries(&base, &diff.log().entries);
        Self {
            base: Arc::new(base),
            current: Arc::new(current),
            diff,
        }
    }
}

/// State owned by whoever holds the flush lock.
#[derive(Debug)]
struct Writer {
    sync_enabled: bool,
    fell_back: bool,
    /// Tier of the active namespace, reset to full whenever the namespace changes
    tier: CompressionTier,
    layouts: HashMap<BackendKind, StoredLayout>,
}

impl Writer {
    fn active(&self) -> BackendKind {
        if self.sync_enabled && !self.fell_back {
            BackendKind::Synchronized
        } else {
            BackendKind::Local
        }
    }

    /// True if the active namespace holds chunk records its meta does not describe
    fn needs_repair(&self) -> bool {
        self.layouts
            .get(&self.active())
            .is_some_and(|layout| layout.torn)
    }
}

#[derive(Debug)]
struct Shared {
    config: VaultConfig,
    monitor: QuotaMonitor,
    time_provider: Arc<dyn TimeProvider>,
    local: Arc<dyn StorageBackend>,
    sync: Arc<dyn StorageBackend>,
    pending: Mutex<Pending>,
    writer: tokio::sync::Mutex<Writer>,
    status: watch::Sender<EngineStatus>,
    mutated: Notify,
    shutdown: CancellationToken,
}

/// What one namespace holds, as found at startup.
#[derive(Debug)]
struct Found {
    kind: BackendKind,
    meta: VaultMeta,
    meta_bytes: u64,
}

#[derive(Debug)]
struct LoadedVault {
    stored: StoredVault,
    diff: Option<VaultDiffLog>,
    diff_key_exists: bool,
    diff_bytes: u64,
}

impl Shared {
    fn backend(&self, kind: BackendKind) -> &Arc<dyn StorageBackend> {
        match kind {
            BackendKind::Synchronized => &self.sync,
            BackendKind::Local => &self.local,
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.retry_base_delay, self.config.max_retries)
    }

    fn on_retry(
        &self,
        kind: BackendKind,
        call: &str,
        attempt: u32,
        delay: Duration,
        e: &tabvault_backend::Error,
    ) {
        warn!(
            backend = %kind,
            call,
            attempt,
            ?delay,
            error = %e,
            "transient storage failure, retrying"
        );
        self.status.send_modify(|s| s.state = SyncState::Retrying);
    }

    async fn get(&self, kind: BackendKind, key: &str) -> Result<Option<Bytes>> {
        let backend = self.backend(kind);
        backoff::retry(
            self.backoff(),
            |attempt, delay, e| self.on_retry(kind, key, attempt, delay, e),
            move || backend.get(key),
        )
        .await
        .map_err(|f| Error::from_backend(kind, f.attempts, f.source))
    }

    async fn set(&self, kind: BackendKind, key: &str, value: &Bytes) -> Result<()> {
        let backend = self.backend(kind);
        backoff::retry(
            self.backoff(),
            |attempt, delay, e| self.on_retry(kind, key, attempt, delay, e),
            move || backend.set(key, value.clone()),
        )
        .await
        .map_err(|f| Error::from_backend(kind, f.attempts, f.source))
    }

    async fn remove(&self, kind: BackendKind, key: &str) -> Result<()> {
        let backend = self.backend(kind);
        backoff::retry(
            self.backoff(),
            |attempt, delay, e| self.on_retry(kind, key, attempt, delay, e),
            move || backend.remove(key),
        )
        .await
        .map_err(|f| Error::from_backend(kind, f.attempts, f.source))
    }

    async fn query_backend_quota(&self, kind: BackendKind) -> Result<BackendQuota> {
        let backend = self.backend(kind);
        backoff::retry(
            self.backoff(),
            |attempt, delay, e| self.on_retry(kind, "query_quota", attempt, delay, e),
            move || backend.query_quota(),
        )
        .await
        .map_err(|f| Error::from_backend(kind, f.attempts, f.source))
    }

    async fn read_meta(&self, kind: BackendKind) -> Result<Option<(VaultMeta, u64)>> {
        let Some(bytes) = self.get(kind, store::META_KEY).await? else {
            return Ok(None);
        };
        let meta = VaultMeta::decode(&bytes)?;
        Ok(Some((meta, item_cost(store::META_KEY, &bytes))))
    }

    async fn read_vault(&self, kind: BackendKind, meta: &VaultMeta) -> Result<LoadedVault> {
        let mut records = Vec::with_capacity(meta.total_chunks as usize);
        for index in 0..meta.total_chunks {
            records.push(self.get(kind, &store::chunk_key(index)).await?);
        }
        let stored = store::assemble(meta, records)?;

        let (diff, diff_key_exists, diff_bytes) = match self.get(kind, store::DIFF_KEY).await? {
            None => (None, false, 0),
            Some(bytes) => {
                let cost = item_cost(store::DIFF_KEY, &bytes);
                match store::decode_diff(&bytes) {
                    Ok(log) if log.base_checksum == meta.payload_checksum => (Some(log), true, cost),
                    Ok(log) => {
                        warn!(
                            backend = %kind,
                            base_checksum = log.base_checksum,
                            payload_checksum = meta.payload_checksum,
                            "ignoring diff log written against a different snapshot"
                        );
                        (None, true, cost)
                    }
                    Err(e) => {
                        warn!(backend = %kind, %e, "ignoring unreadable diff log");
                        (None, true, cost)
                    }
                }
            }
        };

        Ok(LoadedVault {
            stored,
            diff,
            diff_key_exists,
            diff_bytes,
        })
    }

    /// Startup: migrate a legacy vault if there is one, otherwise load the newest stored vault.
    async fn load(&self) -> Result<LoadReport> {
        let mut writer = self.writer.lock().await;

        let kinds: &[BackendKind] = if writer.sync_enabled {
            &[BackendKind::Synchronized, BackendKind::Local]
        } else {
            &[BackendKind::Local]
        };

        let mut found = vec![];
        let mut corrupt_meta = None;
        let mut readable = vec![];
        for &kind in kinds {
            match self.read_meta(kind).await {
                Ok(Some((meta, meta_bytes))) => {
                    writer
                        .layouts
                        .insert(kind, StoredLayout::from_meta(&meta, meta_bytes));
                    found.push(Found {
                        kind,
                        meta,
                        meta_bytes,
                    });
                    readable.push(kind);
                }
                Ok(None) => {
                    writer.layouts.insert(kind, StoredLayout::default());
                    readable.push(kind);
                }
                Err(e) if e.is_corruption() => {
                    error!(backend = %kind, %e, "stored vault meta is unreadable");
                    readable.push(kind);
                    corrupt_meta.get_or_insert(e);
                }
                Err(e) if kind == BackendKind::Synchronized => {
                    warn!(%e, "synchronized storage unavailable at startup, using local storage");
                    writer.fell_back = true;
                }
                Err(e) => return Err(e),
            }
        }

        // legacy keys
        let mut legacy = None;
        for &kind in &readable {
            let Some(bytes) = self.get(kind, store::LEGACY_KEY).await? else {
                continue;
            };
            if !found.is_empty() {
                info!(backend = %kind, "removing legacy vault superseded by a stored vault");
                self.remove(kind, store::LEGACY_KEY).await?;
            } else if corrupt_meta.is_none() && legacy.is_none() {
                legacy = Some((kind, bytes));
            }
        }
        if let Some((kind, bytes)) = legacy {
            let migrated = migration::parse_legacy(&bytes, self.time_provider.now())?;
            return self.migrate(&mut writer, kind, migrated).await;
        }

        // newest stored_at wins, the synchronized namespace on ties
        found.sort_by_key(|f| {
            std::cmp::Reverse((f.meta.stored_at, f.kind == BackendKind::Synchronized))
        });

        let mut report = LoadReport {
            backend: writer.active(),
            tier: writer.tier,
            source: LoadSource::Empty,
            diff_entries: 0,
            error: corrupt_meta,
        };
        for candidate in found {
            let kind = candidate.kind;
            if kind == BackendKind::Local && writer.sync_enabled {
                // the local copy is newer, so an earlier fallback is still in effect
                writer.fell_back = true;
            }
            match self.read_vault(kind, &candidate.meta).await {
                Ok(loaded) => {
                    let LoadedVault {
                        stored,
                        diff,
                        diff_key_exists,
                        diff_bytes,
                    } = loaded;
                    let diff_log = diff.unwrap_or_default();
                    report.diff_entries = diff_log.len();
                    report.source = LoadSource::Stored {
                        backend: kind,
                        tier: stored.tier,
                    };

                    writer.layouts.insert(
                        kind,
                        StoredLayout {
                            records: stored.record_checksums.iter().copied().map(Some).collect(),
                            has_diff: diff_key_exists,
                            vault_bytes: stored.chunk_bytes + diff_bytes + candidate.meta_bytes,
                            torn: false,
                        },
                    );
                    if kind == writer.active() {
                        writer.tier = stored.tier;
                    }

                    let now = self.time_provider.now();
                    *self.pending.lock() = Pending::new(
                        stored.snapshot,
                        DiffManager::with_log(&self.config, diff_log, now),
                    );
                    break;
                }
                Err(e) if e.is_corruption() => {
                    error!(backend = %kind, %e, "stored vault is unreadable, starting empty");
                    report.error = Some(e);
                    break;
                }
                Err(e) if kind == BackendKind::Synchronized => {
                    warn!(%e, "could not read the synchronized vault, trying local storage");
                    writer.fell_back = true;
                }
                Err(e) => return Err(e),
            }
        }

        report.backend = writer.active();
        report.tier = writer.tier;
        self.publish(&writer, SyncState::Idle);
        Ok(report)
    }

    /// Store a migrated legacy vault and remove the legacy key once the new meta is confirmed.
    async fn migrate(
        &self,
        writer: &mut Writer,
        legacy_kind: BackendKind,
        migrated: MigratedVault,
    ) -> Result<LoadReport> {
        let MigratedVault {
            from_version,
            snapshot,
        } = migrated;
        info!(
            backend = %legacy_kind,
            from_version,
            groups = snapshot.groups.len(),
            tabs = snapshot.tabs.len(),
            "migrating legacy vault"
        );

        let now = self.time_provider.now();
        *self.pending.lock() = Pending::new(snapshot, DiffManager::new(&self.config, now));

        let result = self.flush_locked(writer, FlushMode::Always).await;
        let outcome = self.finish_flush(writer, result)?;

        if self.read_meta(outcome.backend).await?.is_none() {
            return Err(migration::Error::Unconfirmed(outcome.backend).into());
        }
        self.remove(legacy_kind, store::LEGACY_KEY).await?;
        info!(backend = %outcome.backend, tier = %outcome.tier, "legacy vault migrated");

        Ok(LoadReport {
            backend: outcome.backend,
            tier: outcome.tier,
            source: LoadSource::Migrated { from_version },
            diff_entries: 0,
            error: None,
        })
    }

    fn publish(&self, writer: &Writer, state: SyncState) {
        self.status.send_modify(|s| {
            s.state = state;
            s.backend = writer.active();
            s.tier = writer.tier;
            s.fell_back = writer.fell_back;
        });
    }

    /// Publish the end of a flush, logging failures.
    fn finish_flush(
        &self,
        writer: &Writer,
        result: Result<VaultStorageOutcome>,
    ) -> Result<VaultStorageOutcome> {
        match &result {
            Ok(outcome) => self.status.send_modify(|s| {
                s.state = SyncState::Committed;
                s.backend = writer.active();
                s.tier = writer.tier;
                s.fell_back = writer.fell_back;
                s.quota = Some(outcome.quota);
                s.last_error = None;
            }),
            Err(e) => {
                error!(%e, "vault flush failed");
                let repair = writer.needs_repair();
                if repair {
                    warn!(
                        backend = %writer.active(),
                        "stored chunks no longer match the stored meta, scheduling another flush"
                    );
                    self.mutated.notify_one();
                }
                self.status.send_modify(|s| {
                    s.state = if repair {
                        SyncState::Debouncing
                    } else {
                        SyncState::Idle
                    };
                    s.backend = writer.active();
                    s.tier = writer.tier;
                    s.fell_back = writer.fell_back;
                    s.last_error = Some(e.to_string());
                });
            }
        }
        result
    }

    async fn flush(&self, mode: FlushMode) -> Result<VaultStorageOutcome> {
        let mut writer = self.writer.lock().await;
        let result = self.flush_locked(&mut writer, mode).await;
        self.finish_flush(&writer, result)
    }

    async fn flush_if_dirty(&self) -> Option<Result<VaultStorageOutcome>> {
        let mut writer = self.writer.lock().await;
        let dirty = self.pending.lock().diff.has_unflushed() || writer.needs_repair();
        if !dirty {
            self.publish(&writer, SyncState::Idle);
            return None;
        }
        let result = self.flush_locked(&mut writer, FlushMode::Always).await;
        Some(self.finish_flush(&writer, result))
    }

    /// Flush, lowering the tier and falling back to local storage until a write commits or
    /// there is nowhere left to go.
    async fn flush_locked(
        &self,
        writer: &mut Writer,
        mode: FlushMode,
    ) -> Result<VaultStorageOutcome> {
        let mut force_compact = mode == FlushMode::Compact;
        loop {
            let kind = writer.active();
            let tier = writer.tier;
            self.publish(writer, SyncState::Flushing);

            match self.write_once(writer, force_compact).await {
                Ok(outcome) => {
                    if kind == BackendKind::Synchronized
                        && outcome.quota.warning_level == WarningLevel::Critical
                    {
                        match tier.lower() {
                            Some(lower) => {
                                warn!(
                                    percentage = outcome.quota.percentage,
                                    from = %tier,
                                    to = %lower,
                                    "synchronized storage critically full, lowering tier"
                                );
                                writer.tier = lower;
                                force_compact = true;
                                self.publish(writer, SyncState::Downgrading);
                                continue;
                            }
                            None => warn!(
                                percentage = outcome.quota.percentage,
                                "synchronized storage critically full at the minimal tier"
                            ),
                        }
                    }
                    return Ok(outcome);
                }
                Err(e @ Error::QuotaExceeded { .. }) => match tier.lower() {
                    Some(lower) => {
                        warn!(%e, from = %tier, to = %lower, "lowering compression tier");
                        writer.tier = lower;
                        force_compact = true;
                        self.publish(writer, SyncState::Downgrading);
                    }
                    None if kind == BackendKind::Synchronized => self.fall_back(writer, &e),
                    None => return Err(e),
                },
                Err(e @ (Error::TransientTransport { .. } | Error::SyncUnavailable(_)))
                    if kind == BackendKind::Synchronized =>
                {
                    self.fall_back(writer, &e)
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fall_back(&self, writer: &mut Writer, e: &Error) {
        warn!(%e, "falling back to local storage");
        writer.fell_back = true;
        writer.tier = CompressionTier::Full;
        self.publish(writer, SyncState::FallingBack);
    }

    /// One attempt at committing the pending state to the active namespace at the current tier.
    async fn write_once(
        &self,
        writer: &mut Writer,
        force_compact: bool,
    ) -> Result<VaultStorageOutcome> {
        let kind = writer.active();
        let tier = writer.tier;
        let backend = self.backend(kind);
        let now = self.time_provider.now();
        let item_ceiling = backend.max_item_bytes().unwrap_or(usize::MAX);
        let max_chunk_bytes = chunk::chunk_size_for(item_ceiling, self.config.chunk_overhead_bytes);

        let (base, mut log, through) = {
            let pending = self.pending.lock();
            (
                Arc::clone(&pending.base),
                pending.diff.log().clone(),
                pending.diff.last_sequence(),
            )
        };

        let base_payload = PreparedPayload::new(&base, tier, max_chunk_bytes, now)?;
        let log_bytes = if log.is_empty() {
            0
        } else {
            store::encode_diff(&log, tier)?.len()
        };
        let compact = (force_compact && !log.is_empty())
            || log_bytes > item_ceiling.saturating_sub(store::DIFF_KEY.len())
            || self.pending.lock().diff.should_compact(
                log_bytes,
                base_payload.payload_len() as usize,
                now,
            );

        let (compacted, payload, diff_bytes) = if compact {
            let compacted = diff::apply_entries(&base, &log.entries);
            let payload = PreparedPayload::new(&compacted, tier, max_chunk_bytes, now)?;
            (Some(compacted), payload, None)
        } else if log.is_empty() {
            (None, base_payload, None)
        } else {
            log.base_checksum = base_payload.meta.payload_checksum;
            let diff_bytes = store::encode_diff(&log, tier)?;
            (None, base_payload, Some(diff_bytes))
        };
        let meta_bytes = payload.meta.encode()?;

        let new_vault_bytes = payload.chunk_bytes()
            + diff_bytes
                .as_ref()
                .map(|b| item_cost(store::DIFF_KEY, b))
                .unwrap_or_default()
            + item_cost(store::META_KEY, &meta_bytes);

        let mut layout = writer.layouts.remove(&kind).unwrap_or_default();
        let written = self
            .write_payload(
                kind,
                &mut layout,
                &payload,
                diff_bytes.as_ref(),
                &meta_bytes,
                new_vault_bytes,
            )
            .await;
        writer.layouts.insert(kind, layout);
        let (chunks_written, projected) = written?;

        // committed
        {
            let mut pending = self.pending.lock();
            if let Some(compacted) = compacted.as_ref() {
                pending.base = Arc::new(compacted.clone());
                pending.diff.discard_through(through, now);
                pending
                    .diff
                    .mark_flushed(DiffSequenceNumber::ZERO, payload.meta.payload_checksum);
            } else {
                pending
                    .diff
                    .mark_flushed(through, payload.meta.payload_checksum);
            }
        }

        let quota = match self.query_backend_quota(kind).await {
            Ok(quota) => self
                .monitor
                .evaluate(quota, self.config.reserved_settings_bytes),
            Err(e) => {
                warn!(%e, backend = %kind, "could not query quota after flush");
                projected
            }
        };

        info!(
            backend = %kind,
            %tier,
            compacted = compacted.is_some(),
            total_chunks = payload.meta.total_chunks,
            chunks_written,
            diff_entries = if compacted.is_some() { 0 } else { log.len() },
            percentage = quota.percentage,
            warning_level = %quota.warning_level,
            "vault flush committed"
        );

        Ok(VaultStorageOutcome {
            backend: kind,
            tier,
            fell_back: writer.fell_back,
            compacted: compacted.is_some(),
            total_chunks: payload.meta.total_chunks,
            chunks_written,
            quota,
        })
    }

    /// Write the chunks that changed, the diff log and the meta, in that order. `layout` is kept
    /// in step with what is physically stored even when a write fails part way.
    async fn write_payload(
        &self,
        kind: BackendKind,
        layout: &mut StoredLayout,
        payload: &PreparedPayload,
        diff_bytes: Option<&Bytes>,
        meta_bytes: &Bytes,
        new_vault_bytes: u64,
    ) -> Result<(usize, QuotaInfo)> {
        let quota = self.query_backend_quota(kind).await?;
        let projected = self.monitor.projected(
            quota,
            self.config.reserved_settings_bytes,
            layout.vault_bytes,
            new_vault_bytes,
        );
        if projected.is_exhausted() {
            return Err(Error::QuotaExceeded {
                backend: kind,
                reason: format!(
                    "writing {new_vault_bytes} bytes at {} would exceed the {} usable bytes",
                    payload.meta.compression_tier, projected.total
                ),
            });
        }

        let mut chunks_written = 0;
        for (index, (key, checksum, record)) in payload.records.iter().enumerate() {
            if layout.is_stored(index, *checksum) {
                continue;
            }
            self.set(kind, key, record).await?;
            layout.record_written(index, *checksum);
            layout.torn = true;
            chunks_written += 1;
        }

        match diff_bytes {
            Some(bytes) => {
                self.set(kind, store::DIFF_KEY, bytes).await?;
                layout.has_diff = true;
            }
            None if layout.has_diff => {
                self.remove(kind, store::DIFF_KEY).await?;
                layout.has_diff = false;
            }
            None => {}
        }

        self.set(kind, store::META_KEY, meta_bytes).await?;
        layout.vault_bytes = new_vault_bytes;
        layout.torn = false;

        let total = payload.records.len();
        for index in total..layout.records.len() {
            let key = store::chunk_key(index as u32);
            if let Err(e) = self.remove(kind, &key).await {
                warn!(%e, %key, "could not remove stale chunk");
            }
        }
        layout.records.truncate(total);

        Ok((chunks_written, projected))
    }
}

/// How often per idle compaction interval the background task checks whether one is due, which
/// bounds the delay past the interval to a fraction of it.
const IDLE_CHECKS_PER_INTERVAL: u32 = 4;

/// Debounces mutations into flushes and runs idle compaction until shutdown.
async fn background_flush(shared: Arc<Shared>) {
    let period = (shared.config.idle_compaction_interval / IDLE_CHECKS_PER_INTERVAL)
        .max(Duration::from_millis(1));
    let mut idle_check = tokio::time::interval(period);
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    idle_check.reset();

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.mutated.notified() => {
                if !debounce(&shared).await {
                    break;
                }
                // failures are logged and published by the flush itself
                let _ = shared.flush_if_dirty().await;
            }
            _ = idle_check.tick() => {
                let now = shared.time_provider.now();
                let due = shared.pending.lock().diff.idle_compaction_due(now);
                if due {
                    debug!("diff log idle, compacting");
                    let _ = shared.flush(FlushMode::Compact).await;
                }
            }
        }
    }
    debug!("vault background flush stopped");
}

/// Wait until no mutation has arrived for the debounce period. False on shutdown.
async fn debounce(shared: &Shared) -> bool {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return false,
            _ = shared.mutated.notified() => continue,
            _ = tokio::time::sleep(shared.config.debounce) => return true,
        }
    }
}
