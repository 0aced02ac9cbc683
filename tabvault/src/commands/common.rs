use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tabvault_backend::BackendKind;
use tabvault_backend::file::FileBackend;
use tabvault_clap_blocks::storage::VaultStorageConfig;
use tabvault_engine::{LoadReport, LoadSource, VaultEngine, VaultEngineArgs, VaultStorageOutcome};
use tabvault_time::SystemProvider;
use tracing::warn;

/// Where the vault lives and how it is written.
#[derive(Debug, Clone, clap::Parser)]
pub(crate) struct VaultArgs {
    /// Directory holding the `local` and `sync` namespaces
    #[clap(
        long = "data-dir",
        env = "TABVAULT_DATA_DIR",
        default_value = ".tabvault"
    )]
    pub(crate) data_dir: PathBuf,

    /// Keep the vault in the synchronized namespace
    #[clap(long = "sync-enabled", env = "TABVAULT_SYNC_ENABLED", action)]
    pub(crate) sync_enabled: bool,

    #[clap(flatten)]
    pub(crate) storage: VaultStorageConfig,
}

impl VaultArgs {
    pub(crate) async fn open(&self) -> anyhow::Result<(VaultEngine, LoadReport)> {
        self.open_with_sync(self.sync_enabled).await
    }

    pub(crate) async fn open_with_sync(
        &self,
        sync_enabled: bool,
    ) -> anyhow::Result<(VaultEngine, LoadReport)> {
        let local = FileBackend::open(BackendKind::Local, self.data_dir.join("local"), None)
            .await
            .context("opening the local namespace")?;
        let sync = FileBackend::open(
            BackendKind::Synchronized,
            self.data_dir.join("sync"),
            Some(self.storage.sync_limits()),
        )
        .await
        .context("opening the synchronized namespace")?;

        let (engine, report) = VaultEngine::open(VaultEngineArgs {
            config: self.storage.vault_config(),
            time_provider: Arc::new(SystemProvider::new()),
            local: Arc::new(local),
            sync: Arc::new(sync),
            sync_enabled,
        })
        .await
        .with_context(|| format!("opening the vault in {}", self.data_dir.display()))?;

        if let Some(e) = &report.error {
            warn!(%e, "stored vault is unreadable");
            eprintln!("warning: the stored vault is unreadable and was ignored: {e}");
        }
        Ok((engine, report))
    }
}

pub(crate) fn describe_source(source: LoadSource) -> String {
    match source {
        LoadSource::Empty => "empty".to_string(),
        LoadSource::Stored { backend, tier } => format!("stored in {backend} at {tier}"),
        LoadSource::Migrated { from_version } => format!("migrated from version {from_version}"),
    }
}

pub(crate) fn describe_outcome(outcome: &VaultStorageOutcome) -> String {
    let mut out = format!(
        "stored in {} at {}: {} of {} chunks written, {:.1}% of quota used ({})",
        outcome.backend,
        outcome.tier,
        outcome.chunks_written,
        outcome.total_chunks,
        outcome.quota.percentage,
        outcome.quota.warning_level,
    );
    if outcome.fell_back {
        out.push_str(", synchronized storage unusable, fell back to local");
    }
    out
}
