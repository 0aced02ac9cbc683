use super::common::{VaultArgs, describe_outcome};
use anyhow::Context;
use std::path::PathBuf;
use tabvault_engine::migration;
use tabvault_time::{SystemProvider, TimeProvider};
use tabvault_types::{VAULT_SCHEMA_VERSION, VaultOp, VaultSnapshot};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// JSON file holding a vault snapshot, or a legacy vault in version 1 or 2 format
    #[clap(value_name = "FILE")]
    file: PathBuf,
}

pub(crate) async fn command(vault_args: VaultArgs, config: Config) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&config.file)
        .await
        .with_context(|| format!("reading {}", config.file.display()))?;
    let imported = parse(&bytes).with_context(|| format!("parsing {}", config.file.display()))?;

    let (engine, _) = vault_args.open().await?;
    for group in imported.groups {
        engine.apply(VaultOp::add_group(group));
    }
    let tabs = imported.tabs.len();
    for tab in imported.tabs {
        engine.apply(VaultOp::add_tab(tab));
    }
    let outcome = engine.flush_now().await;
    engine.shutdown().await;
    let outcome = outcome?;

    let snapshot_tabs = engine.snapshot().tabs.len();
    println!(
        "imported {tabs} tabs, the vault now holds {snapshot_tabs} tabs, {}",
        describe_outcome(&outcome)
    );
    Ok(())
}

fn parse(bytes: &[u8]) -> anyhow::Result<VaultSnapshot> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let version = value.get("version").and_then(serde_json::Value::as_u64);
    if version == Some(u64::from(VAULT_SCHEMA_VERSION)) {
        return Ok(serde_json::from_value(value)?);
    }
    Ok(migration::parse_legacy(bytes, SystemProvider::new().now())?.snapshot)
}
