use super::common::VaultArgs;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {}

pub(crate) async fn command(vault_args: VaultArgs, _config: Config) -> anyhow::Result<()> {
    let (engine, _) = vault_args.open().await?;
    let backend = engine.status().backend;
    let quota = engine.query_quota().await;
    engine.shutdown().await;
    let quota = quota?;

    println!(
        "{backend}: {} of {} bytes used ({:.1}%), warning level {}",
        quota.used, quota.total, quota.percentage, quota.warning_level
    );
    Ok(())
}
