use super::common::{VaultArgs, describe_outcome};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {}

pub(crate) async fn command(vault_args: VaultArgs, _config: Config) -> anyhow::Result<()> {
    let (engine, report) = vault_args.open().await?;
    let outcome = engine.compact_now().await;
    engine.shutdown().await;
    let outcome = outcome?;

    println!(
        "compacted {} diff entries, {}",
        report.diff_entries,
        describe_outcome(&outcome)
    );
    Ok(())
}
