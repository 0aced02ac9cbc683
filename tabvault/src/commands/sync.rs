use super::common::{VaultArgs, describe_outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Toggle {
    On,
    Off,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// `on` moves the vault into the synchronized namespace, `off` into the local one
    #[clap(value_enum)]
    toggle: Toggle,
}

pub(crate) async fn command(vault_args: VaultArgs, config: Config) -> anyhow::Result<()> {
    // both namespaces are read so the newest vault is the one that moves
    let (engine, _) = vault_args.open_with_sync(true).await?;
    let outcome = engine.set_sync_enabled(config.toggle == Toggle::On).await;
    engine.shutdown().await;
    let outcome = outcome?;

    println!("{}", describe_outcome(&outcome));
    Ok(())
}
