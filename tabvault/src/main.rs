//! Entrypoint of the tabvault binary

use dotenvy::dotenv;
use tabvault_clap_blocks::logging::LoggingConfig;

mod commands {
    pub(crate) mod common;
    pub(crate) mod compact;
    pub(crate) mod import;
    pub(crate) mod quota;
    pub(crate) mod show;
    pub(crate) mod sync;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "tabvault",
    version,
    about = "Inspect and maintain a tab vault",
    long_about = r#"Inspect and maintain a tab vault

The vault lives in a data directory holding two namespaces: `local`, and `sync`, which stands in
for the quota-limited synchronized storage area.

Examples:
    # Import a vault export, migrating legacy formats
    tabvault --data-dir ~/.tabvault import vault.json

    # Print the vault
    tabvault --data-dir ~/.tabvault show

    # Move the vault into the synchronized namespace
    tabvault --data-dir ~/.tabvault sync on

    # Show what the synchronized namespace has left, with debug logging
    LOG_FILTER=debug tabvault --data-dir ~/.tabvault --sync-enabled quota
"#
)]
struct Config {
    #[clap(flatten)]
    logging_config: LoggingConfig,

    #[clap(flatten)]
    vault_args: commands::common::VaultArgs,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Print the groups and tabs in the vault
    Show(commands::show::Config),

    /// Print the quota of the namespace the vault is stored in
    Quota(commands::quota::Config),

    /// Merge a vault export into the vault and flush it
    Import(commands::import::Config),

    /// Fold the pending diff log into the stored snapshot
    Compact(commands::compact::Config),

    /// Move the vault into or out of the synchronized namespace
    Sync(commands::sync::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    if let Err(e) = config.logging_config.install() {
        eprintln!("Initializing logs failed: {e}");
        std::process::exit(ReturnCode::Failure as _);
    }

    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tokio_runtime.block_on(async move {
        let Config {
            vault_args,
            command,
            ..
        } = config;

        let (name, result) = match command {
            None => {
                println!("command required, -h/--help for help");
                return;
            }
            Some(Command::Show(config)) => {
                ("Show", commands::show::command(vault_args, config).await)
            }
            Some(Command::Quota(config)) => {
                ("Quota", commands::quota::command(vault_args, config).await)
            }
            Some(Command::Import(config)) => {
                ("Import", commands::import::command(vault_args, config).await)
            }
            Some(Command::Compact(config)) => {
                ("Compact", commands::compact::command(vault_args, config).await)
            }
            Some(Command::Sync(config)) => {
                ("Sync", commands::sync::command(vault_args, config).await)
            }
        };

        if let Err(e) = result {
            eprintln!("{name} command failed: {e:#}");
            std::process::exit(ReturnCode::Failure as _)
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // Ignore this - a missing env file is not an error, defaults will
            // be applied when initialising the Config struct.
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}
