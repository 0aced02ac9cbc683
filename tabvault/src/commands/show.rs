use super::common::{VaultArgs, describe_source};
use anyhow::Context;
use tabvault_types::Tab;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// Print the whole snapshot as JSON
    #[clap(long = "json", action)]
    json: bool,
}

pub(crate) async fn command(vault_args: VaultArgs, config: Config) -> anyhow::Result<()> {
    let (engine, report) = vault_args.open().await?;
    let snapshot = engine.snapshot();
    engine.shutdown().await;

    if config.json {
        let json =
            serde_json::to_string_pretty(snapshot.as_ref()).context("encoding the snapshot")?;
        println!("{json}");
        return Ok(());
    }

    println!(
        "vault in {} at {} ({}), {} groups, {} tabs",
        report.backend,
        report.tier,
        describe_source(report.source),
        snapshot.groups.len(),
        snapshot.tabs.len()
    );
    for group in &snapshot.groups {
        let title = if group.title.is_empty() {
            "(untitled)"
        } else {
            group.title.as_str()
        };
        let color = group.color.as_deref().unwrap_or("grey");
        let collapsed = if group.collapsed { ", collapsed" } else { "" };
        println!("{title} [{color}{collapsed}]");
        snapshot.tabs_in_group(&group.id).for_each(print_tab);
    }

    let ungrouped: Vec<_> = snapshot
        .tabs
        .iter()
        .filter(|t| {
            t.group_id
                .as_deref()
                .is_none_or(|id| snapshot.group(id).is_none())
        })
        .collect();
    if !ungrouped.is_empty() {
        println!("(ungrouped)");
        ungrouped.into_iter().for_each(print_tab);
    }
    Ok(())
}

fn print_tab(tab: &Tab) {
    let pinned = if tab.pinned { "* " } else { "  " };
    if tab.title.is_empty() {
        println!("  {pinned}{}", tab.url);
    } else {
        println!("  {pinned}{} <{}>", tab.title, tab.url);
    }
}
