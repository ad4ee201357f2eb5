use std::sync::Arc;

use anyhow::Context;
use civpds_server::{Node, NodeConfig, PdsServer};
use civpds_types::{Tid, Uid};
use colored::Colorize;
use serde::Serialize;
use tracing::info;

use crate::cli::*;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    display_name: String,
}

fn load_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    match &cli.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}

async fn open_node(config: NodeConfig) -> anyhow::Result<Node> {
    Node::open(config).await.context("opening node")
}

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Serve(args) => cmd_serve(config, args).await,
        Command::InitActor(args) => cmd_init_actor(config, args).await,
        Command::Compact(args) => cmd_compact(config, args).await,
        Command::Export(args) => cmd_export(config, args).await,
        Command::Config(args) => cmd_config(config, args),
    }
}

async fn cmd_serve(mut config: NodeConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }
    let node = Arc::new(open_node(config).await?);

    let token = node.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            token.cancel();
        }
    });

    let result = PdsServer::new(node.clone()).serve().await;
    node.shutdown().await;
    result.context("serving")
}

async fn cmd_init_actor(config: NodeConfig, args: InitActorArgs) -> anyhow::Result<()> {
    let node = open_node(config).await?;
    let actor = Uid::new(args.actor);
    let profile = Profile {
        display_name: args.display_name,
    };
    let did = node
        .repos()
        .create_account(actor, &args.handle, &args.endpoint, &profile)
        .await
        .context("creating account")?;
    let head = node.repos().get_actor_repo_head(actor).await?;
    node.shutdown().await;

    println!("{} Created actor {}", "✓".green().bold(), actor.to_string().bold());
    println!("  DID:  {}", did.to_string().cyan());
    println!("  Head: {}", head.to_string().yellow());
    Ok(())
}

async fn cmd_compact(config: NodeConfig, args: CompactArgs) -> anyhow::Result<()> {
    let min_shards = args.min_shards.unwrap_or(config.storage.compact_min_shards);
    let node = open_node(config).await?;
    let reports = match args.actor {
        Some(actor) => node
            .repos()
            .compact(Uid::new(actor), min_shards)
            .await?
            .into_iter()
            .collect(),
        None => node.repos().compact_all(min_shards).await?,
    };
    node.shutdown().await;

    if reports.is_empty() {
        println!("Nothing to compact (threshold {min_shards} shards).");
    }
    for report in reports {
        println!(
            "{} actor {}: {} shards -> 1 ({} blocks, {} bytes)",
            "✓".green(),
            report.actor.to_string().bold(),
            report.shards_before,
            report.blocks_kept,
            report.bytes_written
        );
    }
    Ok(())
}

async fn cmd_export(config: NodeConfig, args: ExportArgs) -> anyhow::Result<()> {
    let since = args
        .since
        .as_deref()
        .map(Tid::parse)
        .transpose()
        .context("parsing --since")?;
    let node = open_node(config).await?;
    let mut file = tokio::fs::File::create(&args.out)
        .await
        .with_context(|| format!("creating {}", args.out.display()))?;
    node.repos()
        .read_repo(Uid::new(args.actor), since.as_ref(), &mut file)
        .await
        .context("exporting repo")?;
    node.shutdown().await;
    println!(
        "{} Wrote actor {} to {}",
        "✓".green().bold(),
        args.actor,
        args.out.display().to_string().bold()
    );
    Ok(())
}

fn cmd_config(config: NodeConfig, args: ConfigArgs) -> anyhow::Result<()> {
    let config = if args.print_default {
        NodeConfig::default()
    } else {
        config
    };
    print!("{}", config.to_toml()?);
    Ok(())
}
