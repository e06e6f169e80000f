//! shardcoord operator binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use shardcoord::allocation::{rank_copies, FetchRound};
use shardcoord::common::{parse_id_list, Config};
use shardcoord::coordinator::{
    node_ids, reconfigure, NodeId, ReconfigurationSettings, VotingConfiguration,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardcoord")]
#[command(about = "Voting configuration and replica allocation decisions")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = shardcoord::common::config::DEFAULT_CONFIG_FILE)]
    config_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the next voting configuration
    Reconfigure {
        /// Live master-eligible nodes (comma-separated)
        #[arg(long)]
        live: String,

        /// Retired nodes (comma-separated)
        #[arg(long, default_value = "")]
        retired: String,

        /// Elected master
        #[arg(long)]
        master: String,

        /// Current voting configuration (comma-separated)
        #[arg(long, default_value = "")]
        config: String,

        /// Keep the configuration size even when nodes are lost
        #[arg(long)]
        no_auto_shrink: bool,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Rank the copies reported by a fetch round
    Select {
        /// Fetch round as JSON
        #[arg(long)]
        round: PathBuf,

        /// Node the shard is currently recovering towards
        #[arg(long)]
        current: Option<String>,

        /// Nodes to skip (comma-separated)
        #[arg(long, default_value = "")]
        exclude: String,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

fn ids(list: &str) -> BTreeSet<NodeId> {
    node_ids(parse_id_list(list))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load_from(&cli.config_file)
        .with_context(|| format!("loading {}", cli.config_file.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Reconfigure {
            live,
            retired,
            master,
            config: current,
            no_auto_shrink,
            json,
        } => {
            let current = Arc::new(VotingConfiguration::new(ids(&current)));
            let settings = ReconfigurationSettings::auto_shrink(
                config.coordination.auto_shrink_voting_configuration && !no_auto_shrink,
            );
            let next = reconfigure(
                &ids(&live),
                &ids(&retired),
                &NodeId::new(master),
                &current,
                settings,
            )?;
            let changed = !Arc::ptr_eq(&next, &current);

            if json {
                let out = serde_json::json!({
                    "changed": changed,
                    "current": current.node_ids(),
                    "next": next.node_ids(),
                    "auto_shrink": settings.auto_shrink,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if changed {
                println!("changed {} -> {}", current, next);
            } else {
                println!("unchanged {}", current);
            }
        }
        Commands::Select {
            round,
            current,
            exclude,
            json,
        } => {
            let raw = std::fs::read_to_string(&round)
                .with_context(|| format!("reading {}", round.display()))?;
            let round: FetchRound = serde_json::from_str(&raw)?;
            let primary = round
                .primary_info()
                .with_context(|| format!("primary {} reported no copy", round.primary))?;
            let excluded = ids(&exclude);
            let current = current.map(NodeId::new);
            let ranked = rank_copies(&round, &primary, current.as_ref(), |node| {
                excluded.contains(node)
            });

            if json {
                println!("{}", serde_json::to_string_pretty(&ranked)?);
            } else if ranked.is_empty() {
                println!("no eligible copy for {}", round.shard);
            } else {
                for (rank, copy) in ranked.iter().enumerate() {
                    println!(
                        "{}. {} noop={} matched_ops={}{}",
                        rank + 1,
                        copy.node,
                        copy.noop,
                        copy.matched_ops,
                        if copy.current { " (current)" } else { "" }
                    );
                }
            }
        }
    }

    Ok(())
}
