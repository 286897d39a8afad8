//! `jobring`: job placement tool.
//!
//! Answers "which node runs this job?" the same way every scheduler process
//! in a group does, and can simulate a small group sharing a registry.
//!
//! # Usage
//!
//! ```text
//! jobring owner --members a,b,c job1 job2      # owner of each job
//! jobring owner --members a,b,c --node b job1  # does node b run job1?
//! jobring simulate -n 4 -j 12 -r 6             # in-process group with churn
//! jobring -c jobring.toml simulate             # with a config file
//! ```

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use jobring_cluster::{NodePool, RegistryDriver, SharedRegistry, StaticDriver};
use tracing::{info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "jobring", version, about = "Consistent-hash job placement")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long, global = true, env = "JOBRING_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the owner of each job for a fixed member list.
    Owner {
        /// Members of the group, comma separated.
        #[arg(short, long, value_delimiter = ',', required = true)]
        members: Vec<String>,

        /// Node to answer for (defaults to the first member).
        #[arg(long)]
        node: Option<String>,

        /// Override the configured virtual nodes per member.
        #[arg(long)]
        replicas: Option<usize>,

        /// Job names to place.
        #[arg(required = true)]
        jobs: Vec<String>,
    },

    /// Run several node pools over a shared registry and show ownership.
    Simulate {
        /// Number of nodes.
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Number of jobs.
        #[arg(short, long, default_value = "8")]
        jobs: usize,

        /// Number of rounds to report. One node leaves halfway through.
        #[arg(short, long, default_value = "4")]
        rounds: u32,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Owner {
            members,
            node,
            replicas,
            jobs,
        } => {
            if let Some(r) = replicas {
                config.pool.hash_replicas = r;
            }
            cmd_owner(&config, members, node, &jobs).await
        }
        Commands::Simulate {
            nodes,
            jobs,
            rounds,
        } => cmd_simulate(&config, nodes, jobs, rounds).await,
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// -----------------------------------------------------------------------
// jobring owner
// -----------------------------------------------------------------------

async fn cmd_owner(
    config: &CliConfig,
    members: Vec<String>,
    node: Option<String>,
    jobs: &[String],
) -> Result<()> {
    let members: Vec<String> = members
        .into_iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
    let Some(first) = members.first() else {
        bail!("at least one non-empty member is required");
    };
    let node = node.unwrap_or_else(|| first.clone());
    if !members.contains(&node) {
        warn!(%node, "node is not a member; it will own nothing");
    }

    let pool = NodePool::new(config.pool_config(), StaticDriver::new(node.clone(), members));
    pool.start().await?;

    for job in jobs {
        let owner = pool.owner_of(job).unwrap_or_else(|| "-".to_string());
        let mark = if pool.check_job_available(job) { "*" } else { " " };
        println!("{mark} {job} -> {owner}");
    }
    println!();
    println!("* = runs on {node}");

    pool.stop().await?;
    Ok(())
}

// -----------------------------------------------------------------------
// jobring simulate
// -----------------------------------------------------------------------

async fn cmd_simulate(config: &CliConfig, nodes: usize, jobs: usize, rounds: u32) -> Result<()> {
    if nodes == 0 {
        bail!("need at least one node");
    }

    let registry = SharedRegistry::new(config.stale_after());
    let job_names: Vec<String> = (0..jobs).map(|i| format!("job-{i}")).collect();
    let settle = config.refresh_interval() * 2;

    let mut pools = Vec::with_capacity(nodes);
    for _ in 0..nodes {
        let pool = NodePool::new(config.pool_config(), RegistryDriver::new(registry.clone()));
        pool.start().await?;
        pools.push(pool);
    }
    info!(nodes, service = %config.pool.service_name, "simulated group started");

    let leave_at = rounds / 2;
    for round in 0..rounds {
        if round == leave_at && pools.len() > 1 {
            let leaving = pools.remove(0);
            println!("-- {} leaves the group", leaving.node_id());
            leaving.stop().await?;
        }

        tokio::time::sleep(settle).await;

        println!("round {round}:");
        for job in &job_names {
            let claimants: Vec<String> = pools
                .iter()
                .filter(|p| p.check_job_available(job))
                .map(NodePool::node_id)
                .collect();
            let owner = match claimants.as_slice() {
                [] => "(unowned)".to_string(),
                [one] => one.clone(),
                many => format!("CONFLICT {}", many.join(", ")),
            };
            println!("  {job} -> {owner}");
        }
    }

    for pool in &pools {
        pool.stop().await?;
    }
    info!("simulated group stopped");
    Ok(())
}
