use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use warden_kernel::config::{NodeConfig, NodeRole};
use warden_kernel::log::{InMemoryEventLog, LogEntry, Revision};
use warden_kernel::pdp::OperationRegistry;
use warden_kernel::replay::replay_entries;
use warden_kernel::service::{AdminNode, AdminStart, BootstrapSource};
use warden_kernel::simulate::{run_cluster, ScriptedCall};
use warden_kernel::state::{MemoryPolicyStore, PolicyStore};

/// Warden policy replication CLI
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Policy administration replication tools", long_about = None)]
struct Cli {
    /// Path to node config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay an exported event log into an empty policy and print it
    Replay {
        /// Path to a JSON array of log entries
        #[arg(long)]
        log: PathBuf,
    },

    /// Run a one-shot bootstrap and export the resulting log
    Bootstrap {
        /// Policy source; overrides the config's bootstrap_path
        #[arg(long)]
        source: Option<PathBuf>,

        /// Write the log entries here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run an in-process admin and resource cluster over a scripted workload
    Simulate {
        /// Policy source applied at startup
        #[arg(long)]
        bootstrap: PathBuf,

        /// Path to a JSON array of `{ user, name, args }` calls
        #[arg(long)]
        script: Option<PathBuf>,

        /// Number of resource nodes
        #[arg(long, default_value_t = 2)]
        replicas: usize,
    },
}

/// Wrapper for replay JSON output
#[derive(Debug, Serialize)]
struct ReplayOutput {
    revision: Revision,
    nodes: usize,
    policy: serde_json::Value,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => NodeConfig::from_path(path)?,
        None => {
            let mut config = NodeConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };

    match cli.command {
        Command::Replay { log } => replay(&log),
        Command::Bootstrap { source, out } => bootstrap(config, source, out.as_deref()),
        Command::Simulate {
            bootstrap,
            script,
            replicas,
        } => simulate(&config, &bootstrap, script.as_deref(), replicas),
    }
}

/// `WARDEN_LOG` wins over `-v`.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("WARDEN_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn replay(path: &Path) -> Result<()> {
    let data =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let entries: Vec<LogEntry> = serde_json::from_str(&data)?;

    let mut store = MemoryPolicyStore::new();
    let revision = replay_entries(&mut store, &entries)?;
    tracing::info!("replayed {} entries through revision {revision}", entries.len());

    let output = ReplayOutput {
        revision,
        nodes: store.graph().node_count(),
        policy: serde_json::from_slice(&store.to_snapshot()?)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn bootstrap(mut config: NodeConfig, source: Option<PathBuf>, out: Option<&Path>) -> Result<()> {
    if config.role != NodeRole::Admin {
        bail!("bootstrap only runs on an admin node");
    }
    if let Some(source) = source {
        config.bootstrap_path = Some(source);
    }
    if config.bootstrap_path.is_none() {
        bail!("no bootstrap source: pass --source or set bootstrap_path");
    }
    config.shutdown_after_bootstrap = true;

    let log = Arc::new(InMemoryEventLog::new());
    let started = AdminNode::start(
        &config,
        log.clone(),
        MemoryPolicyStore::new(),
        OperationRegistry::new(),
    )?;
    let revision = match started {
        AdminStart::Bootstrapped(revision) => revision,
        AdminStart::Running(node) => {
            node.shutdown();
            bail!("admin node kept running after bootstrap");
        }
    };
    tracing::info!("bootstrap complete at revision {revision}");

    let entries = serde_json::to_string_pretty(&log.entries())?;
    match out {
        Some(path) => {
            fs::write(path, entries).with_context(|| format!("writing {}", path.display()))?
        }
        None => println!("{entries}"),
    }
    Ok(())
}

fn simulate(
    config: &NodeConfig,
    bootstrap: &Path,
    script: Option<&Path>,
    replicas: usize,
) -> Result<()> {
    let source = BootstrapSource::read(bootstrap)?;
    let calls: Vec<ScriptedCall> = match script {
        Some(path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&data)?
        }
        None => Vec::new(),
    };

    let report = run_cluster(config, &source, &calls, replicas)?;
    if !report.converged() {
        tracing::warn!("cluster did not converge at revision {}", report.tail);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
