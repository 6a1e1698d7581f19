// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

// DAG consensus simulator
//
// Runs a set of validators in one process, connected by an in-memory
// network, and logs what they order.
//
// Usage:
//   cargo run --bin dag-node -- --validators 4 --rounds 50 --config dag.toml
//
// Architecture:
//   1. Parse command-line arguments
//   2. Initialize logging
//   3. Load and validate the engine configuration
//   4. Wire every validator (store, handlers, fetch service, driver)
//   5. Run until ctrl-c or until every validator passed the round limit

use anyhow::{bail, Context, Result};
use dag_consensus_core::{testing::LocalCluster, DagConfig};
use dag_consensus_traits::Round;
use log::{info, LevelFilter};
use std::{path::PathBuf, time::Duration};
use tokio::signal;

/// Default number of simulated validators
const DEFAULT_VALIDATORS: usize = 4;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Interval between progress reports
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Simulator command-line arguments.
#[derive(Debug, Clone)]
struct NodeArgs {
    /// Engine configuration file (TOML); defaults apply when absent
    config_path: Option<PathBuf>,
    validators: usize,
    /// Stop after this round; run until ctrl-c when absent
    rounds: Option<Round>,
    log_level: String,
}

impl Default for NodeArgs {
    fn default() -> Self {
        Self {
            config_path: None,
            validators: DEFAULT_VALIDATORS,
            rounds: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl NodeArgs {
    fn from_args() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut parsed = Self::default();

        let mut i = 1;
        while i < args.len() {
            let value = || {
                args.get(i + 1)
                    .with_context(|| format!("Missing value for {}", args[i]))
            };
            match args[i].as_str() {
                "--config" | "-c" => {
                    parsed.config_path = Some(PathBuf::from(value()?));
                    i += 2;
                }
                "--validators" | "-n" => {
                    let raw = value()?;
                    parsed.validators = raw
                        .parse()
                        .with_context(|| format!("Invalid validator count: {}", raw))?;
                    i += 2;
                }
                "--rounds" | "-r" => {
                    let raw = value()?;
                    parsed.rounds = Some(
                        raw.parse()
                            .with_context(|| format!("Invalid round limit: {}", raw))?,
                    );
                    i += 2;
                }
                "--log-level" => {
                    parsed.log_level = value()?.clone();
                    i += 2;
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                flag => bail!("Unknown flag or argument: {}", flag),
            }
        }

        if parsed.validators == 0 {
            bail!("--validators must be at least 1");
        }
        Ok(parsed)
    }
}

fn print_usage() {
    println!("DAG consensus simulator v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("    dag-node [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>        Engine configuration file (TOML)");
    println!("    -n, --validators <N>       Number of validators [default: {}]", DEFAULT_VALIDATORS);
    println!("    -r, --rounds <ROUND>       Stop once every validator passed this round");
    println!("        --log-level <LEVEL>    Log level (trace|debug|info|warn|error) [default: {}]", DEFAULT_LOG_LEVEL);
    println!("    -h, --help                 Print this help information");
}

fn init_logging(level: &str) -> Result<()> {
    let filter: LevelFilter = level
        .parse()
        .with_context(|| format!("Invalid log level: {}", level))?;
    env_logger::Builder::new()
        .filter_level(filter)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<DagConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<DagConfig>(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        }
        None => DagConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn report(cluster: &LocalCluster) {
    for node in cluster.nodes() {
        let snapshot = node.dag().snapshot();
        info!(
            "Validator {} {} | rounds {}..={} | {} nodes | next commit index {}",
            node.author(),
            node.state(),
            snapshot.lowest_round(),
            snapshot.highest_round(),
            snapshot.len(),
            node.inserter().next_commit_index()
        );
    }
}

fn finished(cluster: &LocalCluster, limit: Option<Round>) -> bool {
    limit.is_some_and(|limit| {
        cluster
            .nodes()
            .iter()
            .all(|node| node.state().round() > limit)
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = NodeArgs::from_args()?;
    init_logging(&args.log_level)?;
    let config = load_config(args.config_path.as_ref())?;
    info!(
        "Starting {} validators (protocol v{}) with {:?}",
        args.validators,
        dag_consensus_core::DAG_PROTOCOL_VERSION,
        config
    );

    let mut cluster = LocalCluster::with_round_limit(args.validators, &config, args.rounds)?;
    cluster.start();

    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                info!("Received ctrl-c, shutting down");
                break;
            }
            _ = ticker.tick() => {
                report(&cluster);
                if finished(&cluster, args.rounds) {
                    info!("Every validator passed the round limit");
                    break;
                }
            }
        }
    }

    report(&cluster);
    cluster.shutdown().await;
    Ok(())
}
