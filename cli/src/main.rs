//! nodepool CLI — inspect endpoint addresses and simulate pool failover.
//!
//! Usage:
//! ```bash
//! # Show TLS/plaintext forms of an address
//! nodepool address 35.237.200.180:50211
//!
//! # Replay random failures against a topology file
//! nodepool simulate --config network.json --requests 500 --failure-rate 0.2
//!
//! # Build mirror channels for every configured mirror node
//! nodepool mirror --config network.json
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::process;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use nodepool_core::{EndpointAddress, ManagedNode, Network, NodeSummary, PoolConfig, PoolError};
use nodepool_mirror::{ChannelPurpose, MirrorPool};

/// Topology file layout.
#[derive(Debug, Deserialize)]
struct NetworkFile {
    #[serde(default)]
    config: PoolConfig,
    /// `host:port` → node key.
    #[serde(default)]
    network: HashMap<String, String>,
    #[serde(default)]
    mirror_network: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "address" => cmd_address(&args[2..]),
        "simulate" => cmd_simulate(&args[2..]),
        "mirror" => cmd_mirror(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("nodepool {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("nodepool {}", env!("CARGO_PKG_VERSION"));
    println!("Inspect endpoints and simulate node pool failover\n");
    println!("USAGE:");
    println!("    nodepool <COMMAND>\n");
    println!("COMMANDS:");
    println!("    address    Show secure/insecure forms of a host:port");
    println!("    simulate   Replay random request failures against a network");
    println!("    mirror     Build mirror channels for a mirror network");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("SIMULATE FLAGS:");
    println!("    --config <FILE>         JSON topology file  [required]");
    println!("    --requests <N>          Requests to replay  [default: 200]");
    println!("    --failure-rate <P>      Failure probability [default: 0.1]");
    println!("    --seed <N>              RNG seed            [default: 0]");
}

fn cmd_address(args: &[String]) -> Result<()> {
    let Some(raw) = args.first() else {
        bail!("address argument is required");
    };
    let addr = EndpointAddress::parse(raw)?;

    println!("  Host:      {}", addr.host());
    println!("  Port:      {}", addr.port());
    println!("  Secure:    {}", addr.is_secure());
    println!("  TLS:       {}", addr.to_secure());
    println!("  Plaintext: {}", addr.to_insecure());
    Ok(())
}

fn cmd_simulate(args: &[String]) -> Result<()> {
    let file = load_network(args)?;
    let requests: usize = parse_flag_or(args, "--requests", 200)?;
    let failure_rate: f64 = parse_flag_or(args, "--failure-rate", 0.1)?;
    let seed: u64 = parse_flag_or(args, "--seed", 0)?;
    if !(0.0..=1.0).contains(&failure_rate) {
        bail!("--failure-rate must be between 0 and 1");
    }
    if file.network.is_empty() {
        bail!("network is empty");
    }

    let network = Network::new(file.config)?.with_rng(StdRng::seed_from_u64(seed));
    network.set_topology(&file.network)?;
    tracing::info!(nodes = network.len(), seed, "network loaded");

    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let (mut ok, mut failed, mut exhausted) = (0usize, 0usize, 0usize);
    for _ in 0..requests {
        let node = match network.get_node() {
            Ok(node) => node,
            Err(PoolError::NoHealthyNodes) => {
                exhausted += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        node.mark_in_use();
        if rng.gen_bool(failure_rate) {
            network.increase_backoff(&node);
            failed += 1;
        } else {
            network.decrease_backoff(&node);
            ok += 1;
        }
    }

    println!("Replayed {requests} requests against {} nodes", network.len());
    println!("  Succeeded:        {ok}");
    println!("  Failed:           {failed}");
    println!("  No healthy node:  {exhausted}");
    println!("  Nodes per tx:     {}", network.number_of_nodes_for_transaction());
    println!();
    print_summary(&network.health_summary());

    network.close()?;
    Ok(())
}

fn cmd_mirror(args: &[String]) -> Result<()> {
    let file = load_network(args)?;
    if file.mirror_network.is_empty() {
        bail!("mirror_network is empty");
    }

    let pool = MirrorPool::new(file.config)?;
    pool.set_network(&file.mirror_network)?;
    tracing::info!(mirrors = pool.network().len(), "mirror network loaded");

    for node in pool.pool().nodes() {
        println!("{}", node.key());
        for purpose in ChannelPurpose::ALL {
            let channel = node.channel(purpose)?;
            let keep_alive = purpose.keep_alive();
            println!(
                "  {:<10} {}  (ping every {}s)",
                purpose.to_string(),
                channel.endpoint(),
                keep_alive.interval.as_secs()
            );
        }
    }

    pool.close()?;
    Ok(())
}

fn print_summary(summary: &[NodeSummary]) {
    println!(
        "  {:<12} {:<24} {:<8} {:>10} {:>8} {:>6}",
        "KEY", "ADDRESS", "HEALTHY", "BACKOFF", "ATTEMPTS", "USES"
    );
    for s in summary {
        println!(
            "  {:<12} {:<24} {:<8} {:>9}s {:>8} {:>6}",
            s.key,
            s.address,
            s.healthy,
            s.current_backoff.as_secs(),
            s.attempts,
            s.use_count
        );
    }
}

fn load_network(args: &[String]) -> Result<NetworkFile> {
    let path = parse_flag(args, "--config").context("--config is required")?;
    let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let file: NetworkFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    file.config.validate()?;
    Ok(file)
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_flag_or<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> Result<T> {
    match parse_flag(args, flag) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {flag}: {raw}")),
        None => Ok(default),
    }
}
