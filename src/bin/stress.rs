//! Registry Stress CLI
//!
//! Hammers registries wired into cyclic or diamond-shaped dependency graphs
//! from several threads and reports whether every transaction finished
//! before the deadline.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use familiar_registry::{Entry, EngineConfig, Registry};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "registry-stress")]
#[command(about = "Lock liveness stress test for dependent registries")]
struct Cli {
    /// Path to an engine config file
    #[arg(short, long)]
    config: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand)]
enum Scenario {
    /// Two registries depending on each other
    Cycle(Load),
    /// top -> (left, right) -> bottom
    Diamond(Load),
}

#[derive(Args, Clone, Copy)]
struct Load {
    /// Worker threads
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Updates per worker
    #[arg(short, long, default_value_t = 50)]
    rounds: usize,

    /// Seconds before the run is declared stuck
    #[arg(long, default_value_t = 60)]
    deadline: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct Counter {
    name: String,
    value: u64,
}

impl Entry for Counter {
    type Key = String;

    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Serialize)]
struct StressReport {
    scenario: &'static str,
    threads: usize,
    rounds: usize,
    operations: usize,
    elapsed_ms: u128,
    cycles: Vec<Vec<String>>,
    dependency_order: Option<Vec<String>>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::load_from(cli.config.as_deref()).context("loading engine config")?;

    let (name, load, registries) = match cli.scenario {
        Scenario::Cycle(load) => ("cycle", load, cycle(&config)?),
        Scenario::Diamond(load) => ("diamond", load, diamond(&config)?),
    };

    let started = Instant::now();
    let operations = hammer(&registries, load)?;

    let root = &registries[0];
    let topology = root.dependency_topology();
    let report = StressReport {
        scenario: name,
        threads: load.threads,
        rounds: load.rounds,
        operations,
        elapsed_ms: started.elapsed().as_millis(),
        cycles: topology.cycles(),
        dependency_order: topology.dependency_order(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("🔒 Registry Stress: {}", report.scenario);
        println!("  Threads:    {}", report.threads);
        println!("  Operations: {}", report.operations);
        println!("  Elapsed:    {} ms", report.elapsed_ms);
        if report.cycles.is_empty() {
            println!("  Cycles:     none");
        } else {
            for cycle in &report.cycles {
                println!("  Cycle:      {}", cycle.join(" <-> "));
            }
        }
        println!("✅ All transactions completed");
    }

    for registry in &registries {
        registry.shutdown()?;
    }
    Ok(())
}

fn counter_registry(config: &EngineConfig, name: &str) -> anyhow::Result<Arc<Registry<Counter>>> {
    let registry = Registry::builder(name).config(config).build();
    registry.register(Counter {
        name: name.to_string(),
        value: 0,
    })?;
    Ok(registry)
}

fn cycle(config: &EngineConfig) -> anyhow::Result<Vec<Arc<Registry<Counter>>>> {
    let a = counter_registry(config, "a")?;
    let b = counter_registry(config, "b")?;
    a.register_dependency(b.clone())?;
    b.register_dependency(a.clone())?;
    Ok(vec![a, b])
}

fn diamond(config: &EngineConfig) -> anyhow::Result<Vec<Arc<Registry<Counter>>>> {
    let top = counter_registry(config, "top")?;
    let left = counter_registry(config, "left")?;
    let right = counter_registry(config, "right")?;
    let bottom = counter_registry(config, "bottom")?;
    top.register_dependency(left.clone())?;
    top.register_dependency(right.clone())?;
    left.register_dependency(bottom.clone())?;
    right.register_dependency(bottom.clone())?;
    for registry in [&top, &left, &right] {
        registry.activate_dependencies()?;
    }
    Ok(vec![top, left, right, bottom])
}

/// Run `load.threads` workers, each updating the registries round robin
fn hammer(registries: &[Arc<Registry<Counter>>], load: Load) -> anyhow::Result<usize> {
    let (done_tx, done_rx) = mpsc::channel();

    for worker in 0..load.threads {
        let registries = registries.to_vec();
        let done_tx = done_tx.clone();
        thread::Builder::new()
            .name(format!("stress-{}", worker))
            .spawn(move || {
                let mut operations = 0;
                for round in 0..load.rounds {
                    let registry = &registries[(worker + round) % registries.len()];
                    let key = registry.name().to_string();
                    let result = registry.get(&key).and_then(|current| {
                        registry.update(Counter {
                            value: current.value + 1,
                            ..current
                        })
                    });
                    if result.is_ok() {
                        operations += 1;
                    }
                }
                let _ = done_tx.send(operations);
            })
            .context("spawning stress worker")?;
    }
    drop(done_tx);

    let deadline = Instant::now() + Duration::from_secs(load.deadline);
    let mut total = 0;
    for _ in 0..load.threads {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(remaining) {
            Ok(operations) => total += operations,
            Err(_) => bail!("workers did not finish within {}s; possible livelock", load.deadline),
        }
    }
    Ok(total)
}
