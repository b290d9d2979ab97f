//! Scenario Runner for conductor fleets
//!
//! Spawns a fresh cluster per scenario, runs it and tears the cluster down.
//! Exits non-zero when any check fails.
//!
//! Usage:
//!   hcfleet-scenario --dna passthrough-dna.dna.json links-series
//!   hcfleet-scenario -n 4 -m 2 --dna passthrough-dna.dna.json all
//!   HCFLEET_CONDUCTOR_BIN=/opt/holochain hcfleet-scenario --dna dna.json hold-quorum

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use hcfleet_core::logging::init_tracing;
use hcfleet_core::scenario::{self, ScenarioOptions, ScenarioReport};
use hcfleet_core::{Cluster, FleetConfig, Iteration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScenarioName {
    /// Commit, link and read back one instance at a time
    LinksSeries,
    /// Commit, link and read back with every call in flight at once
    LinksParallel,
    /// A link made on conductor 0 is visible on conductor 1
    LinkVisibility,
    /// Every conductor reports holding a new entry and link
    HoldQuorum,
    /// All of the above, each on a fresh cluster
    All,
}

impl ScenarioName {
    fn expand(self) -> Vec<ScenarioName> {
        match self {
            ScenarioName::All => vec![
                ScenarioName::LinksSeries,
                ScenarioName::LinksParallel,
                ScenarioName::LinkVisibility,
                ScenarioName::HoldQuorum,
            ],
            single => vec![single],
        }
    }

    fn slug(self) -> &'static str {
        match self {
            ScenarioName::LinksSeries => "links-series",
            ScenarioName::LinksParallel => "links-parallel",
            ScenarioName::LinkVisibility => "link-visibility",
            ScenarioName::HoldQuorum => "hold-quorum",
            ScenarioName::All => "all",
        }
    }
}

/// Conductor fleet scenario runner
#[derive(Parser, Debug)]
#[command(name = "hcfleet-scenario")]
#[command(about = "Run replication scenarios against a fleet of conductors")]
struct Args {
    /// Scenario to run
    #[arg(value_enum)]
    scenario: ScenarioName,

    /// Passthrough DNA file installed into every instance
    #[arg(long, env = "HCFLEET_TEST_DNA")]
    dna: PathBuf,

    /// Number of conductors (overrides HCFLEET_CONDUCTORS)
    #[arg(short = 'n', long)]
    conductors: Option<usize>,

    /// Instances per conductor
    #[arg(short = 'm', long, default_value_t = 1)]
    instances: usize,

    /// Seconds to wait for a hold quorum
    #[arg(long, default_value_t = 60)]
    quorum_timeout_secs: u64,

    /// Verbose conductor logging
    #[arg(long)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = FleetConfig::from_env();
    init_tracing(args.verbose, config.logs_dir.as_deref());

    if let Some(conductors) = args.conductors {
        config.conductors = conductors;
    }
    config.debug |= args.debug;

    let dna = args
        .dna
        .canonicalize()
        .with_context(|| format!("DNA file not found at {:?}", args.dna))?;
    let mut options = ScenarioOptions::new(dna);
    options.instances_per_conductor = args.instances;
    options.quorum_timeout = Duration::from_secs(args.quorum_timeout_secs);

    tracing::info!(
        scenario = args.scenario.slug(),
        conductor_bin = %config.conductor_bin.display(),
        conductors = config.conductors,
        instances = options.instances_per_conductor,
        "Starting scenario run"
    );

    let mut reports = Vec::new();
    for name in args.scenario.expand() {
        let report = run_one(name, &config, &options)
            .await
            .with_context(|| format!("Scenario {} failed to run", name.slug()))?;
        reports.push(report);
    }

    let mut failed = 0;
    for report in &reports {
        if report.passed() {
            println!("PASS  {}", report.name);
        } else {
            failed += 1;
            println!("FAIL  {}", report.name);
            for check in report.failures() {
                println!("      {}: {}", check.name, check.detail);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} scenarios failed", failed, reports.len());
    }
    Ok(())
}

async fn run_one(
    name: ScenarioName,
    config: &FleetConfig,
    options: &ScenarioOptions,
) -> Result<ScenarioReport> {
    let mut config = config.clone();
    // Each scenario gets untouched persistence directories
    if let Some(root) = &config.work_dir {
        config.work_dir = Some(root.join(name.slug()));
    }

    let cluster = Cluster::new(config).context("Failed to prepare cluster")?;
    let outcome = async {
        cluster.initialize().await.context("Failed to initialize cluster")?;
        let report = match name {
            ScenarioName::LinksSeries => scenario::links(&cluster, options, Iteration::Series).await?,
            ScenarioName::LinksParallel => {
                scenario::links(&cluster, options, Iteration::Parallel).await?
            }
            ScenarioName::LinkVisibility => scenario::link_visibility(&cluster, options).await?,
            ScenarioName::HoldQuorum => scenario::hold_quorum(&cluster, options).await?,
            ScenarioName::All => anyhow::bail!("`all` must be expanded before running"),
        };
        Ok::<_, anyhow::Error>(report)
    }
    .await;

    // Tear down regardless of how the scenario went
    let shutdown = cluster.shutdown().await.context("Failed to shut down cluster");
    let report = outcome?;
    shutdown?;
    Ok(report)
}
