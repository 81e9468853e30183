//! Scenario runner for the data session supervisor.
//!
//! Usage:
//!   celldata-sim --scenario scenarios/retry_then_connect.toml
//!   celldata-sim --config sim.toml --scenario scenarios/stall_recovery.toml --seed 7

use std::path::PathBuf;

use anyhow::Context;
use celldata_sim::prefs::FilePreferenceStore;
use celldata_sim::scenario::{self, Scenario};
use celldata_supervisor::SupervisorConfig;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "celldata-sim", about = "Run a scripted data session scenario")]
struct Cli {
    /// Supervisor config (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scenario file (TOML).
    #[arg(long)]
    scenario: PathBuf,

    /// Retry jitter seed, overriding the config.
    #[arg(long)]
    seed: Option<u64>,

    /// Preferred-APN store (JSON).
    #[arg(long, default_value = "celldata-prefs.json")]
    prefs: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            SupervisorConfig::from_toml_str(&text)?
        }
        None => SupervisorConfig::default(),
    };
    if let Some(seed) = cli.seed {
        cfg.retry.seed = seed;
    }

    let text = std::fs::read_to_string(&cli.scenario)
        .with_context(|| format!("reading {}", cli.scenario.display()))?;
    let scenario = Scenario::from_toml_str(&text)?;

    tracing::info!(
        scenario = %cli.scenario.display(),
        seed = cfg.retry.seed,
        pool_size = cfg.session.pool_size,
        "celldata-sim starting"
    );

    let report = scenario::run(cfg, &scenario, Box::new(FilePreferenceStore::new(&cli.prefs)))?;

    println!("{}", serde_json::to_string_pretty(&report.final_snapshot)?);
    tracing::info!(
        notifications = report.notifications.len(),
        activations = report.modem.activations,
        deactivations = report.modem.deactivations,
        reregistrations = report.modem.reregistrations,
        "scenario finished"
    );

    if !report.passed() {
        for failure in &report.failures {
            tracing::error!("{failure}");
        }
        anyhow::bail!("{} expectation(s) failed", report.failures.len());
    }
    Ok(())
}
