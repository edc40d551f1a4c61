use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tabled::Tabled;
use tracing::info;

use crate::logging::{self, LogFormat};
use crate::output::{self, OutputFormat};

use vmfleet_core::config::FleetConfig;
use vmfleet_retention::controller::AgentDecision;
use vmfleet_retention::sim::{Scenario, Simulation};

#[derive(Parser)]
#[command(
    name = "vmfleet",
    version,
    about = "Demand-driven retention controller for hypervisor-backed build agents"
)]
struct Cli {
    /// Output format: table, json
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: String,

    /// Log format: human, json
    #[arg(long, global = true, default_value = "human")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a fleet configuration file and summarize its agents
    CheckConfig {
        /// Path to the fleet TOML file
        path: PathBuf,
    },
    /// Evaluate one retention tick against an in-memory fleet without
    /// starting or stopping anything
    Simulate {
        /// Path to the fleet TOML file
        config: PathBuf,
        /// JSON file describing fleet nodes, queued items and domain states
        #[arg(long, short = 's')]
        scenario: PathBuf,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::from_str_arg(&cli.log_format));
    let out_fmt = OutputFormat::from_str_arg(&cli.output);

    match cli.command {
        Commands::CheckConfig { path } => cmd_check_config(&path, out_fmt),
        Commands::Simulate { config, scenario } => cmd_simulate(&config, &scenario, out_fmt),
    }
}

#[derive(Debug, Serialize, Tabled)]
struct AgentRow {
    agent: String,
    hypervisor: String,
    vm: String,
    snapshot: String,
    shutdown: String,
    boot_wait_secs: u64,
    retries: u32,
    max_idle_minutes: u64,
}

fn agent_rows(config: &FleetConfig) -> Vec<AgentRow> {
    config
        .agents
        .iter()
        .map(|a| {
            let spec = a.vm_spec(&config.retention);
            AgentRow {
                agent: a.name.clone(),
                hypervisor: spec.hypervisor.clone(),
                vm: spec.vm_name.clone(),
                snapshot: spec.revert_snapshot().unwrap_or("-").to_string(),
                shutdown: spec.shutdown_method.to_string(),
                boot_wait_secs: spec.boot_wait_secs,
                retries: spec.retries,
                max_idle_minutes: spec.max_idle_minutes,
            }
        })
        .collect()
}

fn cmd_check_config(path: &Path, out_fmt: OutputFormat) -> Result<()> {
    let config = FleetConfig::from_file(path)?;
    info!(
        path = %path.display(),
        hypervisors = config.hypervisors.len(),
        agents = config.agents.len(),
        "Configuration valid"
    );

    let rows = agent_rows(&config);
    if out_fmt == OutputFormat::Table {
        println!(
            "Configuration OK: {} hypervisor(s), {} agent(s), tick every {}s",
            config.hypervisors.len(),
            config.agents.len(),
            config.retention.tick_interval_secs
        );
    }
    output::render_list(&rows, out_fmt);
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
struct DecisionRow {
    agent: String,
    hypervisor: String,
    status: String,
    decision: String,
}

impl From<&AgentDecision> for DecisionRow {
    fn from(d: &AgentDecision) -> Self {
        Self {
            agent: d.agent.clone(),
            hypervisor: d.hypervisor.clone(),
            status: d.status.to_string(),
            decision: d.decision.to_string(),
        }
    }
}

fn load_scenario(path: &Path) -> Result<Scenario> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse scenario JSON: {}", path.display()))
}

fn cmd_simulate(config_path: &Path, scenario_path: &Path, out_fmt: OutputFormat) -> Result<()> {
    let config = FleetConfig::from_file(config_path)?;
    let scenario = load_scenario(scenario_path)?;
    let now = scenario.now.unwrap_or_else(Utc::now);

    let simulation = Simulation::new(&config, &scenario)
        .with_context(|| "Failed to build simulated fleet")?;
    let decisions = run_async(simulation.plan(now))?;

    match out_fmt {
        OutputFormat::Json => output::render_json(&decisions),
        OutputFormat::Table => {
            let rows: Vec<DecisionRow> = decisions.iter().map(DecisionRow::from).collect();
            output::render_list(&rows, out_fmt);
        }
    }
    Ok(())
}

/// Run a future to completion on a fresh multi-threaded runtime.
fn run_async<F: std::future::Future>(f: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;
    Ok(runtime.block_on(f))
}
