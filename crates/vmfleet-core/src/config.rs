use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agent::{ShutdownMethod, VmSpec};
use crate::error::FleetError;

/// Top-level fleet configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub retention: RetentionGlobal,
    #[serde(default)]
    pub hypervisors: Vec<HypervisorEntry>,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

/// Fleet-wide retention settings. Per-agent entries may override the last four.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionGlobal {
    /// Interval between fleet ticks (seconds).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Run a capacity reconciliation pass every N ticks (0 disables it).
    #[serde(default = "default_reconcile_every")]
    pub reconcile_every_ticks: u32,
    /// Idle time before an online agent may be reclaimed on a full hypervisor (minutes).
    #[serde(default = "default_max_idle")]
    pub max_idle_minutes: u64,
    /// Time to let a guest boot before the first handshake (seconds).
    #[serde(default = "default_boot_wait")]
    pub boot_wait_secs: u64,
    /// Handshake attempts before a launch is abandoned.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for RetentionGlobal {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            reconcile_every_ticks: default_reconcile_every(),
            max_idle_minutes: default_max_idle(),
            boot_wait_secs: default_boot_wait(),
            retries: default_retries(),
        }
    }
}

/// A hypervisor and its capacity limit.
#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorEntry {
    pub name: String,
    /// Connection URI, e.g. "qemu+ssh://build@kvm-1/system".
    pub uri: String,
    pub max_online_agents: usize,
}

/// One VM-backed agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    pub hypervisor: String,
    pub vm_name: String,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub shutdown_method: ShutdownMethod,
    pub boot_wait_secs: Option<u64>,
    pub retries: Option<u32>,
    pub max_idle_minutes: Option<u64>,
}

fn default_tick_interval() -> u64 {
    60
}
fn default_reconcile_every() -> u32 {
    10
}
fn default_max_idle() -> u64 {
    60
}
fn default_boot_wait() -> u64 {
    30
}
fn default_retries() -> u32 {
    3
}

impl FleetConfig {
    /// Load fleet config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse fleet config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse fleet config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hypervisors.is_empty() {
            anyhow::bail!("Fleet config must have at least one [[hypervisors]] entry");
        }
        if self.agents.is_empty() {
            anyhow::bail!("Fleet config must have at least one [[agents]] entry");
        }
        if self.retention.tick_interval_secs == 0 {
            anyhow::bail!("tick_interval_secs must be at least 1");
        }

        let mut hypervisors = HashSet::new();
        for hv in &self.hypervisors {
            if !hypervisors.insert(hv.name.as_str()) {
                anyhow::bail!("Duplicate hypervisor name '{}'", hv.name);
            }
            if hv.max_online_agents == 0 {
                anyhow::bail!("Hypervisor '{}' must allow at least one online agent", hv.name);
            }
        }

        let mut agents = HashSet::new();
        for agent in &self.agents {
            if !agents.insert(agent.name.as_str()) {
                anyhow::bail!("Duplicate agent name '{}'", agent.name);
            }
            if agent.vm_name.trim().is_empty() {
                anyhow::bail!("Agent '{}' has an empty vm_name", agent.name);
            }
            if !hypervisors.contains(agent.hypervisor.as_str()) {
                return Err(FleetError::Configuration(format!(
                    "Agent '{}' references unknown hypervisor '{}'. Add it to [[hypervisors]].",
                    agent.name, agent.hypervisor
                ))
                .into());
            }
            if agent.vm_spec(&self.retention).retries == 0 {
                anyhow::bail!("Agent '{}' must retry at least once", agent.name);
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.retention.tick_interval_secs)
    }

    pub fn hypervisor(&self, name: &str) -> Option<&HypervisorEntry> {
        self.hypervisors.iter().find(|h| h.name == name)
    }
}

impl AgentEntry {
    /// Effective VM spec: per-agent overrides or fleet-wide defaults.
    pub fn vm_spec(&self, global: &RetentionGlobal) -> VmSpec {
        VmSpec {
            hypervisor: self.hypervisor.clone(),
            vm_name: self.vm_name.clone(),
            snapshot: self.snapshot.clone(),
            shutdown_method: self.shutdown_method,
            boot_wait_secs: self.boot_wait_secs.unwrap_or(global.boot_wait_secs),
            retries: self.retries.unwrap_or(global.retries),
            max_idle_minutes: self.max_idle_minutes.unwrap_or(global.max_idle_minutes),
        }
    }
}
