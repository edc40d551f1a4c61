//! In-memory collaborators: a simulated hypervisor, agent transport, build
//! queue and fleet. Used for dry runs from the CLI and throughout the tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::controller::{AgentDecision, LifecycleController};
use crate::fleet::{ComputerState, Fleet};
use crate::hypervisor::{DomainHandle, DomainLookup, DomainState, VmControl};
use crate::queue::{Placement, WorkItem, WorkQueue};
use crate::registry::AgentRegistry;
use crate::transport::AgentTransport;
use vmfleet_core::agent::{AgentStatus, VmBacked};
use vmfleet_core::agent_log::AgentLog;
use vmfleet_core::config::FleetConfig;
use vmfleet_core::error::{FleetError, FleetResult};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A VM control call as observed by the simulated hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Resolve(String),
    State(String),
    PowerOn(String),
    Shutdown(String),
    Suspend(String),
    Destroy(String),
    Revert(String, String),
}

/// VM control operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Resolve,
    State,
    PowerOn,
    Shutdown,
    Suspend,
    Destroy,
    Revert,
}

/// Hypervisor whose domains live in a map.
pub struct SimHypervisor {
    uri: String,
    domains: Mutex<BTreeMap<String, DomainState>>,
    calls: Mutex<Vec<SimCall>>,
    failing: Mutex<HashSet<SimOp>>,
    /// A power-on leaves the domain stopped this many more times.
    stuck_power_ons: Mutex<HashMap<String, u32>>,
}

impl SimHypervisor {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            domains: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            stuck_power_ons: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_domain(self, name: &str, state: DomainState) -> Self {
        self.define(name, state);
        self
    }

    pub fn define(&self, name: &str, state: DomainState) {
        lock(&self.domains).insert(name.to_string(), state);
    }

    pub fn undefine(&self, name: &str) {
        lock(&self.domains).remove(name);
    }

    pub fn state_of(&self, name: &str) -> Option<DomainState> {
        lock(&self.domains).get(name).copied()
    }

    /// Make every call of `op` fail with a transport error.
    pub fn fail(&self, op: SimOp) {
        lock(&self.failing).insert(op);
    }

    pub fn recover(&self, op: SimOp) {
        lock(&self.failing).remove(&op);
    }

    /// The next `times` power-ons of `name` report success but leave it stopped.
    pub fn stall_power_on(&self, name: &str, times: u32) {
        lock(&self.stuck_power_ons).insert(name.to_string(), times);
    }

    pub fn calls(&self) -> Vec<SimCall> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: SimCall, op: SimOp) -> FleetResult<()> {
        lock(&self.calls).push(call);
        if lock(&self.failing).contains(&op) {
            return Err(FleetError::Transport(format!(
                "{}: simulated {:?} failure",
                self.uri, op
            )));
        }
        Ok(())
    }

    fn set_state(&self, domain: &DomainHandle, state: DomainState) -> FleetResult<()> {
        let mut domains = lock(&self.domains);
        match domains.get_mut(&domain.name) {
            Some(s) => {
                *s = state;
                Ok(())
            }
            None => Err(FleetError::Transport(format!(
                "{}: domain '{}' vanished",
                self.uri, domain.name
            ))),
        }
    }
}

#[async_trait]
impl VmControl for SimHypervisor {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn resolve_domain(&self, name: &str) -> DomainLookup {
        if let Err(e) = self.record(SimCall::Resolve(name.to_string()), SimOp::Resolve) {
            return DomainLookup::TransportFailure(e.to_string());
        }
        if lock(&self.domains).contains_key(name) {
            DomainLookup::Found(DomainHandle {
                name: name.to_string(),
            })
        } else {
            DomainLookup::NotFound
        }
    }

    async fn domain_state(&self, domain: &DomainHandle) -> FleetResult<DomainState> {
        self.record(SimCall::State(domain.name.clone()), SimOp::State)?;
        self.state_of(&domain.name).ok_or_else(|| {
            FleetError::Transport(format!("{}: domain '{}' vanished", self.uri, domain.name))
        })
    }

    async fn power_on(&self, domain: &DomainHandle) -> FleetResult<()> {
        self.record(SimCall::PowerOn(domain.name.clone()), SimOp::PowerOn)?;
        {
            let mut stuck = lock(&self.stuck_power_ons);
            if let Some(n) = stuck.get_mut(&domain.name)
                && *n > 0
            {
                *n -= 1;
                return Ok(());
            }
        }
        self.set_state(domain, DomainState::Running)
    }

    async fn shutdown(&self, domain: &DomainHandle) -> FleetResult<()> {
        self.record(SimCall::Shutdown(domain.name.clone()), SimOp::Shutdown)?;
        self.set_state(domain, DomainState::Shutoff)
    }

    async fn suspend(&self, domain: &DomainHandle) -> FleetResult<()> {
        self.record(SimCall::Suspend(domain.name.clone()), SimOp::Suspend)?;
        self.set_state(domain, DomainState::Paused)
    }

    async fn destroy(&self, domain: &DomainHandle) -> FleetResult<()> {
        self.record(SimCall::Destroy(domain.name.clone()), SimOp::Destroy)?;
        self.set_state(domain, DomainState::Shutoff)
    }

    async fn revert_to_snapshot(&self, domain: &DomainHandle, snapshot: &str) -> FleetResult<()> {
        self.record(
            SimCall::Revert(domain.name.clone(), snapshot.to_string()),
            SimOp::Revert,
        )?;
        self.set_state(domain, DomainState::Shutoff)
    }
}

/// Agent transport whose handshakes succeed after a scripted number of refusals.
#[derive(Default)]
pub struct SimTransport {
    launch_unsupported: AtomicBool,
    online: Mutex<HashSet<String>>,
    refusals: Mutex<HashMap<String, u32>>,
    unreachable: Mutex<HashSet<String>>,
    connects: Mutex<HashMap<String, u32>>,
    disconnects: Mutex<HashMap<String, u32>>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_launch_supported(&self, supported: bool) {
        self.launch_unsupported.store(!supported, Ordering::Release);
    }

    /// Refuse the next `times` handshakes with `agent`.
    pub fn refuse(&self, agent: &str, times: u32) {
        lock(&self.refusals).insert(agent.to_string(), times);
    }

    /// Refuse every handshake with `agent`.
    pub fn make_unreachable(&self, agent: &str) {
        lock(&self.unreachable).insert(agent.to_string());
    }

    pub fn set_online(&self, agent: &str) {
        lock(&self.online).insert(agent.to_string());
    }

    pub fn connects(&self, agent: &str) -> u32 {
        lock(&self.connects).get(agent).copied().unwrap_or(0)
    }

    pub fn disconnects(&self, agent: &str) -> u32 {
        lock(&self.disconnects).get(agent).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AgentTransport for SimTransport {
    fn launch_supported(&self) -> bool {
        !self.launch_unsupported.load(Ordering::Acquire)
    }

    async fn connect(&self, agent: &str, log: &AgentLog) -> FleetResult<()> {
        *lock(&self.connects).entry(agent.to_string()).or_default() += 1;

        let refused = lock(&self.unreachable).contains(agent) || {
            let mut refusals = lock(&self.refusals);
            match refusals.get_mut(agent) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if refused {
            log.println("Connection refused");
            return Err(FleetError::Transport(format!(
                "{}: connection refused",
                agent
            )));
        }

        log.println("Agent successfully connected and online");
        lock(&self.online).insert(agent.to_string());
        Ok(())
    }

    fn is_online(&self, agent: &str) -> bool {
        lock(&self.online).contains(agent)
    }

    async fn disconnect(&self, agent: &str, log: &AgentLog) {
        *lock(&self.disconnects).entry(agent.to_string()).or_default() += 1;
        if lock(&self.online).remove(agent) {
            log.println("Connection closed");
        }
    }
}

/// Work item that runs on an explicit list of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelledItem {
    pub id: String,
    pub runs_on: Vec<String>,
}

impl LabelledItem {
    pub fn new(id: &str, runs_on: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            runs_on: runs_on.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl WorkItem for LabelledItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn can_run_on(&self, node: &str) -> Placement {
        if self.runs_on.iter().any(|n| n == node) {
            Placement::Yes
        } else {
            Placement::No(format!("'{}' is not eligible for {}", node, self.id))
        }
    }
}

#[derive(Default)]
pub struct SimQueue {
    items: Mutex<Vec<Arc<dyn WorkItem>>>,
}

impl SimQueue {
    pub fn new(items: Vec<LabelledItem>) -> Self {
        let queue = Self::default();
        for item in items {
            queue.push(item);
        }
        queue
    }

    pub fn push(&self, item: LabelledItem) {
        lock(&self.items).push(Arc::new(item));
    }

    pub fn clear(&self) {
        lock(&self.items).clear();
    }
}

impl WorkQueue for SimQueue {
    fn buildable_items(&self) -> Vec<Arc<dyn WorkItem>> {
        lock(&self.items).clone()
    }
}

#[derive(Default)]
pub struct SimFleet {
    computers: Mutex<Vec<ComputerState>>,
}

impl SimFleet {
    pub fn new(computers: Vec<ComputerState>) -> Self {
        Self {
            computers: Mutex::new(computers),
        }
    }

    /// Replace the node with the same name, or append it.
    pub fn upsert(&self, computer: ComputerState) {
        let mut computers = lock(&self.computers);
        match computers.iter_mut().find(|c| c.name == computer.name) {
            Some(existing) => *existing = computer,
            None => computers.push(computer),
        }
    }
}

impl Fleet for SimFleet {
    fn computers(&self) -> Vec<ComputerState> {
        lock(&self.computers).clone()
    }
}

/// Fleet and queue state to evaluate against, as loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    /// Evaluation time. Defaults to the current time.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
    #[serde(default)]
    pub computers: Vec<ComputerState>,
    #[serde(default)]
    pub items: Vec<LabelledItem>,
    /// hypervisor -> domain -> state. Unlisted agent domains start running
    /// when the agent is reported online and shut off otherwise.
    #[serde(default)]
    pub domains: BTreeMap<String, BTreeMap<String, DomainState>>,
}

/// A configured fleet wired to in-memory collaborators.
pub struct Simulation {
    pub hypervisors: BTreeMap<String, Arc<SimHypervisor>>,
    pub transport: Arc<SimTransport>,
    pub queue: Arc<SimQueue>,
    pub fleet: Arc<SimFleet>,
    pub controller: Arc<LifecycleController>,
}

impl Simulation {
    /// Build the fleet described by `config`, seeded from `scenario`.
    ///
    /// Agents that the scenario reports online start out `Online` and
    /// counted against their hypervisor.
    pub fn new(config: &FleetConfig, scenario: &Scenario) -> FleetResult<Self> {
        let mut hypervisors = BTreeMap::new();
        for entry in &config.hypervisors {
            let sim = SimHypervisor::new(&entry.uri);
            for agent in config.agents.iter().filter(|a| a.hypervisor == entry.name) {
                sim.define(&agent.vm_name, DomainState::Shutoff);
            }
            if let Some(domains) = scenario.domains.get(&entry.name) {
                for (name, state) in domains {
                    sim.define(name, *state);
                }
            }
            hypervisors.insert(entry.name.clone(), Arc::new(sim));
        }

        let registry = AgentRegistry::from_config(config, |entry| {
            let control: Arc<dyn VmControl> = match hypervisors.get(&entry.name) {
                Some(sim) => Arc::clone(sim) as Arc<dyn VmControl>,
                None => Arc::new(SimHypervisor::new(&entry.uri)),
            };
            control
        })?;

        let transport = Arc::new(SimTransport::new());
        for computer in scenario.computers.iter().filter(|c| c.online) {
            let Ok(agent) = registry.agent(&computer.name) else {
                continue;
            };
            agent.set_status(AgentStatus::Online);
            agent.host().capacity().mark_online(agent.name());
            transport.set_online(agent.name());

            let listed = scenario
                .domains
                .get(agent.hypervisor())
                .is_some_and(|d| d.contains_key(agent.vm_name()));
            if !listed && let Some(sim) = hypervisors.get(agent.hypervisor()) {
                sim.define(agent.vm_name(), DomainState::Running);
            }
        }

        let queue = Arc::new(SimQueue::new(scenario.items.clone()));
        let fleet = Arc::new(SimFleet::new(scenario.computers.clone()));
        let controller = Arc::new(LifecycleController::new(
            Arc::new(registry),
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            Arc::clone(&fleet) as Arc<dyn Fleet>,
            Arc::clone(&transport) as Arc<dyn AgentTransport>,
        ));

        Ok(Self {
            hypervisors,
            transport,
            queue,
            fleet,
            controller,
        })
    }

    pub fn hypervisor(&self, name: &str) -> FleetResult<&Arc<SimHypervisor>> {
        self.hypervisors.get(name).ok_or_else(|| {
            FleetError::Configuration(format!("Could not find hypervisor '{}'", name))
        })
    }

    /// Evaluate one tick without dispatching anything.
    pub async fn plan(&self, now: DateTime<Utc>) -> Vec<AgentDecision> {
        self.controller.plan(now).await
    }
}
