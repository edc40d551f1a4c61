//! Retention controller: per tick, per agent, decide whether to launch,
//! reclaim or leave it alone, and dispatch the chosen operation.
//!
//! Decisions are made under the fleet lock, which the build queue shares so
//! that the demand snapshot is consistent. The lock is never held across a
//! remote VM call; boots and shutdowns run on their own tasks, serialized
//! per agent by the agent's op guard.
//!
//! A dispatched launch reserves a slot on its hypervisor and offers its
//! executors to the rest of the tick, so later agents see neither the room
//! nor the demand it has already taken. Agents still connecting from an
//! earlier tick offer their executors the same way.
//!
//! Policy when a hypervisor is full: passive wait. An offline agent whose
//! work nobody else can run waits until an online agent on the same
//! hypervisor is reclaimed by its own idle timeout. Busy or recently idle
//! agents are never preempted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::boot::{BootSequencer, LaunchOutcome};
use crate::demand::{DemandSnapshot, ExecutionSlot};
use crate::fleet::{ComputerState, Fleet};
use crate::queue::WorkQueue;
use crate::registry::{AgentRegistry, ManagedAgent};
use crate::shutdown::{ShutdownOutcome, ShutdownSequencer};
use crate::transport::AgentTransport;
use vmfleet_core::agent::{AgentStatus, VmBacked};
use vmfleet_core::error::{FleetError, FleetResult};
use vmfleet_core::time::idle_for;

/// Why an agent was left alone this tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    NotIdle,
    HypervisorNotFull,
    IdleBelowThreshold,
    NotNeeded,
    HypervisorFull,
    LaunchUnsupported,
    Connecting,
    OperationInFlight,
    Error(String),
}

impl std::fmt::Display for HoldReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotIdle => write!(f, "not idle"),
            Self::HypervisorNotFull => write!(f, "hypervisor has room"),
            Self::IdleBelowThreshold => write!(f, "idle below threshold"),
            Self::NotNeeded => write!(f, "not uniquely needed"),
            Self::HypervisorFull => write!(f, "hypervisor full"),
            Self::LaunchUnsupported => write!(f, "launch unsupported"),
            Self::Connecting => write!(f, "connecting"),
            Self::OperationInFlight => write!(f, "operation in flight"),
            Self::Error(e) => write!(f, "error: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "detail", rename_all = "snake_case")]
pub enum Decision {
    Launch,
    Reclaim { idle_minutes: u64 },
    Hold(HoldReason),
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launch => write!(f, "launch"),
            Self::Reclaim { idle_minutes } => write!(f, "reclaim (idle {}m)", idle_minutes),
            Self::Hold(reason) => write!(f, "hold: {}", reason),
        }
    }
}

/// One agent's decision, with the status it was made from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentDecision {
    pub agent: String,
    pub hypervisor: String,
    pub status: AgentStatus,
    pub decision: Decision,
}

/// Result of one tick. Dispatched boots and shutdowns keep running after
/// the tick returns; `wait` joins them.
#[derive(Debug, Default)]
pub struct TickReport {
    pub decisions: Vec<AgentDecision>,
    tasks: Vec<JoinHandle<()>>,
}

impl TickReport {
    pub fn launched(&self) -> usize {
        self.count(|d| matches!(d, Decision::Launch))
    }

    pub fn reclaimed(&self) -> usize {
        self.count(|d| matches!(d, Decision::Reclaim { .. }))
    }

    pub fn decision(&self, agent: &str) -> Option<&Decision> {
        self.decisions
            .iter()
            .find(|d| d.agent == agent)
            .map(|d| &d.decision)
    }

    /// Wait for every dispatched operation to finish.
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Agent operation task failed");
            }
        }
    }

    fn count(&self, pred: impl Fn(&Decision) -> bool) -> usize {
        self.decisions.iter().filter(|d| pred(&d.decision)).count()
    }
}

/// Capacity accounting before and after a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciled {
    pub hypervisor: String,
    pub before: usize,
    pub after: usize,
}

pub struct LifecycleController {
    registry: Arc<AgentRegistry>,
    queue: Arc<dyn WorkQueue>,
    fleet: Arc<dyn Fleet>,
    transport: Arc<dyn AgentTransport>,
    boot: Arc<BootSequencer>,
    shutdown: Arc<ShutdownSequencer>,
    fleet_lock: Arc<AsyncMutex<()>>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<AgentRegistry>,
        queue: Arc<dyn WorkQueue>,
        fleet: Arc<dyn Fleet>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        Self {
            registry,
            queue,
            fleet,
            boot: Arc::new(BootSequencer::new(Arc::clone(&transport))),
            shutdown: Arc::new(ShutdownSequencer::new(Arc::clone(&transport))),
            transport,
            fleet_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Use the ordering lock owned by the build queue.
    pub fn with_fleet_lock(mut self, lock: Arc<AsyncMutex<()>>) -> Self {
        self.fleet_lock = lock;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn fleet_lock(&self) -> &Arc<AsyncMutex<()>> {
        &self.fleet_lock
    }

    /// Decide what to do with one agent. Makes no remote calls and changes nothing.
    pub fn check(
        &self,
        agent: &ManagedAgent,
        computer: Option<&ComputerState>,
        demand: &DemandSnapshot,
        now: DateTime<Utc>,
    ) -> FleetResult<Decision> {
        let hv = agent.host();
        match agent.status() {
            AgentStatus::Online => {
                let computer = computer.ok_or_else(|| {
                    FleetError::Configuration(format!(
                        "Agent '{}' is not reported by the fleet",
                        agent.name()
                    ))
                })?;
                if !(computer.online && computer.idle) {
                    return Ok(Decision::Hold(HoldReason::NotIdle));
                }
                if !hv.is_full() {
                    return Ok(Decision::Hold(HoldReason::HypervisorNotFull));
                }
                let idle = idle_for(computer.idle_since.unwrap_or(now), now);
                if idle > agent.spec().max_idle() {
                    Ok(Decision::Reclaim {
                        idle_minutes: idle.as_secs() / 60,
                    })
                } else {
                    Ok(Decision::Hold(HoldReason::IdleBelowThreshold))
                }
            }
            AgentStatus::Connecting => Ok(Decision::Hold(HoldReason::Connecting)),
            AgentStatus::Offline => {
                if !self.transport.launch_supported() {
                    return Ok(Decision::Hold(HoldReason::LaunchUnsupported));
                }
                if hv.is_full() {
                    return Ok(Decision::Hold(HoldReason::HypervisorFull));
                }
                if !demand.is_uniquely_needed(agent.name()) {
                    return Ok(Decision::Hold(HoldReason::NotNeeded));
                }
                Ok(Decision::Launch)
            }
        }
    }

    /// Run one tick now.
    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Evaluate every agent under the fleet lock and dispatch launches and
    /// reclaims. A failing agent is held; the rest are still evaluated.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let _fleet = self.fleet_lock.lock().await;
        let (computers, mut demand) = self.snapshot();

        let mut report = TickReport::default();
        for agent in self.registry.agents() {
            let status = agent.status();
            let dispatched = match self.decide(&agent, &computers, &demand, now) {
                Decision::Launch => self.dispatch_launch(&agent).map(|task| {
                    demand.offer(pending_slot(&agent, &computers));
                    (task, Decision::Launch)
                }),
                Decision::Reclaim { idle_minutes } => self
                    .dispatch_reclaim(&agent, idle_minutes)
                    .map(|task| (task, Decision::Reclaim { idle_minutes })),
                hold => Err(hold),
            };
            let decision = match dispatched {
                Ok((task, decision)) => {
                    report.tasks.push(task);
                    decision
                }
                Err(hold) => hold,
            };
            report.decisions.push(decided(&agent, status, decision));
        }

        debug!(
            agents = report.decisions.len(),
            launched = report.launched(),
            reclaimed = report.reclaimed(),
            "Retention tick complete"
        );
        report
    }

    /// Evaluate every agent without dispatching anything. Planned launches
    /// count against capacity and demand the way dispatched ones do in a tick.
    pub async fn plan(&self, now: DateTime<Utc>) -> Vec<AgentDecision> {
        let _fleet = self.fleet_lock.lock().await;
        let (computers, mut demand) = self.snapshot();
        let mut planned: HashMap<String, usize> = HashMap::new();

        self.registry
            .agents()
            .iter()
            .map(|agent| {
                let status = agent.status();
                let mut decision = self.decide(agent, &computers, &demand, now);
                if matches!(decision, Decision::Launch | Decision::Reclaim { .. })
                    && agent.try_begin_op().is_none()
                {
                    decision = Decision::Hold(HoldReason::OperationInFlight);
                }
                // `check` tests fullness before demand, so a hypervisor filled
                // by planned launches wins over "not needed".
                if matches!(decision, Decision::Launch | Decision::Hold(HoldReason::NotNeeded)) {
                    let capacity = agent.host().capacity();
                    let pending = planned.entry(agent.host().name().to_string()).or_default();
                    if capacity.occupied() + *pending >= capacity.max() {
                        decision = Decision::Hold(HoldReason::HypervisorFull);
                    } else if decision == Decision::Launch {
                        *pending += 1;
                        demand.offer(pending_slot(agent, &computers));
                    }
                }
                decided(agent, status, decision)
            })
            .collect()
    }

    /// Reset each hypervisor's accounting to the VM-backed nodes the fleet
    /// reports online, and drop agents the fleet has lost to `Offline`.
    pub async fn reconcile(&self) -> Vec<Reconciled> {
        let _fleet = self.fleet_lock.lock().await;
        let computers = self.fleet.computers();

        for agent in self.registry.agents() {
            if agent.status() != AgentStatus::Online {
                continue;
            }
            let reported = computers.iter().any(|c| c.name == agent.name() && c.online);
            if !reported && let Some(_guard) = agent.try_begin_op() {
                info!(agent = %agent.name(), "Agent no longer online, marking offline");
                agent.log().println("Agent went offline");
                agent.set_status(AgentStatus::Offline);
            }
        }

        self.registry
            .hypervisors()
            .map(|hv| {
                let online = computers
                    .iter()
                    .filter(|c| c.online)
                    .filter(|c| c.as_vm_backed().is_some_and(|vm| vm.hypervisor() == hv.name()))
                    .map(|c| c.name.clone());
                let (before, after) = hv.capacity().reconcile(online);
                Reconciled {
                    hypervisor: hv.name().to_string(),
                    before,
                    after,
                }
            })
            .collect()
    }

    /// An operator may start an agent by hand only while its hypervisor has room.
    pub fn manual_launch_allowed(&self, name: &str) -> FleetResult<bool> {
        Ok(!self.registry.agent(name)?.host().is_full())
    }

    /// Start an agent out of band. Returns `None` when it is already up or
    /// another operation on it is in flight.
    pub fn launch_now(&self, name: &str) -> FleetResult<Option<JoinHandle<FleetResult<LaunchOutcome>>>> {
        let agent = self.registry.agent(name)?;
        let hv = agent.host();
        if agent.status() != AgentStatus::Offline {
            info!(agent = %name, status = %agent.status(), "Manual launch skipped");
            return Ok(None);
        }
        let Some(guard) = agent.try_begin_op() else {
            info!(agent = %name, "Manual launch skipped, operation in flight");
            return Ok(None);
        };
        if !hv.capacity().reserve(name) {
            return Err(FleetError::CapacityRace {
                agent: name.to_string(),
                hypervisor: hv.name().to_string(),
            });
        }

        let cancel = agent.cancel_token();
        agent.set_status(AgentStatus::Connecting);
        info!(agent = %name, hypervisor = %hv.name(), "Manual launch");
        let boot = Arc::clone(&self.boot);
        Ok(Some(tokio::spawn(async move {
            boot.launch_and_settle(agent, cancel, guard).await
        })))
    }

    /// Shut an agent down out of band, cancelling any boot in flight.
    pub async fn disconnect(&self, name: &str, cause: Option<&str>) -> FleetResult<ShutdownOutcome> {
        let agent = self.registry.agent(name)?;
        Ok(self.shutdown.shutdown_exclusive(&agent, cause).await)
    }

    /// Forget an agent. Any boot in flight is cancelled and its capacity
    /// released; the domain itself is left as it is.
    pub async fn remove_agent(&self, name: &str) -> FleetResult<()> {
        let agent = {
            let _fleet = self.fleet_lock.lock().await;
            self.registry
                .remove(name)
                .ok_or_else(|| FleetError::Configuration(format!("Unknown agent '{}'", name)))?
        };

        agent.cancel_launch();
        let _guard = agent.begin_op().await;
        agent.host().capacity().mark_offline(agent.name());
        agent.set_status(AgentStatus::Offline);
        info!(agent = %name, hypervisor = %agent.host().name(), "Agent removed");
        Ok(())
    }

    /// Record a task that ended abnormally on an agent.
    pub fn task_failed(&self, name: &str, problem: &str) -> FleetResult<()> {
        let agent = self.registry.agent(name)?;
        warn!(agent = %name, vm = %agent.vm_name(), problem, "VM task interrupted");
        agent.log().println(format!("VM task interrupted by {}", problem));
        Ok(())
    }

    fn snapshot(&self) -> (Vec<ComputerState>, DemandSnapshot) {
        let computers = self.fleet.computers();
        let mut demand = DemandSnapshot::new(
            ExecutionSlot::from_computers(&computers),
            self.queue.buildable_items(),
        );
        for agent in self.registry.agents() {
            if agent.status() == AgentStatus::Connecting {
                demand.offer(pending_slot(&agent, &computers));
            }
        }
        (computers, demand)
    }

    fn decide(
        &self,
        agent: &ManagedAgent,
        computers: &[ComputerState],
        demand: &DemandSnapshot,
        now: DateTime<Utc>,
    ) -> Decision {
        let computer = computers.iter().find(|c| c.name == agent.name());
        match self.check(agent, computer, demand, now) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(agent = %agent.name(), error = %e, "Retention check failed");
                Decision::Hold(HoldReason::Error(e.to_string()))
            }
        }
    }

    fn dispatch_launch(&self, agent: &Arc<ManagedAgent>) -> Result<JoinHandle<()>, Decision> {
        let guard = agent
            .try_begin_op()
            .ok_or(Decision::Hold(HoldReason::OperationInFlight))?;
        // A manual launch may have taken the last slot since the check.
        if !agent.host().capacity().reserve(agent.name()) {
            return Err(Decision::Hold(HoldReason::HypervisorFull));
        }
        let cancel = agent.cancel_token();
        agent.set_status(AgentStatus::Connecting);
        info!(agent = %agent.name(), hypervisor = %agent.host().name(), "Launching agent");

        let boot = Arc::clone(&self.boot);
        let agent = Arc::clone(agent);
        Ok(tokio::spawn(async move {
            let _ = boot.launch_and_settle(agent, cancel, guard).await;
        }))
    }

    fn dispatch_reclaim(&self, agent: &Arc<ManagedAgent>, idle_minutes: u64) -> Result<JoinHandle<()>, Decision> {
        let guard = agent
            .try_begin_op()
            .ok_or(Decision::Hold(HoldReason::OperationInFlight))?;
        info!(
            agent = %agent.name(),
            hypervisor = %agent.host().name(),
            idle_minutes,
            "Reclaiming idle agent"
        );

        let shutdown = Arc::clone(&self.shutdown);
        let agent = Arc::clone(agent);
        Ok(tokio::spawn(async move {
            let cause = format!("idle for {} minutes", idle_minutes);
            shutdown.shutdown(&agent, Some(&cause)).await;
            drop(guard);
        }))
    }
}

/// Executors a booting agent will offer once connected. The fleet may not
/// report any for a node that is still down, so count at least one.
fn pending_slot(agent: &ManagedAgent, computers: &[ComputerState]) -> ExecutionSlot {
    let executors = computers
        .iter()
        .find(|c| c.name == agent.name())
        .map_or(0, |c| c.idle_executors);
    ExecutionSlot {
        node: agent.name().to_string(),
        idle_executors: executors.max(1),
    }
}

fn decided(agent: &ManagedAgent, status: AgentStatus, decision: Decision) -> AgentDecision {
    AgentDecision {
        agent: agent.name().to_string(),
        hypervisor: agent.host().name().to_string(),
        status,
        decision,
    }
}
