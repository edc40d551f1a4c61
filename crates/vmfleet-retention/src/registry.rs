use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tracing::warn;

use crate::hypervisor::{Hypervisor, VmControl};
use vmfleet_core::agent::{AgentStatus, VmBacked, VmSpec, validate_transition};
use vmfleet_core::agent_log::AgentLog;
use vmfleet_core::config::{FleetConfig, HypervisorEntry};
use vmfleet_core::error::{FleetError, FleetResult};

/// A VM-backed agent under retention control.
///
/// Launch and shutdown of the same agent are serialized through `ops`;
/// whoever holds the guard owns the agent's domain until it is dropped.
pub struct ManagedAgent {
    name: String,
    spec: VmSpec,
    host: Arc<Hypervisor>,
    status: Mutex<AgentStatus>,
    log: AgentLog,
    ops: Arc<AsyncMutex<()>>,
    cancel: watch::Sender<u64>,
}

impl ManagedAgent {
    pub fn new(name: impl Into<String>, spec: VmSpec, host: Arc<Hypervisor>) -> Self {
        let (cancel, _) = watch::channel(0);
        Self {
            name: name.into(),
            spec,
            host,
            status: Mutex::new(AgentStatus::Offline),
            log: AgentLog::new(),
            ops: Arc::new(AsyncMutex::new(())),
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &VmSpec {
        &self.spec
    }

    /// The hypervisor this agent's domain lives on.
    pub fn host(&self) -> &Arc<Hypervisor> {
        &self.host
    }

    pub fn log(&self) -> &AgentLog {
        &self.log
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `to` if the transition is legal. Returns whether it applied.
    pub fn set_status(&self, to: AgentStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        match validate_transition(*status, to) {
            Ok(()) => {
                *status = to;
                true
            }
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Rejected status change");
                false
            }
        }
    }

    /// Claim the agent for a launch or shutdown without waiting.
    pub fn try_begin_op(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.ops).try_lock_owned().ok()
    }

    /// Claim the agent, waiting for any in-flight operation to finish.
    pub async fn begin_op(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.ops).lock_owned().await
    }

    /// Receiver that fires on the next `cancel_launch`. Take it before the
    /// boot is dispatched so a cancel in between is not missed.
    pub fn cancel_token(&self) -> watch::Receiver<u64> {
        self.cancel.subscribe()
    }

    /// Ask any boot in progress to stop at its next suspension point.
    pub fn cancel_launch(&self) {
        self.cancel.send_modify(|generation| *generation += 1);
    }
}

impl VmBacked for ManagedAgent {
    fn hypervisor(&self) -> &str {
        &self.spec.hypervisor
    }

    fn vm_name(&self) -> &str {
        &self.spec.vm_name
    }
}

impl std::fmt::Debug for ManagedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedAgent")
            .field("name", &self.name)
            .field("vm", &self.spec.vm_name)
            .field("hypervisor", &self.spec.hypervisor)
            .field("status", &self.status())
            .finish()
    }
}

/// Hypervisors and the agents placed on them.
#[derive(Default)]
pub struct AgentRegistry {
    hypervisors: BTreeMap<String, Arc<Hypervisor>>,
    agents: RwLock<BTreeMap<String, Arc<ManagedAgent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from config, opening one control connection per hypervisor.
    pub fn from_config<F>(config: &FleetConfig, mut connect: F) -> FleetResult<Self>
    where
        F: FnMut(&HypervisorEntry) -> Arc<dyn VmControl>,
    {
        let mut registry = Self::new();
        for entry in &config.hypervisors {
            let control = connect(entry);
            registry.add_hypervisor(Hypervisor::new(
                entry.name.clone(),
                entry.max_online_agents,
                control,
            ));
        }
        for agent in &config.agents {
            registry.add_agent(agent.name.clone(), agent.vm_spec(&config.retention))?;
        }
        Ok(registry)
    }

    pub fn add_hypervisor(&mut self, hypervisor: Hypervisor) -> Arc<Hypervisor> {
        let hv = Arc::new(hypervisor);
        self.hypervisors
            .insert(hv.name().to_string(), Arc::clone(&hv));
        hv
    }

    pub fn hypervisor(&self, name: &str) -> FleetResult<Arc<Hypervisor>> {
        self.hypervisors.get(name).cloned().ok_or_else(|| {
            FleetError::Configuration(format!("Could not find hypervisor '{}'", name))
        })
    }

    pub fn hypervisors(&self) -> impl Iterator<Item = &Arc<Hypervisor>> {
        self.hypervisors.values()
    }

    pub fn add_agent(&self, name: impl Into<String>, spec: VmSpec) -> FleetResult<Arc<ManagedAgent>> {
        let name = name.into();
        let host = self.hypervisor(&spec.hypervisor)?;
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if agents.contains_key(&name) {
            return Err(FleetError::Configuration(format!(
                "Agent '{}' is already registered",
                name
            )));
        }
        let agent = Arc::new(ManagedAgent::new(name.clone(), spec, host));
        agents.insert(name, Arc::clone(&agent));
        Ok(agent)
    }

    pub fn agent(&self, name: &str) -> FleetResult<Arc<ManagedAgent>> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::Configuration(format!("Unknown agent '{}'", name)))
    }

    /// All agents, ordered by name.
    pub fn agents(&self) -> Vec<Arc<ManagedAgent>> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.values().cloned().collect()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ManagedAgent>> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        agents.remove(name)
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHypervisor;

    const CONFIG: &str = r#"
[[hypervisors]]
name = "kvm-1"
uri = "qemu:///system"
max_online_agents = 2

[[agents]]
name = "builder-b"
hypervisor = "kvm-1"
vm_name = "vm-b"

[[agents]]
name = "builder-a"
hypervisor = "kvm-1"
vm_name = "vm-a"
"#;

    fn registry() -> AgentRegistry {
        let config = FleetConfig::parse(CONFIG).unwrap();
        AgentRegistry::from_config(&config, |e| Arc::new(SimHypervisor::new(&e.uri))).unwrap()
    }

    #[test]
    fn test_from_config_orders_agents() {
        let reg = registry();
        let names: Vec<_> = reg.agents().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["builder-a", "builder-b"]);
        assert_eq!(reg.hypervisor("kvm-1").unwrap().capacity().max(), 2);
    }

    #[test]
    fn test_unknown_hypervisor_is_configuration_error() {
        let reg = registry();
        let mut spec = reg.agent("builder-a").unwrap().spec().clone();
        spec.hypervisor = "kvm-9".to_string();
        let err = reg.add_agent("builder-c", spec).unwrap_err();
        assert!(matches!(err, FleetError::Configuration(_)));
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let reg = registry();
        let spec = reg.agent("builder-a").unwrap().spec().clone();
        assert!(reg.add_agent("builder-a", spec).is_err());
    }

    #[test]
    fn test_remove_agent() {
        let reg = registry();
        assert!(reg.remove("builder-a").is_some());
        assert!(reg.remove("builder-a").is_none());
        assert_eq!(reg.len(), 1);
        assert!(reg.agent("builder-a").is_err());
    }

    #[test]
    fn test_status_transitions() {
        let reg = registry();
        let agent = reg.agent("builder-a").unwrap();
        assert_eq!(agent.status(), AgentStatus::Offline);
        assert!(agent.set_status(AgentStatus::Connecting));
        assert!(!agent.set_status(AgentStatus::Connecting));
        assert!(agent.set_status(AgentStatus::Online));
        assert!(agent.set_status(AgentStatus::Offline));
    }

    #[tokio::test]
    async fn test_ops_are_exclusive() {
        let reg = registry();
        let agent = reg.agent("builder-a").unwrap();
        let guard = agent.try_begin_op().unwrap();
        assert!(agent.try_begin_op().is_none());
        drop(guard);
        let _guard = agent.begin_op().await;
        assert!(agent.try_begin_op().is_none());
    }

    #[tokio::test]
    async fn test_cancel_token_fires() {
        let reg = registry();
        let agent = reg.agent("builder-a").unwrap();
        let mut token = agent.cancel_token();
        agent.cancel_launch();
        assert!(token.has_changed().unwrap());
        token.changed().await.unwrap();
    }

    #[test]
    fn test_vm_backed_capability() {
        let reg = registry();
        let agent = reg.agent("builder-b").unwrap();
        let backed: &dyn VmBacked = agent.as_ref();
        assert_eq!(backed.vm_name(), "vm-b");
        assert_eq!(backed.hypervisor(), "kvm-1");
    }
}
