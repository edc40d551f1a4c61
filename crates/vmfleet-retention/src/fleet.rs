use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vmfleet_core::agent::{VmBacked, VmRef};

/// One node of the wider build fleet, VM-backed or not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputerState {
    pub name: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub connecting: bool,
    /// Every executor is idle.
    #[serde(default)]
    pub idle: bool,
    /// At least one executor is idle.
    #[serde(default)]
    pub partially_idle: bool,
    #[serde(default)]
    pub accepting_tasks: bool,
    #[serde(default)]
    pub idle_executors: u32,
    #[serde(default)]
    pub idle_since: Option<DateTime<Utc>>,
    /// Present only for nodes backed by a hypervisor domain.
    #[serde(default)]
    pub vm: Option<VmRef>,
}

impl ComputerState {
    /// An offline node with no executors.
    pub fn offline(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// An online, accepting node with every executor idle since `since`.
    pub fn idle(name: impl Into<String>, executors: u32, since: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            online: true,
            idle: executors > 0,
            partially_idle: executors > 0,
            accepting_tasks: true,
            idle_executors: executors,
            idle_since: Some(since),
            ..Default::default()
        }
    }

    /// An online, accepting node with no idle executors.
    pub fn busy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            online: true,
            accepting_tasks: true,
            ..Default::default()
        }
    }

    /// Attach the VM-backed capability.
    pub fn backed_by(mut self, hypervisor: impl Into<String>, vm_name: impl Into<String>) -> Self {
        self.vm = Some(VmRef {
            hypervisor: hypervisor.into(),
            vm_name: vm_name.into(),
        });
        self
    }

    pub fn as_vm_backed(&self) -> Option<&dyn VmBacked> {
        self.vm.as_ref().map(|v| v as &dyn VmBacked)
    }

    /// Whether this node currently offers idle slots to pending work.
    pub fn offers_slots(&self) -> bool {
        (self.online || self.connecting)
            && self.partially_idle
            && self.accepting_tasks
            && self.idle_executors > 0
    }
}

/// Read-only view of every node in the build fleet.
pub trait Fleet: Send + Sync {
    fn computers(&self) -> Vec<ComputerState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_node_offers_slots() {
        let c = ComputerState::idle("static-1", 2, Utc::now());
        assert!(c.offers_slots());
        assert!(c.as_vm_backed().is_none());
    }

    #[test]
    fn test_busy_and_offline_offer_nothing() {
        assert!(!ComputerState::busy("b").offers_slots());
        assert!(!ComputerState::offline("o").offers_slots());
    }

    #[test]
    fn test_not_accepting_offers_nothing() {
        let mut c = ComputerState::idle("n", 1, Utc::now());
        c.accepting_tasks = false;
        assert!(!c.offers_slots());
    }

    #[test]
    fn test_connecting_node_offers_slots() {
        let mut c = ComputerState::idle("n", 1, Utc::now());
        c.online = false;
        c.connecting = true;
        assert!(c.offers_slots());
    }

    #[test]
    fn test_backed_by_exposes_capability() {
        let c = ComputerState::offline("builder-1").backed_by("kvm-1", "builder-1-vm");
        let vm = c.as_vm_backed().unwrap();
        assert_eq!(vm.hypervisor(), "kvm-1");
        assert_eq!(vm.vm_name(), "builder-1-vm");
    }

    #[test]
    fn test_deserialize_sparse() {
        let c: ComputerState = serde_json::from_str(r#"{"name": "n1", "online": true}"#).unwrap();
        assert!(c.online);
        assert_eq!(c.idle_executors, 0);
        assert!(c.vm.is_none());
    }
}
