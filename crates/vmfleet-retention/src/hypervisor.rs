use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capacity::CapacityTracker;
use vmfleet_core::error::FleetResult;

/// Domain run state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    Suspended,
}

impl DomainState {
    pub fn is_running_or_blocked(self) -> bool {
        matches!(self, Self::Running | Self::Blocked)
    }

    /// True when a power-on is required before the guest can be reached.
    pub fn needs_power_on(self) -> bool {
        !self.is_running_or_blocked()
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoState => "nostate",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::ShuttingDown => "shutting_down",
            Self::Shutoff => "shutoff",
            Self::Crashed => "crashed",
            Self::Suspended => "suspended",
        };
        write!(f, "{}", s)
    }
}

/// Opaque reference to a resolved domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    pub name: String,
}

/// Outcome of looking a domain up by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainLookup {
    Found(DomainHandle),
    NotFound,
    TransportFailure(String),
}

/// Control surface of a remote virtualization API.
///
/// Every call may fail with `FleetError::Transport` at any time.
#[async_trait]
pub trait VmControl: Send + Sync {
    /// Connection URI, used for log context.
    fn uri(&self) -> &str;

    async fn resolve_domain(&self, name: &str) -> DomainLookup;

    async fn domain_state(&self, domain: &DomainHandle) -> FleetResult<DomainState>;

    async fn power_on(&self, domain: &DomainHandle) -> FleetResult<()>;

    /// Graceful, guest-cooperative shutdown.
    async fn shutdown(&self, domain: &DomainHandle) -> FleetResult<()>;

    async fn suspend(&self, domain: &DomainHandle) -> FleetResult<()>;

    /// Hard power-off.
    async fn destroy(&self, domain: &DomainHandle) -> FleetResult<()>;

    /// Revert to a named snapshot, which both stops and resets the domain.
    async fn revert_to_snapshot(&self, domain: &DomainHandle, snapshot: &str) -> FleetResult<()>;
}

/// A hypervisor: its control API plus its capacity accounting.
pub struct Hypervisor {
    name: String,
    control: Arc<dyn VmControl>,
    capacity: CapacityTracker,
}

impl Hypervisor {
    pub fn new(name: impl Into<String>, max_online: usize, control: Arc<dyn VmControl>) -> Self {
        let name = name.into();
        Self {
            capacity: CapacityTracker::new(name.clone(), max_online),
            name,
            control,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &str {
        self.control.uri()
    }

    pub fn control(&self) -> &dyn VmControl {
        self.control.as_ref()
    }

    pub fn capacity(&self) -> &CapacityTracker {
        &self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.capacity.is_full()
    }
}

impl std::fmt::Debug for Hypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hypervisor")
            .field("name", &self.name)
            .field("uri", &self.uri())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHypervisor;

    #[test]
    fn test_running_or_blocked() {
        assert!(DomainState::Running.is_running_or_blocked());
        assert!(DomainState::Blocked.is_running_or_blocked());
        assert!(!DomainState::Paused.is_running_or_blocked());
        assert!(!DomainState::Shutoff.is_running_or_blocked());
        assert!(DomainState::Shutoff.needs_power_on());
        assert!(DomainState::Suspended.needs_power_on());
    }

    #[test]
    fn test_domain_state_display() {
        assert_eq!(DomainState::ShuttingDown.to_string(), "shutting_down");
        let parsed: DomainState = serde_json::from_str("\"shutoff\"").unwrap();
        assert_eq!(parsed, DomainState::Shutoff);
    }

    #[test]
    fn test_hypervisor_delegates_capacity() {
        let sim = Arc::new(SimHypervisor::new("qemu:///system"));
        let hv = Hypervisor::new("kvm-1", 1, sim);
        assert_eq!(hv.name(), "kvm-1");
        assert_eq!(hv.uri(), "qemu:///system");
        assert!(!hv.is_full());
        hv.capacity().mark_online("a");
        assert!(hv.is_full());
    }
}
