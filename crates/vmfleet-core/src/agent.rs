use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};

/// Agent lifecycle status as seen by the retention controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Offline,
    Connecting,
    Online,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Connecting => write!(f, "connecting"),
            Self::Online => write!(f, "online"),
        }
    }
}

/// Validate that a status transition is allowed.
///
/// `Offline -> Connecting -> Online -> Offline` is the only loop; a boot that
/// fails drops `Connecting` back to `Offline`, and any state may be forced
/// `Offline` by a disconnect or removal.
pub fn validate_transition(from: AgentStatus, to: AgentStatus) -> FleetResult<()> {
    if to == AgentStatus::Offline {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        (AgentStatus::Offline, AgentStatus::Connecting)
            | (AgentStatus::Connecting, AgentStatus::Online)
            // Re-attach to a domain that was already running
            | (AgentStatus::Offline, AgentStatus::Online)
    );

    if valid {
        Ok(())
    } else {
        Err(FleetError::Configuration(format!(
            "Invalid agent transition: {} -> {}",
            from, to
        )))
    }
}

/// How a running domain is brought down when no snapshot is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMethod {
    /// Pause the guest and keep its memory state.
    Suspend,
    /// Hard power-off without guest cooperation.
    Destroy,
    /// ACPI-style graceful shutdown request.
    #[default]
    Shutdown,
}

impl std::fmt::Display for ShutdownMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Suspend => write!(f, "suspend"),
            Self::Destroy => write!(f, "destroy"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Capability of a node that is backed by a hypervisor-managed domain.
///
/// Static (bare-metal or externally managed) nodes do not implement this.
pub trait VmBacked {
    /// Name of the hypervisor that owns the domain.
    fn hypervisor(&self) -> &str;
    /// Domain name on that hypervisor.
    fn vm_name(&self) -> &str;
}

/// Reference from a fleet node to the domain backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRef {
    pub hypervisor: String,
    pub vm_name: String,
}

impl VmBacked for VmRef {
    fn hypervisor(&self) -> &str {
        &self.hypervisor
    }

    fn vm_name(&self) -> &str {
        &self.vm_name
    }
}

/// Everything needed to boot and reclaim the domain behind one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub hypervisor: String,
    pub vm_name: String,
    /// Snapshot to revert to on shutdown. Empty or absent means use `shutdown_method`.
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub shutdown_method: ShutdownMethod,
    pub boot_wait_secs: u64,
    pub retries: u32,
    pub max_idle_minutes: u64,
}

impl VmSpec {
    pub fn boot_wait(&self) -> Duration {
        Duration::from_secs(self.boot_wait_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_minutes.saturating_mul(60))
    }

    /// The configured snapshot, ignoring blank values.
    pub fn revert_snapshot(&self) -> Option<&str> {
        self.snapshot
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl VmBacked for VmSpec {
    fn hypervisor(&self) -> &str {
        &self.hypervisor
    }

    fn vm_name(&self) -> &str {
        &self.vm_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(snapshot: Option<&str>) -> VmSpec {
        VmSpec {
            hypervisor: "kvm-1".to_string(),
            vm_name: "builder-1".to_string(),
            snapshot: snapshot.map(str::to_string),
            shutdown_method: ShutdownMethod::default(),
            boot_wait_secs: 30,
            retries: 3,
            max_idle_minutes: 60,
        }
    }

    #[test]
    fn test_valid_transitions() {
        assert!(validate_transition(AgentStatus::Offline, AgentStatus::Connecting).is_ok());
        assert!(validate_transition(AgentStatus::Connecting, AgentStatus::Online).is_ok());
        assert!(validate_transition(AgentStatus::Online, AgentStatus::Offline).is_ok());
        assert!(validate_transition(AgentStatus::Connecting, AgentStatus::Offline).is_ok());
        assert!(validate_transition(AgentStatus::Offline, AgentStatus::Online).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(validate_transition(AgentStatus::Online, AgentStatus::Connecting).is_err());
        assert!(validate_transition(AgentStatus::Connecting, AgentStatus::Connecting).is_err());
    }

    #[test]
    fn test_default_shutdown_method_is_graceful() {
        assert_eq!(ShutdownMethod::default(), ShutdownMethod::Shutdown);
    }

    #[test]
    fn test_shutdown_method_parses_lowercase() {
        let m: ShutdownMethod = serde_json::from_str("\"destroy\"").unwrap();
        assert_eq!(m, ShutdownMethod::Destroy);
        assert_eq!(m.to_string(), "destroy");
    }

    #[test]
    fn test_blank_snapshot_is_ignored() {
        assert_eq!(spec(Some("  ")).revert_snapshot(), None);
        assert_eq!(spec(None).revert_snapshot(), None);
        assert_eq!(spec(Some("clean")).revert_snapshot(), Some("clean"));
    }

    #[test]
    fn test_durations() {
        let s = spec(None);
        assert_eq!(s.boot_wait(), Duration::from_secs(30));
        assert_eq!(s.max_idle(), Duration::from_secs(3600));
    }

    #[test]
    fn test_huge_idle_threshold_saturates() {
        let s = VmSpec {
            max_idle_minutes: u64::MAX / 2,
            ..spec(None)
        };
        assert_eq!(s.max_idle(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_vm_backed_capability() {
        let s = spec(None);
        let backed: &dyn VmBacked = &s;
        assert_eq!(backed.hypervisor(), "kvm-1");
        assert_eq!(backed.vm_name(), "builder-1");
    }
}
