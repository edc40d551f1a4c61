use thiserror::Error;

/// Failures the retention controller distinguishes between.
///
/// Only `Configuration` is fatal to the caller. The rest are isolated to a
/// single agent's launch or shutdown and end with the agent offline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FleetError {
    /// The domain disappeared between the decision and the action.
    #[error("virtual machine '{vm}' not found on hypervisor {hypervisor}")]
    NotFound { vm: String, hypervisor: String },

    /// The hypervisor or agent transport could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// Capacity changed after the launch decision was made.
    #[error("hypervisor {hypervisor} is full, launch of '{agent}' deferred")]
    CapacityRace { agent: String, hypervisor: String },

    /// Missing or inconsistent hypervisor/agent mapping.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A boot in progress was cancelled by a disconnect or removal.
    #[error("launch of '{0}' cancelled")]
    Cancelled(String),
}

impl FleetError {
    /// Benign outcomes are deferred to the next tick rather than reported.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::CapacityRace { .. } | Self::Cancelled(_))
    }
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_classification() {
        assert!(
            FleetError::CapacityRace {
                agent: "a".to_string(),
                hypervisor: "kvm".to_string(),
            }
            .is_benign()
        );
        assert!(FleetError::Cancelled("a".to_string()).is_benign());
        assert!(!FleetError::Transport("reset".to_string()).is_benign());
        assert!(!FleetError::Configuration("x".to_string()).is_benign());
    }

    #[test]
    fn test_not_found_message() {
        let e = FleetError::NotFound {
            vm: "builder-1".to_string(),
            hypervisor: "qemu:///system".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "virtual machine 'builder-1' not found on hypervisor qemu:///system"
        );
    }
}
