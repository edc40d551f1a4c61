use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::hypervisor::DomainLookup;
use crate::registry::ManagedAgent;
use crate::transport::AgentTransport;
use vmfleet_core::agent::{AgentStatus, ShutdownMethod, VmBacked};
use vmfleet_core::error::{FleetError, FleetResult};

/// What the power step of a shutdown did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Reverted,
    Suspended,
    Destroyed,
    GracefulShutdown,
    /// The domain was not running; no power call was made.
    AlreadyStopped,
    /// The domain no longer exists on the hypervisor.
    DomainMissing,
    /// A VM control call failed. Accounting and teardown still happened.
    Failed(FleetError),
}

/// Drives a running agent's domain to stopped, suspended or reverted.
///
/// Accounting is released and the agent goes `Offline` whatever the power
/// step does.
pub struct ShutdownSequencer {
    transport: Arc<dyn AgentTransport>,
}

impl ShutdownSequencer {
    pub fn new(transport: Arc<dyn AgentTransport>) -> Self {
        Self { transport }
    }

    /// Shut the agent down. The caller must hold the agent's op guard.
    #[instrument(skip_all, fields(agent = %agent.name(), vm = %agent.vm_name()))]
    pub async fn shutdown(&self, agent: &ManagedAgent, cause: Option<&str>) -> ShutdownOutcome {
        let hv = agent.host();
        let log = agent.log();

        info!(
            agent = %agent.name(),
            vm = %agent.vm_name(),
            reason = cause.unwrap_or("unspecified"),
            "VM is to be shut down"
        );
        log.println(format!(
            "Virtual machine \"{}\" (agent \"{}\") is to be shut down.",
            agent.vm_name(),
            agent.name()
        ));

        let outcome = match self.power_down(agent).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log.fatal_error(e.to_string());
                error!(
                    agent = %agent.name(),
                    vm = %agent.vm_name(),
                    hypervisor = %hv.uri(),
                    error = %e,
                    "Error while shutting down VM"
                );
                ShutdownOutcome::Failed(e)
            }
        };

        hv.capacity().mark_offline(agent.name());
        agent.set_status(AgentStatus::Offline);
        self.transport.disconnect(agent.name(), log).await;

        outcome
    }

    /// Cancel any boot in progress, wait for the agent to be free, then shut it down.
    pub async fn shutdown_exclusive(
        &self,
        agent: &ManagedAgent,
        cause: Option<&str>,
    ) -> ShutdownOutcome {
        agent.cancel_launch();
        let _guard = agent.begin_op().await;
        self.shutdown(agent, cause).await
    }

    async fn power_down(&self, agent: &ManagedAgent) -> FleetResult<ShutdownOutcome> {
        let hv = agent.host();
        let control = hv.control();
        let log = agent.log();

        let domain = match control.resolve_domain(agent.vm_name()).await {
            DomainLookup::Found(d) => d,
            DomainLookup::NotFound => {
                log.println(format!(
                    "\"{}\" not found on hypervisor, can not shut down!",
                    agent.vm_name()
                ));
                warn!(
                    vm = %agent.vm_name(),
                    hypervisor = %hv.uri(),
                    "Can not shut down VM, domain not found"
                );
                return Ok(ShutdownOutcome::DomainMissing);
            }
            DomainLookup::TransportFailure(e) => return Err(FleetError::Transport(e)),
        };

        if !control.domain_state(&domain).await?.is_running_or_blocked() {
            log.println("Already suspended, no shutdown required.");
            return Ok(ShutdownOutcome::AlreadyStopped);
        }

        if let Some(snapshot) = agent.spec().revert_snapshot() {
            log.println(format!("Reverting to {} and shutting down.", snapshot));
            control.revert_to_snapshot(&domain, snapshot).await?;
            return Ok(ShutdownOutcome::Reverted);
        }

        log.println("Shutting down.");
        match agent.spec().shutdown_method {
            ShutdownMethod::Suspend => {
                control.suspend(&domain).await?;
                Ok(ShutdownOutcome::Suspended)
            }
            ShutdownMethod::Destroy => {
                control.destroy(&domain).await?;
                Ok(ShutdownOutcome::Destroyed)
            }
            ShutdownMethod::Shutdown => {
                control.shutdown(&domain).await?;
                Ok(ShutdownOutcome::GracefulShutdown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{DomainState, Hypervisor};
    use crate::sim::{SimCall, SimHypervisor, SimOp, SimTransport};
    use vmfleet_core::agent::VmSpec;

    struct Rig {
        sim: Arc<SimHypervisor>,
        transport: Arc<SimTransport>,
        agent: Arc<ManagedAgent>,
        seq: ShutdownSequencer,
    }

    fn rig(snapshot: Option<&str>, method: ShutdownMethod, state: DomainState) -> Rig {
        let sim = Arc::new(SimHypervisor::new("qemu:///system").with_domain("vm-w", state));
        let hv = Arc::new(Hypervisor::new("kvm-1", 2, sim.clone()));
        let spec = VmSpec {
            hypervisor: "kvm-1".to_string(),
            vm_name: "vm-w".to_string(),
            snapshot: snapshot.map(str::to_string),
            shutdown_method: method,
            boot_wait_secs: 30,
            retries: 3,
            max_idle_minutes: 60,
        };
        let agent = Arc::new(ManagedAgent::new("w", spec, hv));
        agent.set_status(AgentStatus::Online);
        agent.host().capacity().mark_online("w");
        agent.host().capacity().mark_online("other");
        let transport = Arc::new(SimTransport::new());
        transport.set_online("w");
        let seq = ShutdownSequencer::new(transport.clone());
        Rig {
            sim,
            transport,
            agent,
            seq,
        }
    }

    fn assert_released(r: &Rig) {
        assert_eq!(r.agent.status(), AgentStatus::Offline);
        assert_eq!(r.agent.host().capacity().current(), 1);
        assert!(!r.agent.host().capacity().is_online("w"));
        assert_eq!(r.transport.disconnects("w"), 1);
        assert!(!r.transport.is_online("w"));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_by_default() {
        let r = rig(None, ShutdownMethod::Shutdown, DomainState::Running);
        let outcome = r.seq.shutdown(&r.agent, Some("idle")).await;
        assert_eq!(outcome, ShutdownOutcome::GracefulShutdown);
        assert_eq!(r.sim.state_of("vm-w"), Some(DomainState::Shutoff));
        assert_eq!(r.agent.log().count_containing("Shutting down."), 1);
        assert_released(&r);
    }

    #[tokio::test]
    async fn test_snapshot_takes_precedence() {
        let r = rig(Some("clean"), ShutdownMethod::Suspend, DomainState::Running);
        let outcome = r.seq.shutdown(&r.agent, None).await;
        assert_eq!(outcome, ShutdownOutcome::Reverted);
        assert_eq!(
            r.sim.calls().last(),
            Some(&SimCall::Revert("vm-w".to_string(), "clean".to_string()))
        );
        assert_eq!(r.sim.count(|c| matches!(c, SimCall::Suspend(_))), 0);
        assert_eq!(r.agent.log().count_containing("Reverting to clean"), 1);
        assert_released(&r);
    }

    #[tokio::test]
    async fn test_blank_snapshot_uses_method() {
        let r = rig(Some("  "), ShutdownMethod::Destroy, DomainState::Blocked);
        assert_eq!(r.seq.shutdown(&r.agent, None).await, ShutdownOutcome::Destroyed);
        assert_released(&r);
    }

    #[tokio::test]
    async fn test_suspend_method() {
        let r = rig(None, ShutdownMethod::Suspend, DomainState::Running);
        assert_eq!(r.seq.shutdown(&r.agent, None).await, ShutdownOutcome::Suspended);
        assert_eq!(r.sim.state_of("vm-w"), Some(DomainState::Paused));
    }

    #[tokio::test]
    async fn test_already_stopped_skips_power_step() {
        let r = rig(Some("clean"), ShutdownMethod::Shutdown, DomainState::Paused);
        assert_eq!(r.seq.shutdown(&r.agent, None).await, ShutdownOutcome::AlreadyStopped);
        assert_eq!(r.sim.count(|c| matches!(c, SimCall::Revert(..))), 0);
        assert_eq!(r.agent.log().count_containing("Already suspended"), 1);
        assert_released(&r);
    }

    #[tokio::test]
    async fn test_missing_domain_still_marks_offline() {
        let r = rig(None, ShutdownMethod::Shutdown, DomainState::Running);
        r.sim.undefine("vm-w");
        assert_eq!(r.seq.shutdown(&r.agent, None).await, ShutdownOutcome::DomainMissing);
        assert_eq!(r.agent.log().count_containing("not found on hypervisor"), 1);
        assert_released(&r);
    }

    #[tokio::test]
    async fn test_failed_power_call_is_swallowed() {
        let r = rig(None, ShutdownMethod::Shutdown, DomainState::Running);
        r.sim.fail(SimOp::Shutdown);
        let outcome = r.seq.shutdown(&r.agent, None).await;
        assert!(matches!(outcome, ShutdownOutcome::Failed(FleetError::Transport(_))));
        assert_eq!(r.agent.log().count_containing("FATAL:"), 1);
        assert_released(&r);
    }

    #[tokio::test]
    async fn test_double_shutdown_decrements_once() {
        let r = rig(None, ShutdownMethod::Shutdown, DomainState::Running);
        r.seq.shutdown(&r.agent, None).await;
        let second = r.seq.shutdown(&r.agent, None).await;
        assert_eq!(second, ShutdownOutcome::AlreadyStopped);
        assert_eq!(r.agent.host().capacity().current(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_in_flight_op() {
        let r = rig(None, ShutdownMethod::Shutdown, DomainState::Running);
        let guard = r.agent.try_begin_op().unwrap();
        let mut cancel = r.agent.cancel_token();

        let agent = r.agent.clone();
        let transport = r.transport.clone();
        let task = tokio::spawn(async move {
            ShutdownSequencer::new(transport)
                .shutdown_exclusive(&agent, Some("operator"))
                .await
        });

        cancel.changed().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(r.sim.count(|c| matches!(c, SimCall::Shutdown(_))), 0);
        drop(guard);

        assert_eq!(task.await.unwrap(), ShutdownOutcome::GracefulShutdown);
        assert_released(&r);
    }
}
