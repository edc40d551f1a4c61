use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedMutexGuard, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::hypervisor::{DomainHandle, DomainLookup, Hypervisor};
use crate::registry::ManagedAgent;
use crate::transport::AgentTransport;
use vmfleet_core::agent::{AgentStatus, VmBacked};
use vmfleet_core::error::{FleetError, FleetResult};

/// How a launch ended when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The agent answered a handshake.
    Online { attempts: u32 },
    /// The hypervisor filled up before the domain was started.
    Deferred,
    /// Every handshake attempt failed.
    Exhausted { attempts: u32 },
}

/// Drives an agent's domain from powered off to a connected agent.
pub struct BootSequencer {
    transport: Arc<dyn AgentTransport>,
}

impl BootSequencer {
    pub fn new(transport: Arc<dyn AgentTransport>) -> Self {
        Self { transport }
    }

    /// Start the agent's domain and handshake with it.
    ///
    /// Between attempts the domain is looked up again and powered on if a
    /// third party stopped it. Each wait ends early when `cancel` fires.
    #[instrument(skip_all, fields(agent = %agent.name(), vm = %agent.vm_name()))]
    pub async fn launch(
        &self,
        agent: &ManagedAgent,
        cancel: &mut watch::Receiver<u64>,
    ) -> FleetResult<LaunchOutcome> {
        let hv = agent.host();
        let log = agent.log();
        let vm = agent.vm_name();

        log.println(format!(
            "Virtual machine \"{}\" (agent \"{}\") is to be started.",
            vm,
            agent.name()
        ));
        log.println("Connecting to the hypervisor...");

        let mut domain = resolve(hv, vm).await?;

        if !hv.capacity().has_room_for(agent.name()) {
            log.println(format!(
                "Hypervisor {} is full, can't launch new VMs",
                hv.name()
            ));
            info!(hypervisor = %hv.name(), "Hypervisor full, launch deferred");
            return Ok(LaunchOutcome::Deferred);
        }

        let state = hv.control().domain_state(&domain).await?;
        if !state.needs_power_on() {
            log.println("Already running, no startup required.");
            log.println("Connecting agent client.");
            return Ok(if self.handshake(agent).await {
                LaunchOutcome::Online { attempts: 1 }
            } else {
                LaunchOutcome::Exhausted { attempts: 1 }
            });
        }

        let wait = agent.spec().boot_wait();
        ensure_not_cancelled(cancel, agent.name())?;
        log.println(format!(
            "Starting, waiting for {}ms to let it fully boot up...",
            wait.as_millis()
        ));
        hv.control().power_on(&domain).await?;
        wait_or_cancel(wait, cancel, agent.name()).await?;

        let retries = agent.spec().retries.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            log.println("Connecting agent client.");
            if self.handshake(agent).await {
                return Ok(LaunchOutcome::Online { attempts });
            }
            if attempts >= retries {
                log.println("Maximum retries reached. Failed to start agent client.");
                return Ok(LaunchOutcome::Exhausted { attempts });
            }

            log.println(format!(
                "Not up yet, waiting for {}ms more ({}/{} retries)...",
                wait.as_millis(),
                attempts,
                retries
            ));

            // The domain may have been destroyed or undefined in the meantime.
            match hv.control().resolve_domain(vm).await {
                DomainLookup::Found(d) => {
                    domain = d;
                    self.restart_if_stopped(agent, &domain).await;
                }
                DomainLookup::NotFound => {
                    return Err(FleetError::NotFound {
                        vm: vm.to_string(),
                        hypervisor: hv.uri().to_string(),
                    });
                }
                DomainLookup::TransportFailure(e) => {
                    warn!(hypervisor = %hv.uri(), error = %e, "Could not re-check VM between attempts");
                }
            }

            wait_or_cancel(wait, cancel, agent.name()).await?;
        }
    }

    /// Run `launch` and apply its result to the agent's status and the
    /// hypervisor's accounting. A launch that does not come online gives
    /// back its reservation. The guard is held until settled.
    pub async fn launch_and_settle(
        &self,
        agent: Arc<ManagedAgent>,
        mut cancel: watch::Receiver<u64>,
        guard: OwnedMutexGuard<()>,
    ) -> FleetResult<LaunchOutcome> {
        let result = self.launch(&agent, &mut cancel).await;
        let hv = agent.host();

        match &result {
            Ok(LaunchOutcome::Online { attempts }) => {
                agent.set_status(AgentStatus::Online);
                hv.capacity().mark_online(agent.name());
                info!(agent = %agent.name(), hypervisor = %hv.name(), attempts, "Agent online");
            }
            Ok(LaunchOutcome::Deferred) => {
                agent.set_status(AgentStatus::Offline);
            }
            Ok(LaunchOutcome::Exhausted { attempts }) => {
                agent.set_status(AgentStatus::Offline);
                warn!(
                    agent = %agent.name(),
                    hypervisor = %hv.uri(),
                    attempts,
                    "Agent did not come online"
                );
            }
            Err(e) if e.is_benign() => {
                agent.set_status(AgentStatus::Offline);
                agent.log().println(e.to_string());
                info!(agent = %agent.name(), reason = %e, "Launch abandoned");
            }
            Err(e) => {
                agent.set_status(AgentStatus::Offline);
                agent.log().fatal_error(e.to_string());
                error!(
                    agent = %agent.name(),
                    vm = %agent.vm_name(),
                    hypervisor = %hv.uri(),
                    error = %e,
                    "Error while launching VM"
                );
            }
        }

        hv.capacity().release(agent.name());
        drop(guard);
        result
    }

    async fn handshake(&self, agent: &ManagedAgent) -> bool {
        if let Err(e) = self.transport.connect(agent.name(), agent.log()).await {
            debug!(agent = %agent.name(), error = %e, "Handshake failed");
        }
        self.transport.is_online(agent.name())
    }

    async fn restart_if_stopped(&self, agent: &ManagedAgent, domain: &DomainHandle) {
        let hv = agent.host();
        match hv.control().domain_state(domain).await {
            Ok(state) if state.needs_power_on() => {
                agent.log().println(format!(
                    "Could not create VM \"{}\" trying again",
                    agent.vm_name()
                ));
                if let Err(e) = hv.control().power_on(domain).await {
                    warn!(hypervisor = %hv.uri(), error = %e, "Power-on retry failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(hypervisor = %hv.uri(), error = %e, "Could not read VM state between attempts");
            }
        }
    }
}

async fn resolve(hv: &Hypervisor, vm: &str) -> FleetResult<DomainHandle> {
    match hv.control().resolve_domain(vm).await {
        DomainLookup::Found(d) => Ok(d),
        DomainLookup::NotFound => Err(FleetError::NotFound {
            vm: vm.to_string(),
            hypervisor: hv.uri().to_string(),
        }),
        DomainLookup::TransportFailure(e) => Err(FleetError::Transport(e)),
    }
}

fn ensure_not_cancelled(cancel: &watch::Receiver<u64>, agent: &str) -> FleetResult<()> {
    match cancel.has_changed() {
        Ok(false) => Ok(()),
        _ => Err(FleetError::Cancelled(agent.to_string())),
    }
}

async fn wait_or_cancel(
    wait: Duration,
    cancel: &mut watch::Receiver<u64>,
    agent: &str,
) -> FleetResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(wait) => Ok(()),
        _ = cancel.changed() => Err(FleetError::Cancelled(agent.to_string())),
    }
}
