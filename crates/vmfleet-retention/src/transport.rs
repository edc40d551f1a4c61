use async_trait::async_trait;

use vmfleet_core::agent_log::AgentLog;
use vmfleet_core::error::FleetResult;

/// Generic remote-agent transport that owns the control channel to a guest
/// once it is reachable.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Whether this transport can start agents on demand at all.
    fn launch_supported(&self) -> bool {
        true
    }

    /// Attempt one handshake with the agent. Errors are reported, and the
    /// caller decides whether to retry based on `is_online`.
    async fn connect(&self, agent: &str, log: &AgentLog) -> FleetResult<()>;

    fn is_online(&self, agent: &str) -> bool;

    /// Tear down the control channel. Never fails; problems go to `log`.
    async fn disconnect(&self, agent: &str, log: &AgentLog);
}
