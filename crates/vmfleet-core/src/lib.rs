// vmfleet-core: Pure types, config, error taxonomy, agent log
// No internal vmfleet dependencies; this is the foundation crate.

pub mod agent;
pub mod agent_log;
pub mod config;
pub mod error;
pub mod time;
