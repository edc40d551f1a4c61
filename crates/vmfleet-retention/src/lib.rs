// vmfleet-retention: Capacity accounting, demand analysis, retention controller, boot/shutdown sequencing
// Depends on vmfleet-core (types, config, errors)

pub mod boot;
pub mod capacity;
pub mod controller;
pub mod demand;
pub mod fleet;
pub mod hypervisor;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod sim;
pub mod transport;
