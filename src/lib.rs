//! # vmfleet: demand-driven retention for hypervisor-backed build agents
//!
//! Facade crate that re-exports the vmfleet workspace crates so consumers
//! can depend on a single `vmfleet` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | vmfleet-core | Agent types, config, error taxonomy, agent log |
//! | [`retention`] | vmfleet-retention | Capacity, demand analysis, controller, boot/shutdown |
//! | [`cli`] | vmfleet-cli | Commands, output rendering, logging setup |

pub use vmfleet_cli as cli;
pub use vmfleet_core as core;
pub use vmfleet_retention as retention;
