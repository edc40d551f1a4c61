// vmfleet-cli: Clap commands, output rendering, logging setup
// Depends on vmfleet-core, vmfleet-retention

pub mod commands;
pub mod logging;
pub mod output;

pub use commands::run;
