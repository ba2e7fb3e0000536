//! CLI module for mlrun
//!
//! Argument parsing, logging setup and the launch command itself.

mod args;
mod commands;
mod logging;

pub use args::{parse_args, Cli};
pub use commands::run_command;
pub use logging::init_logging;
