pub mod args;
pub mod commands;

pub use args::{CliArgs, CliCommand};
pub use commands::run_cli;
