//! Command-line arguments.
//!
//! Kept apart from `main.rs` so integration tests can parse argument
//! vectors directly.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Toolbridge: bridges cloud tool-protocol endpoints to local tool servers.
#[derive(Parser, Debug)]
#[command(name = "toolbridge", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Configuration file. Defaults to `TOOLBRIDGE_CONFIG`, then
    /// `./config/config.yaml`, then `./config.yaml`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Log line format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Validate the configuration and print a summary.
    Check,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}
