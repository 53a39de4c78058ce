//! CLI commands

pub mod completions;
pub mod config;
pub mod probe;
pub mod whitelist;

use clap::Subcommand;

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one request through the racer and report which path won
    Probe(probe::ProbeArgs),

    /// Persisted whitelist management
    Whitelist(whitelist::WhitelistArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Generate shell completions
    Completions(completions::CompletionsArgs),
}
