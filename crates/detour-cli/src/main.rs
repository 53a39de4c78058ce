//! detour CLI
//!
//! Command-line front end for the detour connection racer.

mod args;
mod commands;
mod logging;
mod upstream;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use args::Args;

fn main() -> Result<()> {
    let args = Args::parse();

    let config = commands::config::resolve(args.config.as_deref())?;
    let _guard = logging::init(&args, &config.logging)?;

    let result = run(args, config);

    if let Err(ref e) = result {
        error!("Fatal error: {:#}", e);
    }

    result
}

fn run(args: Args, config: detour_core::Config) -> Result<()> {
    match args.command {
        commands::Command::Probe(probe_args) => commands::probe::execute(probe_args, config),
        commands::Command::Whitelist(wl_args) => commands::whitelist::execute(wl_args, &config),
        commands::Command::Config(config_args) => commands::config::execute(config_args, &config),
        commands::Command::Completions(comp_args) => commands::completions::execute(comp_args),
    }
}
