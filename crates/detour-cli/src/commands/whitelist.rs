//! Whitelist management commands
//!
//! Edits the persisted whitelist: destinations that always go through the
//! detour without racing.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use detour_core::{Config, Whitelist};
use std::path::{Path, PathBuf};

use super::config::default_whitelist_path;

/// Whitelist management arguments
#[derive(Args, Debug)]
pub struct WhitelistArgs {
    /// Whitelist file (default: the config's `whitelist.file`, then the data directory)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub action: WhitelistAction,
}

/// Whitelist subcommands
#[derive(Subcommand, Debug)]
pub enum WhitelistAction {
    /// List whitelisted destinations
    List {
        /// Print as a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Add a destination (host:port)
    Add {
        /// Destination address
        addr: String,
    },

    /// Remove a destination
    Remove {
        /// Destination address
        addr: String,
    },

    /// Check whether a destination skips the race
    Check {
        /// Destination address
        addr: String,
    },

    /// Remove every destination
    Clear,
}

/// Execute whitelist command
pub fn execute(args: WhitelistArgs, config: &Config) -> Result<()> {
    let path = args
        .file
        .or_else(|| config.whitelist.file.as_ref().map(PathBuf::from))
        .unwrap_or_else(default_whitelist_path);

    match args.action {
        WhitelistAction::List { json } => list(&path, json),
        WhitelistAction::Add { addr } => add(&path, &addr),
        WhitelistAction::Remove { addr } => remove(&path, &addr),
        WhitelistAction::Check { addr } => check(&path, &addr),
        WhitelistAction::Clear => clear(&path),
    }
}

fn open(path: &Path) -> Result<Whitelist> {
    if path.exists() {
        Whitelist::from_file(path)
            .with_context(|| format!("Failed to load whitelist from {}", path.display()))
    } else {
        let whitelist = Whitelist::new();
        whitelist.set_file(path);
        Ok(whitelist)
    }
}

/// Save to the associated file, creating its directory on first use
pub fn save(whitelist: &Whitelist) -> Result<()> {
    if let Some(parent) = whitelist.file().as_deref().and_then(Path::parent) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    whitelist.save().context("Failed to save whitelist")?;
    Ok(())
}

fn validate_addr(addr: &str) -> Result<()> {
    let valid = addr
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .unwrap_or(false);
    anyhow::ensure!(valid, "'{}' is not a host:port address", addr);
    Ok(())
}

fn list(path: &Path, json: bool) -> Result<()> {
    let whitelist = open(path)?;
    let entries = whitelist.permanent_entries();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("{}", "═".repeat(50).bright_blue());
    println!("{}", " Detour whitelist".bright_white().bold());
    println!("{}", "═".repeat(50).bright_blue());
    println!("File: {}", path.display().to_string().cyan());
    println!("Total: {}", entries.len().to_string().green());
    println!("{}", "─".repeat(50).bright_black());
    if entries.is_empty() {
        println!("{}", "  (empty)".dimmed());
    }
    for addr in &entries {
        println!("  {} {}", "●".green(), addr);
    }
    println!("{}", "═".repeat(50).bright_blue());
    Ok(())
}

fn add(path: &Path, addr: &str) -> Result<()> {
    validate_addr(addr)?;
    let whitelist = open(path)?;
    whitelist.add(addr, true);
    save(&whitelist)?;

    println!("{} Added {} to whitelist", "✓".green(), addr.cyan());
    println!("  File: {}", path.display());
    Ok(())
}

fn remove(path: &Path, addr: &str) -> Result<()> {
    let whitelist = open(path)?;
    if !whitelist.contains(addr) {
        println!("{} {} is not whitelisted", "!".yellow(), addr);
        return Ok(());
    }
    whitelist.remove(addr);
    save(&whitelist)?;

    println!("{} Removed {} from whitelist", "✓".green(), addr.cyan());
    Ok(())
}

fn check(path: &Path, addr: &str) -> Result<()> {
    let whitelist = open(path)?;
    if whitelist.contains(addr) {
        println!("{} {} goes through detour only", "●".green(), addr.cyan());
    } else {
        println!("{} {} races direct against detour", "○".yellow(), addr.cyan());
    }
    Ok(())
}

fn clear(path: &Path) -> Result<()> {
    let whitelist = open(path)?;
    let count = whitelist.len();
    whitelist.clear();
    save(&whitelist)?;

    println!("{} Removed {} entries", "✓".green(), count);
    Ok(())
}
