//! Config command - configuration management

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use detour_core::Config;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File names searched in the working directory
const LOCAL_CONFIG_FILES: [&str; 2] = ["detour.toml", "config.toml"];

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the configuration in effect
    Show,

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "detour.toml")]
        output: PathBuf,

        /// Country code for the detector rules
        #[arg(long, default_value = "")]
        country: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Config file to validate
        file: PathBuf,
    },

    /// Show config file locations
    Paths,
}

/// Execute config command
pub fn execute(args: ConfigArgs, config: &Config) -> Result<()> {
    match args.action {
        ConfigAction::Show => show_config(config),
        ConfigAction::Generate {
            output,
            country,
            force,
        } => generate_config(&output, country, force),
        ConfigAction::Validate { file } => validate_config(&file),
        ConfigAction::Paths => show_paths(),
    }
}

/// Configuration for this run: the explicit file, else the first one found, else defaults
pub fn resolve(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match find_config_file() {
            Some(path) => path,
            None => return Ok(Config::default()),
        },
    };
    debug!("Using config file {}", path.display());
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "detour")
}

/// Where the whitelist lives when neither the flag nor the config names a file
pub fn default_whitelist_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("whitelist.txt"))
        .unwrap_or_else(|| PathBuf::from("whitelist.txt"))
}

fn find_config_file() -> Option<PathBuf> {
    LOCAL_CONFIG_FILES
        .iter()
        .map(PathBuf::from)
        .chain(project_dirs().map(|dirs| dirs.config_dir().join("config.toml")))
        .find(|path| path.exists())
}

fn show_config(config: &Config) -> Result<()> {
    let toml_str = config.to_toml().context("Failed to serialize config")?;
    println!("{}", toml_str);
    Ok(())
}

fn generate_config(output: &Path, country: String, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }

    let mut config = Config::default();
    config.detector.country = country;
    config
        .validate()
        .context("Generated configuration is invalid")?;
    let toml_str = config.to_toml().context("Failed to serialize config")?;

    let content = format!(
        "# detour configuration\n\
         # Every key is optional; missing keys take the values below\n\n\
         {}",
        toml_str
    );

    std::fs::write(output, content)
        .with_context(|| format!("Failed to write config to {}", output.display()))?;

    info!("Generated config file: {}", output.display());
    println!("{} Configuration file generated: {}", "✓".green(), output.display());
    Ok(())
}

fn validate_config(file: &Path) -> Result<()> {
    let config = Config::load(file)
        .with_context(|| format!("Failed to load config from {}", file.display()))?;
    config
        .validate()
        .context("Configuration validation failed")?;

    let country = if config.detector.country.is_empty() {
        "generic"
    } else {
        config.detector.country.as_str()
    };

    println!("{} Configuration is valid", "✓".green());
    println!("  Connect timeout: {}s", config.dial.timeout_to_connect_secs);
    println!("  Detour delay: {}ms", config.dial.delay_before_detour_ms);
    println!("  Buffer size: {} bytes", config.dial.buffer_size);
    println!("  Detector rules: {}", country);
    match &config.whitelist.file {
        Some(path) => println!("  Whitelist file: {}", path),
        None => println!("  Whitelist file: (in memory)"),
    }
    Ok(())
}

fn show_paths() -> Result<()> {
    println!("Configuration file search paths:");
    println!();
    for (i, name) in LOCAL_CONFIG_FILES.iter().enumerate() {
        println!("  {}. ./{}", i + 1, name);
    }
    if let Some(dirs) = project_dirs() {
        println!(
            "  {}. {}",
            LOCAL_CONFIG_FILES.len() + 1,
            dirs.config_dir().join("config.toml").display()
        );
    }

    println!();
    println!("Default whitelist file:");
    println!();
    println!("  {}", default_whitelist_path().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_explicit_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(resolve(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_resolve_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("detour.toml");
        std::fs::write(&path, "[dial]\ntimeout_to_connect_secs = 0\n").unwrap();
        assert!(resolve(Some(&path)).is_err());
    }

    #[test]
    fn test_generate_then_validate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("detour.toml");
        generate_config(&path, "IR".into(), false).unwrap();
        assert!(generate_config(&path, "IR".into(), false).is_err());

        let config = resolve(Some(&path)).unwrap();
        assert_eq!(config.detector.country, "IR");
        validate_config(&path).unwrap();
    }
}
