//! Configuration commands
//!
//! Show the effective configuration, locate or create the config file.

use super::Globals;
use crate::system_config;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;

/// Print the effective configuration as TOML
pub fn run_show(globals: &Globals) -> Result<()> {
    let config = globals.load()?;
    let path = system_config::config_file_path(globals.config.as_deref())?;

    let source = if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (not found, using defaults)", path.display())
    };
    println!("{}: {}", "Location".dimmed(), source.dimmed());
    println!("{}: {}\n", "Data dir".dimmed(), config.data_dir().display());

    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    print!("{}", rendered);
    Ok(())
}

/// Print the config file location, optionally creating it
pub fn run_path(globals: &Globals, create: bool) -> Result<()> {
    if create {
        system_config::init_if_missing(globals.config.as_deref())?;
    }
    let path = system_config::config_file_path(globals.config.as_deref())?;
    println!("{}", path.display());
    Ok(())
}

/// Write the example config unless one exists
pub fn run_init(globals: &Globals) -> Result<()> {
    let path = system_config::config_file_path(globals.config.as_deref())?;
    if system_config::init_if_missing(globals.config.as_deref())? {
        println!("{} Wrote {}", "✓".green(), path.display().to_string().cyan());
    } else {
        println!("{} {}", path.display().to_string().cyan(), "already exists".dimmed());
    }
    Ok(())
}

pub fn run_example() -> Result<()> {
    print!("{}", system_config::example_config());
    Ok(())
}
