//! Subcommand implementations and shared helpers.

pub mod concept;
pub mod config_cmd;
pub mod memory;
pub mod preview;
pub mod rules;

use ctxvault_config::AppConfig;
use serde::Serialize;
use std::path::Path;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Load the config file given on the command line, or the default one.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .map_err(|e| format!("Failed to load config: {e}"))?;
    Ok(config)
}

pub fn require_project(project: Option<&str>) -> Result<&str, Box<dyn std::error::Error>> {
    project
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| "this command needs --project <id> (or CTXVAULT_PROJECT)".into())
}

pub fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
