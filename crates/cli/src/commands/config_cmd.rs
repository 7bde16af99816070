//! `ctxvault config`: configuration commands.

use super::CliResult;
use clap::Subcommand;
use ctxvault_config::AppConfig;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the built-in defaults as TOML
    Defaults,
    /// Print the config file location
    Path,
}

pub fn run(command: ConfigCommand, config: &AppConfig, explicit: Option<&Path>) -> CliResult {
    match command {
        ConfigCommand::Show => println!("{}", toml::to_string_pretty(config)?),
        ConfigCommand::Defaults => println!("{}", AppConfig::default_toml()),
        ConfigCommand::Path => {
            let path = explicit
                .map(Path::to_path_buf)
                .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn config_path_is_valid() {
        let path = ctxvault_config::AppConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().contains("config.toml"));
    }
}
