//! CLI argument definitions for infw-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use infw_core::config::InfwConfig;

/// infw ingress node firewall daemon.
///
/// Loads the XDP classifier (or the external offload backend), syncs the
/// per-interface rules file into it, re-syncs on SIGHUP, and tears the
/// firewall instance down on SIGINT/SIGTERM.
#[derive(Parser, Debug)]
#[command(name = "infw-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to infw.toml configuration file.
    #[arg(short, long, default_value = "/etc/infw/infw.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Override the rule sink backend (xdp, offload).
    #[arg(long)]
    pub backend: Option<String>,

    /// Override the rules file path.
    #[arg(short, long)]
    pub rules: Option<String>,

    /// Validate configuration and rules file, then exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,
}

impl DaemonCli {
    /// Load the config file, apply `INFW_*` environment overrides, then
    /// CLI overrides, and validate the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// final configuration is invalid.
    pub async fn load_config(&self) -> Result<InfwConfig> {
        let content = tokio::fs::read_to_string(&self.config)
            .await
            .with_context(|| format!("failed to read config file {}", self.config.display()))?;

        let mut config = InfwConfig::parse(&content)
            .with_context(|| format!("failed to parse config file {}", self.config.display()))?;
        config.apply_env_overrides();
        self.apply_overrides(&mut config);
        config.validate().context("config validation failed")?;
        Ok(config)
    }

    /// Apply command-line overrides on top of an already loaded config.
    pub fn apply_overrides(&self, config: &mut InfwConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            config.general.log_format.clone_from(format);
        }
        if let Some(backend) = &self.backend {
            config.firewall.backend.clone_from(backend);
        }
        if let Some(rules) = &self.rules {
            config.firewall.rules_path.clone_from(rules);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = DaemonCli::try_parse_from(["infw-daemon"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/infw/infw.toml"));
        assert!(cli.log_level.is_none());
        assert!(cli.rules.is_none());
        assert!(!cli.validate);
    }

    #[test]
    fn test_overrides_replace_config_values() {
        let cli = DaemonCli::try_parse_from([
            "infw-daemon",
            "--log-level",
            "debug",
            "--backend",
            "offload",
            "-r",
            "/tmp/rules.toml",
        ])
        .unwrap();

        let mut config = InfwConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.log_format, "json");
        assert_eq!(config.firewall.backend, "offload");
        assert_eq!(config.firewall.rules_path, "/tmp/rules.toml");
    }
}
