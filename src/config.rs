//! Configuration management for the CWC server
//!
//! Loads an optional YAML file, overlays `CWC_*` environment variables, then
//! overlays CLI flags (CLI always wins), the way the teacher's
//! `Config::load(path, &cli)` layers file defaults under CLI overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::error::{CwcError, Result};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server configuration: file defaults overlaid by env vars,
/// overlaid by CLI flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
    /// mDNS service name; empty disables advertisement.
    #[serde(default)]
    pub mdns_name: String,
    /// Enable `SchemaValidator` instead of `NoopValidator`.
    #[serde(default)]
    pub validate: bool,
    /// `tracing` level filter.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mdns_name: String::new(),
            validate: false,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then env vars, then CLI
    /// overrides. A missing file is not an error -- defaults are used.
    pub fn load(path: Option<&str>, cli: &Cli) -> Result<Self> {
        let mut config = match path {
            Some(path) if Path::new(path).exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::warn!(path, "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CwcError::Config(format!("reading {path}: {e}")))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| CwcError::Config(format!("parsing {path}: {e}")).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(host) = std::env::var("CWC_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("CWC_PORT") {
            match port.parse() {
                Ok(v) => self.port = v,
                Err(_) => tracing::warn!(port, "invalid CWC_PORT, ignoring"),
            }
        }
        if let Ok(name) = std::env::var("CWC_MDNS_NAME") {
            self.mdns_name = name;
        }
        if let Ok(level) = std::env::var("CWC_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(name) = &cli.mdns_name {
            self.mdns_name = name.clone();
        }
        if cli.validate {
            self.validate = true;
        }
        if cli.verbose {
            self.log_level = "debug".to_string();
        }
    }

    /// Validate the resolved configuration.
    pub fn validate_config(&self) -> Result<()> {
        if self.port == 0 {
            return Err(CwcError::Config("port must be nonzero".to_string()).into());
        }
        if self.host.is_empty() {
            return Err(CwcError::Config("host must not be empty".to_string()).into());
        }
        Ok(())
    }
}
