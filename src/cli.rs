//! Command-line interface definition for the CWC server
//!
//! A single top-level command (the server has no subcommands), grounded in
//! the teacher's `Cli` derive shape collapsed to its flags.

use clap::Parser;

/// Cloud-Workstation-Companion server
#[derive(Parser, Debug, Clone)]
#[command(name = "cwc-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to an optional YAML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Address to bind the WebSocket listener on
    #[arg(long, env = "CWC_HOST")]
    pub host: Option<String>,

    /// Port to bind the WebSocket listener on
    #[arg(long, env = "CWC_PORT")]
    pub port: Option<u16>,

    /// mDNS service name to advertise under; empty disables advertisement
    #[arg(long = "mdns-name", env = "CWC_MDNS_NAME")]
    pub mdns_name: Option<String>,

    /// Re-validate inbound messages against the full structural schema
    #[arg(long)]
    pub validate: bool,

    /// Raise the default log level from info to debug
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
