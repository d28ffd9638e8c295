use clap::{Parser, Subcommand};

use std::net::IpAddr;
use std::path::PathBuf;

use meshfw_lib::{config, logging};

/// Mesh VPN firewall - installs and removes the packet filter rules of the mesh interface
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// General configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
    )]
    pub config_path: PathBuf,

    /// Tunnel interface name, overrides the configuration file
    #[arg(short, long)]
    pub tunnel: Option<String>,

    /// Write logs to this file instead of stdout
    #[arg(long, env = logging::ENV_VAR_LOG_FILE)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum Command {
    /// Install hooks, owned chains and the configured rules
    Up,
    /// Remove everything installed by `up`
    Down,
    /// Remove hooks and owned chains left behind by an unclean exit
    Cleanup,
    /// Show detected packet filter capabilities
    Status,
    /// Manage loopback accept rules for local addresses
    Loopback {
        #[command(subcommand)]
        action: LoopbackAction,
    },
    /// Toggle masquerading of subnet-routed traffic
    Snat {
        #[command(subcommand)]
        action: Toggle,
    },
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum LoopbackAction {
    Add { addr: IpAddr },
    Del { addr: IpAddr },
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum Toggle {
    Enable,
    Disable,
}

pub fn parse() -> Cli {
    Cli::parse()
}
