use thiserror::Error;

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use crate::netfilter::RuleParams;

mod v1;

pub const DEFAULT_PATH: &str = "/etc/meshfw/config.toml";
pub const ENV_VAR: &str = "MESHFW_CONFIG_PATH";
pub const DEFAULT_TUNNEL: &str = "mesh0";

/// Longest interface name the kernel accepts (IFNAMSIZ without the NUL).
const MAX_IFNAME_LEN: usize = 15;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Name of the mesh tunnel interface, always validated.
    tunnel: String,
    pub firewall: Firewall,
    params: RuleParams,
}

/// Optional parts of the rule set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Firewall {
    /// Masquerade subnet-routed traffic.
    pub subnet_routing: bool,
    /// Drop new connections forwarded towards the tunnel.
    pub stateful: bool,
    pub loopback_addrs: Vec<IpAddr>,
    pub listen_port: Option<u16>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("Unable to determine configuration version")]
    VersionNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Unsupported config version: {0}")]
    VersionMismatch(i64),
    #[error("Invalid interface name: {0:?}")]
    InvalidInterface(String),
    #[error("Invalid fwmark {0:?}: expected a hexadecimal value like 0x40000")]
    InvalidMark(String),
    #[error("Subnet route mark {mark} has bits outside of mask {mask}")]
    MarkOutsideMask { mark: String, mask: String },
    #[error("Host VM range {host_vm} is not inside the mesh range {cgnat}")]
    VmRangeOutsideMesh { host_vm: String, cgnat: String },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel: DEFAULT_TUNNEL.to_string(),
            firewall: Firewall::default(),
            params: RuleParams::default(),
        }
    }
}

impl Config {
    pub fn tunnel(&self) -> &str {
        &self.tunnel
    }

    /// Replaces the tunnel interface name, applying the same checks as the
    /// configuration file.
    pub fn with_tunnel(mut self, name: String) -> Result<Self, Error> {
        validate_interface(&name)?;
        self.tunnel = name;
        Ok(self)
    }

    pub fn rule_params(&self) -> RuleParams {
        self.params.clone()
    }
}

pub fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    parse(&content)
}

fn parse(content: &str) -> Result<Config, Error> {
    let table = content.parse::<toml::Table>()?;
    let version = table
        .get("version")
        .and_then(|v| v.as_integer())
        .ok_or(Error::VersionNotFound)?;

    match version {
        1 => {
            let res = toml::from_str::<v1::Config>(content)?;
            for key in v1::wrong_keys(&table).iter() {
                tracing::warn!(%key, "ignoring unsupported key in configuration file");
            }
            res.try_into()
        }
        _ => Err(Error::VersionMismatch(version)),
    }
}

fn validate_interface(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && !name.chars().any(|c| c.is_whitespace() || c == '/' || c == ':');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInterface(name.to_string()))
    }
}

fn parse_mark(mark: &str) -> Result<u32, Error> {
    mark.strip_prefix("0x")
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .ok_or_else(|| Error::InvalidMark(mark.to_string()))
}

fn validate_params(params: &RuleParams) -> Result<(), Error> {
    let mark = parse_mark(&params.subnet_route_mark)?;
    let mask = parse_mark(&params.fwmark_mask)?;
    if mark == 0 || mark & !mask != 0 {
        return Err(Error::MarkOutsideMask {
            mark: params.subnet_route_mark.clone(),
            mask: params.fwmark_mask.clone(),
        });
    }
    let cgnat = params.cgnat_range;
    let host_vm = params.host_vm_range;
    if host_vm.network_length() < cgnat.network_length() || !cgnat.contains(&host_vm.first_address()) {
        return Err(Error::VmRangeOutsideMesh {
            host_vm: host_vm.to_string(),
            cgnat: cgnat.to_string(),
        });
    }
    Ok(())
}
