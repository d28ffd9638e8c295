use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};

use std::net::IpAddr;

use crate::config::{self, DEFAULT_TUNNEL, Firewall as FirewallConfig};
use crate::netfilter::RuleParams;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: u8,
    tunnel: Option<Tunnel>,
    marks: Option<Marks>,
    ranges: Option<Ranges>,
    firewall: Option<Firewall>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Tunnel {
    name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Marks {
    subnet_route: Option<String>,
    mask: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Ranges {
    cgnat: Option<Ipv4Cidr>,
    host_vm: Option<Ipv4Cidr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Firewall {
    subnet_routing: Option<bool>,
    stateful: Option<bool>,
    loopback_addrs: Option<Vec<IpAddr>>,
    listen_port: Option<u16>,
}

pub fn wrong_keys(table: &toml::Table) -> Vec<String> {
    let known: [(&str, &[&str]); 4] = [
        ("tunnel", &["name"]),
        ("marks", &["subnet_route", "mask"]),
        ("ranges", &["cgnat", "host_vm"]),
        ("firewall", &["subnet_routing", "stateful", "loopback_addrs", "listen_port"]),
    ];
    let mut wrong_keys = Vec::new();
    for (key, value) in table.iter() {
        if key == "version" {
            continue;
        }
        let Some((_, fields)) = known.iter().find(|(section, _)| *section == key.as_str()) else {
            wrong_keys.push(key.clone());
            continue;
        };
        if let Some(section) = value.as_table() {
            for k in section.keys() {
                if !fields.contains(&k.as_str()) {
                    wrong_keys.push(format!("{key}.{k}"));
                }
            }
        }
    }
    wrong_keys
}

impl TryFrom<Config> for config::Config {
    type Error = config::Error;

    fn try_from(value: Config) -> Result<Self, Self::Error> {
        let defaults = RuleParams::default();

        let tunnel = value
            .tunnel
            .and_then(|t| t.name)
            .unwrap_or_else(|| DEFAULT_TUNNEL.to_string());
        config::validate_interface(&tunnel)?;

        let (subnet_route_mark, fwmark_mask) = match value.marks {
            Some(marks) => (
                marks.subnet_route.unwrap_or(defaults.subnet_route_mark),
                marks.mask.unwrap_or(defaults.fwmark_mask),
            ),
            None => (defaults.subnet_route_mark, defaults.fwmark_mask),
        };
        let (cgnat_range, host_vm_range) = match value.ranges {
            Some(ranges) => (
                ranges.cgnat.unwrap_or(defaults.cgnat_range),
                ranges.host_vm.unwrap_or(defaults.host_vm_range),
            ),
            None => (defaults.cgnat_range, defaults.host_vm_range),
        };
        let params = RuleParams {
            subnet_route_mark,
            fwmark_mask,
            cgnat_range,
            host_vm_range,
        };
        config::validate_params(&params)?;

        let firewall = match value.firewall {
            Some(fw) => FirewallConfig {
                subnet_routing: fw.subnet_routing.unwrap_or_default(),
                stateful: fw.stateful.unwrap_or_default(),
                loopback_addrs: fw.loopback_addrs.unwrap_or_default(),
                listen_port: fw.listen_port,
            },
            None => FirewallConfig::default(),
        };

        Ok(config::Config {
            tunnel,
            firewall,
            params,
        })
    }
}
