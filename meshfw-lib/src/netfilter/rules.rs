//! Rule composition for the mesh firewall.
//!
//! Everything here is pure: functions build the exact argument lists that
//! the runner installs and later looks up again, so the same function must
//! be used on both the add and the delete path.

use cidr::Ipv4Cidr;

use std::net::{IpAddr, Ipv4Addr};

use super::types::{Chain, Family, Rule};

pub const DEFAULT_SUBNET_ROUTE_MARK: &str = "0x40000";
pub const DEFAULT_FWMARK_MASK: &str = "0xff0000";

/// Values consumed by the rule set but owned by configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleParams {
    /// fwmark value designating subnet-routed traffic.
    pub subnet_route_mark: String,
    /// Bits of the fwmark reserved for the mesh daemon.
    pub fwmark_mask: String,
    /// The mesh's private address range.
    pub cgnat_range: Ipv4Cidr,
    /// Host-local virtual machine range carved out of `cgnat_range`.
    pub host_vm_range: Ipv4Cidr,
}

impl Default for RuleParams {
    fn default() -> Self {
        Self {
            subnet_route_mark: DEFAULT_SUBNET_ROUTE_MARK.to_string(),
            fwmark_mask: DEFAULT_FWMARK_MASK.to_string(),
            cgnat_range: default_cgnat_range(),
            host_vm_range: default_host_vm_range(),
        }
    }
}

pub fn default_cgnat_range() -> Ipv4Cidr {
    static_cidr(Ipv4Addr::new(100, 64, 0, 0), 10)
}

pub fn default_host_vm_range() -> Ipv4Cidr {
    static_cidr(Ipv4Addr::new(100, 115, 92, 0), 23)
}

fn static_cidr(addr: Ipv4Addr, len: u8) -> Ipv4Cidr {
    match Ipv4Cidr::new(addr, len) {
        Ok(cidr) => cidr,
        Err(_) => unreachable!("{addr}/{len} has host bits set"),
    }
}

impl RuleParams {
    /// `<mark>/<mask>` as used by both `--set-mark` and `--mark`.
    pub fn mark_spec(&self) -> String {
        format!("{}/{}", self.subnet_route_mark, self.fwmark_mask)
    }
}

/// Jump from a built-in chain into the owned chain.
pub fn hook_jump(owned: Chain) -> Rule {
    Rule::new(["-j", owned.name()])
}

/// Rules of the owned input chain, in evaluation order.
///
/// On v4 traffic claiming a mesh source address but arriving on another
/// interface is dropped, except for the host VM range which returns to the
/// built-in chain. The exception has to come first.
pub fn base_input(family: Family, tun: &str, params: &RuleParams) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(3);
    if family == Family::V4 {
        let vm_range = params.host_vm_range.to_string();
        let cgnat = params.cgnat_range.to_string();
        rules.push(Rule::new(["!", "-i", tun, "-s", vm_range.as_str(), "-j", "RETURN"]));
        rules.push(Rule::new(["!", "-i", tun, "-s", cgnat.as_str(), "-j", "DROP"]));
    }
    rules.push(Rule::new(["-i", tun, "-j", "ACCEPT"]));
    rules
}

/// Rules of the owned forward chain, in evaluation order.
///
/// Traffic entering from the tunnel is marked so that both the forward
/// accept below and the NAT post-routing chain can match it.
pub fn base_forward(family: Family, tun: &str, params: &RuleParams) -> Vec<Rule> {
    let mark = params.mark_spec();
    let mut rules = Vec::with_capacity(4);
    rules.push(Rule::new(["-i", tun, "-j", "MARK", "--set-mark", mark.as_str()]));
    rules.push(Rule::new(["-m", "mark", "--mark", mark.as_str(), "-j", "ACCEPT"]));
    if family == Family::V4 {
        let cgnat = params.cgnat_range.to_string();
        rules.push(Rule::new(["-o", tun, "-s", cgnat.as_str(), "-j", "DROP"]));
    }
    rules.push(forward_accept_out(tun));
    rules
}

/// Final accept of the owned forward chain, anchor for the stateful drop.
pub fn forward_accept_out(tun: &str) -> Rule {
    Rule::new(["-o", tun, "-j", "ACCEPT"])
}

/// Drops new connections routed towards the tunnel.
pub fn stateful_drop(tun: &str) -> Rule {
    Rule::new([
        "-o",
        tun,
        "-m",
        "conntrack",
        "!",
        "--ctstate",
        "ESTABLISHED,RELATED",
        "-j",
        "DROP",
    ])
}

pub fn loopback_accept(addr: IpAddr) -> Rule {
    let source = addr.to_string();
    Rule::new(["-i", "lo", "-s", source.as_str(), "-j", "ACCEPT"])
}

pub fn snat_masquerade(params: &RuleParams) -> Rule {
    let mark = params.mark_spec();
    Rule::new(["-m", "mark", "--mark", mark.as_str(), "-j", "MASQUERADE"])
}

pub fn udp_port_accept(port: u16) -> Rule {
    let port = port.to_string();
    Rule::new(["-p", "udp", "--dport", port.as_str(), "-j", "ACCEPT"])
}
