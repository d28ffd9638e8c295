//! Vocabulary shared by the controllers and the runner.
//!
//! A rule is addressed structurally by `(table, chain, args)`. There are no
//! handles: two rules with the same argument list in the same chain are
//! indistinguishable.

use std::fmt;
use std::net::IpAddr;

/// Address family of a packet filter instance (`iptables` vs `ip6tables`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn is_v6(self) -> bool {
        self == Family::V6
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "v4"),
            Family::V6 => write!(f, "v6"),
        }
    }
}

/// Built-in netfilter tables this engine touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chains known to the engine.
///
/// Built-in chains always exist and are never created or destroyed here.
/// The `Mesh*` chains are owned: created by `add_chains`, destroyed by
/// `del_chains`, and every VPN rule lives in one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Input,
    Output,
    Forward,
    PreRouting,
    PostRouting,
    MeshInput,
    MeshForward,
    MeshPostRouting,
}

impl Chain {
    pub fn name(&self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
            Chain::Forward => "FORWARD",
            Chain::PreRouting => "PREROUTING",
            Chain::PostRouting => "POSTROUTING",
            Chain::MeshInput => "mesh-input",
            Chain::MeshForward => "mesh-forward",
            Chain::MeshPostRouting => "mesh-postrouting",
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, Chain::MeshInput | Chain::MeshForward | Chain::MeshPostRouting)
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One match+action entry, as the ordered argument list handed to iptables.
///
/// Equality is exact argument equality; no normalization is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    args: Vec<String>,
}

impl Rule {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits a whitespace separated rule specification.
    /// Quoted arguments are not supported.
    pub fn parse(spec: &str) -> Self {
        Self::new(spec.split_whitespace())
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}
