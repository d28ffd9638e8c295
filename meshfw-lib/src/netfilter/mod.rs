//! Dual-stack packet filter management for the mesh interface.
//!
//! [`PacketFilterController`] is the narrow per-family view of the host's
//! packet filter. [`IptablesRunner`] fans the VPN-level operations out to one
//! controller per address family.

use thiserror::Error;

mod controller;
mod iptables_ops;
mod rules;
mod runner;
mod types;

#[cfg(test)]
mod mocks;

pub use controller::PacketFilterController;
pub use iptables_ops::IptablesController;
pub use rules::RuleParams;
pub use runner::{IptablesRunner, new_iptables_runner};
pub use types::{Chain, Family, Rule, Table};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{family}/{table}/{chain}: no such chain")]
    UnknownChain { family: Family, table: Table, chain: Chain },
    #[error("{family}/{table}/{chain}: chain already exists")]
    ChainExists { family: Family, table: Table, chain: Chain },
    #[error("{family}/{table}/{chain}: chain is not empty ({rules} rules)")]
    ChainNotEmpty {
        family: Family,
        table: Table,
        chain: Chain,
        rules: usize,
    },
    #[error("{family}/{table}/{chain}: built-in chains cannot be created or deleted")]
    BuiltinChain { family: Family, table: Table, chain: Chain },
    #[error("{family}/{table}/{chain}: rule `{rule}` not found")]
    RuleNotFound {
        family: Family,
        table: Table,
        chain: Chain,
        rule: Rule,
    },
    #[error("{family}/{table}/{chain}: position {position} out of range for {rules} rules")]
    InvalidPosition {
        family: Family,
        table: Table,
        chain: Chain,
        position: usize,
        rules: usize,
    },
    #[error("{family}/{table}/{chain}: anchor rule `{rule}` missing")]
    MissingAnchor {
        family: Family,
        table: Table,
        chain: Chain,
        rule: Rule,
    },
    #[error("{family}/{table}/{chain}: argument {arg:?} cannot be passed to the packet filter")]
    InvalidArgument {
        family: Family,
        table: Table,
        chain: Chain,
        arg: String,
    },
    #[error("{family}: {op} failed: {message}")]
    Execution {
        family: Family,
        op: String,
        message: String,
    },
}

/// Classification of [`Error`] used by the orchestration code to decide
/// between aborting and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Table or chain unknown to the packet filter.
    UnknownTarget,
    /// Operation conflicts with existing state (chain exists, chain not empty).
    Conflict,
    /// Rule to check or delete is absent.
    NotFound,
    /// The packet filter itself failed to run, or the caller passed bad input.
    Execution,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownChain { .. } => ErrorKind::UnknownTarget,
            Error::ChainExists { .. } | Error::ChainNotEmpty { .. } | Error::BuiltinChain { .. } => {
                ErrorKind::Conflict
            }
            Error::RuleNotFound { .. } | Error::MissingAnchor { .. } => ErrorKind::NotFound,
            Error::InvalidPosition { .. } | Error::InvalidArgument { .. } | Error::Execution { .. } => {
                ErrorKind::Execution
            }
        }
    }

    /// True when the thing a teardown wanted to remove is already gone.
    pub fn is_absent(&self) -> bool {
        matches!(self, Error::UnknownChain { .. } | Error::RuleNotFound { .. })
    }

    pub(crate) fn execution(family: Family, op: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Execution {
            family,
            op: op.into(),
            message: err.to_string(),
        }
    }
}
