//! Abstraction over one address family's packet filter for testability.
//!
//! Production code uses [`super::IptablesController`].
//! Tests use a stateful in-memory model (see `mocks` module).

use super::Error;
use super::types::{Chain, Family, Rule, Table};

/// Per-family chain and rule operations.
///
/// All methods are synchronous and each maps to one or a few invocations of
/// the underlying control utility. Implementations must report a missing
/// chain as [`Error::UnknownChain`] and a missing rule as
/// [`Error::RuleNotFound`] so callers can branch on [`Error::kind`].
pub trait PacketFilterController {
    fn family(&self) -> Family;

    /// Insert `rule` so that it becomes the rule at 1-based `position`.
    /// Fails if `position` is past the end of the chain plus one.
    fn insert(&self, table: Table, chain: Chain, position: usize, rule: &Rule) -> Result<(), Error>;

    fn append(&self, table: Table, chain: Chain, rule: &Rule) -> Result<(), Error>;

    /// `Ok(false)` if the rule is absent, `Err` if the chain is absent.
    fn exists(&self, table: Table, chain: Chain, rule: &Rule) -> Result<bool, Error>;

    /// Remove the first rule matching `rule` exactly.
    fn delete(&self, table: Table, chain: Chain, rule: &Rule) -> Result<(), Error>;

    /// Rules of the chain in evaluation order.
    fn list(&self, table: Table, chain: Chain) -> Result<Vec<Rule>, Error>;

    fn new_chain(&self, table: Table, chain: Chain) -> Result<(), Error>;

    fn clear_chain(&self, table: Table, chain: Chain) -> Result<(), Error>;

    /// Remove an empty owned chain.
    fn delete_chain(&self, table: Table, chain: Chain) -> Result<(), Error>;
}
