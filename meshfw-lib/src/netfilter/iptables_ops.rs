//! Production [`PacketFilterController`] backed by the `iptables` crate.
//!
//! The crate shells out to `iptables`/`ip6tables` and only reports exit
//! status and stderr. Absence of chains and rules is therefore checked up
//! front with `chain_exists`/`exists` so the returned errors are classified
//! instead of carrying raw utility output.

use super::Error;
use super::controller::PacketFilterController;
use super::types::{Chain, Family, Rule, Table};

pub struct IptablesController {
    family: Family,
    inner: iptables::IPTables,
}

impl IptablesController {
    pub fn new(family: Family) -> Result<Self, Error> {
        let inner = iptables::new(family.is_v6()).map_err(|e| Error::execution(family, "init", e))?;
        Ok(Self { family, inner })
    }

    /// Whether `table` can be used on this host (e.g. the `nat` table is
    /// missing on kernels without `ip6table_nat`).
    pub fn has_table(&self, table: Table) -> bool {
        let probe = match table {
            Table::Filter => Chain::Input,
            Table::Nat => Chain::PostRouting,
        };
        match self.inner.chain_exists(table.as_str(), probe.name()) {
            Ok(exists) => exists,
            Err(error) => {
                tracing::debug!(family = %self.family, %table, %error, "table probe failed");
                false
            }
        }
    }

    fn ensure_chain(&self, table: Table, chain: Chain) -> Result<(), Error> {
        let exists = self
            .inner
            .chain_exists(table.as_str(), chain.name())
            .map_err(|e| self.failed("chain_exists", table, chain, e))?;
        if exists {
            Ok(())
        } else {
            Err(Error::UnknownChain {
                family: self.family,
                table,
                chain,
            })
        }
    }

    fn spec(&self, table: Table, chain: Chain, rule: &Rule) -> Result<String, Error> {
        rule_spec(rule).map_err(|arg| Error::InvalidArgument {
            family: self.family,
            table,
            chain,
            arg: arg.to_string(),
        })
    }

    fn failed(&self, op: &str, table: Table, chain: Chain, err: impl std::fmt::Display) -> Error {
        Error::execution(self.family, format!("{op} {table}/{chain}"), err)
    }
}

impl PacketFilterController for IptablesController {
    fn family(&self) -> Family {
        self.family
    }

    fn insert(&self, table: Table, chain: Chain, position: usize, rule: &Rule) -> Result<(), Error> {
        let rules = self.list(table, chain)?.len();
        if position == 0 || position > rules + 1 {
            return Err(Error::InvalidPosition {
                family: self.family,
                table,
                chain,
                position,
                rules,
            });
        }
        let index = i32::try_from(position).map_err(|e| self.failed("insert", table, chain, e))?;
        self.inner
            .insert(table.as_str(), chain.name(), &self.spec(table, chain, rule)?, index)
            .map_err(|e| self.failed("insert", table, chain, e))
    }

    fn append(&self, table: Table, chain: Chain, rule: &Rule) -> Result<(), Error> {
        self.ensure_chain(table, chain)?;
        self.inner
            .append(table.as_str(), chain.name(), &self.spec(table, chain, rule)?)
            .map_err(|e| self.failed("append", table, chain, e))
    }

    fn exists(&self, table: Table, chain: Chain, rule: &Rule) -> Result<bool, Error> {
        self.ensure_chain(table, chain)?;
        self.inner
            .exists(table.as_str(), chain.name(), &self.spec(table, chain, rule)?)
            .map_err(|e| self.failed("exists", table, chain, e))
    }

    fn delete(&self, table: Table, chain: Chain, rule: &Rule) -> Result<(), Error> {
        if !self.exists(table, chain, rule)? {
            return Err(Error::RuleNotFound {
                family: self.family,
                table,
                chain,
                rule: rule.clone(),
            });
        }
        self.inner
            .delete(table.as_str(), chain.name(), &self.spec(table, chain, rule)?)
            .map_err(|e| self.failed("delete", table, chain, e))
    }

    fn list(&self, table: Table, chain: Chain) -> Result<Vec<Rule>, Error> {
        self.ensure_chain(table, chain)?;
        let lines = self
            .inner
            .list(table.as_str(), chain.name())
            .map_err(|e| self.failed("list", table, chain, e))?;
        Ok(parse_listing(chain, &lines))
    }

    fn new_chain(&self, table: Table, chain: Chain) -> Result<(), Error> {
        if chain.is_builtin() {
            return Err(Error::BuiltinChain {
                family: self.family,
                table,
                chain,
            });
        }
        match self.ensure_chain(table, chain) {
            Ok(()) => Err(Error::ChainExists {
                family: self.family,
                table,
                chain,
            }),
            Err(Error::UnknownChain { .. }) => self
                .inner
                .new_chain(table.as_str(), chain.name())
                .map_err(|e| self.failed("new_chain", table, chain, e)),
            Err(e) => Err(e),
        }
    }

    fn clear_chain(&self, table: Table, chain: Chain) -> Result<(), Error> {
        self.ensure_chain(table, chain)?;
        self.inner
            .flush_chain(table.as_str(), chain.name())
            .map_err(|e| self.failed("flush_chain", table, chain, e))
    }

    fn delete_chain(&self, table: Table, chain: Chain) -> Result<(), Error> {
        if chain.is_builtin() {
            return Err(Error::BuiltinChain {
                family: self.family,
                table,
                chain,
            });
        }
        let rules = self.list(table, chain)?.len();
        if rules != 0 {
            return Err(Error::ChainNotEmpty {
                family: self.family,
                table,
                chain,
                rules,
            });
        }
        self.inner
            .delete_chain(table.as_str(), chain.name())
            .map_err(|e| self.failed("delete_chain", table, chain, e))
    }
}

/// Joins the arguments of `rule` into the string the `iptables` crate
/// expects.
///
/// The crate splits that string on whitespace again, so an argument that is
/// empty or contains whitespace would reach the utility as a different rule.
/// Such an argument is returned as the error.
pub(super) fn rule_spec(rule: &Rule) -> Result<String, &str> {
    if let Some(arg) = rule.args().iter().find(|a| a.is_empty() || a.chars().any(char::is_whitespace)) {
        return Err(arg.as_str());
    }
    Ok(rule.args().join(" "))
}

/// Extracts the rules of `chain` from `iptables -S <chain>` output.
///
/// Policy (`-P`) and chain declaration (`-N`) lines are skipped. The
/// utility prints rules in its canonical form, which may differ from the
/// form they were inserted with (e.g. host addresses gain a `/32`).
fn parse_listing(chain: Chain, lines: &[String]) -> Vec<Rule> {
    let prefix = format!("-A {} ", chain.name());
    lines
        .iter()
        .filter_map(|line| line.strip_prefix(&prefix))
        .map(Rule::parse)
        .collect()
}
