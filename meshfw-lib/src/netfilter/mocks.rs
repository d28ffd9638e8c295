//! Stateful mock for [`PacketFilterController`].
//!
//! The mock keeps an in-memory model of the tables (which chains exist and
//! their ordered rules) so tests assert on the resulting _state_ after a
//! runner operation, not on the sequence of calls.
//!
//! Clones share state through `Arc<Mutex<_>>`, so a test keeps one handle
//! while the runner owns another.

#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::Error;
use super::controller::PacketFilterController;
use super::iptables_ops::rule_spec;
use super::types::{Chain, Family, Rule, Table};

const FILTER_CHAINS: [Chain; 3] = [Chain::Input, Chain::Output, Chain::Forward];
const NAT_CHAINS: [Chain; 3] = [Chain::PreRouting, Chain::Output, Chain::PostRouting];

#[derive(Debug, Default)]
pub struct ControllerState {
    pub chains: HashMap<(Table, Chain), Vec<Rule>>,
    /// Map of operation name -> error message. If set, the operation will fail.
    pub fail_on: HashMap<String, String>,
}

impl ControllerState {
    fn check_fail(&self, family: Family, op: &str) -> Result<(), Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::execution(family, op, msg))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct MockController {
    family: Family,
    pub state: Arc<Mutex<ControllerState>>,
}

impl MockController {
    /// Fresh host: built-in filter and nat chains, all empty.
    pub fn new(family: Family) -> Self {
        let mock = Self::without_nat(family);
        {
            let mut s = mock.state.lock().unwrap();
            for chain in NAT_CHAINS {
                s.chains.insert((Table::Nat, chain), Vec::new());
            }
        }
        mock
    }

    /// Host whose kernel lacks the nat table for this family.
    pub fn without_nat(family: Family) -> Self {
        let mut state = ControllerState::default();
        for chain in FILTER_CHAINS {
            state.chains.insert((Table::Filter, chain), Vec::new());
        }
        Self {
            family,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn fail_on(&self, op: &str, msg: &str) {
        self.state.lock().unwrap().fail_on.insert(op.into(), msg.into());
    }

    /// Rules of a chain, `None` if the chain does not exist.
    pub fn rules(&self, table: Table, chain: Chain) -> Option<Vec<Rule>> {
        self.state.lock().unwrap().chains.get(&(table, chain)).cloned()
    }

    pub fn has_chain(&self, table: Table, chain: Chain) -> bool {
        self.state.lock().unwrap().chains.contains_key(&(table, chain))
    }

    /// Snapshot of every chain, for before/after comparisons.
    pub fn snapshot(&self) -> HashMap<(Table, Chain), Vec<Rule>> {
        self.state.lock().unwrap().chains.clone()
    }

    /// Rejects rules the real controller could not pass on unchanged.
    fn check_rule(&self, table: Table, chain: Chain, rule: &Rule) -> Result<(), Error> {
        rule_spec(rule).map(|_| ()).map_err(|arg| Error::InvalidArgument {
            family: self.family,
            table,
            chain,
            arg: arg.to_string(),
        })
    }

    fn unknown(&self, table: Table, chain: Chain) -> Error {
        Error::UnknownChain {
            family: self.family,
            table,
            chain,
        }
    }
}

impl PacketFilterController for MockController {
    fn family(&self) -> Family {
        self.family
    }

    fn insert(&self, table: Table, chain: Chain, position: usize, rule: &Rule) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail(self.family, "insert")?;
        self.check_rule(table, chain, rule)?;
        let rules = s
            .chains
            .get_mut(&(table, chain))
            .ok_or_else(|| self.unknown(table, chain))?;
        if position == 0 || position > rules.len() + 1 {
            return Err(Error::InvalidPosition {
                family: self.family,
                table,
                chain,
                position,
                rules: rules.len(),
            });
        }
        rules.insert(position - 1, rule.clone());
        Ok(())
    }

    fn append(&self, table: Table, chain: Chain, rule: &Rule) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail(self.family, "append")?;
        self.check_rule(table, chain, rule)?;
        s.chains
            .get_mut(&(table, chain))
            .ok_or_else(|| self.unknown(table, chain))?
            .push(rule.clone());
        Ok(())
    }

    fn exists(&self, table: Table, chain: Chain, rule: &Rule) -> Result<bool, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail(self.family, "exists")?;
        self.check_rule(table, chain, rule)?;
        let rules = s.chains.get(&(table, chain)).ok_or_else(|| self.unknown(table, chain))?;
        Ok(rules.contains(rule))
    }

    fn delete(&self, table: Table, chain: Chain, rule: &Rule) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail(self.family, "delete")?;
        self.check_rule(table, chain, rule)?;
        let rules = s
            .chains
            .get_mut(&(table, chain))
            .ok_or_else(|| self.unknown(table, chain))?;
        match rules.iter().position(|r| r == rule) {
            Some(index) => {
                rules.remove(index);
                Ok(())
            }
            None => Err(Error::RuleNotFound {
                family: self.family,
                table,
                chain,
                rule: rule.clone(),
            }),
        }
    }

    fn list(&self, table: Table, chain: Chain) -> Result<Vec<Rule>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail(self.family, "list")?;
        s.chains
            .get(&(table, chain))
            .cloned()
            .ok_or_else(|| self.unknown(table, chain))
    }

    fn new_chain(&self, table: Table, chain: Chain) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail(self.family, "new_chain")?;
        if chain.is_builtin() {
            return Err(Error::BuiltinChain {
                family: self.family,
                table,
                chain,
            });
        }
        if s.chains.contains_key(&(table, chain)) {
            return Err(Error::ChainExists {
                family: self.family,
                table,
                chain,
            });
        }
        s.chains.insert((table, chain), Vec::new());
        Ok(())
    }

    fn clear_chain(&self, table: Table, chain: Chain) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail(self.family, "clear_chain")?;
        s.chains
            .get_mut(&(table, chain))
            .ok_or_else(|| self.unknown(table, chain))?
            .clear();
        Ok(())
    }

    fn delete_chain(&self, table: Table, chain: Chain) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail(self.family, "delete_chain")?;
        if chain.is_builtin() {
            return Err(Error::BuiltinChain {
                family: self.family,
                table,
                chain,
            });
        }
        let rules = s.chains.get(&(table, chain)).ok_or_else(|| self.unknown(table, chain))?;
        if !rules.is_empty() {
            return Err(Error::ChainNotEmpty {
                family: self.family,
                table,
                chain,
                rules: rules.len(),
            });
        }
        s.chains.remove(&(table, chain));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(spec: &str) -> Rule {
        Rule::parse(spec)
    }

    #[test]
    fn fresh_builtin_chains_hold_no_rules() -> anyhow::Result<()> {
        for family in [Family::V4, Family::V6] {
            let ipt = MockController::new(family);
            let pairs = FILTER_CHAINS
                .iter()
                .map(|c| (Table::Filter, *c))
                .chain(NAT_CHAINS.iter().map(|c| (Table::Nat, *c)));
            for (table, chain) in pairs {
                assert!(!ipt.exists(table, chain, &rule("-j ACCEPT"))?, "{family}/{table}/{chain}");
            }
            assert_eq!(ipt.snapshot().len(), 6);
        }
        Ok(())
    }

    #[test]
    fn rules_with_splitting_arguments_are_rejected() {
        let ipt = MockController::new(Family::V4);
        let err = ipt
            .append(Table::Filter, Chain::Input, &Rule::new(["-i", "mesh 0", "-j", "ACCEPT"]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(ipt.rules(Table::Filter, Chain::Input), Some(vec![]));
    }

    #[test]
    fn insert_places_rule_at_position() -> anyhow::Result<()> {
        let ipt = MockController::new(Family::V4);
        ipt.append(Table::Filter, Chain::Input, &rule("-j A"))?;
        ipt.append(Table::Filter, Chain::Input, &rule("-j B"))?;

        ipt.insert(Table::Filter, Chain::Input, 2, &rule("-j C"))?;

        assert!(ipt.exists(Table::Filter, Chain::Input, &rule("-j C"))?);
        assert_eq!(
            ipt.rules(Table::Filter, Chain::Input),
            Some(vec![rule("-j A"), rule("-j C"), rule("-j B")])
        );
        Ok(())
    }

    #[test]
    fn insert_past_end_is_rejected() {
        let ipt = MockController::new(Family::V6);
        let err = ipt.insert(Table::Filter, Chain::Input, 2, &rule("-j A")).unwrap_err();
        assert!(matches!(err, Error::InvalidPosition { position: 2, rules: 0, .. }));
    }

    #[test]
    fn exists_on_unknown_chain_is_an_error() {
        let ipt = MockController::new(Family::V4);
        let err = ipt.exists(Table::Filter, Chain::MeshInput, &rule("-j A")).unwrap_err();
        assert!(matches!(err, Error::UnknownChain { .. }));
    }

    #[test]
    fn delete_chain_refuses_non_empty_chain() -> anyhow::Result<()> {
        let ipt = MockController::new(Family::V4);
        ipt.new_chain(Table::Filter, Chain::MeshInput)?;
        ipt.append(Table::Filter, Chain::MeshInput, &rule("-j ACCEPT"))?;

        let err = ipt.delete_chain(Table::Filter, Chain::MeshInput).unwrap_err();

        assert!(matches!(err, Error::ChainNotEmpty { rules: 1, .. }));
        assert!(ipt.has_chain(Table::Filter, Chain::MeshInput));
        Ok(())
    }
}
