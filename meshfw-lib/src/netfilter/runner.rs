//! Dual-stack orchestration of the mesh firewall.
//!
//! [`IptablesRunner`] owns one [`PacketFilterController`] per address family
//! and installs the mesh rule set into both:
//!
//! | table  | built-in chain | owned chain        |
//! |--------|----------------|--------------------|
//! | filter | INPUT          | `mesh-input`       |
//! | filter | FORWARD        | `mesh-forward`     |
//! | nat    | POSTROUTING    | `mesh-postrouting` |
//!
//! Every operation is idempotent: `add_*` may be repeated after a partial
//! failure and `del_*` may be called when nothing is installed. There is no
//! rollback inside an operation; callers recover by re-running the
//! operation or its inverse.
//!
//! The host's tables are process-wide shared state. One runner, used
//! serially, must own them; mutating operations take `&mut self` to make
//! that explicit. Nothing here guards against other processes editing the
//! same tables concurrently.

use std::net::IpAddr;

use super::controller::PacketFilterController;
use super::iptables_ops::IptablesController;
use super::rules::{self, RuleParams};
use super::types::{Chain, Family, Rule, Table};
use super::{Error, ErrorKind};

/// Owned chains in the filter table, present in every family.
const FILTER_CHAINS: [Chain; 2] = [Chain::MeshInput, Chain::MeshForward];

/// (built-in chain, owned chain) pairs hooked in the filter table.
const FILTER_HOOKS: [(Chain, Chain); 2] = [(Chain::Input, Chain::MeshInput), (Chain::Forward, Chain::MeshForward)];

/// (built-in chain, owned chain) pair hooked in the nat table.
const NAT_HOOK: (Chain, Chain) = (Chain::PostRouting, Chain::MeshPostRouting);

pub struct IptablesRunner<C: PacketFilterController> {
    ipt4: C,
    /// `None` on hosts without a usable IPv6 packet filter.
    ipt6: Option<C>,
    v4_nat: bool,
    v6_nat: bool,
    params: RuleParams,
}

/// Builds the production runner, probing which families and nat tables the
/// host supports.
pub fn new_iptables_runner(params: RuleParams) -> Result<IptablesRunner<IptablesController>, Error> {
    let ipt4 = IptablesController::new(Family::V4)?;
    let v4_nat = ipt4.has_table(Table::Nat);

    let ipt6 = match IptablesController::new(Family::V6) {
        Ok(ipt6) if ipt6.has_table(Table::Filter) => Some(ipt6),
        Ok(_) => {
            tracing::warn!("ip6tables filter table unavailable - managing IPv4 only");
            None
        }
        Err(error) => {
            tracing::warn!(%error, "ip6tables unavailable - managing IPv4 only");
            None
        }
    };
    let v6_nat = ipt6.as_ref().is_some_and(|ipt| ipt.has_table(Table::Nat));

    tracing::info!(v6 = ipt6.is_some(), v4_nat, v6_nat, "packet filter capabilities detected");
    Ok(IptablesRunner::new(ipt4, ipt6, v4_nat, v6_nat, params))
}

impl<C: PacketFilterController> IptablesRunner<C> {
    pub fn new(ipt4: C, ipt6: Option<C>, v4_nat: bool, v6_nat: bool, params: RuleParams) -> Self {
        Self {
            ipt4,
            ipt6,
            v4_nat,
            v6_nat,
            params,
        }
    }

    pub fn has_ipv6(&self) -> bool {
        self.ipt6.is_some()
    }

    pub fn has_ipv4_nat(&self) -> bool {
        self.v4_nat
    }

    pub fn has_ipv6_nat(&self) -> bool {
        self.ipt6.is_some() && self.v6_nat
    }

    /// Controllers of all available families.
    fn tables(&self) -> impl Iterator<Item = &C> {
        std::iter::once(&self.ipt4).chain(self.ipt6.as_ref())
    }

    /// Controllers of the families that have a nat table.
    fn nat_tables(&self) -> impl Iterator<Item = &C> {
        let v4 = self.v4_nat.then_some(&self.ipt4);
        let v6 = self.ipt6.as_ref().filter(|_| self.v6_nat);
        v4.into_iter().chain(v6)
    }

    /// Creates the owned chains, or empties them if they survived a previous
    /// run.
    pub fn add_chains(&mut self) -> Result<(), Error> {
        for ipt in self.tables() {
            for chain in FILTER_CHAINS {
                create_chain(ipt, Table::Filter, chain)?;
            }
        }
        for ipt in self.nat_tables() {
            create_chain(ipt, Table::Nat, Chain::MeshPostRouting)?;
        }
        Ok(())
    }

    /// Empties and removes the owned chains. Hooks must be removed first,
    /// a chain still referenced by a jump cannot be deleted.
    pub fn del_chains(&mut self) -> Result<(), Error> {
        for ipt in self.tables() {
            for chain in FILTER_CHAINS {
                delete_chain(ipt, Table::Filter, chain)?;
            }
        }
        for ipt in self.nat_tables() {
            delete_chain(ipt, Table::Nat, Chain::MeshPostRouting)?;
        }
        Ok(())
    }

    /// Makes the jump into each owned chain the first rule of its built-in
    /// chain.
    pub fn add_hooks(&mut self) -> Result<(), Error> {
        for ipt in self.tables() {
            for (builtin, owned) in FILTER_HOOKS {
                divert(ipt, Table::Filter, builtin, owned)?;
            }
        }
        for ipt in self.nat_tables() {
            let (builtin, owned) = NAT_HOOK;
            divert(ipt, Table::Nat, builtin, owned)?;
        }
        Ok(())
    }

    /// Removes the jumps installed by [`Self::add_hooks`].
    ///
    /// Missing hooks or chains are reported to `logf` and skipped so that a
    /// single absent hook never blocks the rest of the teardown.
    pub fn del_hooks<F: FnMut(&str)>(&mut self, mut logf: F) -> Result<(), Error> {
        for ipt in self.tables() {
            for (builtin, owned) in FILTER_HOOKS {
                del_hook(ipt, Table::Filter, builtin, owned, &mut logf)?;
            }
        }
        for ipt in self.nat_tables() {
            let (builtin, owned) = NAT_HOOK;
            del_hook(ipt, Table::Nat, builtin, owned, &mut logf)?;
        }
        Ok(())
    }

    /// Installs the baseline policy for the tunnel interface `tun`.
    pub fn add_base(&mut self, tun: &str) -> Result<(), Error> {
        for ipt in self.tables() {
            let family = ipt.family();
            let input = rules::base_input(family, tun, &self.params);
            install_in_order(ipt, Table::Filter, Chain::MeshInput, &input)?;
            let forward = rules::base_forward(family, tun, &self.params);
            install_in_order(ipt, Table::Filter, Chain::MeshForward, &forward)?;
        }
        Ok(())
    }

    /// Empties the owned filter chains. This also drops loopback, port and
    /// stateful rules, which live in the same chains.
    pub fn del_base(&mut self) -> Result<(), Error> {
        for ipt in self.tables() {
            for chain in FILTER_CHAINS {
                match ipt.clear_chain(Table::Filter, chain) {
                    Ok(()) => (),
                    Err(e) if e.kind() == ErrorKind::UnknownTarget => {
                        tracing::debug!(family = %ipt.family(), %chain, "chain already gone");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Accepts loopback traffic sourced from `addr`, ahead of every other
    /// rule of the owned input chain.
    pub fn add_loopback_rule(&mut self, addr: IpAddr) -> Result<(), Error> {
        let Some(ipt) = self.family_table(Family::of(addr)) else {
            return Ok(());
        };
        let rule = rules::loopback_accept(addr);
        if ipt.exists(Table::Filter, Chain::MeshInput, &rule)? {
            return Ok(());
        }
        ipt.insert(Table::Filter, Chain::MeshInput, 1, &rule)?;
        tracing::debug!(family = %ipt.family(), %addr, "loopback rule added");
        Ok(())
    }

    pub fn del_loopback_rule(&mut self, addr: IpAddr) -> Result<(), Error> {
        let Some(ipt) = self.family_table(Family::of(addr)) else {
            return Ok(());
        };
        delete_if_present(ipt, Table::Filter, Chain::MeshInput, &rules::loopback_accept(addr))
    }

    /// Masquerades subnet-routed traffic in every family with a nat table.
    pub fn add_snat_rule(&mut self) -> Result<(), Error> {
        let rule = rules::snat_masquerade(&self.params);
        for ipt in self.nat_tables() {
            append_unique(ipt, Table::Nat, Chain::MeshPostRouting, &rule)?;
        }
        Ok(())
    }

    pub fn del_snat_rule(&mut self) -> Result<(), Error> {
        let rule = rules::snat_masquerade(&self.params);
        for ipt in self.nat_tables() {
            delete_if_present(ipt, Table::Nat, Chain::MeshPostRouting, &rule)?;
        }
        Ok(())
    }

    /// Drops new connections forwarded towards `tun`. The rule goes right
    /// before the final `-o <tun> -j ACCEPT` installed by [`Self::add_base`],
    /// which must therefore be present.
    pub fn add_stateful_rule(&mut self, tun: &str) -> Result<(), Error> {
        let rule = rules::stateful_drop(tun);
        let anchor = rules::forward_accept_out(tun);
        for ipt in self.tables() {
            if ipt.exists(Table::Filter, Chain::MeshForward, &rule)? {
                continue;
            }
            let existing = ipt.list(Table::Filter, Chain::MeshForward)?;
            let Some(index) = existing.iter().position(|r| *r == anchor) else {
                return Err(Error::MissingAnchor {
                    family: ipt.family(),
                    table: Table::Filter,
                    chain: Chain::MeshForward,
                    rule: anchor,
                });
            };
            ipt.insert(Table::Filter, Chain::MeshForward, index + 1, &rule)?;
        }
        Ok(())
    }

    pub fn del_stateful_rule(&mut self, tun: &str) -> Result<(), Error> {
        let rule = rules::stateful_drop(tun);
        for ipt in self.tables() {
            delete_if_present(ipt, Table::Filter, Chain::MeshForward, &rule)?;
        }
        Ok(())
    }

    /// Accepts the daemon's own UDP listener on `port` for one family.
    pub fn add_magicsock_port_rule(&mut self, port: u16, family: Family) -> Result<(), Error> {
        match self.family_table(family) {
            Some(ipt) => append_unique(ipt, Table::Filter, Chain::MeshInput, &rules::udp_port_accept(port)),
            None => Ok(()),
        }
    }

    pub fn del_magicsock_port_rule(&mut self, port: u16, family: Family) -> Result<(), Error> {
        match self.family_table(family) {
            Some(ipt) => delete_if_present(ipt, Table::Filter, Chain::MeshInput, &rules::udp_port_accept(port)),
            None => Ok(()),
        }
    }

    /// Removes hooks and owned chains left behind by an earlier run.
    pub fn clean_up<F: FnMut(&str)>(&mut self, logf: F) -> Result<(), Error> {
        self.del_hooks(logf)?;
        self.del_chains()
    }

    fn family_table(&self, family: Family) -> Option<&C> {
        let ipt = match family {
            Family::V4 => Some(&self.ipt4),
            Family::V6 => self.ipt6.as_ref(),
        };
        if ipt.is_none() {
            tracing::debug!(%family, "address family unavailable - skipping");
        }
        ipt
    }
}

/// Creates `chain`, or empties it if it already exists.
fn create_chain<C: PacketFilterController>(ipt: &C, table: Table, chain: Chain) -> Result<(), Error> {
    match ipt.clear_chain(table, chain) {
        Ok(()) => {
            tracing::debug!(family = %ipt.family(), %table, %chain, "reusing existing chain");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::UnknownTarget => {
            ipt.new_chain(table, chain)?;
            tracing::debug!(family = %ipt.family(), %table, %chain, "chain created");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Empties then removes `chain`; a chain that does not exist is left alone.
fn delete_chain<C: PacketFilterController>(ipt: &C, table: Table, chain: Chain) -> Result<(), Error> {
    match ipt.clear_chain(table, chain) {
        Ok(()) => (),
        Err(e) if e.kind() == ErrorKind::UnknownTarget => {
            tracing::debug!(family = %ipt.family(), %table, %chain, "chain already gone");
            return Ok(());
        }
        Err(e) => return Err(e),
    }
    ipt.delete_chain(table, chain)?;
    tracing::debug!(family = %ipt.family(), %table, %chain, "chain deleted");
    Ok(())
}

/// Ensures the jump to `owned` is rule 1 of `builtin`.
///
/// An existing jump that something else pushed down is moved back to the
/// top.
fn divert<C: PacketFilterController>(ipt: &C, table: Table, builtin: Chain, owned: Chain) -> Result<(), Error> {
    let jump = rules::hook_jump(owned);
    if ipt.exists(table, builtin, &jump)? {
        let current = ipt.list(table, builtin)?;
        if current.first() == Some(&jump) {
            return Ok(());
        }
        tracing::info!(family = %ipt.family(), %table, chain = %builtin, "hook displaced - moving back to the top");
        ipt.delete(table, builtin, &jump)?;
    }
    ipt.insert(table, builtin, 1, &jump)?;
    tracing::debug!(family = %ipt.family(), %table, chain = %builtin, target = %owned, "hook installed");
    Ok(())
}

fn del_hook<C, F>(ipt: &C, table: Table, builtin: Chain, owned: Chain, logf: &mut F) -> Result<(), Error>
where
    C: PacketFilterController,
    F: FnMut(&str),
{
    let jump = rules::hook_jump(owned);
    match ipt.delete(table, builtin, &jump) {
        Ok(()) => Ok(()),
        Err(e) if e.is_absent() => {
            logf(&format!("hook not removed: {e}"));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn append_unique<C: PacketFilterController>(ipt: &C, table: Table, chain: Chain, rule: &Rule) -> Result<(), Error> {
    if ipt.exists(table, chain, rule)? {
        return Ok(());
    }
    ipt.append(table, chain, rule)?;
    tracing::debug!(family = %ipt.family(), %table, %chain, %rule, "rule appended");
    Ok(())
}

/// Installs `rules` as a block that keeps their relative order.
///
/// Rules already present as a leading run are kept and the rest appended.
/// If a later rule survives while an earlier one is gone, appending would
/// land the earlier rule behind it, so the surviving rules are removed and
/// the whole block is laid down again at the end of the chain.
fn install_in_order<C: PacketFilterController>(ipt: &C, table: Table, chain: Chain, rules: &[Rule]) -> Result<(), Error> {
    let mut present = Vec::with_capacity(rules.len());
    for rule in rules {
        present.push(ipt.exists(table, chain, rule)?);
    }
    let kept = present.iter().take_while(|p| **p).count();
    if kept == rules.len() {
        return Ok(());
    }
    let start = if present[kept..].iter().any(|p| *p) {
        tracing::info!(family = %ipt.family(), %table, %chain, "rules out of order - reinstalling");
        for (rule, _) in rules.iter().zip(present.iter()).filter(|(_, p)| **p) {
            ipt.delete(table, chain, rule)?;
        }
        0
    } else {
        kept
    };
    for rule in &rules[start..] {
        ipt.append(table, chain, rule)?;
        tracing::debug!(family = %ipt.family(), %table, %chain, %rule, "rule appended");
    }
    Ok(())
}

/// Deletes `rule`; absence of the rule or of its chain counts as done.
fn delete_if_present<C: PacketFilterController>(ipt: &C, table: Table, chain: Chain, rule: &Rule) -> Result<(), Error> {
    match ipt.delete(table, chain, rule) {
        Ok(()) => {
            tracing::debug!(family = %ipt.family(), %table, %chain, %rule, "rule deleted");
            Ok(())
        }
        Err(e) if e.is_absent() => Ok(()),
        Err(e) => Err(e),
    }
}
