use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use egress_iptables::{Backend, Chain, Rule, Table};
use egress_layer2::{Announce, IpAdvertisement};
use tracing::{debug, info};

use crate::Result;
use crate::ipset::{IpFamily, IpSet, IpSetManager};
use crate::rules::{
    MARK_REQUEST_CHAIN, SNAT_CHAIN, build_mangle_static_rules, build_mark_request_rules,
    build_nat_static_rules, build_snat_rules,
};
use crate::state::DesiredState;

/// Remembers what was last handed to a [`Table`] so unchanged rules do not
/// invalidate its dataplane cache.
struct CachedTable<B: Backend> {
    table: Table<B>,
    inserted: BTreeMap<String, Vec<Rule>>,
    chains: BTreeMap<String, Vec<Rule>>,
}

impl<B: Backend> CachedTable<B> {
    fn new(table: Table<B>) -> Self {
        Self {
            table,
            inserted: BTreeMap::new(),
            chains: BTreeMap::new(),
        }
    }

    fn insert_rules(&mut self, chain: &str, rules: Vec<Rule>) {
        if self.inserted.get(chain) == Some(&rules) {
            return;
        }
        self.inserted.insert(chain.to_owned(), rules.clone());
        self.table.insert_or_append_rules(chain, rules);
    }

    fn update_chain(&mut self, name: &str, rules: Vec<Rule>) {
        if self.chains.get(name) == Some(&rules) {
            return;
        }
        self.chains.insert(name.to_owned(), rules.clone());
        self.table.update_chain(Chain::new(name, rules));
    }
}

/// The mangle and nat tables of one IP family.
pub struct FamilyTables<B: Backend> {
    family: IpFamily,
    mangle: CachedTable<B>,
    nat: CachedTable<B>,
}

impl<B: Backend> FamilyTables<B> {
    pub fn new(family: IpFamily, mangle: Table<B>, nat: Table<B>) -> Self {
        Self {
            family,
            mangle: CachedTable::new(mangle),
            nat: CachedTable::new(nat),
        }
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub fn mangle(&self) -> &Table<B> {
        &self.mangle.table
    }

    pub fn nat(&self) -> &Table<B> {
        &self.nat.table
    }
}

/// Converges ipsets, iptables and layer-2 announcements of one node.
pub struct Dataplane<B: Backend, S: IpSet> {
    node_name: String,
    mark_base: u32,
    tables: Vec<FamilyTables<B>>,
    ipsets: IpSetManager<S>,
    announce: Arc<Announce>,
    announced: BTreeMap<String, BTreeSet<IpAddr>>,
}

impl<B: Backend, S: IpSet> Dataplane<B, S> {
    pub fn new(
        node_name: &str,
        mark_base: u32,
        tables: Vec<FamilyTables<B>>,
        ipsets: IpSetManager<S>,
        announce: Arc<Announce>,
    ) -> Self {
        Self {
            node_name: node_name.to_owned(),
            mark_base,
            tables,
            ipsets,
            announce,
            announced: BTreeMap::new(),
        }
    }

    pub fn families(&self) -> Vec<IpFamily> {
        self.tables.iter().map(|t| t.family).collect()
    }

    pub fn tables(&self) -> &[FamilyTables<B>] {
        &self.tables
    }

    pub fn ipsets(&self) -> &IpSetManager<S> {
        &self.ipsets
    }

    /// Programs `desired` and returns the longest the caller may wait before
    /// syncing again. Sets are created before the rules referencing them and
    /// destroyed after.
    pub fn sync(&mut self, desired: &DesiredState) -> Result<Option<Duration>> {
        self.ipsets.set_desired(desired.ipsets.clone());
        self.ipsets.apply_updates()?;

        let statics =
            build_mangle_static_rules(self.mark_base, desired.is_gateway_node, desired.has_gateway);
        let mut reschedule: Option<Duration> = None;
        for tables in self.tables.iter_mut() {
            let family = tables.family;
            tables
                .mangle
                .insert_rules("PREROUTING", statics.prerouting.clone());
            tables.mangle.insert_rules("FORWARD", statics.forward.clone());
            tables
                .mangle
                .insert_rules("POSTROUTING", statics.postrouting.clone());
            tables.mangle.update_chain(
                MARK_REQUEST_CHAIN,
                build_mark_request_rules(&self.node_name, &desired.routes, family),
            );

            tables
                .nat
                .insert_rules("POSTROUTING", build_nat_static_rules(desired.is_gateway_node));
            tables.nat.update_chain(
                SNAT_CHAIN,
                build_snat_rules(&self.node_name, &desired.routes, family),
            );

            for table in [&mut tables.mangle.table, &mut tables.nat.table] {
                if let Some(next) = table.apply()? {
                    reschedule = Some(reschedule.map_or(next, |r| r.min(next)));
                }
            }
        }

        self.ipsets.apply_deletions()?;
        self.sync_announcements(&desired.announcements);
        debug!(routes = desired.routes.len(), "dataplane in sync");
        Ok(reschedule)
    }

    fn sync_announcements(&mut self, desired: &BTreeMap<String, BTreeSet<IpAddr>>) {
        let stale: Vec<String> = self
            .announced
            .iter()
            .filter(|(name, ips)| desired.get(*name) != Some(*ips))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            info!(balancer = %name, "withdrawing egress ip announcement");
            self.announce.delete_balancer(&name);
            self.announced.remove(&name);
        }
        for (name, ips) in desired {
            if self.announced.contains_key(name) {
                continue;
            }
            for ip in ips {
                self.announce.set_balancer(name, IpAdvertisement::new(*ip));
            }
            self.announced.insert(name.clone(), ips.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use egress_crds::v1beta1::gateway::PolicyRef;
    use egress_iptables::{DummyLock, IpVersion, MemoryBackend, TableOptions};
    use egress_layer2::{Interface, InterfaceSource, Responder, ResponderFactory, ShouldAnnounce};

    use super::*;
    use crate::ipset::{IpSetSpec, MemoryIpSet, OWNED_PREFIX};
    use crate::rules::{PolicyRoute, policy_sets};

    struct NoInterfaces;

    impl InterfaceSource for NoInterfaces {
        fn interfaces(&self) -> egress_layer2::Result<Vec<Interface>> {
            Ok(Vec::new())
        }
    }

    struct NoResponders;

    impl ResponderFactory for NoResponders {
        fn arp(
            &self,
            intf: &Interface,
            _: ShouldAnnounce,
        ) -> egress_layer2::Result<Arc<dyn Responder>> {
            Err(egress_layer2::Error::NoHardwareAddress(intf.name.clone()))
        }

        fn ndp(
            &self,
            intf: &Interface,
            _: ShouldAnnounce,
        ) -> egress_layer2::Result<Arc<dyn Responder>> {
            Err(egress_layer2::Error::NoHardwareAddress(intf.name.clone()))
        }
    }

    struct Harness {
        backend: MemoryBackend,
        ipset: MemoryIpSet,
        announce: Arc<Announce>,
        dataplane: Dataplane<MemoryBackend, MemoryIpSet>,
    }

    fn harness(node: &str) -> Harness {
        let backend = MemoryBackend::new();
        let ipset = MemoryIpSet::new();
        let table = |name: &str| {
            Table::new(
                name,
                IpVersion::V4,
                backend.clone(),
                Arc::new(DummyLock),
                false,
                TableOptions::default(),
            )
            .unwrap()
        };
        let tables = vec![FamilyTables::new(IpFamily::Inet, table("mangle"), table("nat"))];
        let (announce, _spam) = Announce::new(None, Arc::new(NoResponders), Arc::new(NoInterfaces));
        let dataplane = Dataplane::new(
            node,
            0x26000000,
            tables,
            IpSetManager::new(ipset.clone(), OWNED_PREFIX),
            announce.clone(),
        );
        Harness {
            backend,
            ipset,
            announce,
            dataplane,
        }
    }

    fn route(node: &str) -> PolicyRoute {
        PolicyRoute {
            policy: PolicyRef::namespaced("default", "p1"),
            gateway_node: node.into(),
            mark: Some(0x26000002),
            ipv4: Some(Ipv4Addr::new(10, 6, 0, 10)),
            ..Default::default()
        }
    }

    fn desired(is_gateway_node: bool, gateway_node: &str) -> DesiredState {
        let sets = policy_sets(&PolicyRef::namespaced("default", "p1"), IpFamily::Inet);
        let mut state = DesiredState {
            is_gateway_node,
            has_gateway: true,
            routes: vec![route(gateway_node)],
            ..Default::default()
        };
        state.ipsets.insert(
            sets.src,
            IpSetSpec::from_entries(IpFamily::Inet, ["10.244.1.5"]),
        );
        if is_gateway_node {
            state.announcements.insert(
                "default/p1".into(),
                BTreeSet::from([IpAddr::from(Ipv4Addr::new(10, 6, 0, 10))]),
            );
        }
        state
    }

    fn has_rule(rules: &Option<Vec<String>>, needle: &str) -> bool {
        rules
            .as_ref()
            .is_some_and(|rules| rules.iter().any(|r| r.contains(needle)))
    }

    #[test]
    fn test_worker_marks_traffic_for_remote_gateway() {
        let mut h = harness("node-a");
        h.dataplane.sync(&desired(false, "node-b")).unwrap();

        let prerouting = h.backend.rules("mangle", "PREROUTING");
        assert!(has_rule(&prerouting, &format!("--jump {MARK_REQUEST_CHAIN}")));
        let marks = h.backend.rules("mangle", MARK_REQUEST_CHAIN);
        assert!(has_rule(&marks, "--set-mark 0x26000002/0xffffffff"));
        assert!(has_rule(&h.backend.rules("mangle", "FORWARD"), "--set-mark 0x12000000/0xffffffff"));
        assert!(!h.backend.chains("nat").contains(&SNAT_CHAIN.to_owned()));

        let sets = policy_sets(&PolicyRef::namespaced("default", "p1"), IpFamily::Inet);
        assert_eq!(h.ipset.members(&sets.src).unwrap(), vec!["10.244.1.5"]);
        assert!(h.announce.balancers().is_empty());
    }

    #[test]
    fn test_gateway_node_snats_and_announces() {
        let mut h = harness("node-a");
        h.dataplane.sync(&desired(true, "node-a")).unwrap();

        assert!(!has_rule(
            &h.backend.rules("mangle", "PREROUTING"),
            MARK_REQUEST_CHAIN
        ));
        assert!(has_rule(
            &h.backend.rules("nat", "POSTROUTING"),
            &format!("--jump {SNAT_CHAIN}")
        ));
        assert!(has_rule(
            &h.backend.rules("nat", SNAT_CHAIN),
            "--jump SNAT --to-source 10.6.0.10"
        ));
        assert_eq!(h.announce.balancers(), vec!["default/p1"]);
        assert_eq!(
            h.announce
                .ip_refcount(IpAddr::from(Ipv4Addr::new(10, 6, 0, 10))),
            1
        );
    }

    #[test]
    fn test_resync_without_changes_writes_nothing() {
        let mut h = harness("node-a");
        let state = desired(false, "node-b");
        h.dataplane.sync(&state).unwrap();
        h.backend.clear_restore_inputs();
        h.dataplane.sync(&state).unwrap();
        assert!(h.backend.restore_inputs().is_empty());
    }

    #[test]
    fn test_node_losing_gateway_role_cleans_up() {
        let mut h = harness("node-a");
        h.dataplane.sync(&desired(true, "node-a")).unwrap();

        let mut state = desired(false, "node-b");
        state.ipsets.clear();
        state.routes.clear();
        state.has_gateway = false;
        h.dataplane.sync(&state).unwrap();

        assert!(!h.backend.chains("nat").contains(&SNAT_CHAIN.to_owned()));
        assert!(!has_rule(&h.backend.rules("nat", "POSTROUTING"), SNAT_CHAIN));
        assert!(h.ipset.list_names().unwrap().is_empty());
        assert!(h.announce.balancers().is_empty());
        assert_eq!(
            h.announce
                .ip_refcount(IpAddr::from(Ipv4Addr::new(10, 6, 0, 10))),
            0
        );
    }
}
