use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use kube::ResourceExt;

use egress_crds::v1beta1::endpoint::EgressEndpoint;
use egress_crds::v1beta1::gateway::{EgressGateway, PolicyRef};
use egress_crds::v1beta1::policy::Policy;
use egress_crds::v1beta1::tunnel::EgressTunnel;

use crate::ipset::{IpFamily, IpSetSpec};
use crate::route::TunnelState;
use crate::rules::{PolicyRoute, ignore_set, policy_sets};

/// What the agent needs to know about one policy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyInfo {
    pub reference: PolicyRef,
    pub priority: i64,
    pub use_node_ip: bool,
    /// Pod addresses and pod subnets.
    pub sources: BTreeSet<String>,
    pub destinations: BTreeSet<String>,
}

impl PolicyInfo {
    pub fn new<'a, P, I>(policy: &P, endpoints: I) -> Self
    where
        P: Policy,
        I: IntoIterator<Item = &'a EgressEndpoint>,
    {
        let mut sources: BTreeSet<String> = policy.pod_subnet().iter().cloned().collect();
        for endpoint in endpoints {
            sources.extend(endpoint.ipv4.iter().cloned());
            sources.extend(endpoint.ipv6.iter().cloned());
        }
        Self {
            reference: policy.policy_ref(),
            priority: policy.priority(),
            use_node_ip: policy.egress_ip().use_node_ip,
            sources,
            destinations: policy.dest_subnet().iter().cloned().collect(),
        }
    }
}

/// Dataplane state one node should converge to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredState {
    /// The node is listed by some gateway.
    pub is_gateway_node: bool,
    /// Some gateway has a ready node.
    pub has_gateway: bool,
    pub routes: Vec<PolicyRoute>,
    pub ipsets: BTreeMap<String, IpSetSpec>,
    /// Egress IPs this node answers ARP/NDP for, per policy.
    pub announcements: BTreeMap<String, BTreeSet<IpAddr>>,
    pub tunnel: TunnelState,
}

/// Derives the desired state of `node_name` from the gateway statuses. Only
/// ready gateway nodes carry traffic.
pub fn desired_state(
    node_name: &str,
    gateways: &[Arc<EgressGateway>],
    policies: &[PolicyInfo],
    tunnels: &[Arc<EgressTunnel>],
    ignore_cidrs: &[IpNetwork],
    families: &[IpFamily],
) -> DesiredState {
    let marks: HashMap<String, u32> = tunnels
        .iter()
        .filter_map(|t| Some((t.name_any(), t.mark()?)))
        .collect();
    let policies: HashMap<&PolicyRef, &PolicyInfo> =
        policies.iter().map(|p| (&p.reference, p)).collect();

    let mut state = DesiredState::default();
    for status in gateways.iter().filter_map(|gw| gw.status.as_ref()) {
        for node in &status.node_list {
            if node.name == node_name {
                state.is_gateway_node = true;
            }
            if !node.is_ready() {
                continue;
            }
            state.has_gateway = true;
            for eip in &node.eips {
                for reference in &eip.policies {
                    let Some(info) = policies.get(reference) else {
                        continue;
                    };
                    let route = PolicyRoute {
                        policy: reference.clone(),
                        priority: info.priority,
                        gateway_node: node.name.clone(),
                        mark: marks.get(&node.name).copied(),
                        ipv4: eip.ipv4.parse().ok(),
                        ipv6: eip.ipv6.parse().ok(),
                        use_node_ip: info.use_node_ip,
                        has_destinations: !info.destinations.is_empty(),
                    };
                    if node.name == node_name && !route.use_node_ip {
                        let ips: BTreeSet<IpAddr> = route
                            .ipv4
                            .map(IpAddr::from)
                            .into_iter()
                            .chain(route.ipv6.map(IpAddr::from))
                            .filter(|ip| families.iter().any(|f| family_of(ip) == *f))
                            .collect();
                        if !ips.is_empty() {
                            state.announcements.insert(reference.to_string(), ips);
                        }
                    }
                    for family in families {
                        let sets = policy_sets(reference, *family);
                        state.ipsets.insert(
                            sets.src,
                            IpSetSpec::from_entries(*family, info.sources.iter().map(String::as_str)),
                        );
                        if route.has_destinations {
                            state.ipsets.insert(
                                sets.dst,
                                IpSetSpec::from_entries(
                                    *family,
                                    info.destinations.iter().map(String::as_str),
                                ),
                            );
                        }
                    }
                    state.routes.push(route);
                }
            }
        }
    }

    state.tunnel = TunnelState::new(node_name, tunnels, &state.routes, families);
    for family in families {
        let ignored: Vec<String> = ignore_cidrs.iter().map(|c| c.to_string()).collect();
        state.ipsets.insert(
            ignore_set(*family).to_owned(),
            IpSetSpec::from_entries(*family, ignored.iter().map(String::as_str)),
        );
    }
    state
}

fn family_of(ip: &IpAddr) -> IpFamily {
    match ip {
        IpAddr::V4(_) => IpFamily::Inet,
        IpAddr::V6(_) => IpFamily::Inet6,
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use egress_crds::v1beta1::gateway::{EgressGatewayStatus, EgressIPStatus, Eips};
    use egress_crds::v1beta1::policy::{EgressPolicy, EgressPolicySpec};
    use egress_crds::v1beta1::tunnel::{EgressTunnelPhase, EgressTunnelSpec, EgressTunnelStatus};
    use kube::api::ObjectMeta;

    use super::*;

    fn gateway(nodes: Vec<EgressIPStatus>) -> Arc<EgressGateway> {
        let mut gateway = EgressGateway::new("egw", Default::default());
        gateway.status = Some(EgressGatewayStatus {
            node_list: nodes,
            ..Default::default()
        });
        Arc::new(gateway)
    }

    fn node(name: &str, phase: EgressTunnelPhase, eips: Vec<Eips>) -> EgressIPStatus {
        EgressIPStatus {
            name: name.into(),
            eips,
            status: phase,
        }
    }

    fn eip(ipv4: &str, policies: &[&str]) -> Eips {
        Eips {
            ipv4: ipv4.into(),
            ipv6: String::new(),
            policies: policies
                .iter()
                .map(|p| PolicyRef::namespaced("default", p))
                .collect(),
        }
    }

    fn tunnel(name: &str, mark: &str) -> Arc<EgressTunnel> {
        let mut tunnel = EgressTunnel::new(name, EgressTunnelSpec {});
        tunnel.status = Some(EgressTunnelStatus {
            mark: mark.into(),
            phase: EgressTunnelPhase::Ready,
            ..Default::default()
        });
        Arc::new(tunnel)
    }

    fn policy(name: &str, dest: &[&str]) -> PolicyInfo {
        let policy = EgressPolicy {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: EgressPolicySpec {
                egress_gateway_name: "egw".into(),
                dest_subnet: dest.iter().map(|d| d.to_string()).collect(),
                ..Default::default()
            },
            status: None,
        };
        let endpoints = [EgressEndpoint {
            ns: "default".into(),
            pod: format!("{name}-pod"),
            ipv4: vec!["10.244.1.5".into()],
            ipv6: vec!["fd00:10:244::5".into()],
            node: "node-a".into(),
        }];
        PolicyInfo::new(&policy, endpoints.iter())
    }

    #[test]
    fn test_worker_node_state() {
        let gateways = [gateway(vec![node(
            "node-b",
            EgressTunnelPhase::Ready,
            vec![eip("10.6.0.10", &["p1"])],
        )])];
        let tunnels = [tunnel("node-b", "0x26000002")];
        let policies = [policy("p1", &[]), policy("unassigned", &[])];
        let state = desired_state(
            "node-a",
            &gateways,
            &policies,
            &tunnels,
            &["10.96.0.0/12".parse().unwrap()],
            &[IpFamily::Inet],
        );

        assert!(!state.is_gateway_node);
        assert!(state.has_gateway);
        assert_eq!(state.routes.len(), 1);
        assert_eq!(state.routes[0].gateway_node, "node-b");
        assert_eq!(state.routes[0].mark, Some(0x26000002));
        assert_eq!(state.routes[0].ipv4, Some(Ipv4Addr::new(10, 6, 0, 10)));
        assert!(state.announcements.is_empty());
        // node-b never published a tunnel address.
        assert!(state.tunnel.gateways.is_empty());

        let sets = policy_sets(&PolicyRef::namespaced("default", "p1"), IpFamily::Inet);
        assert_eq!(
            state.ipsets[&sets.src].members.iter().collect::<Vec<_>>(),
            vec!["10.244.1.5"]
        );
        assert!(!state.ipsets.contains_key(&sets.dst));
        assert_eq!(
            state.ipsets[ignore_set(IpFamily::Inet)]
                .members
                .iter()
                .collect::<Vec<_>>(),
            vec!["10.96.0.0/12"]
        );
    }

    #[test]
    fn test_gateway_node_announces_its_eips() {
        let gateways = [gateway(vec![node(
            "node-a",
            EgressTunnelPhase::Ready,
            vec![eip("10.6.0.10", &["p1", "p2"])],
        )])];
        let policies = [policy("p1", &["1.1.1.0/24"]), policy("p2", &[])];
        let state = desired_state(
            "node-a",
            &gateways,
            &policies,
            &[],
            &[],
            &[IpFamily::Inet, IpFamily::Inet6],
        );

        assert!(state.is_gateway_node);
        assert_eq!(state.announcements.len(), 2);
        assert_eq!(
            state.announcements["default/p1"],
            BTreeSet::from([IpAddr::from(Ipv4Addr::new(10, 6, 0, 10))])
        );
        let v6 = policy_sets(&PolicyRef::namespaced("default", "p1"), IpFamily::Inet6);
        assert_eq!(
            state.ipsets[&v6.src].members.iter().collect::<Vec<_>>(),
            vec!["fd00:10:244::5"]
        );
        // The destination only has an IPv4 network.
        assert!(state.ipsets[&v6.dst].members.is_empty());
    }

    #[test]
    fn test_not_ready_gateway_node_carries_nothing() {
        let gateways = [gateway(vec![node(
            "node-a",
            EgressTunnelPhase::HeartbeatTimeout,
            vec![eip("10.6.0.10", &["p1"])],
        )])];
        let state = desired_state(
            "node-a",
            &gateways,
            &[policy("p1", &[])],
            &[],
            &[],
            &[IpFamily::Inet],
        );
        assert!(state.is_gateway_node);
        assert!(!state.has_gateway);
        assert!(state.routes.is_empty());
        assert!(state.announcements.is_empty());
    }

    #[test]
    fn test_worker_routes_through_gateway_tunnel() {
        let gateways = [gateway(vec![node(
            "node-b",
            EgressTunnelPhase::Ready,
            vec![eip("10.6.0.10", &["p1"])],
        )])];
        let mut gateway_tunnel = tunnel("node-b", "0x26000002");
        if let Some(status) = Arc::make_mut(&mut gateway_tunnel).status.as_mut() {
            status.tunnel.ipv4 = "172.31.0.2".into();
        }
        let state = desired_state(
            "node-a",
            &gateways,
            &[policy("p1", &[])],
            &[gateway_tunnel],
            &[],
            &[IpFamily::Inet],
        );
        assert_eq!(
            state.tunnel.gateways,
            BTreeMap::from([(0x26000002, vec![IpAddr::from(Ipv4Addr::new(172, 31, 0, 2))])])
        );
    }
}
