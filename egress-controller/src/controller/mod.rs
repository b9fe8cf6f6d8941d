pub(crate) mod gateway;
pub(crate) mod node;
pub(crate) mod policy;
pub(crate) mod tunnel;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error};

use egress_crds::v1beta1::gateway::{EgressGateway, EgressGatewayStatus, PolicyRef};
use egress_crds::v1beta1::policy::{
    EgressClusterPolicy, EgressIp, EgressPolicy, EgressPolicyStatus, Policy,
};
use egress_crds::v1beta1::tunnel::{EgressTunnel, EgressTunnelPhase};

use crate::allocator::{Assignment, PolicyOutcome};
use crate::event::{holds_node, resolve_gateway, selects};
use crate::{Context, Error, Result, Stores};

pub(crate) const DEFAULT_REQUEUE: Duration = Duration::from_secs(300);
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

pub(crate) fn error_policy<K>(k: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: ResourceExt<DynamicType = ()>,
    K: DeserializeOwned + Clone + Send + Sync + Debug + 'static,
{
    let name = k.name_any();
    let ns = k.namespace().unwrap_or_default();
    error!(?error, "reconcile error for {} {}/{}", K::kind(&()), ns, name);
    ctx.metrics.count_failure(k.as_ref(), error.metric_label());
    Action::requeue(ERROR_REQUEUE)
}

/// The parts of a policy the gateway reconciler needs.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PolicyView {
    pub reference: PolicyRef,
    pub egress_ip: EgressIp,
    pub status: Option<EgressPolicyStatus>,
}

impl PolicyView {
    fn of<P: Policy>(policy: &P) -> Self {
        Self {
            reference: policy.policy_ref(),
            egress_ip: policy.egress_ip().clone(),
            status: policy.policy_status().cloned(),
        }
    }
}

/// Live policies of both kinds that resolve to `gateway`, ordered by
/// reference.
pub(crate) fn policies_of(
    stores: &Stores,
    gateway: &str,
    gateways: &[Arc<EgressGateway>],
) -> Vec<PolicyView> {
    let resolves_here = |name: &str| {
        resolve_gateway(name, gateways).is_some_and(|gw| gw.name_any() == gateway)
    };
    let namespaced = stores
        .policies
        .state()
        .into_iter()
        .filter(|p| p.meta().deletion_timestamp.is_none() && resolves_here(p.gateway_name()))
        .map(|p| PolicyView::of(p.as_ref()));
    let cluster = stores
        .cluster_policies
        .state()
        .into_iter()
        .filter(|p| p.meta().deletion_timestamp.is_none() && resolves_here(p.gateway_name()))
        .map(|p| PolicyView::of(p.as_ref()));
    let mut views: Vec<PolicyView> = namespaced.chain(cluster).collect();
    views.sort_by(|a, b| a.reference.cmp(&b.reference));
    views
}

/// Nodes matched by the gateway's selector together with their tunnel
/// phase. Nodes already held by another gateway are left to it.
pub(crate) fn selected_nodes(
    gateway: &EgressGateway,
    gateways: &[Arc<EgressGateway>],
    nodes: &[Arc<Node>],
    tunnels: &Store<EgressTunnel>,
) -> BTreeMap<String, EgressTunnelPhase> {
    let name = gateway.name_any();
    nodes
        .iter()
        .filter(|node| node.meta().deletion_timestamp.is_none())
        .filter(|node| selects(&gateway.spec.node_selector.selector, node.labels()))
        .map(|node| node.name_any())
        .filter(|node| {
            let claimed = gateways
                .iter()
                .any(|gw| gw.name_any() != name && holds_node(gw, node));
            if claimed {
                debug!(gateway = %name, %node, "node is held by another gateway");
            }
            !claimed
        })
        .map(|node| {
            let phase = tunnels
                .get(&ObjectRef::new(&node))
                .map(|t| t.phase())
                .unwrap_or_default();
            (node, phase)
        })
        .collect()
}

/// The status to write for a policy, if any. An assigned status is only
/// replaced when the policy was moved.
pub(crate) fn policy_status_update(
    current: Option<&EgressPolicyStatus>,
    outcome: &PolicyOutcome,
) -> Option<EgressPolicyStatus> {
    let desired = outcome
        .assignment
        .as_ref()
        .map(Assignment::to_policy_status)
        .unwrap_or_default();
    let current_empty = current.is_none_or(|s| s.is_empty());
    if !outcome.reallocated && !current_empty {
        return None;
    }
    if current_empty && desired.is_empty() {
        return None;
    }
    (current != Some(&desired)).then_some(desired)
}

/// Writes the gateway status, failing with a conflict when the gateway
/// changed since it was read.
pub(crate) async fn patch_gateway_status(
    client: Client,
    gateway: &EgressGateway,
    status: &EgressGatewayStatus,
) -> Result<()> {
    let api: Api<EgressGateway> = Api::all(client);
    let mut patch = json!({ "status": status });
    if let Some(rv) = gateway.resource_version() {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    api.patch_status(
        &gateway.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

pub(crate) async fn patch_policy_status(
    client: Client,
    policy: &PolicyRef,
    status: &EgressPolicyStatus,
) -> Result<()> {
    let patch = Patch::Merge(json!({ "status": status }));
    let params = PatchParams::default();
    if policy.is_cluster_scoped() {
        let api: Api<EgressClusterPolicy> = Api::all(client);
        api.patch_status(&policy.name, &params, &patch).await?;
    } else {
        let api: Api<EgressPolicy> = Api::namespaced(client, &policy.namespace);
        api.patch_status(&policy.name, &params, &patch).await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use egress_crds::v1beta1::gateway::{
        EgressGatewaySpec, EgressGatewayStatus, EgressIPStatus, Ippools, NodeSelector,
    };
    use egress_crds::v1beta1::policy::{Eip, EgressClusterPolicySpec, EgressPolicySpec};
    use egress_crds::v1beta1::tunnel::EgressTunnelStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;
    use kube::runtime::reflector::store;
    use kube::runtime::watcher;

    use super::*;

    pub(crate) fn make_store<K>(objects: Vec<K>) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + 'static,
    {
        let (reader, mut writer) = store();
        for obj in objects {
            writer.apply_watcher_event(&watcher::Event::Apply(obj));
        }
        reader
    }

    pub(crate) fn make_gateway(
        name: &str,
        selector: &[(&str, &str)],
        held: &[&str],
    ) -> EgressGateway {
        EgressGateway {
            metadata: ObjectMeta {
                name: Some(name.into()),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            spec: EgressGatewaySpec {
                ippools: Ippools {
                    ipv4: vec!["10.0.0.0/24".into()],
                    ..Default::default()
                },
                node_selector: NodeSelector {
                    selector: LabelSelector {
                        match_labels: Some(
                            selector
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_string()))
                                .collect(),
                        ),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
            status: Some(EgressGatewayStatus {
                node_list: held
                    .iter()
                    .map(|n| EgressIPStatus::new(n, EgressTunnelPhase::Ready))
                    .collect(),
                ..Default::default()
            }),
        }
    }

    pub(crate) fn make_node(name: &str, labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub(crate) fn make_tunnel(node: &str, phase: EgressTunnelPhase) -> EgressTunnel {
        EgressTunnel {
            metadata: ObjectMeta {
                name: Some(node.into()),
                ..Default::default()
            },
            spec: Default::default(),
            status: Some(EgressTunnelStatus {
                phase,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn make_policy(ns: &str, name: &str, gateway: &str) -> EgressPolicy {
        EgressPolicy {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                ..Default::default()
            },
            spec: EgressPolicySpec {
                egress_gateway_name: gateway.into(),
                ..Default::default()
            },
            status: None,
        }
    }

    pub(crate) fn make_stores(
        gateways: Vec<EgressGateway>,
        policies: Vec<EgressPolicy>,
        cluster_policies: Vec<EgressClusterPolicy>,
        nodes: Vec<Node>,
        tunnels: Vec<EgressTunnel>,
    ) -> Stores {
        Stores {
            gateways: make_store(gateways),
            policies: make_store(policies),
            cluster_policies: make_store(cluster_policies),
            tunnels: make_store(tunnels),
            nodes: make_store(nodes),
            pods: make_store(vec![]),
            namespaces: make_store(vec![]),
        }
    }

    #[test]
    fn test_selected_nodes() {
        let gw = make_gateway("egw-a", &[("egress", "true")], &[]);
        let other = make_gateway("egw-b", &[("egress", "true")], &["node-2"]);
        let stores = make_stores(
            vec![gw.clone(), other],
            vec![],
            vec![],
            vec![
                make_node("node-1", &[("egress", "true")]),
                make_node("node-2", &[("egress", "true")]),
                make_node("node-3", &[("egress", "true")]),
                make_node("node-4", &[]),
            ],
            vec![make_tunnel("node-1", EgressTunnelPhase::Ready)],
        );
        let selected = selected_nodes(
            &gw,
            &stores.gateways.state(),
            &stores.nodes.state(),
            &stores.tunnels,
        );
        assert_eq!(
            selected,
            BTreeMap::from([
                ("node-1".to_owned(), EgressTunnelPhase::Ready),
                ("node-3".to_owned(), EgressTunnelPhase::Pending),
            ])
        );
    }

    #[test]
    fn test_policies_of_both_kinds() {
        let mut default = make_gateway("egw-default", &[], &[]);
        default.spec.cluster_default = true;
        let cluster = EgressClusterPolicy {
            metadata: ObjectMeta {
                name: Some("c1".into()),
                ..Default::default()
            },
            spec: EgressClusterPolicySpec::default(),
            status: None,
        };
        let stores = make_stores(
            vec![make_gateway("egw-a", &[], &[]), default],
            vec![
                make_policy("default", "p2", "egw-a"),
                make_policy("default", "p1", ""),
                make_policy("other", "p3", "egw-missing"),
            ],
            vec![cluster],
            vec![],
            vec![],
        );
        let gateways = stores.gateways.state();
        let refs = |gw: &str| -> Vec<PolicyRef> {
            policies_of(&stores, gw, &gateways)
                .into_iter()
                .map(|v| v.reference)
                .collect()
        };
        assert_eq!(refs("egw-a"), vec![PolicyRef::namespaced("default", "p2")]);
        assert_eq!(
            refs("egw-default"),
            vec![PolicyRef::cluster("c1"), PolicyRef::namespaced("default", "p1")]
        );
    }

    #[test]
    fn test_policy_status_written_once_unless_moved() {
        let assigned = Assignment {
            node: "node-1".into(),
            ipv4: "10.0.0.5".into(),
            ipv6: String::new(),
        };
        let kept = PolicyOutcome {
            assignment: Some(assigned.clone()),
            reallocated: false,
        };
        let written = policy_status_update(None, &kept).unwrap();
        assert_eq!(written.node, "node-1");
        assert_eq!(written.eip.ipv4, "10.0.0.5");

        let stale = EgressPolicyStatus {
            eip: Eip {
                ipv4: "10.0.0.9".into(),
                ipv6: String::new(),
            },
            node: "node-9".into(),
        };
        assert_eq!(policy_status_update(Some(&stale), &kept), None);

        let moved = PolicyOutcome {
            assignment: Some(assigned),
            reallocated: true,
        };
        assert_eq!(policy_status_update(Some(&stale), &moved), Some(written.clone()));
        assert_eq!(policy_status_update(Some(&written), &moved), None);

        let unplaced = PolicyOutcome {
            assignment: None,
            reallocated: true,
        };
        assert_eq!(
            policy_status_update(Some(&stale), &unplaced),
            Some(EgressPolicyStatus::default())
        );
        assert_eq!(policy_status_update(None, &unplaced), None);
    }
}
