use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::runtime::reflector::ObjectRef;

use egress_crds::v1beta1::gateway::{EgressGateway, PolicyRef};
use egress_crds::v1beta1::policy::Policy;
use egress_crds::v1beta1::tunnel::EgressTunnel;
use egress_k8s_utils::label_selector_matches;

/// A change that may affect gateway assignments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Gateway(String),
    Policy { policy: PolicyRef, gateway: String },
    Tunnel(String),
    Node {
        name: String,
        labels: BTreeMap<String, String>,
    },
}

impl Event {
    pub fn from_policy<P: Policy>(policy: &P) -> Self {
        Event::Policy {
            policy: policy.policy_ref(),
            gateway: policy.gateway_name().to_owned(),
        }
    }

    pub fn from_tunnel(tunnel: &EgressTunnel) -> Self {
        Event::Tunnel(tunnel.name_any())
    }

    pub fn from_node(node: &Node) -> Self {
        Event::Node {
            name: node.name_any(),
            labels: node.labels().clone(),
        }
    }

    /// Gateways that have to be reconciled because of this event.
    pub fn gateways(&self, gateways: &[Arc<EgressGateway>]) -> Vec<ObjectRef<EgressGateway>> {
        let refs = |filter: &dyn Fn(&EgressGateway) -> bool| {
            gateways
                .iter()
                .filter(|gw| filter(gw))
                .map(|gw| ObjectRef::from_obj(gw.as_ref()))
                .collect()
        };
        match self {
            Event::Gateway(name) => vec![ObjectRef::new(name)],
            Event::Policy { policy, gateway } => {
                let target = resolve_gateway(gateway, gateways).map(|gw| gw.name_any());
                refs(&|gw| {
                    target.as_deref() == Some(gw.name_any().as_str()) || holds_policy(gw, policy)
                })
            }
            Event::Tunnel(node) => refs(&|gw| holds_node(gw, node)),
            Event::Node { name, labels } => refs(&|gw| {
                holds_node(gw, name) || selects(&gw.spec.node_selector.selector, labels)
            }),
        }
    }
}

/// The gateway named by a policy, or the cluster default one when the name
/// is empty.
pub fn resolve_gateway(name: &str, gateways: &[Arc<EgressGateway>]) -> Option<Arc<EgressGateway>> {
    if name.is_empty() {
        let mut defaults: Vec<&Arc<EgressGateway>> =
            gateways.iter().filter(|gw| gw.spec.cluster_default).collect();
        defaults.sort_by_key(|gw| gw.name_any());
        return defaults.first().map(|gw| Arc::clone(gw));
    }
    gateways.iter().find(|gw| gw.name_any() == name).cloned()
}

pub fn holds_node(gateway: &EgressGateway, node: &str) -> bool {
    gateway
        .status
        .as_ref()
        .is_some_and(|s| s.node_list.iter().any(|n| n.name == node))
}

pub fn holds_policy(gateway: &EgressGateway, policy: &PolicyRef) -> bool {
    gateway.status.as_ref().is_some_and(|s| {
        s.node_list
            .iter()
            .flat_map(|n| n.eips.iter())
            .any(|e| e.contains_policy(policy))
    })
}

/// Empty selectors select nothing so a gateway without a selector does not
/// claim every node.
pub fn selects(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let empty = selector.match_labels.as_ref().is_none_or(|m| m.is_empty())
        && selector
            .match_expressions
            .as_ref()
            .is_none_or(|e| e.is_empty());
    !empty && label_selector_matches(selector, labels).unwrap_or(false)
}
