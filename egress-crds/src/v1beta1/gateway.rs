use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::v1beta1::tunnel::EgressTunnelPhase;

pub const NAME_GROUP_EGRESSGATEWAY: &str = "egressgateways.egressgateway.spidernet.io";

#[derive(CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressGateway",
    status = "EgressGatewayStatus",
    shortname = "egw",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct EgressGatewaySpec {
    #[serde(default)]
    pub ippools: Ippools,
    #[serde(default)]
    pub node_selector: NodeSelector,
    /// Policies without an explicit gateway name use the cluster default gateway
    #[serde(default)]
    pub cluster_default: bool,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Ippools {
    /// Single addresses, CIDRs or `a-b` ranges
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
    #[serde(default, rename = "ipv4DefaultEIP")]
    pub ipv4_default_eip: String,
    #[serde(default, rename = "ipv6DefaultEIP")]
    pub ipv6_default_eip: String,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub policy: String,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressGatewayStatus {
    #[serde(default)]
    pub node_list: Vec<EgressIPStatus>,
    #[serde(default)]
    pub ip_usage: IpUsage,
}

/// Assignments held by one node selected by the gateway.
#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressIPStatus {
    pub name: String,
    #[serde(default)]
    pub eips: Vec<Eips>,
    #[serde(default)]
    pub status: EgressTunnelPhase,
}

impl EgressIPStatus {
    pub fn new(name: &str, status: EgressTunnelPhase) -> Self {
        Self {
            name: name.to_owned(),
            eips: Vec::new(),
            status,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == EgressTunnelPhase::Ready
    }

    pub fn policy_count(&self) -> usize {
        self.eips.iter().map(|eip| eip.policies.len()).sum()
    }
}

/// Policies sharing one egress IP pair on one node.
#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Eips {
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub policies: Vec<PolicyRef>,
}

impl Eips {
    pub fn contains_policy(&self, policy: &PolicyRef) -> bool {
        self.policies.iter().any(|p| p == policy)
    }
}

/// Reference to an `EgressPolicy`, or an `EgressClusterPolicy` when the
/// namespace is empty.
#[derive(
    Serialize, Deserialize, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl PolicyRef {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
        }
    }

    pub fn cluster(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            namespace: String::new(),
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for PolicyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IpUsage {
    #[serde(default)]
    pub ipv4_total: u64,
    #[serde(default)]
    pub ipv4_free: u64,
    #[serde(default)]
    pub ipv6_total: u64,
    #[serde(default)]
    pub ipv6_free: u64,
}
