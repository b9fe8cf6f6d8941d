use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, KubeSchema, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::v1beta1::gateway::PolicyRef;

pub const NAME_GROUP_EGRESSPOLICY: &str = "egresspolicies.egressgateway.spidernet.io";
pub const NAME_GROUP_EGRESSCLUSTERPOLICY: &str = "egressclusterpolicies.egressgateway.spidernet.io";

pub const ALLOCATOR_POLICY_DEFAULT: &str = "default";
pub const ALLOCATOR_POLICY_ROUND_ROBIN: &str = "rr";

#[derive(CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressPolicy",
    status = "EgressPolicyStatus",
    shortname = "egp",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EgressPolicySpec {
    #[serde(default)]
    pub egress_gateway_name: String,
    #[serde(default, rename = "egressIP")]
    pub egress_ip: EgressIp,
    #[serde(default)]
    pub applied_to: AppliedTo,
    #[serde(default)]
    pub dest_subnet: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressClusterPolicy",
    status = "EgressPolicyStatus",
    shortname = "egcp",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct EgressClusterPolicySpec {
    #[serde(default)]
    pub egress_gateway_name: String,
    #[serde(default, rename = "egressIP")]
    pub egress_ip: EgressIp,
    #[serde(default)]
    pub applied_to: ClusterAppliedTo,
    #[serde(default)]
    pub dest_subnet: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

/// Requested egress address. Empty addresses mean the allocator picks one.
#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EgressIp {
    #[serde(default, rename = "ipv4")]
    pub ipv4: String,
    #[serde(default, rename = "ipv6")]
    pub ipv6: String,
    #[serde(default, rename = "useNodeIP")]
    pub use_node_ip: bool,
    #[serde(default)]
    pub allocator_policy: String,
}

impl EgressIp {
    /// Allocator policy with the empty value mapped to `default`.
    pub fn allocator(&self) -> &str {
        if self.allocator_policy.is_empty() {
            ALLOCATOR_POLICY_DEFAULT
        } else {
            &self.allocator_policy
        }
    }
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AppliedTo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
    #[serde(default)]
    pub pod_subnet: Vec<String>,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAppliedTo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
    #[serde(default)]
    pub pod_subnet: Vec<String>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressPolicyStatus {
    #[serde(default)]
    pub eip: Eip,
    #[serde(default)]
    pub node: String,
}

impl EgressPolicyStatus {
    pub fn is_empty(&self) -> bool {
        self.eip.ipv4.is_empty() && self.eip.ipv6.is_empty() && self.node.is_empty()
    }
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Eip {
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
}

/// Common view over namespaced and cluster-scoped policies.
pub trait Policy {
    fn policy_ref(&self) -> PolicyRef;
    fn gateway_name(&self) -> &str;
    fn egress_ip(&self) -> &EgressIp;
    fn dest_subnet(&self) -> &[String];
    fn pod_subnet(&self) -> &[String];
    /// Lower values take precedence when several policies select a packet.
    fn priority(&self) -> i64;
    fn policy_status(&self) -> Option<&EgressPolicyStatus>;
}

impl Policy for EgressPolicy {
    fn policy_ref(&self) -> PolicyRef {
        PolicyRef::namespaced(&self.namespace().unwrap_or_default(), &self.name_any())
    }

    fn gateway_name(&self) -> &str {
        &self.spec.egress_gateway_name
    }

    fn egress_ip(&self) -> &EgressIp {
        &self.spec.egress_ip
    }

    fn dest_subnet(&self) -> &[String] {
        &self.spec.dest_subnet
    }

    fn pod_subnet(&self) -> &[String] {
        &self.spec.applied_to.pod_subnet
    }

    fn priority(&self) -> i64 {
        self.spec.priority
    }

    fn policy_status(&self) -> Option<&EgressPolicyStatus> {
        self.status.as_ref()
    }
}

impl Policy for EgressClusterPolicy {
    fn policy_ref(&self) -> PolicyRef {
        PolicyRef::cluster(&self.name_any())
    }

    fn gateway_name(&self) -> &str {
        &self.spec.egress_gateway_name
    }

    fn egress_ip(&self) -> &EgressIp {
        &self.spec.egress_ip
    }

    fn dest_subnet(&self) -> &[String] {
        &self.spec.dest_subnet
    }

    fn pod_subnet(&self) -> &[String] {
        &self.spec.applied_to.pod_subnet
    }

    fn priority(&self) -> i64 {
        self.spec.priority
    }

    fn policy_status(&self) -> Option<&EgressPolicyStatus> {
        self.status.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;

    #[test]
    fn test_policy_refs() {
        let policy = EgressPolicy {
            metadata: ObjectMeta {
                name: Some("p1".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: EgressPolicySpec::default(),
            status: None,
        };
        assert_eq!(policy.policy_ref(), PolicyRef::namespaced("default", "p1"));

        let cluster = EgressClusterPolicy {
            metadata: ObjectMeta {
                name: Some("c1".into()),
                ..Default::default()
            },
            spec: EgressClusterPolicySpec::default(),
            status: None,
        };
        assert!(cluster.policy_ref().is_cluster_scoped());
    }

    #[test]
    fn test_egress_ip_field_names() {
        let spec: EgressPolicySpec = serde_json::from_value(serde_json::json!({
            "egressGatewayName": "egw",
            "egressIP": { "useNodeIP": true, "allocatorPolicy": "rr" },
            "appliedTo": { "podSubnet": ["172.16.0.0/16"] },
        }))
        .expect("deserialize policy spec");
        assert!(spec.egress_ip.use_node_ip);
        assert_eq!(spec.egress_ip.allocator(), ALLOCATOR_POLICY_ROUND_ROBIN);
        assert_eq!(spec.applied_to.pod_subnet, vec!["172.16.0.0/16"]);
    }

    #[test]
    fn test_allocator_defaults() {
        assert_eq!(EgressIp::default().allocator(), ALLOCATOR_POLICY_DEFAULT);
        assert!(EgressPolicyStatus::default().is_empty());
    }
}
