use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const NAME_GROUP_EGRESSENDPOINTSLICE: &str = "egressendpointslices.egressgateway.spidernet.io";
pub const NAME_GROUP_EGRESSCLUSTERENDPOINTSLICE: &str =
    "egressclusterendpointslices.egressgateway.spidernet.io";

/// A page of pod addresses selected by one `EgressPolicy`.
#[derive(CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressEndpointSlice",
    shortname = "egep",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EgressEndpointSliceSpec {
    #[serde(default)]
    pub endpoints: Vec<EgressEndpoint>,
}

/// A page of pod addresses selected by one `EgressClusterPolicy`.
#[derive(CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressClusterEndpointSlice",
    shortname = "egcep",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct EgressClusterEndpointSliceSpec {
    #[serde(default)]
    pub endpoints: Vec<EgressEndpoint>,
}

#[derive(
    Serialize, Deserialize, Default, PartialEq, Eq, PartialOrd, Ord, Clone, Debug, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct EgressEndpoint {
    pub ns: String,
    pub pod: String,
    #[serde(default, rename = "ipv4")]
    pub ipv4: Vec<String>,
    #[serde(default, rename = "ipv6")]
    pub ipv6: Vec<String>,
    #[serde(default)]
    pub node: String,
}
