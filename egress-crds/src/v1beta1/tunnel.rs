use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const NAME_GROUP_EGRESSTUNNEL: &str = "egresstunnels.egressgateway.spidernet.io";

/// One per node, named after the node.
#[derive(CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "egressgateway.spidernet.io",
    version = "v1beta1",
    kind = "EgressTunnel",
    status = "EgressTunnelStatus",
    shortname = "egt",
    derive = "Default",
    derive = "PartialEq"
)]
pub struct EgressTunnelSpec {}

#[derive(Serialize, Deserialize, Default, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressTunnelStatus {
    #[serde(default)]
    pub tunnel: Tunnel,
    #[serde(default)]
    pub phase: EgressTunnelPhase,
    /// Firewall mark in `0x` hex notation
    #[serde(default)]
    pub mark: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<Time>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    #[serde(default, rename = "ipv4")]
    pub ipv4: String,
    #[serde(default, rename = "ipv6")]
    pub ipv6: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub parent: Parent,
}

/// Host interface the tunnel rides on.
#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Parent {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "ipv4")]
    pub ipv4: String,
    #[serde(default, rename = "ipv6")]
    pub ipv6: String,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Hash, Clone, Copy, Debug, JsonSchema)]
pub enum EgressTunnelPhase {
    #[default]
    Pending,
    Init,
    Failed,
    Succeeded,
    Ready,
    NotReady,
    HeartbeatTimeout,
}

impl EgressTunnelPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Init => "Init",
            Self::Failed => "Failed",
            Self::Succeeded => "Succeeded",
            Self::Ready => "Ready",
            Self::NotReady => "NotReady",
            Self::HeartbeatTimeout => "HeartbeatTimeout",
        }
    }
}

impl EgressTunnel {
    pub fn phase(&self) -> EgressTunnelPhase {
        self.status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    /// Parses the `0x` prefixed mark, `None` when unset or malformed.
    pub fn mark(&self) -> Option<u32> {
        let mark = self.status.as_ref()?.mark.as_str();
        let hex = mark.strip_prefix("0x").or_else(|| mark.strip_prefix("0X"))?;
        u32::from_str_radix(hex, 16).ok()
    }
}

pub fn format_mark(mark: u32) -> String {
    format!("{mark:#010x}")
}
