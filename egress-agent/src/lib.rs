pub mod config;
pub mod dataplane;
mod heartbeat;
pub mod ipset;
pub mod netlink;
pub mod route;
pub mod rules;
mod runtime;
pub mod state;

use thiserror::Error;

pub use config::{AgentConfig, IptablesBackend, IptablesConfig, TunnelConfig};
pub use runtime::start_agent;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("k8s utils error: {0}")]
    K8sUtils(#[from] egress_k8s_utils::Error),

    #[error("iptables error: {0}")]
    Iptables(#[from] egress_iptables::Error),

    #[error("layer2 error: {0}")]
    Layer2(#[from] egress_layer2::Error),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("invalid mac address {0:?}")]
    InvalidMac(String),

    #[error("invalid interface pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("no ip family enabled")]
    NoFamily,

    #[error("timed out waiting for stores")]
    Timeout,

    #[error("task failed: {0}")]
    Task(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
