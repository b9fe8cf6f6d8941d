pub mod config;
pub mod http;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("controller error: {0}")]
    Controller(#[from] egress_controller::Error),

    #[error("agent error: {0}")]
    Agent(#[from] egress_agent::Error),

    #[error("crd error: {0}")]
    Crd(#[from] egress_crds::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
