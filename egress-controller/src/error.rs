use kube::runtime::finalizer;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("invalid network: {0}")]
    IpNetworkError(#[from] ipnetwork::IpNetworkError),

    #[error("k8s utils error: {0}")]
    K8sUtils(#[from] egress_k8s_utils::Error),

    #[error("invalid ip pool entry {0}")]
    InvalidIpPool(String),

    #[error("invalid ip {0}")]
    InvalidIp(String),

    #[error("{0} is not within the ip pools of gateway {1}")]
    IpNotInPool(String, String),

    #[error("no egress {0} is available in gateway {1}")]
    NoFreeIp(&'static str, String),

    #[error("{0} is already held by {1}")]
    IpInUse(String, String),

    #[error("egress gateway {0} not found")]
    GatewayNotFound(String),

    #[error("{0} allocator exhausted")]
    AllocatorExhausted(&'static str),

    #[error("missing precondition: {0}")]
    ReconcileMissingPrecondition(String),

    #[error("timed out waiting for stores")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl From<finalizer::Error<Error>> for Error {
    fn from(err: finalizer::Error<Error>) -> Self {
        match err {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
            finalizer::Error::AddFinalizer(e) | finalizer::Error::RemoveFinalizer(e) => {
                Error::KubeError(e)
            }
            finalizer::Error::UnnamedObject => Error::Other("object has no name".into()),
            finalizer::Error::InvalidFinalizer => Error::Other("invalid finalizer".into()),
        }
    }
}

impl Error {
    pub fn metric_label(&self) -> String {
        let label = match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::IpNetworkError(_) | Error::InvalidIpPool(_) | Error::InvalidIp(_) => {
                "invalid_ip"
            }
            Error::K8sUtils(_) => "k8s_utils",
            Error::IpNotInPool(..) => "ip_not_in_pool",
            Error::NoFreeIp(..) => "no_free_ip",
            Error::IpInUse(..) => "ip_in_use",
            Error::GatewayNotFound(_) => "gateway_not_found",
            Error::AllocatorExhausted(_) => "allocator_exhausted",
            Error::ReconcileMissingPrecondition(_) => "missing_precondition",
            Error::Timeout => "timeout",
            Error::Other(_) => "other",
        };
        label.to_owned()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
