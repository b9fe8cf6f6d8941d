use thiserror::Error;

pub mod v1beta1;

use kube::CustomResourceExt;

pub const GROUP: &str = "egressgateway.spidernet.io";

/// Label carried by endpoint slices pointing back at their namespaced policy.
pub const LABEL_POLICY_NAME: &str = "egressgateway.spidernet.io/egresspolicy";

/// Label carried by endpoint slices pointing back at their cluster policy.
pub const LABEL_CLUSTER_POLICY_NAME: &str = "egressgateway.spidernet.io/egressclusterpolicy";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

pub fn crd_gen_all() -> Result<()> {
    let crds = vec![
        v1beta1::gateway::EgressGateway::crd(),
        v1beta1::policy::EgressPolicy::crd(),
        v1beta1::policy::EgressClusterPolicy::crd(),
        v1beta1::tunnel::EgressTunnel::crd(),
        v1beta1::endpoint::EgressEndpointSlice::crd(),
        v1beta1::endpoint::EgressClusterEndpointSlice::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
