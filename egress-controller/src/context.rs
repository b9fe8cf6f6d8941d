use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::Client;
use kube::runtime::reflector::Store;

use egress_crds::v1beta1::gateway::EgressGateway;
use egress_crds::v1beta1::policy::{EgressClusterPolicy, EgressPolicy};
use egress_crds::v1beta1::tunnel::EgressTunnel;
use egress_k8s_utils::ControllerMetrics;

use crate::ControllerConfig;
use crate::tunnel::TunnelAllocators;

/// Reflector caches shared by every controller.
#[derive(Clone)]
pub struct Stores {
    pub gateways: Store<EgressGateway>,
    pub policies: Store<EgressPolicy>,
    pub cluster_policies: Store<EgressClusterPolicy>,
    pub tunnels: Store<EgressTunnel>,
    pub nodes: Store<Node>,
    pub pods: Store<Pod>,
    pub namespaces: Store<Namespace>,
}

pub struct Context {
    pub client: Client,
    pub metrics: ControllerMetrics,
    pub config: Arc<ControllerConfig>,
    pub stores: Stores,
    pub tunnel_allocators: Arc<Mutex<TunnelAllocators>>,
}
