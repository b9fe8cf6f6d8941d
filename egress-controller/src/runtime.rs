use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{Config, Controller};
use kube::{Api, Client, ResourceExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info;

use egress_crds::v1beta1::gateway::EgressGateway;
use egress_crds::v1beta1::policy::{EgressClusterPolicy, EgressPolicy};
use egress_crds::v1beta1::tunnel::EgressTunnel;
use egress_k8s_utils::{ControllerMetrics, create_store_and_subscriber, shutdown};

use crate::controller::{error_policy, gateway, node, policy, tunnel};
use crate::event::Event;
use crate::tunnel::{TunnelAllocation, TunnelAllocators};
use crate::{Context, ControllerConfig, Error, Result, Stores};

const STORE_TIMEOUT: Duration = Duration::from_secs(30);
const CONCURRENCY: u16 = 10;

fn restore_allocators(config: &ControllerConfig, tunnels: &Store<EgressTunnel>) -> TunnelAllocators {
    let mut allocators = TunnelAllocators::new(
        config.mark_start,
        config.mark_count,
        config.tunnel_ipv4_subnet,
        config.tunnel_ipv6_subnet,
    );
    let mut restored = 0usize;
    for tunnel in tunnels.state() {
        if let Some(allocation) = TunnelAllocation::from_tunnel(&tunnel)
            && allocators.restore(&tunnel.name_any(), allocation)
        {
            restored += 1;
        }
    }
    info!(restored, "restored tunnel allocations");
    allocators
}

/// Runs the gateway, policy, tunnel and node controllers until `cancel`
/// fires. `ready` is cancelled once every store has synced.
pub async fn start_controllers(
    client: Client,
    config: ControllerConfig,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let store_init = timeout(STORE_TIMEOUT, async {
        tokio::try_join!(
            create_store_and_subscriber(Api::<EgressGateway>::all(client.clone()), Some(STORE_TIMEOUT)),
            create_store_and_subscriber(Api::<EgressPolicy>::all(client.clone()), Some(STORE_TIMEOUT)),
            create_store_and_subscriber(
                Api::<EgressClusterPolicy>::all(client.clone()),
                Some(STORE_TIMEOUT)
            ),
            create_store_and_subscriber(Api::<EgressTunnel>::all(client.clone()), Some(STORE_TIMEOUT)),
            create_store_and_subscriber(Api::<Node>::all(client.clone()), Some(STORE_TIMEOUT)),
            create_store_and_subscriber(Api::<Pod>::all(client.clone()), Some(STORE_TIMEOUT)),
            create_store_and_subscriber(Api::<Namespace>::all(client.clone()), Some(STORE_TIMEOUT)),
        )
    })
    .await
    .map_err(|_| Error::Timeout)??;

    let (
        (gateways, gateway_subscriber),
        (policies, policy_subscriber),
        (cluster_policies, cluster_policy_subscriber),
        (tunnels, tunnel_subscriber),
        (nodes, node_subscriber),
        (pods, pod_subscriber),
        (namespaces, namespace_subscriber),
    ) = store_init;

    let allocators = Arc::new(Mutex::new(restore_allocators(&config, &tunnels)));
    let stores = Stores {
        gateways: gateways.clone(),
        policies: policies.clone(),
        cluster_policies: cluster_policies.clone(),
        tunnels: tunnels.clone(),
        nodes: nodes.clone(),
        pods,
        namespaces,
    };
    let controller_config = Config::default()
        .debounce(config.debounce)
        .concurrency(CONCURRENCY);
    let config = Arc::new(config);
    let context = |name: &str| {
        Arc::new(Context {
            client: client.clone(),
            metrics: ControllerMetrics::new(name),
            config: config.clone(),
            stores: stores.clone(),
            tunnel_allocators: allocators.clone(),
        })
    };

    let gateway_controller = {
        let (for_policy, for_cluster_policy, for_tunnel, for_node) = (
            gateways.clone(),
            gateways.clone(),
            gateways.clone(),
            gateways.clone(),
        );
        Controller::for_shared_stream(gateway_subscriber, gateways)
            .watches_shared_stream(policy_subscriber.clone(), move |p: Arc<EgressPolicy>| {
                Event::from_policy(p.as_ref()).gateways(&for_policy.state())
            })
            .watches_shared_stream(
                cluster_policy_subscriber.clone(),
                move |p: Arc<EgressClusterPolicy>| {
                    Event::from_policy(p.as_ref()).gateways(&for_cluster_policy.state())
                },
            )
            .watches_shared_stream(tunnel_subscriber.clone(), move |t: Arc<EgressTunnel>| {
                Event::from_tunnel(&t).gateways(&for_tunnel.state())
            })
            .watches_shared_stream(node_subscriber.clone(), move |n: Arc<Node>| {
                Event::from_node(&n).gateways(&for_node.state())
            })
            .graceful_shutdown_on(shutdown(cancel.clone()))
            .with_config(controller_config.clone())
            .run(gateway::reconcile, error_policy, context("egress_gateway"))
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
    };

    let policy_controller = {
        let by_namespace = policies.clone();
        Controller::for_shared_stream(policy_subscriber, policies)
            .watches_shared_stream(pod_subscriber.clone(), move |pod: Arc<Pod>| {
                by_namespace
                    .state()
                    .into_iter()
                    .filter(|p| p.namespace() == pod.namespace())
                    .map(|p| ObjectRef::from_obj(p.as_ref()))
                    .collect::<Vec<_>>()
            })
            .graceful_shutdown_on(shutdown(cancel.clone()))
            .with_config(controller_config.clone())
            .run(
                policy::reconcile::<EgressPolicy>,
                error_policy,
                context("egress_policy"),
            )
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
    };

    let cluster_policy_controller = {
        let (for_pods, for_namespaces) = (cluster_policies.clone(), cluster_policies.clone());
        Controller::for_shared_stream(cluster_policy_subscriber, cluster_policies)
            .watches_shared_stream(pod_subscriber, move |_: Arc<Pod>| all_refs(&for_pods))
            .watches_shared_stream(namespace_subscriber, move |_: Arc<Namespace>| {
                all_refs(&for_namespaces)
            })
            .graceful_shutdown_on(shutdown(cancel.clone()))
            .with_config(controller_config.clone())
            .run(
                policy::reconcile::<EgressClusterPolicy>,
                error_policy,
                context("egress_cluster_policy"),
            )
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
    };

    let tunnel_controller = Controller::for_shared_stream(tunnel_subscriber.clone(), tunnels)
        .watches_shared_stream(node_subscriber.clone(), |n: Arc<Node>| {
            Some(ObjectRef::<EgressTunnel>::new(&n.name_any()))
        })
        .graceful_shutdown_on(shutdown(cancel.clone()))
        .with_config(controller_config.clone())
        .run(tunnel::reconcile, error_policy, context("egress_tunnel"))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    let node_controller = Controller::for_shared_stream(node_subscriber, nodes)
        .watches_shared_stream(tunnel_subscriber, |t: Arc<EgressTunnel>| {
            Some(ObjectRef::<Node>::new(&t.name_any()))
        })
        .graceful_shutdown_on(shutdown(cancel.clone()))
        .with_config(controller_config)
        .run(node::reconcile, error_policy, context("egress_node"))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    info!("starting egress controllers");
    ready.cancel();
    tokio::join!(
        gateway_controller,
        policy_controller,
        cluster_policy_controller,
        tunnel_controller,
        node_controller,
    );
    Ok(())
}

fn all_refs<K>(store: &Store<K>) -> Vec<ObjectRef<K>>
where
    K: kube::Resource<DynamicType = ()> + Clone + 'static,
{
    store
        .state()
        .iter()
        .map(|k| ObjectRef::from_obj(k.as_ref()))
        .collect()
}
