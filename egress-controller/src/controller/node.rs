use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Resource, ResourceExt};
use tracing::info;

use egress_crds::v1beta1::tunnel::{EgressTunnel, EgressTunnelSpec};

use crate::controller::DEFAULT_REQUEUE;
use crate::{Context, MANAGER, Result};

/// Every node gets an `EgressTunnel` named after it.
#[tracing::instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub(crate) async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(node.as_ref());
    if node.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let name = node.name_any();
    if ctx.stores.tunnels.get(&ObjectRef::new(&name)).is_some() {
        return Ok(Action::requeue(DEFAULT_REQUEUE));
    }

    info!(%name, "creating EgressTunnel for node");
    let api: Api<EgressTunnel> = Api::all(ctx.client.clone());
    let tunnel = EgressTunnel::new(&name, EgressTunnelSpec {});
    api.patch(
        &name,
        &PatchParams::apply(MANAGER).force(),
        &Patch::Apply(&tunnel),
    )
    .await?;
    Ok(Action::requeue(DEFAULT_REQUEUE))
}
