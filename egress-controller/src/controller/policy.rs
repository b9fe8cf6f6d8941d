use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use kube::runtime::controller::Action;
use kube::runtime::finalizer;
use tracing::{info, warn};

use egress_crds::v1beta1::policy::Policy;

use crate::allocator::GatewayState;
use crate::controller::{
    DEFAULT_REQUEUE, patch_gateway_status, patch_policy_status, policy_status_update,
};
use crate::endpoint::{PolicyResource, sync_slices};
use crate::event::{holds_policy, resolve_gateway};
use crate::{Context, POLICY_FINALIZER, Result};

const MISSING_GATEWAY_REQUEUE: Duration = Duration::from_secs(30);

#[tracing::instrument(skip(policy, ctx), fields(policy = %policy.policy_ref()))]
pub(crate) async fn reconcile<P: PolicyResource>(policy: Arc<P>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(policy.as_ref());
    let api = policy.api(ctx.client.clone());

    info!("reconciling {} {}", P::kind(&()), policy.policy_ref());
    let action = finalizer(&api, POLICY_FINALIZER, policy, |event| async {
        match event {
            finalizer::Event::Apply(policy) => apply(policy, ctx).await,
            finalizer::Event::Cleanup(policy) => cleanup(policy, ctx).await,
        }
    })
    .await?;
    Ok(action)
}

async fn apply<P: PolicyResource>(policy: Arc<P>, ctx: Arc<Context>) -> Result<Action> {
    let reference = policy.policy_ref();
    let gateways = ctx.stores.gateways.state();
    let target = resolve_gateway(policy.gateway_name(), &gateways);

    // A policy is served by at most one gateway.
    for other in gateways.iter().filter(|gw| {
        holds_policy(gw, &reference)
            && target
                .as_ref()
                .is_none_or(|t| t.name_any() != gw.name_any())
    }) {
        info!(gateway = %other.name_any(), policy = %reference, "removing policy from previous gateway");
        let mut state = GatewayState::from_gateway(other)?;
        state.delete_policy(&reference);
        patch_gateway_status(ctx.client.clone(), other, &state.status()).await?;
    }

    sync_slices(policy.as_ref(), &ctx).await?;

    let Some(gateway) = target else {
        warn!(policy = %reference, gateway = %policy.gateway_name(), "no egress gateway for policy");
        return Ok(Action::requeue(MISSING_GATEWAY_REQUEUE));
    };

    let mut state = GatewayState::from_gateway(&gateway)?;
    let outcome = {
        let mut rng = rand::rng();
        state.ensure_policy(&reference, policy.egress_ip(), &mut rng)?
    };
    if outcome.reallocated {
        patch_gateway_status(ctx.client.clone(), &gateway, &state.status()).await?;
    }
    if let Some(status) = policy_status_update(policy.policy_status(), &outcome) {
        info!(policy = %reference, node = %status.node, ipv4 = %status.eip.ipv4, ipv6 = %status.eip.ipv6, "updating policy status");
        patch_policy_status(ctx.client.clone(), &reference, &status).await?;
    }
    Ok(Action::requeue(DEFAULT_REQUEUE))
}

async fn cleanup<P: PolicyResource>(policy: Arc<P>, ctx: Arc<Context>) -> Result<Action> {
    let reference = policy.policy_ref();
    for gateway in ctx
        .stores
        .gateways
        .state()
        .iter()
        .filter(|gw| holds_policy(gw, &reference))
    {
        info!(gateway = %gateway.name_any(), policy = %reference, "deleting policy from gateway");
        let mut state = GatewayState::from_gateway(gateway)?;
        state.delete_policy(&reference);
        patch_gateway_status(ctx.client.clone(), gateway, &state.status()).await?;
    }
    Ok(Action::await_change())
}
