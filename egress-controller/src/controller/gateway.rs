use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use rand::Rng;
use tracing::{info, warn};

use egress_crds::v1beta1::gateway::{EgressGateway, EgressGatewayStatus, PolicyRef};
use egress_crds::v1beta1::policy::EgressPolicyStatus;
use egress_crds::v1beta1::tunnel::EgressTunnelPhase;

use crate::allocator::GatewayState;
use crate::controller::{
    DEFAULT_REQUEUE, PolicyView, patch_gateway_status, patch_policy_status, policies_of,
    policy_status_update, selected_nodes,
};
use crate::{Context, Error, Result};

#[derive(Debug, Default)]
pub(crate) struct GatewayPlan {
    pub status: EgressGatewayStatus,
    pub policy_updates: Vec<(PolicyRef, EgressPolicyStatus)>,
    pub errors: Vec<(PolicyRef, Error)>,
}

/// Recomputes every assignment of a gateway against the currently selected
/// nodes and the policies that point at it.
pub(crate) fn plan<R: Rng + ?Sized>(
    gateway: &EgressGateway,
    selected: &BTreeMap<String, EgressTunnelPhase>,
    policies: &[PolicyView],
    rng: &mut R,
) -> Result<GatewayPlan> {
    let mut state = GatewayState::from_gateway(gateway)?;
    let evicted: BTreeSet<PolicyRef> = state.sync_nodes(selected).into_iter().collect();
    if state.needs_cold_start() {
        info!(gateway = %state.name(), "single ready node without policies, placing every policy");
    }

    let wanted: BTreeSet<&PolicyRef> = policies.iter().map(|p| &p.reference).collect();
    for held in state.policies() {
        if !wanted.contains(&held) {
            info!(gateway = %state.name(), policy = %held, "dropping assignment of removed policy");
            state.delete_policy(&held);
        }
    }

    let mut plan = GatewayPlan::default();
    for view in policies {
        match state.ensure_policy(&view.reference, &view.egress_ip, rng) {
            Ok(mut outcome) => {
                outcome.reallocated |= evicted.contains(&view.reference);
                if let Some(status) = policy_status_update(view.status.as_ref(), &outcome) {
                    plan.policy_updates.push((view.reference.clone(), status));
                }
            }
            Err(error) => {
                warn!(gateway = %state.name(), policy = %view.reference, %error, "failed to place policy");
                plan.errors.push((view.reference.clone(), error));
            }
        }
    }
    plan.status = state.status();
    Ok(plan)
}

#[tracing::instrument(skip(gateway, ctx), fields(gateway = %gateway.name_any()))]
pub(crate) async fn reconcile(gateway: Arc<EgressGateway>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(gateway.as_ref());
    if gateway.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let name = gateway.name_any();
    info!("reconciling EgressGateway {}", name);

    let gateways = ctx.stores.gateways.state();
    let selected = selected_nodes(
        &gateway,
        &gateways,
        &ctx.stores.nodes.state(),
        &ctx.stores.tunnels,
    );
    let policies = policies_of(&ctx.stores, &name, &gateways);
    let plan = {
        let mut rng = rand::rng();
        plan(&gateway, &selected, &policies, &mut rng)?
    };

    if gateway.status.as_ref() != Some(&plan.status) {
        info!(
            nodes = plan.status.node_list.len(),
            "updating EgressGateway status"
        );
        patch_gateway_status(ctx.client.clone(), &gateway, &plan.status).await?;
    }
    for (policy, status) in &plan.policy_updates {
        info!(%policy, node = %status.node, ipv4 = %status.eip.ipv4, "updating policy status");
        patch_policy_status(ctx.client.clone(), policy, status).await?;
    }
    if let Some((_, error)) = plan.errors.into_iter().next() {
        return Err(error);
    }
    Ok(Action::requeue(DEFAULT_REQUEUE))
}
