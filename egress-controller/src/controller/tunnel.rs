use std::sync::{Arc, PoisonError};
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::info;

use egress_crds::v1beta1::tunnel::{EgressTunnel, EgressTunnelPhase, EgressTunnelStatus, format_mark};

use crate::tunnel::TunnelAllocation;
use crate::{Context, Result, TUNNEL_FINALIZER};

/// Whether the last heartbeat is older than `timeout`. A tunnel that never
/// reported counts as expired.
pub(crate) fn heartbeat_expired(last: Option<&Time>, now: DateTime<Utc>, timeout: Duration) -> bool {
    let Some(last) = last else {
        return true;
    };
    let timeout = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
    now.timestamp().saturating_sub(last.0.timestamp()) > timeout
}

/// Status fields owned by the controller. The heartbeat and the parent
/// interface are written by the agent.
pub(crate) fn desired_status(
    current: &EgressTunnelStatus,
    allocation: &TunnelAllocation,
    now: DateTime<Utc>,
    heartbeat_timeout: Duration,
) -> EgressTunnelStatus {
    let mut status = current.clone();
    status.mark = format_mark(allocation.mark);
    status.tunnel.ipv4 = allocation.ipv4.map(|ip| ip.to_string()).unwrap_or_default();
    status.tunnel.ipv6 = allocation.ipv6.map(|ip| ip.to_string()).unwrap_or_default();
    match status.phase {
        EgressTunnelPhase::Pending => status.phase = EgressTunnelPhase::Init,
        EgressTunnelPhase::Ready
            if heartbeat_expired(status.last_heartbeat_time.as_ref(), now, heartbeat_timeout) =>
        {
            status.phase = EgressTunnelPhase::HeartbeatTimeout
        }
        _ => {}
    }
    status
}

#[tracing::instrument(skip(tunnel, ctx), fields(tunnel = %tunnel.name_any()))]
pub(crate) async fn reconcile(tunnel: Arc<EgressTunnel>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(tunnel.as_ref());
    let api: Api<EgressTunnel> = Api::all(ctx.client.clone());

    let action = finalizer(&api, TUNNEL_FINALIZER, tunnel, |event| async {
        match event {
            finalizer::Event::Apply(tunnel) => apply(tunnel, ctx).await,
            finalizer::Event::Cleanup(tunnel) => cleanup(tunnel, ctx).await,
        }
    })
    .await?;
    Ok(action)
}

async fn apply(tunnel: Arc<EgressTunnel>, ctx: Arc<Context>) -> Result<Action> {
    let node = tunnel.name_any();
    let api: Api<EgressTunnel> = Api::all(ctx.client.clone());
    if ctx.stores.nodes.get(&ObjectRef::new(&node)).is_none() {
        info!(%node, "node no longer exists, deleting EgressTunnel");
        api.delete(&node, &DeleteParams::default()).await?;
        return Ok(Action::await_change());
    }

    let allocation = ctx
        .tunnel_allocators
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .acquire(&node)?;

    let current = tunnel.status.clone().unwrap_or_default();
    let timeout = ctx.config.heartbeat_timeout;
    let desired = desired_status(&current, &allocation, Utc::now(), timeout);
    if desired != current {
        if desired.phase != current.phase {
            info!(%node, from = current.phase.as_str(), to = desired.phase.as_str(), "tunnel phase changed");
        }
        let mut patch = json!({
            "status": {
                "mark": desired.mark,
                "phase": desired.phase,
                "tunnel": { "ipv4": desired.tunnel.ipv4, "ipv6": desired.tunnel.ipv6 },
            }
        });
        if let Some(rv) = tunnel.resource_version() {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        api.patch_status(&node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(Action::requeue(timeout))
}

async fn cleanup(tunnel: Arc<EgressTunnel>, ctx: Arc<Context>) -> Result<Action> {
    let node = tunnel.name_any();
    ctx.tunnel_allocators
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .release(&node);
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn allocation() -> TunnelAllocation {
        TunnelAllocation {
            mark: 0x26000002,
            ipv4: Some(Ipv4Addr::new(172, 31, 0, 3)),
            ipv6: None,
        }
    }

    #[test]
    fn test_heartbeat_expired() {
        let timeout = Duration::from_secs(60);
        let last = Time(at(1_000));
        assert!(!heartbeat_expired(Some(&last), at(1_060), timeout));
        assert!(heartbeat_expired(Some(&last), at(1_061), timeout));
        assert!(heartbeat_expired(None, at(1_000), timeout));
    }

    #[test]
    fn test_pending_tunnel_moves_to_init() {
        let status = desired_status(
            &EgressTunnelStatus::default(),
            &allocation(),
            at(1_000),
            Duration::from_secs(60),
        );
        assert_eq!(status.phase, EgressTunnelPhase::Init);
        assert_eq!(status.mark, "0x26000002");
        assert_eq!(status.tunnel.ipv4, "172.31.0.3");
        assert!(status.tunnel.ipv6.is_empty());
    }

    #[test]
    fn test_ready_tunnel_times_out() {
        let current = EgressTunnelStatus {
            phase: EgressTunnelPhase::Ready,
            last_heartbeat_time: Some(Time(at(1_000))),
            ..Default::default()
        };
        let fresh = desired_status(&current, &allocation(), at(1_030), Duration::from_secs(60));
        assert_eq!(fresh.phase, EgressTunnelPhase::Ready);
        assert_eq!(fresh.last_heartbeat_time, current.last_heartbeat_time);

        let stale = desired_status(&current, &allocation(), at(2_000), Duration::from_secs(60));
        assert_eq!(stale.phase, EgressTunnelPhase::HeartbeatTimeout);
    }
}
