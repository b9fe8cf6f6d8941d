use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use egress_crds::v1beta1::tunnel::{EgressTunnel, EgressTunnelPhase};

use crate::Result;
use crate::route::LocalTunnel;

/// The tunnel addresses stay with the controller, only the local end is
/// published next to the heartbeat.
pub(crate) fn heartbeat_patch(now: DateTime<Utc>, local: Option<&LocalTunnel>) -> Value {
    let mut patch = json!({
        "status": {
            "phase": EgressTunnelPhase::Ready,
            "lastHeartbeatTime": Time(now),
        }
    });
    if let Some(local) = local {
        patch["status"]["tunnel"] = json!({
            "mac": local.mac,
            "parent": local.parent,
        });
    }
    patch
}

async fn beat(api: &Api<EgressTunnel>, node_name: &str, local: Option<&LocalTunnel>) -> Result<()> {
    api.patch_status(
        node_name,
        &PatchParams::default(),
        &Patch::Merge(&heartbeat_patch(Utc::now(), local)),
    )
    .await?;
    debug!(node = node_name, "sent tunnel heartbeat");
    Ok(())
}

/// Marks the node's `EgressTunnel` ready every `interval` until cancelled,
/// and right away whenever the local tunnel end changes.
pub async fn run(
    client: Client,
    node_name: String,
    interval: Duration,
    mut local: watch::Receiver<Option<LocalTunnel>>,
    cancel: CancellationToken,
) {
    let api: Api<EgressTunnel> = Api::all(client);
    let mut ticker = tokio::time::interval(interval);
    info!(node = %node_name, ?interval, "starting tunnel heartbeat");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            changed = local.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let current = local.borrow_and_update().clone();
        if let Err(e) = beat(&api, &node_name, current.as_ref()).await {
            warn!(node = %node_name, error = %e, "failed to send tunnel heartbeat");
        }
    }
}

#[cfg(test)]
mod tests {
    use egress_crds::v1beta1::tunnel::Parent;

    use super::*;

    #[test]
    fn test_heartbeat_patch() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let patch = heartbeat_patch(now, None);
        assert_eq!(patch["status"]["phase"], "Ready");
        let sent: Time = serde_json::from_value(patch["status"]["lastHeartbeatTime"].clone()).unwrap();
        assert_eq!(sent, Time(now));
        assert!(patch["status"].get("tunnel").is_none());
    }

    #[test]
    fn test_heartbeat_patch_publishes_local_end_only() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let local = LocalTunnel {
            mac: "02:00:00:00:00:02".into(),
            parent: Parent {
                name: "eth0".into(),
                ipv4: "192.168.1.11".into(),
                ipv6: String::new(),
            },
        };
        let patch = heartbeat_patch(now, Some(&local));
        let tunnel = &patch["status"]["tunnel"];
        assert_eq!(tunnel["mac"], "02:00:00:00:00:02");
        assert_eq!(tunnel["parent"]["name"], "eth0");
        assert_eq!(tunnel["parent"]["ipv4"], "192.168.1.11");
        // A merge patch must not clear the addresses the controller owns.
        assert!(tunnel.get("ipv4").is_none());
        assert!(tunnel.get("ipv6").is_none());
    }
}
