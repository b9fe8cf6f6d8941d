use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use kube::runtime::reflector::Store;
use kube::{Api, Client, ResourceExt};
use regex::Regex;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use egress_crds::v1beta1::endpoint::{EgressClusterEndpointSlice, EgressEndpointSlice};
use egress_crds::v1beta1::gateway::EgressGateway;
use egress_crds::v1beta1::policy::{EgressClusterPolicy, EgressPolicy};
use egress_crds::v1beta1::tunnel::EgressTunnel;
use egress_crds::{LABEL_CLUSTER_POLICY_NAME, LABEL_POLICY_NAME};
use egress_iptables::{
    BackendMode, CommandBackend, DataplaneLock, DummyLock, Features, IpVersion, SharedLock, Table,
    features,
};
use egress_k8s_utils::create_store_and_subscriber;
use egress_layer2::{Announce, SocketResponderFactory, SystemInterfaces};

use crate::config::{AgentConfig, IptablesBackend};
use crate::dataplane::{Dataplane, FamilyTables};
use crate::heartbeat;
use crate::ipset::{CommandIpSet, IpFamily, IpSetManager, OWNED_PREFIX};
use crate::netlink::RtNetlink;
use crate::route::Router;
use crate::state::{PolicyInfo, desired_state};
use crate::{Error, Result};

const STORE_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_RETRY: Duration = Duration::from_secs(1);
const MAX_RETRY: Duration = Duration::from_secs(30);
/// Longest idle wait between syncs when nothing changes.
const RESYNC_INTERVAL: Duration = Duration::from_secs(90);
const MIN_WAIT: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct Stores {
    gateways: Store<EgressGateway>,
    policies: Store<EgressPolicy>,
    cluster_policies: Store<EgressClusterPolicy>,
    tunnels: Store<EgressTunnel>,
    slices: Store<EgressEndpointSlice>,
    cluster_slices: Store<EgressClusterEndpointSlice>,
}

impl Stores {
    fn policy_infos(&self) -> Vec<PolicyInfo> {
        let slices = self.slices.state();
        let cluster_slices = self.cluster_slices.state();
        let mut infos: Vec<PolicyInfo> = self
            .policies
            .state()
            .iter()
            .map(|policy| {
                let endpoints = slices
                    .iter()
                    .filter(|s| {
                        s.namespace() == policy.namespace()
                            && s.labels().get(LABEL_POLICY_NAME) == Some(&policy.name_any())
                    })
                    .flat_map(|s| s.spec.endpoints.iter());
                PolicyInfo::new(policy.as_ref(), endpoints)
            })
            .collect();
        infos.extend(self.cluster_policies.state().iter().map(|policy| {
            let endpoints = cluster_slices
                .iter()
                .filter(|s| s.labels().get(LABEL_CLUSTER_POLICY_NAME) == Some(&policy.name_any()))
                .flat_map(|s| s.spec.endpoints.iter());
            PolicyInfo::new(policy.as_ref(), endpoints)
        }));
        infos
    }
}

/// Reads the iptables version of the selected flavour. A forced flavour
/// overrides what the binary reports.
fn detect_features(ip_version: IpVersion, backend: IptablesBackend) -> Result<Features> {
    let prefix = match ip_version {
        IpVersion::V4 => "iptables",
        IpVersion::V6 => "ip6tables",
    };
    let features = match backend {
        IptablesBackend::Auto => features::detect(prefix)?,
        IptablesBackend::Legacy => Features {
            mode: BackendMode::Legacy,
            ..features::detect(&format!("{prefix}-legacy"))?
        },
        IptablesBackend::Nft => Features {
            mode: BackendMode::Nft,
            ..features::detect(&format!("{prefix}-nft"))?
        },
    };
    Ok(features)
}

fn build_dataplane(
    config: &AgentConfig,
    announce: Arc<Announce>,
) -> Result<Dataplane<CommandBackend, CommandIpSet>> {
    let iptables = &config.iptables;
    let shared_lock: Arc<dyn DataplaneLock> = Arc::new(SharedLock::new(
        iptables.lock_file.clone(),
        iptables.lock_timeout,
        iptables.lock_probe_interval,
    ));
    let families = [
        (config.enable_ipv4, IpFamily::Inet, IpVersion::V4),
        (config.enable_ipv6, IpFamily::Inet6, IpVersion::V6),
    ];

    let mut tables = Vec::new();
    for (_, family, ip_version) in families.into_iter().filter(|(enabled, ..)| *enabled) {
        let features = detect_features(ip_version, iptables.backend)?;
        let lock: Arc<dyn DataplaneLock> = if features.restore_supports_lock {
            Arc::new(DummyLock)
        } else {
            shared_lock.clone()
        };
        let backend = match iptables.backend {
            IptablesBackend::Auto => {
                CommandBackend::system(ip_version, &features, iptables.lock_timeout)
            }
            IptablesBackend::Legacy | IptablesBackend::Nft => {
                CommandBackend::new(ip_version, &features, iptables.lock_timeout)
            }
        };
        info!(family = family.as_str(), version = %features.version, nftables = features.nftables(), "iptables detected");
        let table = |name: &str| {
            Table::new(
                name,
                ip_version,
                backend.clone(),
                lock.clone(),
                features.nftables(),
                iptables.table_options(),
            )
        };
        tables.push(FamilyTables::new(family, table("mangle")?, table("nat")?));
    }
    if tables.is_empty() {
        return Err(Error::NoFamily);
    }

    Ok(Dataplane::new(
        &config.node_name,
        config.mark_start,
        tables,
        IpSetManager::new(CommandIpSet::default(), OWNED_PREFIX),
        announce,
    ))
}

/// Runs the node's dataplane sync until `cancel` fires. `ready` is cancelled
/// after the first successful sync, which is retried until it succeeds.
pub async fn start_agent(
    client: Client,
    config: AgentConfig,
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
            create_store_and_subscriber(
                Api::<EgressEndpointSlice>::all(client.clone()),
                Some(STORE_TIMEOUT)
            ),
            create_store_and_subscriber(
                Api::<EgressClusterEndpointSlice>::all(client.clone()),
                Some(STORE_TIMEOUT)
            ),
        )
    })
    .await
    .map_err(|_| Error::Timeout)??;

    let (
        (gateways, gateway_subscriber),
        (policies, policy_subscriber),
        (cluster_policies, cluster_policy_subscriber),
        (tunnels, tunnel_subscriber),
        (slices, slice_subscriber),
        (cluster_slices, cluster_slice_subscriber),
    ) = store_init;
    let stores = Stores {
        gateways,
        policies,
        cluster_policies,
        tunnels,
        slices,
        cluster_slices,
    };
    let mut changes = futures::stream::select_all(vec![
        gateway_subscriber.map(|_| ()).boxed(),
        policy_subscriber.map(|_| ()).boxed(),
        cluster_policy_subscriber.map(|_| ()).boxed(),
        tunnel_subscriber.map(|_| ()).boxed(),
        slice_subscriber.map(|_| ()).boxed(),
        cluster_slice_subscriber.map(|_| ()).boxed(),
    ]);

    let exclude = Regex::new(&config.announce_exclude_interfaces)?;
    let announce = Announce::start(
        Some(exclude),
        Arc::new(SocketResponderFactory),
        Arc::new(SystemInterfaces),
        cancel.child_token(),
    );
    let mut dataplane = build_dataplane(&config, announce)?;
    let families = dataplane.families();
    let router = Router::new(
        RtNetlink::new()?,
        config.tunnel.clone(),
        config.mark_start,
        config.mark_count,
        families.clone(),
    );
    let (local_tunnel, local_tunnel_rx) = watch::channel(None);

    info!(node = %config.node_name, "starting egress agent");
    let mut bootstrapped = false;
    let mut retry = INITIAL_RETRY;
    loop {
        let desired = desired_state(
            &config.node_name,
            &stores.gateways.state(),
            &stores.policy_infos(),
            &stores.tunnels.state(),
            &config.ignore_cidrs,
            &families,
        );
        let (returned, desired, result) = tokio::task::spawn_blocking(move || {
            let result = dataplane.sync(&desired);
            (dataplane, desired, result)
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))?;
        dataplane = returned;
        let result = match result {
            Ok(reschedule) => router.sync(&desired.tunnel).await.map(|local| {
                local_tunnel.send_if_modified(|current| {
                    let changed = *current != local;
                    *current = local;
                    changed
                });
                reschedule
            }),
            Err(e) => Err(e),
        };

        let wait = match result {
            Ok(reschedule) => {
                retry = INITIAL_RETRY;
                if !bootstrapped {
                    bootstrapped = true;
                    info!("first dataplane sync succeeded");
                    ready.cancel();
                    tokio::spawn(heartbeat::run(
                        client.clone(),
                        config.node_name.clone(),
                        config.heartbeat_interval,
                        local_tunnel_rx.clone(),
                        cancel.child_token(),
                    ));
                }
                reschedule
                    .map_or(RESYNC_INTERVAL, |r| r.min(RESYNC_INTERVAL))
                    .max(MIN_WAIT)
            }
            Err(e) if !bootstrapped => {
                warn!(error = %e, ?retry, "initial dataplane sync failed, retrying");
                let next = (retry * 2).min(MAX_RETRY);
                std::mem::replace(&mut retry, next)
            }
            Err(e) => {
                error!(error = %e, ?retry, "dataplane sync failed");
                let next = (retry * 2).min(MAX_RETRY);
                std::mem::replace(&mut retry, next)
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(()) = changes.next() => {
                // Coalesce whatever else is already queued.
                while let Some(Some(())) = changes.next().now_or_never() {}
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!("egress agent stopped");
    Ok(())
}
