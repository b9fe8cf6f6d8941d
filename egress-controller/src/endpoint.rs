use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use egress_crds::v1beta1::endpoint::{
    EgressClusterEndpointSlice, EgressClusterEndpointSliceSpec, EgressEndpoint,
    EgressEndpointSlice, EgressEndpointSliceSpec,
};
use egress_crds::v1beta1::policy::{EgressClusterPolicy, EgressPolicy, Policy};
use egress_crds::{LABEL_CLUSTER_POLICY_NAME, LABEL_POLICY_NAME};
use egress_k8s_utils::label_selector_matches;

use crate::{Context, MANAGER, Result};

/// Behaviour shared by `EgressPolicy` and `EgressClusterPolicy` so that one
/// reconciler serves both.
pub trait PolicyResource:
    Policy
    + Resource<DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    type Slice: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static;

    /// Label pointing a slice back at its policy.
    const SLICE_LABEL: &'static str;

    fn api(&self, client: Client) -> Api<Self>;

    fn slice_api(&self, client: Client) -> Api<Self::Slice>;

    fn new_slice(&self, name: &str, endpoints: Vec<EgressEndpoint>) -> Self::Slice;

    fn slice_endpoints(slice: &Self::Slice) -> &[EgressEndpoint];

    fn selects(&self, pod: &Pod, namespaces: &Store<Namespace>) -> bool;
}

fn slice_meta<P: PolicyResource>(policy: &P, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: policy.namespace(),
        labels: Some(BTreeMap::from([(
            P::SLICE_LABEL.to_owned(),
            policy.name_any(),
        )])),
        owner_references: policy.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

impl PolicyResource for EgressPolicy {
    type Slice = EgressEndpointSlice;
    const SLICE_LABEL: &'static str = LABEL_POLICY_NAME;

    fn api(&self, client: Client) -> Api<Self> {
        Api::namespaced(client, &self.namespace().unwrap_or_default())
    }

    fn slice_api(&self, client: Client) -> Api<Self::Slice> {
        Api::namespaced(client, &self.namespace().unwrap_or_default())
    }

    fn new_slice(&self, name: &str, endpoints: Vec<EgressEndpoint>) -> Self::Slice {
        let mut slice = EgressEndpointSlice::new(name, EgressEndpointSliceSpec { endpoints });
        slice.metadata = slice_meta(self, name);
        slice
    }

    fn slice_endpoints(slice: &Self::Slice) -> &[EgressEndpoint] {
        &slice.spec.endpoints
    }

    fn selects(&self, pod: &Pod, _namespaces: &Store<Namespace>) -> bool {
        if pod.namespace() != self.namespace() {
            return false;
        }
        let Some(selector) = &self.spec.applied_to.pod_selector else {
            return false;
        };
        label_selector_matches(selector, pod.labels()).unwrap_or(false)
    }
}

impl PolicyResource for EgressClusterPolicy {
    type Slice = EgressClusterEndpointSlice;
    const SLICE_LABEL: &'static str = LABEL_CLUSTER_POLICY_NAME;

    fn api(&self, client: Client) -> Api<Self> {
        Api::all(client)
    }

    fn slice_api(&self, client: Client) -> Api<Self::Slice> {
        Api::all(client)
    }

    fn new_slice(&self, name: &str, endpoints: Vec<EgressEndpoint>) -> Self::Slice {
        let mut slice =
            EgressClusterEndpointSlice::new(name, EgressClusterEndpointSliceSpec { endpoints });
        slice.metadata = slice_meta(self, name);
        slice
    }

    fn slice_endpoints(slice: &Self::Slice) -> &[EgressEndpoint] {
        &slice.spec.endpoints
    }

    fn selects(&self, pod: &Pod, namespaces: &Store<Namespace>) -> bool {
        let applied = &self.spec.applied_to;
        if applied.namespace_selector.is_none() && applied.pod_selector.is_none() {
            return false;
        }
        if let Some(selector) = &applied.namespace_selector {
            let Some(ns) = pod
                .namespace()
                .and_then(|ns| namespaces.get(&ObjectRef::new(&ns)))
            else {
                return false;
            };
            if !label_selector_matches(selector, ns.labels()).unwrap_or(false) {
                return false;
            }
        }
        applied
            .pod_selector
            .as_ref()
            .is_none_or(|s| label_selector_matches(s, pod.labels()).unwrap_or(false))
    }
}

/// The addresses of a pod that can send egress traffic. Host network,
/// terminating and finished pods have none.
pub fn pod_endpoint(pod: &Pod) -> Option<EgressEndpoint> {
    if pod.metadata.deletion_timestamp.is_some() {
        return None;
    }
    let spec = pod.spec.as_ref()?;
    if spec.host_network.unwrap_or(false) {
        return None;
    }
    let status = pod.status.as_ref()?;
    if matches!(status.phase.as_deref(), Some("Succeeded" | "Failed")) {
        return None;
    }

    let mut ips: BTreeSet<String> = status
        .pod_ips
        .iter()
        .flatten()
        .map(|p| p.ip.clone())
        .collect();
    if let Some(ip) = &status.pod_ip {
        ips.insert(ip.clone());
    }

    let mut endpoint = EgressEndpoint {
        ns: pod.namespace().unwrap_or_default(),
        pod: pod.name_any(),
        node: spec.node_name.clone().unwrap_or_default(),
        ..Default::default()
    };
    for ip in ips {
        match ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => endpoint.ipv4.push(ip),
            Ok(IpAddr::V6(_)) => endpoint.ipv6.push(ip),
            Err(_) => debug!(pod = %endpoint.pod, %ip, "ignoring malformed pod ip"),
        }
    }
    (!endpoint.ipv4.is_empty() || !endpoint.ipv6.is_empty()).then_some(endpoint)
}

/// Endpoints of every pod the policy selects, ordered by namespace and name.
pub fn desired_endpoints<P: PolicyResource>(
    policy: &P,
    pods: &[Arc<Pod>],
    namespaces: &Store<Namespace>,
) -> Vec<EgressEndpoint> {
    let mut endpoints: Vec<EgressEndpoint> = pods
        .iter()
        .filter(|pod| policy.selects(pod, namespaces))
        .filter_map(|pod| pod_endpoint(pod))
        .collect();
    endpoints.sort();
    endpoints
}

pub fn slice_name(policy: &str, index: usize) -> String {
    format!("{policy}-{index}")
}

/// Slices to write and to delete so that stored slices match the pages.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SlicePlan {
    pub apply: Vec<(String, Vec<EgressEndpoint>)>,
    pub delete: Vec<String>,
}

pub fn plan_slices(
    policy: &str,
    endpoints: Vec<EgressEndpoint>,
    max_per_slice: usize,
    existing: &BTreeMap<String, Vec<EgressEndpoint>>,
) -> SlicePlan {
    let mut plan = SlicePlan::default();
    let mut wanted = BTreeSet::new();
    for (index, page) in endpoints.chunks(max_per_slice.max(1)).enumerate() {
        let name = slice_name(policy, index);
        wanted.insert(name.clone());
        if existing.get(&name).is_some_and(|e| e.as_slice() == page) {
            continue;
        }
        plan.apply.push((name, page.to_vec()));
    }
    plan.delete = existing
        .keys()
        .filter(|name| !wanted.contains(*name))
        .cloned()
        .collect();
    plan
}

/// Writes the pod endpoints selected by `policy` into its slices.
pub(crate) async fn sync_slices<P: PolicyResource>(policy: &P, ctx: &Context) -> Result<()> {
    let name = policy.name_any();
    let endpoints = desired_endpoints(policy, &ctx.stores.pods.state(), &ctx.stores.namespaces);

    let api = policy.slice_api(ctx.client.clone());
    let params = ListParams::default().labels(&format!("{}={}", P::SLICE_LABEL, name));
    let existing: BTreeMap<String, Vec<EgressEndpoint>> = api
        .list(&params)
        .await?
        .into_iter()
        .map(|slice| (slice.name_any(), P::slice_endpoints(&slice).to_vec()))
        .collect();

    let plan = plan_slices(&name, endpoints, ctx.config.max_endpoints_per_slice, &existing);
    let ssapply = PatchParams::apply(MANAGER).force();
    for (slice_name, page) in plan.apply {
        debug!(policy = %name, slice = %slice_name, endpoints = page.len(), "applying endpoint slice");
        let slice = policy.new_slice(&slice_name, page);
        api.patch(&slice_name, &ssapply, &Patch::Apply(&slice))
            .await?;
    }
    for slice_name in plan.delete {
        info!(policy = %name, slice = %slice_name, "deleting surplus endpoint slice");
        api.delete(&slice_name, &DeleteParams::default()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use egress_crds::v1beta1::policy::{
        AppliedTo, ClusterAppliedTo, EgressClusterPolicySpec, EgressPolicySpec,
    };
    use k8s_openapi::api::core::v1::{PodIP, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::runtime::reflector::store;
    use kube::runtime::watcher;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn make_pod(ns: &str, name: &str, app: &str, ips: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                labels: Some(labels(&[("app", app)])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".into()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                pod_ips: Some(ips.iter().map(|ip| PodIP { ip: ip.to_string() }).collect()),
                ..Default::default()
            }),
        }
    }

    fn make_namespaces(namespaces: &[(&str, &[(&str, &str)])]) -> Store<Namespace> {
        let (reader, mut writer) = store();
        for (name, ns_labels) in namespaces {
            writer.apply_watcher_event(&watcher::Event::Apply(Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(labels(ns_labels)),
                    ..Default::default()
                },
                ..Default::default()
            }));
        }
        reader
    }

    fn endpoint(pod: &str, ipv4: &str) -> EgressEndpoint {
        EgressEndpoint {
            ns: "default".into(),
            pod: pod.into(),
            ipv4: vec![ipv4.into()],
            ipv6: vec![],
            node: "node-a".into(),
        }
    }

    #[test]
    fn test_pod_endpoint_splits_families() {
        let pod = make_pod("default", "web", "web", &["10.1.0.4", "fd00::4"]);
        let ep = pod_endpoint(&pod).unwrap();
        assert_eq!(ep.ipv4, vec!["10.1.0.4"]);
        assert_eq!(ep.ipv6, vec!["fd00::4"]);
        assert_eq!(ep.node, "node-a");

        let mut host = pod.clone();
        host.spec.as_mut().unwrap().host_network = Some(true);
        assert!(pod_endpoint(&host).is_none());

        let mut done = pod.clone();
        done.status.as_mut().unwrap().phase = Some("Succeeded".into());
        assert!(pod_endpoint(&done).is_none());

        assert!(pod_endpoint(&make_pod("default", "pending", "web", &[])).is_none());
    }

    #[test]
    fn test_namespaced_policy_selection() {
        let policy = EgressPolicy {
            metadata: ObjectMeta {
                name: Some("p1".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: EgressPolicySpec {
                applied_to: AppliedTo {
                    pod_selector: Some(LabelSelector {
                        match_labels: Some(labels(&[("app", "web")])),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        };
        let namespaces = make_namespaces(&[]);
        let pods = vec![
            Arc::new(make_pod("default", "web-2", "web", &["10.1.0.2"])),
            Arc::new(make_pod("default", "web-1", "web", &["10.1.0.1"])),
            Arc::new(make_pod("default", "db", "db", &["10.1.0.3"])),
            Arc::new(make_pod("other", "web-3", "web", &["10.1.0.9"])),
        ];
        let endpoints = desired_endpoints(&policy, &pods, &namespaces);
        assert_eq!(
            endpoints,
            vec![endpoint("web-1", "10.1.0.1"), endpoint("web-2", "10.1.0.2")]
        );
    }

    #[test]
    fn test_cluster_policy_namespace_selector() {
        let policy = EgressClusterPolicy {
            metadata: ObjectMeta {
                name: Some("c1".into()),
                ..Default::default()
            },
            spec: EgressClusterPolicySpec {
                applied_to: ClusterAppliedTo {
                    namespace_selector: Some(LabelSelector {
                        match_labels: Some(labels(&[("egress", "true")])),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        };
        let namespaces = make_namespaces(&[("team-a", &[("egress", "true")]), ("team-b", &[])]);
        assert!(policy.selects(&make_pod("team-a", "x", "web", &["10.1.0.1"]), &namespaces));
        assert!(!policy.selects(&make_pod("team-b", "y", "web", &["10.1.0.2"]), &namespaces));
        assert!(!policy.selects(&make_pod("missing", "z", "web", &["10.1.0.3"]), &namespaces));
    }

    #[test]
    fn test_plan_slices_pages_and_prunes() {
        let endpoints: Vec<EgressEndpoint> = (1..=5)
            .map(|i| endpoint(&format!("pod-{i}"), &format!("10.1.0.{i}")))
            .collect();
        let existing = BTreeMap::from([
            ("p1-0".to_owned(), endpoints[0..2].to_vec()),
            ("p1-1".to_owned(), vec![endpoint("gone", "10.1.0.99")]),
            ("p1-7".to_owned(), vec![]),
        ]);
        let plan = plan_slices("p1", endpoints.clone(), 2, &existing);
        let applied: Vec<&str> = plan.apply.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(applied, vec!["p1-1", "p1-2"]);
        assert_eq!(plan.apply[1].1, endpoints[4..].to_vec());
        assert_eq!(plan.delete, vec!["p1-7"]);
    }

    #[test]
    fn test_plan_slices_unchanged() {
        let endpoints = vec![endpoint("pod-1", "10.1.0.1")];
        let existing = BTreeMap::from([("p1-0".to_owned(), endpoints.clone())]);
        assert_eq!(plan_slices("p1", endpoints, 100, &existing), SlicePlan::default());

        let plan = plan_slices("p1", vec![], 100, &existing);
        assert!(plan.apply.is_empty());
        assert_eq!(plan.delete, vec!["p1-0"]);
    }

    #[test]
    fn test_slice_owner_and_label() {
        let policy = EgressPolicy {
            metadata: ObjectMeta {
                name: Some("p1".into()),
                namespace: Some("default".into()),
                uid: Some("uid-1".into()),
                ..Default::default()
            },
            spec: EgressPolicySpec::default(),
            status: None,
        };
        let slice = policy.new_slice("p1-0", vec![endpoint("pod-1", "10.1.0.1")]);
        assert_eq!(slice.labels().get(LABEL_POLICY_NAME).map(String::as_str), Some("p1"));
        assert_eq!(slice.namespace().as_deref(), Some("default"));
        let owner = &slice.owner_references()[0];
        assert_eq!(owner.kind, "EgressPolicy");
        assert_eq!(owner.uid, "uid-1");
    }
}
