use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use rand::Rng;
use tracing::{debug, info};

use egress_crds::v1beta1::gateway::{
    EgressGateway, EgressGatewayStatus, EgressIPStatus, Eips, IpUsage, PolicyRef,
};
use egress_crds::v1beta1::policy::{ALLOCATOR_POLICY_DEFAULT, Eip, EgressIp, EgressPolicyStatus};
use egress_crds::v1beta1::tunnel::EgressTunnelPhase;

use crate::ippool::{IpFamily, IpPool};
use crate::{Error, Result};

/// Nodes of one gateway keyed by node name.
pub type NodeMap = BTreeMap<String, EgressIPStatus>;

/// Where a policy's traffic leaves the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assignment {
    pub node: String,
    pub ipv4: String,
    pub ipv6: String,
}

impl Assignment {
    pub fn to_policy_status(&self) -> EgressPolicyStatus {
        EgressPolicyStatus {
            eip: Eip {
                ipv4: self.ipv4.clone(),
                ipv6: self.ipv6.clone(),
            },
            node: self.node.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub assignment: Option<Assignment>,
    /// The policy was (re)placed rather than left where it was.
    pub reallocated: bool,
}

/// Working copy of a gateway's pools and node list that assignments are
/// computed against before being written back as status.
#[derive(Clone, Debug)]
pub struct GatewayState {
    name: String,
    ipv4_pool: IpPool,
    ipv6_pool: IpPool,
    ipv4_default: Option<IpAddr>,
    ipv6_default: Option<IpAddr>,
    nodes: NodeMap,
}

/// `s` in the form status entries are written in.
fn canonical(s: &str) -> Result<String> {
    Ok(parse_optional_ip(s)?.map(|ip| ip.to_string()).unwrap_or_default())
}

fn parse_optional_ip(s: &str) -> Result<Option<IpAddr>> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|_| Error::InvalidIp(s.to_owned()))
}

impl GatewayState {
    pub fn from_gateway(gateway: &EgressGateway) -> Result<Self> {
        let name = kube::ResourceExt::name_any(gateway);
        let pools = &gateway.spec.ippools;
        let ipv4_pool = IpPool::parse(IpFamily::V4, &pools.ipv4)?;
        let ipv6_pool = IpPool::parse(IpFamily::V6, &pools.ipv6)?;

        let ipv4_default = parse_optional_ip(&pools.ipv4_default_eip)?;
        if let Some(ip) = ipv4_default
            && !ipv4_pool.contains(&ip)
        {
            return Err(Error::IpNotInPool(ip.to_string(), name));
        }
        let ipv6_default = parse_optional_ip(&pools.ipv6_default_eip)?;
        if let Some(ip) = ipv6_default
            && !ipv6_pool.contains(&ip)
        {
            return Err(Error::IpNotInPool(ip.to_string(), name));
        }

        let nodes = gateway
            .status
            .as_ref()
            .map(|s| {
                s.node_list
                    .iter()
                    .map(|n| (n.name.clone(), n.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name,
            ipv4_pool,
            ipv6_pool,
            ipv4_default,
            ipv6_default,
            nodes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    pub fn status(&self) -> EgressGatewayStatus {
        EgressGatewayStatus {
            node_list: self.nodes.values().cloned().collect(),
            ip_usage: self.ip_usage(),
        }
    }

    fn used_ips(&self) -> HashSet<IpAddr> {
        let mut used = HashSet::new();
        for eip in self.nodes.values().flat_map(|n| n.eips.iter()) {
            for ip in [&eip.ipv4, &eip.ipv6] {
                if let Ok(ip) = ip.parse::<IpAddr>() {
                    used.insert(ip);
                }
            }
        }
        used
    }

    pub fn ip_usage(&self) -> IpUsage {
        let used = self.used_ips();
        let clamp = |v: u128| u64::try_from(v).unwrap_or(u64::MAX);
        IpUsage {
            ipv4_total: clamp(self.ipv4_pool.size()),
            ipv4_free: clamp(self.ipv4_pool.free_count(&used)),
            ipv6_total: clamp(self.ipv6_pool.size()),
            ipv6_free: clamp(self.ipv6_pool.free_count(&used)),
        }
    }

    /// The Ready node carrying the fewest policies, lowest name on ties.
    pub fn allocator_node(&self) -> Option<String> {
        self.nodes
            .values()
            .filter(|n| n.is_ready())
            .min_by(|a, b| {
                a.policy_count()
                    .cmp(&b.policy_count())
                    .then_with(|| a.name.cmp(&b.name))
            })
            .map(|n| n.name.clone())
    }

    /// The node holding `ip`, preferring a Ready one.
    pub fn node_by_ip(&self, ip: &str) -> Option<&EgressIPStatus> {
        let holds = |n: &&EgressIPStatus| n.eips.iter().any(|e| e.ipv4 == ip || e.ipv6 == ip);
        self.nodes
            .values()
            .filter(holds)
            .find(|n| n.is_ready())
            .or_else(|| self.nodes.values().find(holds))
    }

    pub fn assignment_of(&self, policy: &PolicyRef) -> Option<Assignment> {
        self.nodes.values().find_map(|node| {
            node.eips
                .iter()
                .find(|eip| eip.contains_policy(policy))
                .map(|eip| Assignment {
                    node: node.name.clone(),
                    ipv4: eip.ipv4.clone(),
                    ipv6: eip.ipv6.clone(),
                })
        })
    }

    fn pick<R: Rng + ?Sized>(
        &self,
        pool: &IpPool,
        explicit: &str,
        default: Option<IpAddr>,
        allocator: &str,
        used: &HashSet<IpAddr>,
        rng: &mut R,
    ) -> Result<String> {
        if let Some(ip) = parse_optional_ip(explicit)? {
            if !pool.contains(&ip) {
                return Err(Error::IpNotInPool(ip.to_string(), self.name.clone()));
            }
            return Ok(ip.to_string());
        }
        if pool.is_empty() {
            return Ok(String::new());
        }
        if allocator == ALLOCATOR_POLICY_DEFAULT
            && let Some(ip) = default
        {
            return Ok(ip.to_string());
        }
        pool.random_free(used, rng)
            .map(|ip| ip.to_string())
            .ok_or_else(|| Error::NoFreeIp(pool.family().as_str(), self.name.clone()))
    }

    /// The EIP holding `ip` in either family, with the node it lives on.
    fn eip_holding(&self, ip: &str) -> Option<(&str, &Eips)> {
        if ip.is_empty() {
            return None;
        }
        self.nodes.values().find_map(|node| {
            node.eips
                .iter()
                .find(|e| e.ipv4 == ip || e.ipv6 == ip)
                .map(|e| (node.name.as_str(), e))
        })
    }

    /// Chooses the IPv4/IPv6 pair for a policy placed on `node`. Empty
    /// strings mean the node's own address is used. An IP that is already
    /// in use is only handed out together with its existing partner, so an
    /// address never appears in two EIPs.
    pub fn allocate_eip<R: Rng + ?Sized>(
        &self,
        node: Option<&str>,
        egress_ip: &EgressIp,
        rng: &mut R,
    ) -> Result<(String, String)> {
        let Some(node) = node.filter(|_| !egress_ip.use_node_ip) else {
            return Ok((String::new(), String::new()));
        };
        let used = self.used_ips();
        let allocator = egress_ip.allocator();
        let wanted_ipv6 = canonical(&egress_ip.ipv6)?;

        // An IPv6 that is already in use brings its IPv4 along.
        let ipv4 = match self.eip_holding(&wanted_ipv6) {
            Some((_, eip)) if egress_ip.ipv4.is_empty() => eip.ipv4.clone(),
            _ => self.pick(
                &self.ipv4_pool,
                &egress_ip.ipv4,
                self.ipv4_default,
                allocator,
                &used,
                rng,
            )?,
        };

        let ipv6 = match self.eip_holding(&ipv4) {
            Some((_, eip)) if !eip.ipv6.is_empty() => {
                if !wanted_ipv6.is_empty() && wanted_ipv6 != eip.ipv6 {
                    return Err(Error::IpInUse(ipv4, format!("pair {}/{}", eip.ipv4, eip.ipv6)));
                }
                eip.ipv6.clone()
            }
            _ => {
                let ipv6 = self.pick(
                    &self.ipv6_pool,
                    &egress_ip.ipv6,
                    self.ipv6_default,
                    allocator,
                    &used,
                    rng,
                )?;
                if let Some((_, eip)) = self.eip_holding(&ipv6)
                    && eip.ipv4 != ipv4
                {
                    return Err(Error::IpInUse(ipv6, format!("pair {}/{}", eip.ipv4, eip.ipv6)));
                }
                ipv6
            }
        };

        for ip in [&ipv4, &ipv6] {
            if let Some((holder, _)) = self.eip_holding(ip)
                && holder != node
            {
                return Err(Error::IpInUse(ip.clone(), format!("node {holder}")));
            }
        }
        Ok((ipv4, ipv6))
    }

    /// Adds `policy` to the EIP sharing either address on `node`, creating
    /// the EIP when the pair is new there.
    pub fn set_eip_status(&mut self, node: &str, ipv4: &str, ipv6: &str, policy: &PolicyRef) {
        let entry = self
            .nodes
            .entry(node.to_owned())
            .or_insert_with(|| EgressIPStatus::new(node, EgressTunnelPhase::Ready));
        let existing = entry.eips.iter_mut().find(|e| {
            if ipv4.is_empty() && ipv6.is_empty() {
                e.ipv4.is_empty() && e.ipv6.is_empty()
            } else {
                (!ipv4.is_empty() && e.ipv4 == ipv4) || (!ipv6.is_empty() && e.ipv6 == ipv6)
            }
        });
        match existing {
            Some(eip) => {
                if eip.ipv4.is_empty() {
                    eip.ipv4 = ipv4.to_owned();
                }
                if eip.ipv6.is_empty() {
                    eip.ipv6 = ipv6.to_owned();
                }
                if !eip.contains_policy(policy) {
                    eip.policies.push(policy.clone());
                }
            }
            None => entry.eips.push(Eips {
                ipv4: ipv4.to_owned(),
                ipv6: ipv6.to_owned(),
                policies: vec![policy.clone()],
            }),
        }
    }

    /// Places `policy` on a node and picks its EIP. Returns `None` when no
    /// node can take it.
    pub fn reallocate_policy<R: Rng + ?Sized>(
        &mut self,
        policy: &PolicyRef,
        egress_ip: &EgressIp,
        rng: &mut R,
    ) -> Result<Option<Assignment>> {
        if self.nodes.is_empty() {
            return Ok(None);
        }

        let preferred_ip = if !egress_ip.ipv4.is_empty() {
            Some(egress_ip.ipv4.clone())
        } else if !egress_ip.ipv6.is_empty() {
            Some(egress_ip.ipv6.clone())
        } else if egress_ip.allocator() == ALLOCATOR_POLICY_DEFAULT && !egress_ip.use_node_ip {
            self.ipv4_default
                .or(self.ipv6_default)
                .map(|ip| ip.to_string())
        } else {
            None
        };
        let holder = preferred_ip
            .as_deref()
            .and_then(|ip| self.node_by_ip(ip))
            .filter(|n| n.is_ready())
            .map(|n| n.name.clone());
        let Some(node) = holder.or_else(|| self.allocator_node()) else {
            debug!(gateway = %self.name, %policy, "no ready node for policy");
            return Ok(None);
        };

        let (ipv4, ipv6) = self.allocate_eip(Some(&node), egress_ip, rng)?;
        self.set_eip_status(&node, &ipv4, &ipv6, policy);
        info!(gateway = %self.name, %policy, %node, %ipv4, %ipv6, "allocated policy");
        Ok(Some(Assignment { node, ipv4, ipv6 }))
    }

    /// Removes `policy` everywhere, dropping EIPs left without policies.
    pub fn delete_policy(&mut self, policy: &PolicyRef) -> bool {
        let mut changed = false;
        for node in self.nodes.values_mut() {
            for eip in node.eips.iter_mut() {
                let before = eip.policies.len();
                eip.policies.retain(|p| p != policy);
                changed |= eip.policies.len() != before;
            }
            node.eips.retain(|eip| !eip.policies.is_empty());
        }
        changed
    }

    /// Keeps an existing assignment when it still satisfies `egress_ip`,
    /// otherwise moves the policy.
    pub fn ensure_policy<R: Rng + ?Sized>(
        &mut self,
        policy: &PolicyRef,
        egress_ip: &EgressIp,
        rng: &mut R,
    ) -> Result<PolicyOutcome> {
        if let Some(current) = self.assignment_of(policy) {
            let has_ip = !current.ipv4.is_empty() || !current.ipv6.is_empty();
            // Without pools the node's own address is the only outcome.
            let has_pool = !self.ipv4_pool.is_empty() || !self.ipv6_pool.is_empty();
            let wanted_ipv4 = canonical(&egress_ip.ipv4)?;
            let wanted_ipv6 = canonical(&egress_ip.ipv6)?;
            let stale = (egress_ip.use_node_ip && has_ip)
                || (!egress_ip.use_node_ip && !has_ip && has_pool)
                || (!wanted_ipv4.is_empty() && wanted_ipv4 != current.ipv4)
                || (!wanted_ipv6.is_empty() && wanted_ipv6 != current.ipv6);
            if !stale {
                return Ok(PolicyOutcome {
                    assignment: Some(current),
                    reallocated: false,
                });
            }
            info!(gateway = %self.name, %policy, "assignment no longer matches policy, reallocating");
            self.delete_policy(policy);
        }
        let assignment = self.reallocate_policy(policy, egress_ip, rng)?;
        Ok(PolicyOutcome {
            reallocated: assignment.is_some(),
            assignment,
        })
    }

    /// Aligns the node list with the selected nodes and their tunnel
    /// phases. Policies of removed or no longer Ready nodes are stripped and
    /// returned for reallocation.
    pub fn sync_nodes(&mut self, selected: &BTreeMap<String, EgressTunnelPhase>) -> Vec<PolicyRef> {
        let mut evicted = Vec::new();
        let removed: Vec<String> = self
            .nodes
            .keys()
            .filter(|name| !selected.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(node) = self.nodes.remove(&name) {
                info!(gateway = %self.name, node = %name, "node left gateway");
                evicted.extend(node.eips.into_iter().flat_map(|e| e.policies));
            }
        }
        for (name, phase) in selected {
            let node = self
                .nodes
                .entry(name.clone())
                .or_insert_with(|| EgressIPStatus::new(name, *phase));
            node.status = *phase;
            if !node.is_ready() && !node.eips.is_empty() {
                info!(gateway = %self.name, node = %name, phase = phase.as_str(), "evicting policies from node");
                evicted.extend(node.eips.drain(..).flat_map(|e| e.policies));
            }
        }
        evicted
    }

    /// A single Ready node without policies means the gateway just regained
    /// capacity and every policy has to be placed again.
    pub fn needs_cold_start(&self) -> bool {
        let mut ready = self.nodes.values().filter(|n| n.is_ready());
        match (ready.next(), ready.next()) {
            (Some(node), None) => node.policy_count() == 0,
            _ => false,
        }
    }

    pub fn policies(&self) -> Vec<PolicyRef> {
        self.nodes
            .values()
            .flat_map(|n| n.eips.iter())
            .flat_map(|e| e.policies.iter().cloned())
            .collect()
    }
}
