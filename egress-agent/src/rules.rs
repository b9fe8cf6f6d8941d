use std::net::{Ipv4Addr, Ipv6Addr};

use egress_crds::v1beta1::gateway::PolicyRef;
use egress_iptables::{Action, MatchCriteria, Rule};

use crate::ipset::{
    IGNORE_V4, IGNORE_V6, IpFamily, PREFIX_DST_V4, PREFIX_DST_V6, PREFIX_SRC_V4, PREFIX_SRC_V6,
    format_ipset_name,
};

pub const MARK_REQUEST_CHAIN: &str = "EGRESSGATEWAY-MARK-REQUEST";
pub const SNAT_CHAIN: &str = "EGRESSGATEWAY-SNAT-EIP";

pub const EGRESS_MARK_MASK: u32 = 0xff000000;
pub const FULL_MASK: u32 = 0xffffffff;
/// Replaces tunnel marks in FORWARD so POSTROUTING can let the traffic pass
/// untouched by other masquerade rules.
pub const FORWARD_MARK: u32 = 0x12000000;

/// Rules inserted into the kernel chains of the mangle table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MangleStaticRules {
    pub prerouting: Vec<Rule>,
    pub forward: Vec<Rule>,
    pub postrouting: Vec<Rule>,
}

/// Gateway nodes never send traffic to another gateway, so only the other
/// nodes jump to the mark chain, and only once some gateway exists.
pub fn build_mangle_static_rules(
    mark_base: u32,
    is_gateway_node: bool,
    has_gateway: bool,
) -> MangleStaticRules {
    let forward = vec![
        Rule::new(
            MatchCriteria::new().mark_matches_with_mask(mark_base & EGRESS_MARK_MASK, EGRESS_MARK_MASK),
            Action::SetMaskedMark {
                mark: FORWARD_MARK,
                mask: FULL_MASK,
            },
        )
        .with_comment("Mark egress traffic forwarded to the egress tunnel"),
    ];
    let postrouting = vec![
        Rule::new(
            MatchCriteria::new().mark_matches_with_mask(FORWARD_MARK, FULL_MASK),
            Action::Accept,
        )
        .with_comment("Accept egress traffic leaving through the egress tunnel"),
    ];
    let prerouting = if !is_gateway_node && has_gateway {
        vec![
            Rule::new(MatchCriteria::new(), Action::Jump(MARK_REQUEST_CHAIN.into()))
                .with_comment("Mark egress traffic of selected pods"),
        ]
    } else {
        Vec::new()
    };
    MangleStaticRules {
        prerouting,
        forward,
        postrouting,
    }
}

/// Jump from nat POSTROUTING into the SNAT chain, present on gateway nodes.
pub fn build_nat_static_rules(is_gateway_node: bool) -> Vec<Rule> {
    if !is_gateway_node {
        return Vec::new();
    }
    vec![
        Rule::new(MatchCriteria::new(), Action::Jump(SNAT_CHAIN.into()))
            .with_comment("SNAT egress traffic to the egress IP"),
    ]
}

/// Where a policy's traffic leaves the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyRoute {
    pub policy: PolicyRef,
    pub priority: i64,
    pub gateway_node: String,
    /// Tunnel mark of the gateway node.
    pub mark: Option<u32>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub use_node_ip: bool,
    /// The policy restricts destinations, so the destination set is matched.
    pub has_destinations: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicySets {
    pub src: String,
    pub dst: String,
}

pub fn policy_sets(policy: &PolicyRef, family: IpFamily) -> PolicySets {
    let key = policy.to_string();
    let (src, dst) = match family {
        IpFamily::Inet => (PREFIX_SRC_V4, PREFIX_DST_V4),
        IpFamily::Inet6 => (PREFIX_SRC_V6, PREFIX_DST_V6),
    };
    PolicySets {
        src: format_ipset_name(src, &key),
        dst: format_ipset_name(dst, &key),
    }
}

pub fn ignore_set(family: IpFamily) -> &'static str {
    match family {
        IpFamily::Inet => IGNORE_V4,
        IpFamily::Inet6 => IGNORE_V6,
    }
}

fn policy_match(route: &PolicyRoute, family: IpFamily) -> MatchCriteria {
    let sets = policy_sets(&route.policy, family);
    let mut criteria = MatchCriteria::new().source_ip_set(&sets.src);
    if route.has_destinations {
        criteria = criteria.dest_ip_set(&sets.dst);
    }
    criteria.not_dest_ip_set(ignore_set(family))
}

fn ordered<'a>(routes: impl Iterator<Item = &'a PolicyRoute>) -> Vec<&'a PolicyRoute> {
    let mut routes: Vec<&PolicyRoute> = routes.collect();
    routes.sort_by(|a, b| (a.priority, &a.policy).cmp(&(b.priority, &b.policy)));
    routes
}

/// Marks traffic of policies served by another node with that node's
/// tunnel mark. A packet keeps the first mark it gets.
pub fn build_mark_request_rules(
    node_name: &str,
    routes: &[PolicyRoute],
    family: IpFamily,
) -> Vec<Rule> {
    ordered(routes.iter().filter(|r| r.gateway_node != node_name))
        .into_iter()
        .filter_map(|route| {
            let mark = route.mark?;
            Some(
                Rule::new(
                    policy_match(route, family).mark_matches_with_mask(0, EGRESS_MARK_MASK),
                    Action::SetMaskedMark {
                        mark,
                        mask: FULL_MASK,
                    },
                )
                .with_comment(format!("policy {}", route.policy)),
            )
        })
        .collect()
}

/// SNAT rules for the policies this node is the gateway of. Policies
/// without an egress IP of `family` get no rule.
pub fn build_snat_rules(node_name: &str, routes: &[PolicyRoute], family: IpFamily) -> Vec<Rule> {
    ordered(routes.iter().filter(|r| r.gateway_node == node_name))
        .into_iter()
        .filter_map(|route| {
            let action = if route.use_node_ip {
                Action::Masquerade
            } else {
                let to_source = match family {
                    IpFamily::Inet => route.ipv4?.to_string(),
                    IpFamily::Inet6 => route.ipv6?.to_string(),
                };
                Action::Snat { to_source }
            };
            Some(
                Rule::new(policy_match(route, family), action)
                    .with_comment(format!("policy {}", route.policy)),
            )
        })
        .collect()
}
