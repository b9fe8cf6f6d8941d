use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};

use egress_agent::{AgentConfig, IptablesBackend, IptablesConfig, TunnelConfig};
use egress_controller::ControllerConfig;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Run the cluster wide controllers
    Controller(ControllerArgs),
    /// Run the per node dataplane agent
    Agent(AgentArgs),
    /// Print the CustomResourceDefinitions as yaml
    Crdgen,
}

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

fn parse_mark(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Metrics and readiness listener
    #[arg(long, env = "METRICS_ADDRESS", default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    #[arg(long, env = "ENABLE_IPV4", default_value_t = true, action = ArgAction::Set)]
    pub enable_ipv4: bool,

    #[arg(long, env = "ENABLE_IPV6", default_value_t = false, action = ArgAction::Set)]
    pub enable_ipv6: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Pool for IPv4 tunnel addresses
    #[arg(long, env = "TUNNEL_IPV4_SUBNET")]
    pub tunnel_ipv4_subnet: Option<Ipv4Network>,

    /// Pool for IPv6 tunnel addresses
    #[arg(long, env = "TUNNEL_IPV6_SUBNET")]
    pub tunnel_ipv6_subnet: Option<Ipv6Network>,

    /// First packet mark handed to tunnels
    #[arg(long, env = "MARK_START", default_value = "0x26000000", value_parser = parse_mark)]
    pub mark_start: u32,

    #[arg(long, env = "MARK_COUNT", default_value_t = 4096)]
    pub mark_count: u32,

    #[arg(long, env = "MAX_ENDPOINTS_PER_SLICE", default_value_t = 100)]
    pub max_endpoints_per_slice: usize,

    /// Tunnels without a heartbeat for this long are marked not ready
    #[arg(long, env = "HEARTBEAT_TIMEOUT", default_value = "60s", value_parser = parse_duration)]
    pub heartbeat_timeout: Duration,

    /// Delay used to coalesce bursts of changes
    #[arg(long, env = "DEBOUNCE", default_value = "1s", value_parser = parse_duration)]
    pub debounce: Duration,
}

impl ControllerArgs {
    pub fn to_config(&self) -> ControllerConfig {
        ControllerConfig {
            tunnel_ipv4_subnet: self.tunnel_ipv4_subnet.filter(|_| self.common.enable_ipv4),
            tunnel_ipv6_subnet: self.tunnel_ipv6_subnet.filter(|_| self.common.enable_ipv6),
            mark_start: self.mark_start,
            mark_count: self.mark_count,
            max_endpoints_per_slice: self.max_endpoints_per_slice,
            heartbeat_timeout: self.heartbeat_timeout,
            debounce: self.debounce,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// iptables flavour: auto, legacy or nft
    #[arg(long, env = "IPTABLES_BACKEND", default_value = "auto")]
    pub iptables_backend: IptablesBackend,

    #[arg(long, env = "IPTABLES_REFRESH_INTERVAL", default_value = "90s", value_parser = parse_duration)]
    pub iptables_refresh_interval: Duration,

    /// Delay before re-reading a table after writing it
    #[arg(long, env = "IPTABLES_POST_WRITE_INTERVAL", default_value = "1s", value_parser = parse_duration)]
    pub iptables_post_write_interval: Duration,

    #[arg(long, env = "IPTABLES_LOCK_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub iptables_lock_timeout: Duration,

    #[arg(long, env = "IPTABLES_LOCK_PROBE_INTERVAL", default_value = "50ms", value_parser = parse_duration)]
    pub iptables_lock_probe_interval: Duration,

    #[arg(long, env = "IPTABLES_LOCK_FILE", default_value = "/run/xtables.lock")]
    pub iptables_lock_file: PathBuf,

    #[arg(long, env = "HASH_COMMENT_PREFIX", default_value = "egw:")]
    pub hash_comment_prefix: String,

    /// Interfaces matching this regex never answer ARP/NDP for egress IPs
    #[arg(
        long,
        env = "ANNOUNCE_EXCLUDE_INTERFACES",
        default_value = r"^(lo|egress\.vxlan.*|docker.*|cali.*|veth.*)$"
    )]
    pub announce_exclude_interfaces: String,

    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    pub heartbeat_interval: Duration,

    /// Must match the controller's --mark-start
    #[arg(long, env = "MARK_START", default_value = "0x26000000", value_parser = parse_mark)]
    pub mark_start: u32,

    /// Must match the controller's --mark-count
    #[arg(long, env = "MARK_COUNT", default_value_t = 4096)]
    pub mark_count: u32,

    #[arg(long, env = "VXLAN_NAME", default_value = "egress.vxlan")]
    pub vxlan_name: String,

    #[arg(long, env = "VXLAN_ID", default_value_t = 100)]
    pub vxlan_id: u32,

    #[arg(long, env = "VXLAN_PORT", default_value_t = 7789)]
    pub vxlan_port: u16,

    /// Routing table of the first mark
    #[arg(long, env = "ROUTE_TABLE_START", default_value_t = 3000)]
    pub route_table_start: u32,

    /// Destinations that bypass the gateway, e.g. pod and service CIDRs
    #[arg(long, env = "IGNORE_CIDRS", value_delimiter = ',')]
    pub ignore_cidrs: Vec<IpNetwork>,
}

impl AgentArgs {
    pub fn to_config(&self) -> AgentConfig {
        AgentConfig {
            node_name: self.node_name.clone(),
            enable_ipv4: self.common.enable_ipv4,
            enable_ipv6: self.common.enable_ipv6,
            mark_start: self.mark_start,
            mark_count: self.mark_count,
            iptables: IptablesConfig {
                backend: self.iptables_backend,
                refresh_interval: self.iptables_refresh_interval,
                post_write_interval: self.iptables_post_write_interval,
                lock_timeout: self.iptables_lock_timeout,
                lock_probe_interval: self.iptables_lock_probe_interval,
                lock_file: self.iptables_lock_file.clone(),
                hash_comment_prefix: self.hash_comment_prefix.clone(),
            },
            tunnel: TunnelConfig {
                name: self.vxlan_name.clone(),
                vni: self.vxlan_id,
                port: self.vxlan_port,
                table_start: self.route_table_start,
            },
            announce_exclude_interfaces: self.announce_exclude_interfaces.clone(),
            heartbeat_interval: self.heartbeat_interval,
            ignore_cidrs: self.ignore_cidrs.clone(),
        }
    }
}
