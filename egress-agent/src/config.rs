use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use egress_iptables::TableOptions;
use egress_iptables::lock::DEFAULT_LOCK_FILE;
use ipnetwork::IpNetwork;

/// Which iptables flavour to drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IptablesBackend {
    /// Whatever the unsuffixed binaries are.
    #[default]
    Auto,
    Legacy,
    Nft,
}

impl FromStr for IptablesBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "legacy" => Ok(Self::Legacy),
            "nft" => Ok(Self::Nft),
            other => Err(format!("unknown iptables backend {other}, expected auto, legacy or nft")),
        }
    }
}

impl fmt::Display for IptablesBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Legacy => "legacy",
            Self::Nft => "nft",
        })
    }
}

#[derive(Clone, Debug)]
pub struct IptablesConfig {
    pub backend: IptablesBackend,
    pub refresh_interval: Duration,
    pub post_write_interval: Duration,
    pub lock_timeout: Duration,
    pub lock_probe_interval: Duration,
    pub lock_file: PathBuf,
    pub hash_comment_prefix: String,
}

impl Default for IptablesConfig {
    fn default() -> Self {
        Self {
            backend: IptablesBackend::Auto,
            refresh_interval: Duration::from_secs(90),
            post_write_interval: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(10),
            lock_probe_interval: Duration::from_millis(50),
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            hash_comment_prefix: "egw:".into(),
        }
    }
}

impl IptablesConfig {
    pub fn table_options(&self) -> TableOptions {
        TableOptions {
            hash_comment_prefix: self.hash_comment_prefix.clone(),
            refresh_interval: self.refresh_interval,
            post_write_interval: self.post_write_interval,
            ..Default::default()
        }
    }
}

/// The vxlan device and the routing tables behind the tunnel marks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfig {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    /// Table of the first mark, each following mark gets the next table.
    pub table_start: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: "egress.vxlan".into(),
            vni: 100,
            port: 7789,
            table_start: 3000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub node_name: String,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    /// First tunnel mark handed out by the controller.
    pub mark_start: u32,
    pub mark_count: u32,
    pub iptables: IptablesConfig,
    pub tunnel: TunnelConfig,
    /// Interfaces never used for ARP/NDP announcement.
    pub announce_exclude_interfaces: String,
    pub heartbeat_interval: Duration,
    /// Destinations that never leave through a gateway, e.g. cluster CIDRs.
    pub ignore_cidrs: Vec<IpNetwork>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            enable_ipv4: true,
            enable_ipv6: false,
            mark_start: 0x26000000,
            mark_count: 4096,
            iptables: IptablesConfig::default(),
            tunnel: TunnelConfig::default(),
            announce_exclude_interfaces: r"^(lo|egress\.vxlan.*|docker.*|cali.*|veth.*)$".into(),
            heartbeat_interval: Duration::from_secs(10),
            ignore_cidrs: Vec::new(),
        }
    }
}
