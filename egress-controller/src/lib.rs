pub mod allocator;
mod context;
mod controller;
pub mod endpoint;
mod error;
pub mod event;
pub mod ippool;
mod runtime;
pub mod tunnel;

use std::time::Duration;

use ipnetwork::{Ipv4Network, Ipv6Network};

pub use allocator::{Assignment, GatewayState};
pub use context::{Context, Stores};
pub use error::{Error, Result};
pub use runtime::start_controllers;

pub const POLICY_FINALIZER: &str = "egressgateway.spidernet.io/egresspolicy";
pub const TUNNEL_FINALIZER: &str = "egressgateway.spidernet.io/egresstunnel";

/// Field manager for server side apply.
pub const MANAGER: &str = "egressgateway-controller";

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub tunnel_ipv4_subnet: Option<Ipv4Network>,
    pub tunnel_ipv6_subnet: Option<Ipv6Network>,
    pub mark_start: u32,
    pub mark_count: u32,
    pub max_endpoints_per_slice: usize,
    pub heartbeat_timeout: Duration,
    pub debounce: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tunnel_ipv4_subnet: None,
            tunnel_ipv6_subnet: None,
            mark_start: 0x26000000,
            mark_count: 4096,
            max_endpoints_per_slice: 100,
            heartbeat_timeout: Duration::from_secs(60),
            debounce: Duration::from_secs(1),
        }
    }
}
