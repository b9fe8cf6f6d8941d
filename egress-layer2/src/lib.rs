pub mod announcer;
pub mod arp;
pub mod interfaces;
pub mod ndp;

use thiserror::Error;

pub use announcer::{
    Announce, DropReason, IpAdvertisement, Responder, ResponderFactory, ShouldAnnounce,
    SocketResponderFactory, SpamLoop,
};
pub use interfaces::{Interface, InterfaceSource, SystemInterfaces};

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("interface {0} has no hardware address")]
    NoHardwareAddress(String),

    #[error("address family of {0} not supported by this responder")]
    WrongFamily(std::net::IpAddr),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
