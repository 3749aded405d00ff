use std::net::IpAddr;

use ipnet::IpNet;

use crate::docker::DockerError;
use crate::netlink::NetlinkError;

/// Error type shared by the interface manager, address selector, cache and
/// the orchestrator-facing core. The plugin boundary renders these into the
/// protocol's `Err` strings.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Address selection exhausted the caller's response deadline.
    #[error("timeout expired while waiting for address")]
    AddressRequestTimeout,

    /// A requested address was outside the interface's subnet.
    #[error("requested address {addr} is not in subnet {subnet}")]
    OutOfSubnet { addr: IpAddr, subnet: IpNet },

    /// A link with the requested name exists but its attributes conflict
    /// with the requested ones.
    #[error("link {name} already exists with conflicting attributes")]
    ConflictingExistingLink { name: String },

    #[error("host interface {0} not found")]
    InterfaceNotFound(String),

    #[error("network {0} not found")]
    NetworkNotFound(String),

    /// Unexpected kernel error.
    #[error("netlink failure: {0}")]
    Netlink(#[from] NetlinkError),

    /// The orchestrator inspect/list RPC failed or timed out.
    #[error("orchestrator request failed: {0}")]
    RemoteRpc(#[from] DockerError),

    /// Invalid network option or plugin argument.
    #[error("invalid option: {0}")]
    InvalidOption(String),
}

pub type Result<T> = std::result::Result<T, Error>;
