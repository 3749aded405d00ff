//! Narrow netlink capability used by the interface manager.
//!
//! Everything the daemon needs from the kernel goes through the [`Netlink`]
//! trait: link creation for the two tunnel link types, address assignment,
//! and host-route manipulation. The production implementation wraps an
//! rtnetlink handle; tests use an in-memory table.

mod rtnl;

#[cfg(test)]
pub mod mem;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;

pub use rtnl::RtNetlink;

/// Kernel link as seen by this daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    /// `IFLA_LINK`: the parent device for macvlans, the VTEP for VXLANs.
    pub parent: Option<u32>,
    pub mtu: Option<u32>,
    pub txqlen: Option<u32>,
    pub hwaddr: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkKind {
    Vxlan(VxlanSpec),
    Macvlan,
    Other,
}

impl Link {
    pub fn is_vxlan(&self) -> bool {
        matches!(self.kind, LinkKind::Vxlan(_))
    }

    pub fn is_macvlan(&self) -> bool {
        matches!(self.kind, LinkKind::Macvlan)
    }
}

/// VXLAN attributes, used both for creation requests and for the state
/// parsed back from the kernel. `None` means "not specified" on requests
/// and "not reported" on parsed state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VxlanSpec {
    pub id: u32,
    pub vtep_index: Option<u32>,
    pub src_addr: Option<IpAddr>,
    pub group: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub tos: Option<u8>,
    pub ageing: Option<u32>,
    pub limit: Option<u32>,
    pub port: Option<u16>,
    pub port_range: Option<(u16, u16)>,
    pub learning: Option<bool>,
    pub proxy: Option<bool>,
    pub rsc: Option<bool>,
    pub l2miss: Option<bool>,
    pub l3miss: Option<bool>,
    pub gbp: Option<bool>,
    /// Transmit queue length, a link-level attribute set at creation.
    pub txqlen: Option<u32>,
}

/// A route to install or remove.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub dst: IpNet,
    pub oif: Option<u32>,
    pub gateway: Option<IpAddr>,
    pub proto: Option<u8>,
}

impl RouteSpec {
    /// On-link host route out of `oif` tagged with `proto`.
    pub fn host(dst: IpNet, oif: u32, proto: u8) -> Self {
        Self {
            dst,
            oif: Some(oif),
            gateway: None,
            proto: Some(proto),
        }
    }
}

/// A route observed in the kernel table.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub dst: IpNet,
    pub oif: Option<u32>,
    pub gateway: Option<IpAddr>,
    pub proto: u8,
}

/// Match filter for route listing; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RouteFilter {
    /// Exact destination (address and prefix length).
    pub dst: Option<IpNet>,
    pub oif: Option<u32>,
    pub gateway: Option<IpAddr>,
    pub proto: Option<u8>,
}

impl RouteFilter {
    pub fn dst(dst: IpNet) -> Self {
        Self {
            dst: Some(dst),
            ..Self::default()
        }
    }

    pub fn proto(proto: u8) -> Self {
        Self {
            proto: Some(proto),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &RouteEntry) -> bool {
        if let Some(dst) = self.dst {
            if entry.dst != dst {
                return false;
            }
        }
        if let Some(oif) = self.oif {
            if entry.oif != Some(oif) {
                return false;
            }
        }
        if let Some(gw) = self.gateway {
            if entry.gateway != Some(gw) {
                return false;
            }
        }
        if let Some(proto) = self.proto {
            if entry.proto != proto {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NetlinkError {
    #[error("link not found")]
    LinkNotFound,
    #[error("link already exists")]
    LinkExists,
    #[error("address already exists")]
    AddrExists,
    #[error("route already exists")]
    RouteExists,
    #[error("permission denied")]
    Permission,
    #[error("netlink io: {0}")]
    Io(String),
}

pub type NlResult<T> = Result<T, NetlinkError>;

/// The netlink operations the daemon relies on.
#[async_trait]
pub trait Netlink: Send + Sync {
    async fn link_get(&self, name: &str) -> NlResult<Link>;
    async fn link_get_by_index(&self, index: u32) -> NlResult<Link>;
    async fn link_add_vxlan(&self, name: &str, spec: &VxlanSpec) -> NlResult<()>;
    /// Create a bridge-mode macvlan slaved to `parent`.
    async fn link_add_macvlan(&self, name: &str, parent: u32) -> NlResult<()>;
    async fn link_del(&self, index: u32) -> NlResult<()>;
    async fn link_set_up(&self, index: u32) -> NlResult<()>;
    async fn link_set_mtu(&self, index: u32, mtu: u32) -> NlResult<()>;
    async fn link_set_hwaddr(&self, index: u32, hwaddr: Vec<u8>) -> NlResult<()>;
    async fn addr_add(&self, index: u32, addr: IpNet) -> NlResult<()>;
    async fn addr_list(&self, index: u32) -> NlResult<Vec<IpNet>>;
    /// All links whose `IFLA_LINK` parent is `parent`.
    async fn slave_links(&self, parent: u32) -> NlResult<Vec<Link>>;
    async fn route_add(&self, route: &RouteSpec) -> NlResult<()>;
    /// Remove the first route matching the spec. Removing an absent route
    /// succeeds.
    async fn route_del(&self, route: &RouteSpec) -> NlResult<()>;
    async fn route_list(&self, filter: &RouteFilter) -> NlResult<Vec<RouteEntry>>;

    /// Best-match route for a destination address, host routes winning on
    /// prefix length.
    async fn route_lookup(&self, dst: IpAddr) -> NlResult<Option<RouteEntry>> {
        let routes = self.route_list(&RouteFilter::default()).await?;
        Ok(routes
            .into_iter()
            .filter(|r| r.dst.contains(&dst))
            .max_by_key(|r| r.dst.prefix_len()))
    }
}

pub type NetlinkHandle = Arc<dyn Netlink>;
