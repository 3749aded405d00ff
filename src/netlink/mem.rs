//! In-memory [`Netlink`] implementation for tests.
//!
//! Models the slice of kernel behavior the daemon depends on: link names
//! are unique, deleting a link cascades to its slaves and routes, and a
//! second route to an already-routed destination is rejected with `EEXIST`
//! unless injected through [`MemNetlink::inject_route`], which behaves like
//! a routing-daemon import carrying its own metric.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::IpNet;

use super::{
    Link, LinkKind, Netlink, NetlinkError, NlResult, RouteEntry, RouteFilter, RouteSpec, VxlanSpec,
};

#[derive(Default)]
struct State {
    links: HashMap<u32, Link>,
    addrs: HashMap<u32, Vec<IpNet>>,
    routes: Vec<RouteEntry>,
    next_index: u32,
}

impl State {
    fn link_by_name(&self, name: &str) -> Option<&Link> {
        self.links.values().find(|l| l.name == name)
    }

    fn remove_link(&mut self, index: u32) {
        self.links.remove(&index);
        self.addrs.remove(&index);
        self.routes.retain(|r| r.oif != Some(index));
        let slaves: Vec<u32> = self
            .links
            .values()
            .filter(|l| l.parent == Some(index))
            .map(|l| l.index)
            .collect();
        for slave in slaves {
            self.remove_link(slave);
        }
    }
}

#[derive(Default)]
pub struct MemNetlink {
    state: Mutex<State>,
}

impl MemNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_link(&self, name: &str, kind: LinkKind, parent: Option<u32>) -> NlResult<u32> {
        let mut state = self.state.lock().unwrap();
        if state.link_by_name(name).is_some() {
            return Err(NetlinkError::LinkExists);
        }
        if let Some(parent) = parent {
            if !state.links.contains_key(&parent) {
                return Err(NetlinkError::LinkNotFound);
            }
        }
        state.next_index += 1;
        let index = state.next_index;
        state.links.insert(
            index,
            Link {
                index,
                name: name.to_string(),
                kind,
                parent,
                mtu: None,
                txqlen: None,
                hwaddr: None,
            },
        );
        Ok(index)
    }

    /// Insert a route as an external routing daemon would, bypassing the
    /// duplicate-destination check.
    pub fn inject_route(&self, dst: IpNet, proto: u8) {
        self.state.lock().unwrap().routes.push(RouteEntry {
            dst,
            oif: None,
            gateway: None,
            proto,
        });
    }

    pub fn route_count(&self, dst: IpNet) -> usize {
        self.state
            .lock()
            .unwrap()
            .routes
            .iter()
            .filter(|r| r.dst == dst)
            .count()
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().unwrap().link_by_name(name).is_some()
    }

    pub fn routes(&self) -> Vec<RouteEntry> {
        self.state.lock().unwrap().routes.clone()
    }
}

#[async_trait]
impl Netlink for MemNetlink {
    async fn link_get(&self, name: &str) -> NlResult<Link> {
        self.state
            .lock()
            .unwrap()
            .link_by_name(name)
            .cloned()
            .ok_or(NetlinkError::LinkNotFound)
    }

    async fn link_get_by_index(&self, index: u32) -> NlResult<Link> {
        self.state
            .lock()
            .unwrap()
            .links
            .get(&index)
            .cloned()
            .ok_or(NetlinkError::LinkNotFound)
    }

    async fn link_add_vxlan(&self, name: &str, spec: &VxlanSpec) -> NlResult<()> {
        self.add_link(name, LinkKind::Vxlan(spec.clone()), spec.vtep_index)
            .map(|_| ())
    }

    async fn link_add_macvlan(&self, name: &str, parent: u32) -> NlResult<()> {
        self.add_link(name, LinkKind::Macvlan, Some(parent)).map(|_| ())
    }

    async fn link_del(&self, index: u32) -> NlResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.links.contains_key(&index) {
            return Err(NetlinkError::LinkNotFound);
        }
        state.remove_link(index);
        Ok(())
    }

    async fn link_set_up(&self, _index: u32) -> NlResult<()> {
        Ok(())
    }

    async fn link_set_mtu(&self, index: u32, mtu: u32) -> NlResult<()> {
        let mut state = self.state.lock().unwrap();
        let link = state
            .links
            .get_mut(&index)
            .ok_or(NetlinkError::LinkNotFound)?;
        link.mtu = Some(mtu);
        Ok(())
    }

    async fn link_set_hwaddr(&self, index: u32, hwaddr: Vec<u8>) -> NlResult<()> {
        let mut state = self.state.lock().unwrap();
        let link = state
            .links
            .get_mut(&index)
            .ok_or(NetlinkError::LinkNotFound)?;
        link.hwaddr = Some(hwaddr);
        Ok(())
    }

    async fn addr_add(&self, index: u32, addr: IpNet) -> NlResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.links.contains_key(&index) {
            return Err(NetlinkError::LinkNotFound);
        }
        let addrs = state.addrs.entry(index).or_default();
        if addrs.contains(&addr) {
            return Err(NetlinkError::AddrExists);
        }
        addrs.push(addr);
        Ok(())
    }

    async fn addr_list(&self, index: u32) -> NlResult<Vec<IpNet>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .addrs
            .get(&index)
            .cloned()
            .unwrap_or_default())
    }

    async fn slave_links(&self, parent: u32) -> NlResult<Vec<Link>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .links
            .values()
            .filter(|l| l.parent == Some(parent))
            .cloned()
            .collect())
    }

    async fn route_add(&self, route: &RouteSpec) -> NlResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.routes.iter().any(|r| r.dst == route.dst) {
            return Err(NetlinkError::RouteExists);
        }
        state.routes.push(RouteEntry {
            dst: route.dst,
            oif: route.oif,
            gateway: route.gateway,
            proto: route.proto.unwrap_or(0),
        });
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> NlResult<()> {
        let filter = RouteFilter {
            dst: Some(route.dst),
            oif: route.oif,
            gateway: route.gateway,
            proto: route.proto,
        };
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.routes.iter().position(|r| filter.matches(r)) {
            state.routes.remove(pos);
        }
        Ok(())
    }

    async fn route_list(&self, filter: &RouteFilter) -> NlResult<Vec<RouteEntry>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .routes
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}
