//! Host interface management.
//!
//! A host interface is the pair of kernel links realizing one network on
//! this host: the VXLAN named after the network and the `hmvl_`-prefixed
//! macvlan carrying the gateway address. Address allocation happens here
//! too: an address is claimed by installing its host route and verified by
//! watching whether the routing daemon imports a competing claim.

pub mod lock;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use tokio::time::Instant;

use crate::addr;
use crate::error::{Error, Result};
use crate::link::{vxlan, Macvlan, Vxlan};
use crate::netlink::{NetlinkError, NetlinkHandle, RouteFilter, RouteSpec};
use lock::{IfaceLock, LockRegistry};

/// Name of the host-side gateway macvlan for a network.
pub fn host_macvlan_name(network: &str) -> String {
    format!("hmvl_{network}")
}

/// Name of the container-side macvlan for an endpoint.
pub fn container_macvlan_name(endpoint_id: &str) -> String {
    format!("cmvl_{}", &endpoint_id[..7.min(endpoint_id.len())])
}

/// Creates and resolves host interfaces. Cheap to clone; all clones share
/// the lock registry.
#[derive(Clone)]
pub struct InterfaceManager {
    nl: NetlinkHandle,
    locks: LockRegistry,
    route_proto: u8,
    req_addr_sleep: Duration,
}

impl InterfaceManager {
    pub fn new(nl: NetlinkHandle, route_proto: u8, req_addr_sleep: Duration) -> Self {
        Self {
            nl,
            locks: LockRegistry::spawn(),
            route_proto,
            req_addr_sleep,
        }
    }

    /// Get the host interface for `name`, creating whichever of its parts
    /// are missing and binding the gateway address. Mutating steps run under
    /// the interface write lock; pre-existing links discovered on entry are
    /// never torn down on failure.
    pub async fn get_or_create(
        &self,
        name: &str,
        gateway: IpNet,
        options: &HashMap<String, String>,
    ) -> Result<HostInterface> {
        if let Ok(hi) = self.get(name).await {
            if hi.mvl.has_address(&gateway).await {
                return Ok(hi);
            }
        }

        let lock = self.locks.get(name).await;
        let guard = lock.write().await;

        let vxlan_existed = self.nl.link_get(name).await.is_ok();
        let parsed = vxlan::parse_options(options, &self.nl).await?;
        let vxl = Vxlan::create(self.nl.clone(), name, &parsed).await?;

        let mvl_name = host_macvlan_name(name);
        let mvl_existed = self.nl.link_get(&mvl_name).await.is_ok();
        let mvl = match vxl.create_macvlan(&mvl_name).await {
            Ok(mvl) => mvl,
            Err(err) => {
                if !vxlan_existed {
                    if let Err(del_err) = vxl.delete().await {
                        tracing::debug!(%del_err, name, "teardown after failed create");
                    }
                }
                return Err(err);
            }
        };

        if !mvl.has_address(&gateway).await {
            match mvl.add_address(gateway).await {
                Ok(()) | Err(Error::Netlink(NetlinkError::AddrExists)) => {}
                Err(err) => {
                    if !vxlan_existed {
                        // Deleting the vxlan removes the macvlan implicitly.
                        if let Err(del_err) = vxl.delete().await {
                            tracing::debug!(%del_err, name, "teardown after failed create");
                        }
                    } else if !mvl_existed {
                        if let Err(del_err) = mvl.delete().await {
                            tracing::debug!(%del_err, name, "teardown after failed create");
                        }
                    }
                    return Err(err);
                }
            }
        }

        drop(guard);
        tracing::debug!(name, %gateway, "host interface ready");

        Ok(self.assemble(name, vxl, mvl, lock))
    }

    /// Get the host interface for `name`; both kernel links must exist.
    pub async fn get(&self, name: &str) -> Result<HostInterface> {
        let vxl = match Vxlan::from_name(self.nl.clone(), name).await {
            Ok(vxl) => vxl,
            Err(_) => return Err(Error::InterfaceNotFound(name.to_string())),
        };
        let mvl = match Macvlan::from_name(self.nl.clone(), &host_macvlan_name(name)).await {
            Ok(mvl) => mvl,
            Err(_) => return Err(Error::InterfaceNotFound(name.to_string())),
        };
        let lock = self.locks.get(name).await;
        Ok(self.assemble(name, vxl, mvl, lock))
    }

    /// Resolve the host interface owning the route to `addr`: the route's
    /// egress link must be a macvlan whose parent is a VXLAN.
    pub async fn from_destination(&self, addr: IpAddr) -> Result<HostInterface> {
        let not_found = || Error::InterfaceNotFound(addr.to_string());

        let entry = self
            .nl
            .route_lookup(addr)
            .await?
            .ok_or_else(not_found)?;
        let oif = entry.oif.ok_or_else(not_found)?;
        let link = self.nl.link_get_by_index(oif).await?;
        if !link.is_macvlan() {
            return Err(not_found());
        }
        let parent = link.parent.ok_or_else(not_found)?;
        let parent_link = self.nl.link_get_by_index(parent).await?;
        if !parent_link.is_vxlan() {
            return Err(not_found());
        }
        self.get(&parent_link.name).await
    }

    fn assemble(
        &self,
        name: &str,
        vxlan: Vxlan,
        mvl: Macvlan,
        lock: Arc<IfaceLock>,
    ) -> HostInterface {
        HostInterface {
            name: name.to_string(),
            vxlan,
            mvl,
            lock,
            locks: self.locks.clone(),
            nl: self.nl.clone(),
            route_proto: self.route_proto,
            req_addr_sleep: self.req_addr_sleep,
        }
    }
}

/// One network's VXLAN + host macvlan pair.
#[derive(Clone)]
pub struct HostInterface {
    name: String,
    vxlan: Vxlan,
    mvl: Macvlan,
    lock: Arc<IfaceLock>,
    locks: LockRegistry,
    nl: NetlinkHandle,
    route_proto: u8,
    req_addr_sleep: Duration,
}

impl HostInterface {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The network subnet, derived from the gateway address bound to the
    /// host macvlan.
    pub async fn subnet(&self) -> Result<IpNet> {
        for net in self.mvl.addresses().await? {
            if let Ok(subnet) = IpNet::new(net.network(), net.prefix_len()) {
                return Ok(subnet);
            }
        }
        Err(Error::InterfaceNotFound(format!(
            "no address on {}",
            self.mvl.name()
        )))
    }

    /// Create a container macvlan on this network.
    pub async fn create_macvlan(&self, name: &str) -> Result<()> {
        let _guard = self.lock.read().await;
        self.vxlan.create_macvlan(name).await.map(|_| ())
    }

    /// Delete a container macvlan on this network.
    pub async fn delete_macvlan(&self, name: &str) -> Result<()> {
        let _guard = self.lock.read().await;
        self.vxlan.delete_macvlan(name).await
    }

    /// Select an address on this network: the requested one if available,
    /// or a random available one.
    ///
    /// Claims are arbitrated through the routing table. Each attempt
    /// installs the candidate's host route, waits `prop_time` for the
    /// routing daemon to import any competing claim, and keeps the address
    /// only if its route is still the single route to that destination.
    /// Attempts repeat until `resp_time` is exhausted.
    pub async fn select_address(
        &self,
        requested: Option<IpAddr>,
        prop_time: Duration,
        resp_time: Duration,
        exclude_first: u32,
        exclude_last: u32,
    ) -> Result<IpNet> {
        // Hold the read side for the whole loop so interface teardown
        // cannot race an in-flight selection. Selections on the same
        // interface run in parallel.
        let _guard = self.lock.read().await;

        let sleep_time = match requested {
            Some(_) => self.req_addr_sleep,
            None => Duration::ZERO,
        };

        let deadline = Instant::now() + resp_time;
        while Instant::now() < deadline {
            let selected = self
                .try_select(requested, prop_time, exclude_first, exclude_last)
                .await?;
            if let Some(ip) = selected {
                return Ok(ip);
            }
            if !sleep_time.is_zero() {
                tokio::time::sleep(sleep_time).await;
            }
        }

        tracing::warn!(iface = %self.name, "timeout expired while waiting for address");
        Err(Error::AddressRequestTimeout)
    }

    /// One optimistic claim attempt. `Ok(None)` means the candidate was
    /// taken (or lost the propagation race) and the caller should retry.
    async fn try_select(
        &self,
        requested: Option<IpAddr>,
        prop_time: Duration,
        exclude_first: u32,
        exclude_last: u32,
    ) -> Result<Option<IpNet>> {
        let subnet = self.subnet().await?;

        let candidate = match requested {
            Some(ip) => {
                if !subnet.contains(&ip) {
                    return Err(Error::OutOfSubnet { addr: ip, subnet });
                }
                ip
            }
            None => addr::random_addr(&subnet, exclude_first, exclude_last).ok_or_else(|| {
                Error::InvalidOption(format!(
                    "subnet {subnet} has no selectable addresses with the configured exclusions"
                ))
            })?,
        };

        let host = addr::host_net(candidate);
        if self.num_routes_to(host).await? > 0 {
            // Already claimed, by us in-flight or by another host.
            return Ok(None);
        }

        tracing::debug!(ip = %candidate, iface = %self.name, "claiming address by route");
        self.nl
            .route_add(&RouteSpec::host(host, self.mvl.index(), self.route_proto))
            .await?;

        // Give the routing daemon time to import a competing claim.
        tokio::time::sleep(prop_time).await;

        if self.num_routes_to(host).await? == 1 {
            let selected = addr::in_subnet(candidate, &subnet)
                .ok_or(Error::OutOfSubnet {
                    addr: candidate,
                    subnet,
                })?;
            return Ok(Some(selected));
        }

        tracing::info!(ip = %candidate, iface = %self.name, "another host claimed the address first");
        self.del_route_inner(host).await?;
        Ok(None)
    }

    /// Delete the host route to `ip` out of this interface.
    pub async fn del_route(&self, ip: IpAddr) -> Result<()> {
        let _guard = self.lock.read().await;
        self.del_route_inner(addr::host_net(ip)).await
    }

    async fn del_route_inner(&self, host: IpNet) -> Result<()> {
        self.nl
            .route_del(&RouteSpec::host(host, self.mvl.index(), self.route_proto))
            .await?;
        Ok(())
    }

    /// Remove the host interface if nothing uses it anymore: no slave
    /// devices besides the host macvlan and no owned routes out of it.
    /// Returns successfully without deleting otherwise.
    pub async fn delete(&self) -> Result<()> {
        let _guard = self.lock.write().await;

        for slave in self.vxlan.slave_links().await? {
            if slave.index != self.mvl.index() {
                tracing::debug!(iface = %self.name, slave = %slave.name, "still has slave devices, not deleting");
                return Ok(());
            }
        }

        let owned = self
            .nl
            .route_list(&RouteFilter {
                oif: Some(self.mvl.index()),
                proto: Some(self.route_proto),
                ..RouteFilter::default()
            })
            .await?;
        if !owned.is_empty() {
            tracing::debug!(iface = %self.name, routes = owned.len(), "still has routes, not deleting");
            return Ok(());
        }

        self.locks.delete(&self.name).await;
        self.vxlan.delete().await
    }

    async fn num_routes_to(&self, host: IpNet) -> Result<usize> {
        Ok(self.nl.route_list(&RouteFilter::dst(host)).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::mem::MemNetlink;

    const PROTO: u8 = 192;

    fn opts() -> HashMap<String, String> {
        [("vxlanid".to_string(), "42".to_string())].into_iter().collect()
    }

    async fn setup() -> (Arc<MemNetlink>, InterfaceManager, HostInterface) {
        let mem = Arc::new(MemNetlink::new());
        let mgr = InterfaceManager::new(mem.clone(), PROTO, Duration::from_millis(10));
        let gw: IpNet = "10.1.0.1/24".parse().unwrap();
        let hi = mgr.get_or_create("net0", gw, &opts()).await.unwrap();
        (mem, mgr, hi)
    }

    #[tokio::test]
    async fn get_or_create_builds_both_links_and_gateway() {
        let (mem, mgr, hi) = setup().await;
        assert!(mem.has_link("net0"));
        assert!(mem.has_link("hmvl_net0"));
        assert_eq!(hi.subnet().await.unwrap().to_string(), "10.1.0.0/24");

        // Second call reuses the same links.
        let again = mgr
            .get_or_create("net0", "10.1.0.1/24".parse().unwrap(), &opts())
            .await
            .unwrap();
        assert_eq!(again.vxlan.index(), hi.vxlan.index());
    }

    #[tokio::test]
    async fn get_requires_both_links() {
        let (_mem, mgr, _hi) = setup().await;
        assert!(mgr.get("net0").await.is_ok());
        assert!(matches!(
            mgr.get("missing").await,
            Err(Error::InterfaceNotFound(_))
        ));
    }

    // A random selection commits a /32 with the configured protocol out
    // of the host macvlan.
    #[tokio::test]
    async fn select_random_address() {
        let (mem, _mgr, hi) = setup().await;
        let selected = hi
            .select_address(None, Duration::from_millis(20), Duration::from_secs(2), 1, 1)
            .await
            .unwrap();

        let subnet: IpNet = "10.1.0.0/24".parse().unwrap();
        assert!(subnet.contains(&selected.addr()));
        assert_eq!(selected.prefix_len(), 24);
        assert_ne!(selected.addr().to_string(), "10.1.0.0");
        assert_ne!(selected.addr().to_string(), "10.1.0.255");

        let routes = mem.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst, addr::host_net(selected.addr()));
        assert_eq!(routes[0].proto, PROTO);
        assert_eq!(routes[0].oif, Some(hi.mvl.index()));
    }

    // A requested address that is already routed returns null until the
    // deadline, then AddressRequestTimeout. No route of ours is left behind.
    #[tokio::test]
    async fn select_requested_address_already_claimed() {
        let (mem, _mgr, hi) = setup().await;
        let taken: IpNet = "10.1.0.42/32".parse().unwrap();
        mem.inject_route(taken, 10);

        let err = hi
            .select_address(
                Some("10.1.0.42".parse().unwrap()),
                Duration::from_millis(10),
                Duration::from_millis(300),
                1,
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AddressRequestTimeout));
        assert_eq!(mem.route_count(taken), 1, "foreign route untouched, ours gone");
    }

    #[tokio::test]
    async fn select_requested_address_out_of_subnet() {
        let (_mem, _mgr, hi) = setup().await;
        let err = hi
            .select_address(
                Some("192.168.9.9".parse().unwrap()),
                Duration::from_millis(10),
                Duration::from_secs(1),
                1,
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutOfSubnet { .. }));
    }

    // A foreign route appearing inside the propagation window forces the
    // loser to remove its own claim, while an independent concurrent
    // selection commits normally.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn select_loses_propagation_race() {
        let (mem, _mgr, hi) = setup().await;
        let contested: IpAddr = "10.1.0.99".parse().unwrap();
        let contested_host = addr::host_net(contested);

        let racer = {
            let hi = hi.clone();
            tokio::spawn(async move {
                hi.select_address(
                    Some(contested),
                    Duration::from_millis(100),
                    Duration::from_millis(400),
                    1,
                    1,
                )
                .await
            })
        };

        // Wait until the claim route shows up, then inject the competing
        // import as the routing daemon would.
        let mut waited = Duration::ZERO;
        while mem.route_count(contested_host) == 0 && waited < Duration::from_millis(300) {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += Duration::from_millis(5);
        }
        assert!(mem.route_count(contested_host) > 0, "claim route never appeared");
        mem.inject_route(contested_host, 186);

        let other = hi
            .select_address(None, Duration::from_millis(20), Duration::from_secs(2), 1, 1)
            .await
            .unwrap();
        assert_ne!(other.addr(), contested);

        let err = racer.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::AddressRequestTimeout));
        // Only the foreign route survives on the contested destination.
        assert_eq!(mem.route_count(contested_host), 1);
        let foreign = mem
            .routes()
            .into_iter()
            .find(|r| r.dst == contested_host)
            .unwrap();
        assert_eq!(foreign.proto, 186);
    }

    // Interface GC: delete is a no-op while endpoints or routes
    // remain, and removes both links once the last of them is gone.
    #[tokio::test]
    async fn delete_respects_slaves_and_routes() {
        let (mem, _mgr, hi) = setup().await;

        for ep in ["cmvl_e1", "cmvl_e2", "cmvl_e3"] {
            hi.create_macvlan(ep).await.unwrap();
        }
        let selected = hi
            .select_address(None, Duration::from_millis(10), Duration::from_secs(2), 1, 1)
            .await
            .unwrap();

        hi.delete_macvlan("cmvl_e1").await.unwrap();
        hi.delete_macvlan("cmvl_e2").await.unwrap();

        hi.delete().await.unwrap();
        assert!(mem.has_link("net0"), "slave remains, vxlan must survive");

        hi.delete_macvlan("cmvl_e3").await.unwrap();
        hi.delete().await.unwrap();
        assert!(mem.has_link("net0"), "route remains, vxlan must survive");

        hi.del_route(selected.addr()).await.unwrap();
        hi.delete().await.unwrap();
        assert!(!mem.has_link("net0"));
        assert!(!mem.has_link("hmvl_net0"), "kernel cascades slave deletion");
    }

    // Concurrent selections on one interface never hand out the same
    // address: every committed address owns the single route to its
    // destination.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_selections_are_unique() {
        let (mem, _mgr, hi) = setup().await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let hi = hi.clone();
                tokio::spawn(async move {
                    hi.select_address(
                        None,
                        Duration::from_millis(10),
                        Duration::from_secs(5),
                        1,
                        1,
                    )
                    .await
                })
            })
            .collect();

        // A claim can lose the check-then-install race against a sibling
        // and fail; committed ones must be distinct and route-backed.
        let mut committed = std::collections::HashSet::new();
        for task in tasks {
            if let Ok(selected) = task.await.unwrap() {
                assert!(committed.insert(selected.addr()), "duplicate address handed out");
                assert_eq!(mem.route_count(addr::host_net(selected.addr())), 1);
            }
        }
        assert!(!committed.is_empty());
        assert_eq!(mem.routes().len(), committed.len(), "no route leaked by losers");
    }

    #[tokio::test]
    async fn from_destination_resolves_owning_interface() {
        let (_mem, mgr, hi) = setup().await;
        let selected = hi
            .select_address(None, Duration::from_millis(10), Duration::from_secs(2), 1, 1)
            .await
            .unwrap();

        let resolved = mgr.from_destination(selected.addr()).await.unwrap();
        assert_eq!(resolved.name(), "net0");

        assert!(matches!(
            mgr.from_destination("10.9.9.9".parse().unwrap()).await,
            Err(Error::InterfaceNotFound(_))
        ));
    }
}
