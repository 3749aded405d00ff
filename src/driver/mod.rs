//! Orchestrator-facing core: glue between the plugin handlers, the
//! network-resource cache and the interface manager.

pub mod cache;
mod reconcile;


use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::config::{self, Config, ENV_PREFIX, IPAM_DRIVER_NAME, NETWORK_DRIVER_NAME};
use crate::docker::{NetworkResource, Orchestrator};
use crate::error::{Error, Result};
use crate::iface::{container_macvlan_name, HostInterface, InterfaceManager};
use crate::netlink::NetlinkHandle;
use cache::ResourceCache;

/// Strip the IPAM driver prefix from a pool id
/// (`"<ipam-driver-name>/<subnet>"`).
pub fn pool_from_id(pool_id: &str) -> &str {
    pool_id
        .strip_prefix(&format!("{IPAM_DRIVER_NAME}/"))
        .unwrap_or(pool_id)
}

pub struct Core {
    docker: Arc<dyn Orchestrator>,
    cache: ResourceCache,
    ifaces: InterfaceManager,
    nl: NetlinkHandle,
    config: Config,
}

impl Core {
    pub fn new(docker: Arc<dyn Orchestrator>, nl: NetlinkHandle, config: Config) -> Arc<Self> {
        let ifaces =
            InterfaceManager::new(nl.clone(), config.route_proto, config.req_addr_sleep);
        Arc::new(Self {
            docker,
            cache: ResourceCache::spawn(),
            ifaces,
            nl,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve a network by id, checking the cache before asking the
    /// orchestrator. Networks of foreign drivers are rejected.
    pub async fn network_resource_by_id(&self, id: &str) -> Result<Arc<NetworkResource>> {
        if let Some(nr) = self.cache.get(id).await {
            return Ok(nr);
        }

        let nr = self.docker.inspect_network(id).await?;
        if nr.driver != NETWORK_DRIVER_NAME {
            tracing::debug!(net_id = id, driver = %nr.driver, "network belongs to another driver");
            return Err(Error::NetworkNotFound(id.to_string()));
        }
        let nr = Arc::new(nr);
        self.cache.put(nr.clone()).await;
        Ok(nr)
    }

    /// Resolve a network by its pool subnet: cache first, then the
    /// orchestrator's network list filtered by driver, inspecting each
    /// candidate until the subnet matches.
    pub async fn network_resource_by_pool(&self, pool: &str) -> Result<Arc<NetworkResource>> {
        if let Some(nr) = self.cache.get(pool).await {
            return Ok(nr);
        }

        for summary in self.docker.list_networks(NETWORK_DRIVER_NAME).await? {
            let nr = match self.network_resource_by_id(&summary.id).await {
                Ok(nr) => nr,
                Err(err) => {
                    tracing::debug!(net_id = %summary.id, %err, "failed to inspect network");
                    continue;
                }
            };
            if nr.pool().as_deref() == Some(pool) {
                return Ok(nr);
            }
        }
        Err(Error::NetworkNotFound(pool.to_string()))
    }

    /// Evict a network resource from the cache. Accepts a prefixed pool id
    /// or a network id; the entry's other index is removed with it.
    pub async fn uncache(&self, pool_id: &str) {
        self.cache.delete(pool_from_id(pool_id)).await;
    }

    /// Ensure the network's host interface exists with its gateway bound.
    async fn ensure_interface(&self, nr: &NetworkResource) -> Result<HostInterface> {
        let gateway = nr.gateway_cidr().ok_or_else(|| {
            Error::InvalidOption(format!(
                "network {} has no gateway with subnet in its IPAM config",
                nr.name
            ))
        })?;
        self.ifaces.get_or_create(&nr.name, gateway, &nr.options).await
    }

    /// Ensure the interface and run address selection on it.
    pub(crate) async fn connect(
        &self,
        nr: &NetworkResource,
        requested: Option<IpAddr>,
    ) -> Result<IpNet> {
        let hi = self.ensure_interface(nr).await?;

        // Exclude the network and (normal) broadcast addresses by default.
        let xf = config::env_int_with_default(
            &format!("{ENV_PREFIX}excludefirst"),
            nr.options.get("excludefirst").map(String::as_str),
            1,
        );
        let xl = config::env_int_with_default(
            &format!("{ENV_PREFIX}excludelast"),
            nr.options.get("excludelast").map(String::as_str),
            1,
        );

        hi.select_address(
            requested,
            self.config.prop_timeout,
            self.config.resp_timeout,
            xf,
            xl,
        )
        .await
    }

    /// Resolve the pool, ensure its interface and select an address.
    pub async fn connect_and_get_address(
        &self,
        requested: Option<IpAddr>,
        pool_id: &str,
    ) -> Result<IpNet> {
        let nr = self.network_resource_by_pool(pool_from_id(pool_id)).await?;
        self.connect(&nr, requested).await
    }

    /// Delete the route claiming `addr` and asynchronously try to garbage
    /// collect its host interface.
    pub async fn delete_route(&self, addr: IpAddr) -> Result<()> {
        let hi = self.ifaces.from_destination(addr).await?;
        hi.del_route(addr).await?;

        // Best-effort: the interface survives if anything still uses it.
        tokio::spawn(async move {
            if let Err(err) = hi.delete().await {
                tracing::warn!(%err, "interface cleanup after route removal failed");
            }
        });
        Ok(())
    }

    /// Create the container-side macvlan for an endpoint and return its
    /// interface name.
    pub async fn create_container_interface(
        &self,
        netid: &str,
        endpoint_id: &str,
    ) -> Result<String> {
        let nr = self.network_resource_by_id(netid).await?;
        let hi = self.ensure_interface(&nr).await?;
        let name = container_macvlan_name(endpoint_id);
        hi.create_macvlan(&name).await?;
        Ok(name)
    }

    /// Delete an endpoint's container macvlan. Route deletion is handled
    /// separately through [`Core::delete_route`].
    pub async fn delete_container_interface(&self, netid: &str, endpoint_id: &str) -> Result<()> {
        let nr = self.network_resource_by_id(netid).await?;
        let hi = self.ifaces.get(&nr.name).await?;
        hi.delete_macvlan(&container_macvlan_name(endpoint_id)).await
    }

    /// Gateway CIDR of a network, for the Join response.
    pub async fn network_gateway(&self, netid: &str) -> Result<IpNet> {
        let nr = self.network_resource_by_id(netid).await?;
        nr.gateway_cidr().ok_or_else(|| {
            Error::InvalidOption(format!(
                "network {} has no gateway with subnet in its IPAM config",
                nr.name
            ))
        })
    }
}
