//! Drift repair between the observed container set and the installed
//! routes.
//!
//! A pass is possibly racy: a container starting after the container list
//! was taken could have its fresh route reaped. To compensate, the
//! container set is snapshotted again after the reap; if it changed, the
//! whole pass restarts and the interfaces collected for garbage collection
//! are discarded. Interface GC therefore only ever runs on a pass whose
//! container set demonstrably did not change while routes were being
//! deleted.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::addr;
use crate::error::Result;
use crate::iface::HostInterface;
use crate::netlink::{RouteFilter, RouteSpec};

use super::Core;

/// Container address snapshot: address to network id.
type Snapshot = BTreeMap<IpAddr, String>;

impl Core {
    /// One-shot reconciliation at startup, then periodically at
    /// `interval`. A zero interval disables the ticker but the startup
    /// pass still runs.
    pub async fn run_reconciler(self: Arc<Self>, interval: Duration) {
        self.reconcile().await;
        if interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.reconcile().await;
        }
    }

    /// Add missing routes for running containers and reap orphaned routes.
    /// Per-item failures are logged and skipped; an orchestrator failure
    /// aborts the pass.
    pub async fn reconcile(&self) {
        loop {
            let snapshot = match self.container_addresses().await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::error!(%err, "reconcile: failed to list container addresses");
                    return;
                }
            };

            // Make sure every container address has its route.
            for (ip, netid) in &snapshot {
                match self.ensure_connected(*ip, netid).await {
                    Ok(true) => tracing::debug!(%ip, "reconcile: added missing route"),
                    Ok(false) => {}
                    Err(err) => tracing::error!(%ip, %err, "reconcile: failed to connect container"),
                }
            }

            // Reap routes we own whose container is gone, remembering the
            // interfaces they pointed at.
            let mut orphaned: HashMap<String, HostInterface> = HashMap::new();
            let owned = match self
                .nl
                .route_list(&RouteFilter::proto(self.config.route_proto))
                .await
            {
                Ok(owned) => owned,
                Err(err) => {
                    tracing::error!(%err, "reconcile: failed to list routes");
                    return;
                }
            };
            for route in owned {
                if route.dst.prefix_len() != route.dst.max_prefix_len() {
                    continue;
                }
                let dst = route.dst.addr();
                if snapshot.contains_key(&dst) {
                    continue;
                }

                tracing::debug!(ip = %dst, "reconcile: deleting orphaned route");
                match self.ifaces.from_destination(dst).await {
                    Ok(hi) => {
                        if let Err(err) = hi.del_route(dst).await {
                            tracing::error!(ip = %dst, %err, "reconcile: failed to delete route");
                            continue;
                        }
                        orphaned.insert(hi.name().to_string(), hi);
                    }
                    Err(err) => {
                        // The owning interface is unresolvable; remove the
                        // route directly.
                        tracing::debug!(ip = %dst, %err, "reconcile: route has no resolvable interface");
                        let spec = RouteSpec {
                            dst: route.dst,
                            oif: route.oif,
                            gateway: None,
                            proto: Some(self.config.route_proto),
                        };
                        if let Err(err) = self.nl.route_del(&spec).await {
                            tracing::error!(ip = %dst, %err, "reconcile: failed to delete route");
                        }
                    }
                }
            }

            let recheck = match self.container_addresses().await {
                Ok(recheck) => recheck,
                Err(err) => {
                    tracing::error!(%err, "reconcile: failed to re-list container addresses");
                    return;
                }
            };
            if recheck != snapshot {
                // A container came or went mid-pass; one of the routes we
                // just reaped may belong to it. Run the whole pass again and
                // leave the collected interfaces alone.
                tracing::debug!("reconcile: container set changed during pass, restarting");
                continue;
            }

            // Stable pass: the collected interfaces can be garbage
            // collected. Each delete re-checks its own preconditions under
            // the interface write lock.
            join_all(orphaned.into_values().map(|hi| async move {
                if let Err(err) = hi.delete().await {
                    tracing::error!(iface = %hi.name(), %err, "reconcile: interface cleanup failed");
                }
            }))
            .await;
            return;
        }
    }

    /// Install the route for a container address if it is missing.
    /// Returns true when a route was added.
    async fn ensure_connected(&self, ip: IpAddr, netid: &str) -> Result<bool> {
        let existing = self
            .nl
            .route_list(&RouteFilter {
                dst: Some(addr::host_net(ip)),
                proto: Some(self.config.route_proto),
                ..RouteFilter::default()
            })
            .await?;
        if !existing.is_empty() {
            return Ok(false);
        }

        let nr = self.network_resource_by_id(netid).await?;
        self.connect(&nr, Some(ip)).await?;
        Ok(true)
    }

    /// (address → network id) for every running container, from the
    /// orchestrator's container list. Unparseable addresses are ignored.
    async fn container_addresses(&self) -> Result<Snapshot> {
        let containers = self.docker.list_containers().await?;

        let mut snapshot = Snapshot::new();
        for container in containers {
            let Some(settings) = container.network_settings else {
                continue;
            };
            for endpoint in settings.networks.values() {
                if let Ok(ip) = endpoint.ip_address.parse::<IpAddr>() {
                    snapshot.insert(ip, endpoint.network_id.clone());
                }
                if let Some(ipam) = &endpoint.ipam_config {
                    if let Ok(ip) = ipam.ipv4_address.parse::<IpAddr>() {
                        snapshot.insert(ip, endpoint.network_id.clone());
                    }
                }
            }
        }
        Ok(snapshot)
    }
}
