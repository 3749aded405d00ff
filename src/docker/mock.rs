//! Scriptable [`Orchestrator`] for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::types::{
    ContainerSummary, EndpointSettings, Ipam, IpamConfig, NetworkResource, SummaryNetworkSettings,
};
use super::{DockerError, Orchestrator};

#[derive(Default)]
pub struct MockDocker {
    networks: Mutex<Vec<NetworkResource>>,
    containers: Mutex<Vec<ContainerSummary>>,
    /// One-shot container lists consumed before the steady-state list,
    /// for simulating containers appearing mid-pass.
    queued_lists: Mutex<VecDeque<Vec<ContainerSummary>>>,
    fail: Mutex<bool>,
}

impl MockDocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_network(&self, id: &str, name: &str, subnet: &str, gateway: &str, vni: &str) {
        self.add_network_with_driver(id, name, subnet, gateway, crate::config::NETWORK_DRIVER_NAME);
        if let Some(nr) = self
            .networks
            .lock()
            .unwrap()
            .iter_mut()
            .find(|n| n.id == id)
        {
            nr.options.insert("vxlanid".to_string(), vni.to_string());
        }
    }

    pub fn add_network_with_driver(
        &self,
        id: &str,
        name: &str,
        subnet: &str,
        gateway: &str,
        driver: &str,
    ) {
        self.networks.lock().unwrap().push(NetworkResource {
            id: id.to_string(),
            name: name.to_string(),
            driver: driver.to_string(),
            ipam: Ipam {
                config: vec![IpamConfig {
                    subnet: subnet.to_string(),
                    gateway: gateway.to_string(),
                }],
            },
            options: HashMap::new(),
        });
    }

    /// Replace the steady-state container list with (container id, network
    /// name, network id, endpoint id, address) tuples.
    pub fn set_containers(&self, entries: &[(&str, &str, &str, &str, &str)]) {
        *self.containers.lock().unwrap() = Self::build_containers(entries);
    }

    /// Queue a container list returned by exactly one `list_containers`
    /// call before falling back to the steady-state list.
    pub fn queue_container_list(&self, entries: &[(&str, &str, &str, &str, &str)]) {
        let list = Self::build_containers(entries);
        self.queued_lists.lock().unwrap().push_back(list);
    }

    fn build_containers(entries: &[(&str, &str, &str, &str, &str)]) -> Vec<ContainerSummary> {
        entries
            .iter()
            .map(|(cid, net_name, netid, epid, ip)| ContainerSummary {
                id: cid.to_string(),
                names: vec![format!("/{cid}")],
                network_settings: Some(SummaryNetworkSettings {
                    networks: HashMap::from([(
                        net_name.to_string(),
                        EndpointSettings {
                            network_id: netid.to_string(),
                            endpoint_id: epid.to_string(),
                            ip_address: ip.to_string(),
                            ipam_config: None,
                        },
                    )]),
                }),
            })
            .collect()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    fn check(&self) -> Result<(), DockerError> {
        if *self.fail.lock().unwrap() {
            return Err(DockerError::Http("mock failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for MockDocker {
    async fn inspect_network(&self, id: &str) -> Result<NetworkResource, DockerError> {
        self.check()?;
        self.networks
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| DockerError::Status {
                status: 404,
                body: format!("no such network: {id}"),
            })
    }

    async fn list_networks(&self, driver: &str) -> Result<Vec<NetworkResource>, DockerError> {
        self.check()?;
        Ok(self
            .networks
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.driver == driver)
            .cloned()
            .collect())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        self.check()?;
        if let Some(list) = self.queued_lists.lock().unwrap().pop_front() {
            return Ok(list);
        }
        Ok(self.containers.lock().unwrap().clone())
    }
}
