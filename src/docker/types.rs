//! Docker Engine API wire types, limited to the fields this daemon reads.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// A network as returned by network inspect/list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkResource {
    #[serde(rename = "Id")]
    pub id: String,
    pub name: String,
    pub driver: String,
    #[serde(rename = "IPAM")]
    pub ipam: Ipam,
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Ipam {
    pub config: Vec<IpamConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IpamConfig {
    pub subnet: String,
    pub gateway: String,
}

impl NetworkResource {
    /// The pool this network allocates from: the subnet of its first
    /// subnet-bearing IPAM config entry.
    pub fn pool(&self) -> Option<String> {
        self.ipam
            .config
            .iter()
            .find(|c| !c.subnet.is_empty())
            .map(|c| c.subnet.clone())
    }

    /// Gateway address carrying the subnet's prefix length, from the first
    /// IPAM entry specifying both.
    pub fn gateway_cidr(&self) -> Option<IpNet> {
        for config in &self.ipam.config {
            if config.gateway.is_empty() || config.subnet.is_empty() {
                continue;
            }
            let gw: IpAddr = config.gateway.parse().ok()?;
            let subnet: IpNet = config.subnet.parse().ok()?;
            return IpNet::new(gw, subnet.prefix_len()).ok();
        }
        None
    }
}

/// A container as returned by container list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    pub names: Vec<String>,
    pub network_settings: Option<SummaryNetworkSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SummaryNetworkSettings {
    pub networks: HashMap<String, EndpointSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EndpointSettings {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "IPAMConfig")]
    pub ipam_config: Option<EndpointIpamConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EndpointIpamConfig {
    #[serde(rename = "IPv4Address")]
    pub ipv4_address: String,
    #[serde(rename = "IPv6Address")]
    pub ipv6_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_and_gateway_come_from_first_subnet_entry() {
        let nr: NetworkResource = serde_json::from_str(
            r#"{
                "Id": "abc",
                "Name": "net0",
                "Driver": "vxrnet",
                "IPAM": {"Config": [{"Subnet": "", "Gateway": ""},
                                    {"Subnet": "10.1.0.0/24", "Gateway": "10.1.0.1"}]},
                "Options": {"vxlanid": "42"}
            }"#,
        )
        .unwrap();
        assert_eq!(nr.pool().unwrap(), "10.1.0.0/24");
        assert_eq!(nr.gateway_cidr().unwrap().to_string(), "10.1.0.1/24");
        assert_eq!(nr.options["vxlanid"], "42");
    }

    #[test]
    fn container_network_settings_parse() {
        let c: ContainerSummary = serde_json::from_str(
            r#"{
                "Id": "c1",
                "Names": ["/web"],
                "NetworkSettings": {"Networks": {"net0": {
                    "NetworkID": "abc",
                    "EndpointID": "ep1234567",
                    "IPAddress": "10.1.0.7",
                    "IPAMConfig": {"IPv4Address": "10.1.0.7"}
                }}}
            }"#,
        )
        .unwrap();
        let nets = &c.network_settings.unwrap().networks;
        assert_eq!(nets["net0"].ip_address, "10.1.0.7");
        assert_eq!(nets["net0"].endpoint_id, "ep1234567");
    }
}
