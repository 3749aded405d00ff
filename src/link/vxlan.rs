//! VXLAN link lifecycle: option parsing, idempotent create, delete.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::config::ENV_PREFIX;
use crate::error::{Error, Result};
use crate::link::macvlan::Macvlan;
use crate::netlink::{Link, LinkKind, NetlinkError, NetlinkHandle, VxlanSpec};

/// Maximum VXLAN network identifier (24 bits).
pub const MAX_VNI: u32 = 16_777_215;

/// Option keys recognized on a network. Anything else is ignored.
const OPT_KEYS: &[&str] = &[
    "vxlanid",
    "vtepdev",
    "srcaddr",
    "group",
    "ttl",
    "tos",
    "age",
    "limit",
    "port",
    "portlow",
    "porthigh",
    "learning",
    "proxy",
    "rsc",
    "l2miss",
    "l3miss",
    "noage",
    "gbp",
    "vxlanmtu",
    "vxlantxqlen",
    "vxlanhardwareaddr",
];

/// A VXLAN interface on this host.
#[derive(Clone)]
pub struct Vxlan {
    name: String,
    index: u32,
    nl: NetlinkHandle,
}

impl std::fmt::Debug for Vxlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vxlan")
            .field("name", &self.name)
            .field("index", &self.index)
            .finish()
    }
}

/// Everything parsed out of the per-network options: the creation-time spec
/// plus the two attributes that may be adjusted on a live link.
#[derive(Debug, Default, Clone)]
pub struct VxlanOptions {
    pub spec: VxlanSpec,
    pub mtu: Option<u32>,
    pub hwaddr: Option<Vec<u8>>,
}

/// Validate a `vxlanid` option value.
pub fn parse_vxlan_id(value: &str) -> Result<u32> {
    let id: i64 = value
        .parse()
        .map_err(|_| Error::InvalidOption(format!("vxlanid {value:?} is not an integer")))?;
    if id < 0 || id > i64::from(MAX_VNI) {
        return Err(Error::InvalidOption(format!(
            "vxlanid {id} is out of range (0-{MAX_VNI})"
        )));
    }
    Ok(id as u32)
}

fn parse_mac(value: &str) -> Result<Vec<u8>> {
    let bytes: Vec<u8> = value
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::InvalidOption(format!("invalid hardware address {value:?}")))?;
    if bytes.len() != 6 {
        return Err(Error::InvalidOption(format!(
            "invalid hardware address {value:?}"
        )));
    }
    Ok(bytes)
}

fn opt_value(opts: &HashMap<String, String>, key: &str) -> Option<String> {
    if let Some(v) = opts.get(key) {
        if !v.is_empty() {
            return Some(v.clone());
        }
    }
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn parse_opt<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidOption(format!("failed to parse option {key}={value:?}")))
}

/// Parse the recognized VXLAN options, falling back to `VXR_<key>`
/// environment variables for absent keys. `vtepdev` is resolved to a link
/// index immediately.
pub async fn parse_options(
    opts: &HashMap<String, String>,
    nl: &NetlinkHandle,
) -> Result<VxlanOptions> {
    let mut out = VxlanOptions::default();
    let mut port_low: Option<u16> = None;
    let mut port_high: Option<u16> = None;
    let mut vni = None;

    for key in OPT_KEYS {
        let Some(value) = opt_value(opts, key) else {
            continue;
        };
        match *key {
            "vxlanid" => vni = Some(parse_vxlan_id(&value)?),
            "vtepdev" => {
                let link = nl.link_get(&value).await.map_err(|err| {
                    Error::InvalidOption(format!("vtepdev {value:?}: {err}"))
                })?;
                out.spec.vtep_index = Some(link.index);
            }
            "srcaddr" => out.spec.src_addr = Some(parse_opt::<IpAddr>(key, &value)?),
            "group" => out.spec.group = Some(parse_opt::<IpAddr>(key, &value)?),
            "ttl" => out.spec.ttl = Some(parse_opt(key, &value)?),
            "tos" => out.spec.tos = Some(parse_opt(key, &value)?),
            "age" => out.spec.ageing = Some(parse_opt(key, &value)?),
            "limit" => out.spec.limit = Some(parse_opt(key, &value)?),
            "port" => out.spec.port = Some(parse_opt(key, &value)?),
            "portlow" => port_low = Some(parse_opt(key, &value)?),
            "porthigh" => port_high = Some(parse_opt(key, &value)?),
            "learning" => out.spec.learning = Some(parse_opt(key, &value)?),
            "proxy" => out.spec.proxy = Some(parse_opt(key, &value)?),
            "rsc" => out.spec.rsc = Some(parse_opt(key, &value)?),
            "l2miss" => out.spec.l2miss = Some(parse_opt(key, &value)?),
            "l3miss" => out.spec.l3miss = Some(parse_opt(key, &value)?),
            "noage" => {
                if parse_opt::<bool>(key, &value)? {
                    out.spec.ageing = Some(0);
                }
            }
            "gbp" => out.spec.gbp = Some(parse_opt(key, &value)?),
            "vxlanmtu" => out.mtu = Some(parse_opt(key, &value)?),
            "vxlantxqlen" => out.spec.txqlen = Some(parse_opt(key, &value)?),
            "vxlanhardwareaddr" => out.hwaddr = Some(parse_mac(&value)?),
            _ => {}
        }
    }

    out.spec.id =
        vni.ok_or_else(|| Error::InvalidOption("vxlanid option is required".to_string()))?;
    if port_low.is_some() || port_high.is_some() {
        out.spec.port_range = Some((port_low.unwrap_or(0), port_high.unwrap_or(0)));
    }
    Ok(out)
}

/// Check the creation-time attributes of an existing VXLAN against a
/// requested spec. Only fields the request specifies are compared, and only
/// when the kernel reported them.
fn conflicts(existing: &VxlanSpec, requested: &VxlanSpec) -> bool {
    fn differs<T: PartialEq + Copy>(have: Option<T>, want: Option<T>) -> bool {
        matches!((have, want), (Some(h), Some(w)) if h != w)
    }

    existing.id != requested.id
        || differs(existing.vtep_index, requested.vtep_index)
        || differs(existing.src_addr, requested.src_addr)
        || differs(existing.group, requested.group)
        || differs(existing.ttl, requested.ttl)
        || differs(existing.tos, requested.tos)
        || differs(existing.ageing, requested.ageing)
        || differs(existing.limit, requested.limit)
        || differs(existing.port, requested.port)
        || differs(existing.port_range, requested.port_range)
        || differs(existing.learning, requested.learning)
        || differs(existing.proxy, requested.proxy)
        || differs(existing.rsc, requested.rsc)
        || differs(existing.l2miss, requested.l2miss)
        || differs(existing.l3miss, requested.l3miss)
        || differs(existing.gbp, requested.gbp)
}

impl Vxlan {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    fn from_link(nl: NetlinkHandle, link: Link) -> Result<Self> {
        if !link.is_vxlan() {
            return Err(Error::ConflictingExistingLink { name: link.name });
        }
        Ok(Self {
            name: link.name,
            index: link.index,
            nl,
        })
    }

    /// Get the VXLAN by name, failing if it does not exist or is another
    /// link kind.
    pub async fn from_name(nl: NetlinkHandle, name: &str) -> Result<Self> {
        let link = nl.link_get(name).await?;
        Self::from_link(nl, link)
    }

    /// Create the VXLAN, or confirm a pre-existing one matches the
    /// requested options. The link is up when this returns.
    pub async fn create(
        nl: NetlinkHandle,
        name: &str,
        options: &VxlanOptions,
    ) -> Result<Self> {
        let vxl = match nl.link_get(name).await {
            Ok(link) => Self::confirm_existing(nl, link, options)?,
            Err(NetlinkError::LinkNotFound) => {
                match nl.link_add_vxlan(name, &options.spec).await {
                    Ok(()) => Self::from_name(nl, name).await?,
                    // Another task may have created it between our probe and
                    // the add; re-fetch once and keep the add error if that
                    // also fails.
                    Err(add_err) => match nl.link_get(name).await {
                        Ok(link) => Self::confirm_existing(nl, link, options)?,
                        Err(_) => return Err(add_err.into()),
                    },
                }
            }
            Err(err) => return Err(err.into()),
        };

        vxl.apply_mutable(options).await?;
        vxl.nl.link_set_up(vxl.index).await?;
        Ok(vxl)
    }

    fn confirm_existing(nl: NetlinkHandle, link: Link, options: &VxlanOptions) -> Result<Self> {
        let name = link.name.clone();
        let txqlen = link.txqlen;
        let LinkKind::Vxlan(ref existing) = link.kind else {
            return Err(Error::ConflictingExistingLink { name });
        };
        let mut existing = existing.clone();
        existing.txqlen = txqlen;
        if conflicts(&existing, &options.spec) {
            tracing::debug!(%name, "existing vxlan has conflicting attributes");
            return Err(Error::ConflictingExistingLink { name });
        }
        Self::from_link(nl, link)
    }

    async fn apply_mutable(&self, options: &VxlanOptions) -> Result<()> {
        let current = self.nl.link_get_by_index(self.index).await?;
        if let Some(mtu) = options.mtu {
            if current.mtu != Some(mtu) {
                self.nl.link_set_mtu(self.index, mtu).await?;
            }
        }
        if let Some(ref hwaddr) = options.hwaddr {
            if current.hwaddr.as_ref() != Some(hwaddr) {
                self.nl.link_set_hwaddr(self.index, hwaddr.clone()).await?;
            }
        }
        Ok(())
    }

    /// Create a bridge-mode macvlan slaved to this VXLAN.
    pub async fn create_macvlan(&self, name: &str) -> Result<Macvlan> {
        Macvlan::create(self.nl.clone(), name, self.index).await
    }

    /// Delete a slave macvlan by name, refusing if it is not ours.
    pub async fn delete_macvlan(&self, name: &str) -> Result<()> {
        let mvl = Macvlan::from_name(self.nl.clone(), name).await?;
        if mvl.parent_index() != Some(self.index) {
            return Err(Error::InvalidOption(format!(
                "macvlan {name} is not a child of vxlan {}",
                self.name
            )));
        }
        mvl.delete().await
    }

    /// All links slaved to this VXLAN, macvlans or otherwise.
    pub async fn slave_links(&self) -> Result<Vec<Link>> {
        Ok(self.nl.slave_links(self.index).await?)
    }

    /// Delete the VXLAN. The kernel removes slave macvlans implicitly.
    /// Deleting an already-gone link succeeds.
    pub async fn delete(&self) -> Result<()> {
        match self.nl.link_del(self.index).await {
            Ok(()) | Err(NetlinkError::LinkNotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
