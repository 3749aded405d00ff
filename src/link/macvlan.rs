//! Macvlan link lifecycle, for both the host gateway interface and the
//! per-container endpoints.

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::netlink::{Link, NetlinkHandle};

/// A bridge-mode macvlan slaved to a VXLAN.
#[derive(Clone)]
pub struct Macvlan {
    name: String,
    index: u32,
    parent: Option<u32>,
    nl: NetlinkHandle,
}

impl std::fmt::Debug for Macvlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Macvlan")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("parent", &self.parent)
            .finish()
    }
}

impl Macvlan {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn parent_index(&self) -> Option<u32> {
        self.parent
    }

    pub fn from_link(nl: NetlinkHandle, link: Link) -> Result<Self> {
        if !link.is_macvlan() {
            return Err(Error::ConflictingExistingLink { name: link.name });
        }
        Ok(Self {
            name: link.name,
            index: link.index,
            parent: link.parent,
            nl,
        })
    }

    pub async fn from_name(nl: NetlinkHandle, name: &str) -> Result<Self> {
        let link = nl.link_get(name).await?;
        Self::from_link(nl, link)
    }

    /// Create a bridge-mode macvlan under `parent`. A pre-existing link with
    /// the same name succeeds idempotently when its parent matches and fails
    /// with [`Error::ConflictingExistingLink`] otherwise. The link is up when
    /// this returns.
    pub async fn create(nl: NetlinkHandle, name: &str, parent: u32) -> Result<Self> {
        let mvl = match nl.link_add_macvlan(name, parent).await {
            Ok(()) => Self::from_name(nl, name).await?,
            // The add may have lost a race with another task creating the
            // same link; accept it if the parent matches.
            Err(add_err) => match nl.link_get(name).await {
                Ok(link) => {
                    let mvl = Self::from_link(nl, link)?;
                    if mvl.parent != Some(parent) {
                        return Err(Error::ConflictingExistingLink {
                            name: name.to_string(),
                        });
                    }
                    mvl
                }
                Err(_) => return Err(add_err.into()),
            },
        };

        mvl.nl.link_set_up(mvl.index).await?;
        Ok(mvl)
    }

    /// Addresses currently bound to this link.
    pub async fn addresses(&self) -> Result<Vec<IpNet>> {
        Ok(self.nl.addr_list(self.index).await?)
    }

    pub async fn has_address(&self, addr: &IpNet) -> bool {
        match self.addresses().await {
            Ok(addrs) => addrs.contains(addr),
            Err(err) => {
                tracing::debug!(name = %self.name, %err, "failed to list addresses");
                false
            }
        }
    }

    pub async fn add_address(&self, addr: IpNet) -> Result<()> {
        Ok(self.nl.addr_add(self.index, addr).await?)
    }

    /// Delete the macvlan. Refuses to delete a link that is not a slave
    /// device, so a misresolved name can never tear down a real interface.
    pub async fn delete(&self) -> Result<()> {
        if self.parent.unwrap_or(0) == 0 {
            return Err(Error::InvalidOption(format!(
                "refusing to delete {}: not a slave device",
                self.name
            )));
        }
        Ok(self.nl.link_del(self.index).await?)
    }
}
