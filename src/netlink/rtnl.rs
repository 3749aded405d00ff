//! rtnetlink-backed implementation of the [`Netlink`] capability.
//!
//! One handle per process; the connection task is spawned once and reused
//! for every operation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::link::{
    InfoData, InfoKind, InfoMacVlan, InfoVxlan, LinkAttribute, LinkInfo, LinkMessage, MacVlanMode,
};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol,
};
use netlink_packet_route::AddressFamily;
use rtnetlink::{LinkUnspec, RouteMessageBuilder};

use super::{
    Link, LinkKind, Netlink, NetlinkError, NlResult, RouteEntry, RouteFilter, RouteSpec, VxlanSpec,
};

const RT_TABLE_MAIN: u8 = 254;

pub struct RtNetlink {
    handle: rtnetlink::Handle,
    // Keep the connection task alive for the life of the handle.
    _conn_task: tokio::task::JoinHandle<()>,
}

impl RtNetlink {
    pub fn new() -> NlResult<Self> {
        let (conn, handle, _) =
            rtnetlink::new_connection().map_err(|e| NetlinkError::Io(e.to_string()))?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }
}

/// Which object an operation touched, for errno mapping.
#[derive(Clone, Copy, PartialEq)]
enum Obj {
    Link,
    Addr,
    Route,
}

fn map_err(obj: Obj, err: rtnetlink::Error) -> NetlinkError {
    if let rtnetlink::Error::NetlinkError(ref msg) = err {
        match -msg.raw_code() {
            libc::EEXIST => {
                return match obj {
                    Obj::Link => NetlinkError::LinkExists,
                    Obj::Addr => NetlinkError::AddrExists,
                    Obj::Route => NetlinkError::RouteExists,
                }
            }
            libc::ENODEV => {
                if obj == Obj::Link {
                    return NetlinkError::LinkNotFound;
                }
            }
            libc::EPERM | libc::EACCES => return NetlinkError::Permission,
            _ => {}
        }
    }
    NetlinkError::Io(err.to_string())
}

fn parse_link(msg: LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        kind: LinkKind::Other,
        parent: None,
        mtu: None,
        txqlen: None,
        hwaddr: None,
    };

    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name,
            LinkAttribute::Link(parent) => link.parent = Some(parent),
            LinkAttribute::Mtu(mtu) => link.mtu = Some(mtu),
            LinkAttribute::TxQueueLen(len) => link.txqlen = Some(len),
            LinkAttribute::Address(addr) => link.hwaddr = Some(addr),
            LinkAttribute::LinkInfo(infos) => {
                let mut kind = None;
                let mut vxlan = VxlanSpec::default();
                for info in infos {
                    match info {
                        LinkInfo::Kind(k) => kind = Some(k),
                        LinkInfo::Data(InfoData::Vxlan(attrs)) => {
                            parse_vxlan_attrs(attrs, &mut vxlan);
                        }
                        _ => {}
                    }
                }
                link.kind = match kind {
                    Some(InfoKind::Vxlan) => LinkKind::Vxlan(vxlan),
                    Some(InfoKind::MacVlan) => LinkKind::Macvlan,
                    _ => LinkKind::Other,
                };
            }
            _ => {}
        }
    }
    link
}

fn parse_vxlan_attrs(attrs: Vec<InfoVxlan>, out: &mut VxlanSpec) {
    for attr in attrs {
        match attr {
            InfoVxlan::Id(id) => out.id = id,
            InfoVxlan::Link(index) => out.vtep_index = Some(index),
            InfoVxlan::Local(addr) => out.src_addr = Some(IpAddr::V4(addr)),
            InfoVxlan::Local6(addr) => out.src_addr = Some(IpAddr::V6(addr)),
            InfoVxlan::Group(addr) => out.group = Some(IpAddr::V4(addr)),
            InfoVxlan::Group6(addr) => out.group = Some(IpAddr::V6(addr)),
            InfoVxlan::Ttl(ttl) => out.ttl = Some(ttl),
            InfoVxlan::Tos(tos) => out.tos = Some(tos),
            InfoVxlan::Ageing(age) => out.ageing = Some(age),
            InfoVxlan::Limit(limit) => out.limit = Some(limit),
            InfoVxlan::Port(port) => out.port = Some(port),
            InfoVxlan::PortRange(range) => out.port_range = Some(range),
            InfoVxlan::Learning(v) => out.learning = Some(v),
            InfoVxlan::Proxy(v) => out.proxy = Some(v),
            InfoVxlan::Rsc(v) => out.rsc = Some(v),
            InfoVxlan::L2Miss(v) => out.l2miss = Some(v),
            InfoVxlan::L3Miss(v) => out.l3miss = Some(v),
            InfoVxlan::Gbp(v) => out.gbp = Some(v),
            _ => {}
        }
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn vxlan_info_data(spec: &VxlanSpec) -> Vec<InfoVxlan> {
    let mut attrs = vec![InfoVxlan::Id(spec.id)];
    if let Some(index) = spec.vtep_index {
        attrs.push(InfoVxlan::Link(index));
    }
    match spec.src_addr {
        Some(IpAddr::V4(v4)) => attrs.push(InfoVxlan::Local(v4)),
        Some(IpAddr::V6(v6)) => attrs.push(InfoVxlan::Local6(v6)),
        None => {}
    }
    match spec.group {
        Some(IpAddr::V4(v4)) => attrs.push(InfoVxlan::Group(v4)),
        Some(IpAddr::V6(v6)) => attrs.push(InfoVxlan::Group6(v6)),
        None => {}
    }
    if let Some(ttl) = spec.ttl {
        attrs.push(InfoVxlan::Ttl(ttl));
    }
    if let Some(tos) = spec.tos {
        attrs.push(InfoVxlan::Tos(tos));
    }
    if let Some(age) = spec.ageing {
        attrs.push(InfoVxlan::Ageing(age));
    }
    if let Some(limit) = spec.limit {
        attrs.push(InfoVxlan::Limit(limit));
    }
    if let Some(port) = spec.port {
        attrs.push(InfoVxlan::Port(port));
    }
    if let Some(range) = spec.port_range {
        attrs.push(InfoVxlan::PortRange(range));
    }
    if let Some(v) = spec.learning {
        attrs.push(InfoVxlan::Learning(v));
    }
    if let Some(v) = spec.proxy {
        attrs.push(InfoVxlan::Proxy(v));
    }
    if let Some(v) = spec.rsc {
        attrs.push(InfoVxlan::Rsc(v));
    }
    if let Some(v) = spec.l2miss {
        attrs.push(InfoVxlan::L2Miss(v));
    }
    if let Some(v) = spec.l3miss {
        attrs.push(InfoVxlan::L3Miss(v));
    }
    if let Some(v) = spec.gbp {
        attrs.push(InfoVxlan::Gbp(v));
    }
    attrs
}

fn parse_route(msg: &RouteMessage) -> Option<RouteEntry> {
    if msg.header.table != RT_TABLE_MAIN {
        return None;
    }

    let prefix = msg.header.destination_prefix_length;
    let mut dst_ip = None;
    let mut oif = None;
    let mut gateway = None;

    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(addr) => dst_ip = route_addr_ip(addr),
            RouteAttribute::Gateway(addr) => gateway = route_addr_ip(addr),
            RouteAttribute::Oif(index) => oif = Some(*index),
            _ => {}
        }
    }

    let dst_ip = dst_ip.or(match msg.header.address_family {
        AddressFamily::Inet => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        AddressFamily::Inet6 => Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        _ => None,
    })?;

    let dst = IpNet::new(dst_ip, prefix).ok()?;
    Some(RouteEntry {
        dst,
        oif,
        gateway,
        proto: u8::from(msg.header.protocol),
    })
}

fn route_addr_ip(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn build_route_message(spec: &RouteSpec) -> RouteMessage {
    let mut msg = match spec.dst.addr() {
        IpAddr::V4(v4) => {
            let mut builder = RouteMessageBuilder::<Ipv4Addr>::default()
                .destination_prefix(v4, spec.dst.prefix_len());
            if let Some(oif) = spec.oif {
                builder = builder.output_interface(oif);
            }
            if let Some(IpAddr::V4(gw)) = spec.gateway {
                builder = builder.gateway(gw);
            }
            builder.build()
        }
        IpAddr::V6(v6) => {
            let mut builder = RouteMessageBuilder::<Ipv6Addr>::default()
                .destination_prefix(v6, spec.dst.prefix_len());
            if let Some(oif) = spec.oif {
                builder = builder.output_interface(oif);
            }
            if let Some(IpAddr::V6(gw)) = spec.gateway {
                builder = builder.gateway(gw);
            }
            builder.build()
        }
    };
    if let Some(proto) = spec.proto {
        msg.header.protocol = RouteProtocol::from(proto);
    }
    msg
}

impl RtNetlink {
    async fn dump_routes(&self, family: AddressFamily) -> NlResult<Vec<RouteMessage>> {
        let filter = match family {
            AddressFamily::Inet => RouteMessageBuilder::<Ipv4Addr>::default().build(),
            _ => RouteMessageBuilder::<Ipv6Addr>::default().build(),
        };
        let mut stream = self.handle.route().get(filter).execute();
        let mut out = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| map_err(Obj::Route, e))?
        {
            out.push(msg);
        }
        Ok(out)
    }

    async fn dump_routes_for(&self, filter: &RouteFilter) -> NlResult<Vec<RouteMessage>> {
        match filter.dst.map(|d| d.addr().is_ipv4()) {
            Some(true) => self.dump_routes(AddressFamily::Inet).await,
            Some(false) => self.dump_routes(AddressFamily::Inet6).await,
            None => {
                let mut routes = self.dump_routes(AddressFamily::Inet).await?;
                routes.extend(self.dump_routes(AddressFamily::Inet6).await?);
                Ok(routes)
            }
        }
    }
}

#[async_trait]
impl Netlink for RtNetlink {
    async fn link_get(&self, name: &str) -> NlResult<Link> {
        let mut stream = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match stream.try_next().await {
            Ok(Some(msg)) => Ok(parse_link(msg)),
            Ok(None) => Err(NetlinkError::LinkNotFound),
            Err(err) => Err(map_err(Obj::Link, err)),
        }
    }

    async fn link_get_by_index(&self, index: u32) -> NlResult<Link> {
        let mut stream = self.handle.link().get().match_index(index).execute();
        match stream.try_next().await {
            Ok(Some(msg)) => Ok(parse_link(msg)),
            Ok(None) => Err(NetlinkError::LinkNotFound),
            Err(err) => Err(map_err(Obj::Link, err)),
        }
    }

    async fn link_add_vxlan(&self, name: &str, spec: &VxlanSpec) -> NlResult<()> {
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        if let Some(len) = spec.txqlen {
            msg.attributes.push(LinkAttribute::TxQueueLen(len));
        }
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::Vxlan),
            LinkInfo::Data(InfoData::Vxlan(vxlan_info_data(spec))),
        ]));
        self.handle
            .link()
            .add(msg)
            .execute()
            .await
            .map_err(|e| map_err(Obj::Link, e))
    }

    async fn link_add_macvlan(&self, name: &str, parent: u32) -> NlResult<()> {
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.push(LinkAttribute::Link(parent));
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::MacVlan),
            LinkInfo::Data(InfoData::MacVlan(vec![InfoMacVlan::Mode(
                MacVlanMode::Bridge,
            )])),
        ]));
        self.handle
            .link()
            .add(msg)
            .execute()
            .await
            .map_err(|e| map_err(Obj::Link, e))
    }

    async fn link_del(&self, index: u32) -> NlResult<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| map_err(Obj::Link, e))
    }

    async fn link_set_up(&self, index: u32) -> NlResult<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|e| map_err(Obj::Link, e))
    }

    async fn link_set_mtu(&self, index: u32, mtu: u32) -> NlResult<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).mtu(mtu).build())
            .execute()
            .await
            .map_err(|e| map_err(Obj::Link, e))
    }

    async fn link_set_hwaddr(&self, index: u32, hwaddr: Vec<u8>) -> NlResult<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).address(hwaddr).build())
            .execute()
            .await
            .map_err(|e| map_err(Obj::Link, e))
    }

    async fn addr_add(&self, index: u32, addr: IpNet) -> NlResult<()> {
        match self
            .handle
            .address()
            .add(index, addr.addr(), addr.prefix_len())
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => Err(map_err(Obj::Addr, err)),
        }
    }

    async fn addr_list(&self, index: u32) -> NlResult<Vec<IpNet>> {
        use netlink_packet_route::address::AddressAttribute;

        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut out = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(|e| map_err(Obj::Addr, e))? {
            let prefix = msg.header.prefix_len;
            for attr in &msg.attributes {
                if let AddressAttribute::Address(ip) = attr {
                    if let Ok(net) = IpNet::new(*ip, prefix) {
                        out.push(net);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn slave_links(&self, parent: u32) -> NlResult<Vec<Link>> {
        let mut stream = self.handle.link().get().execute();
        let mut out = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(|e| map_err(Obj::Link, e))? {
            let link = parse_link(msg);
            if link.parent == Some(parent) {
                out.push(link);
            }
        }
        Ok(out)
    }

    async fn route_add(&self, route: &RouteSpec) -> NlResult<()> {
        self.handle
            .route()
            .add(build_route_message(route))
            .execute()
            .await
            .map_err(|e| map_err(Obj::Route, e))
    }

    async fn route_del(&self, route: &RouteSpec) -> NlResult<()> {
        let spec_filter = RouteFilter {
            dst: Some(route.dst),
            oif: route.oif,
            gateway: route.gateway,
            proto: route.proto,
        };
        for msg in self.dump_routes_for(&spec_filter).await? {
            let Some(entry) = parse_route(&msg) else {
                continue;
            };
            if !spec_filter.matches(&entry) {
                continue;
            }
            return match self.handle.route().del(msg).execute().await {
                Ok(()) => Ok(()),
                // Already gone, deletion is idempotent.
                Err(rtnetlink::Error::NetlinkError(ref e)) if -e.raw_code() == libc::ESRCH => {
                    Ok(())
                }
                Err(err) => Err(map_err(Obj::Route, err)),
            };
        }
        Ok(())
    }

    async fn route_list(&self, filter: &RouteFilter) -> NlResult<Vec<RouteEntry>> {
        let msgs = self.dump_routes_for(filter).await?;
        Ok(msgs
            .iter()
            .filter_map(parse_route)
            .filter(|entry| filter.matches(entry))
            .collect())
    }
}
