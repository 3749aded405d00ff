//! Subnet arithmetic for the address selector.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use rand::Rng;

/// The address as a host route, `/32` or `/128` depending on family.
pub fn host_net(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

/// The address carrying its subnet's prefix length, e.g. `10.1.0.7/24`.
pub fn in_subnet(addr: IpAddr, subnet: &IpNet) -> Option<IpNet> {
    IpNet::new(addr, subnet.prefix_len()).ok()
}

fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_u128(value: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

/// Number of addresses in the subnet, saturating at `u128::MAX` for `::/0`.
fn pool_size(subnet: &IpNet) -> u128 {
    let host_bits = u32::from(subnet.max_prefix_len() - subnet.prefix_len());
    if host_bits >= 128 {
        u128::MAX
    } else {
        1u128 << host_bits
    }
}

/// Pick a random address uniformly within `subnet`, excluding the first
/// `exclude_first` and the last `exclude_last` addresses of the range.
///
/// Returns `None` when the exclusions leave an empty range.
pub fn random_addr(subnet: &IpNet, exclude_first: u32, exclude_last: u32) -> Option<IpAddr> {
    let size = pool_size(subnet);
    let lo = u128::from(exclude_first);
    let hi = size.checked_sub(1 + u128::from(exclude_last))?;
    if lo > hi {
        return None;
    }

    let offset = rand::thread_rng().gen_range(lo..=hi);
    let base = to_u128(IpAddr::from(subnet.network()));
    Some(from_u128(base + offset, subnet.addr().is_ipv4()))
}
