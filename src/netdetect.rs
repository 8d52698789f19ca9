use anyhow::{anyhow, Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Determine the local IPv4 address the kernel would use to reach `probe`.
///
/// Uses an unconnected-then-connected UDP socket (no datagram is sent) and
/// falls back to the first non-loopback interface address.
pub fn detect_source_ipv4(probe: Ipv4Addr) -> Result<Ipv4Addr> {
    match route_source(probe) {
        Some(ip) => Ok(ip),
        None => first_interface_ipv4()?
            .ok_or_else(|| anyhow!("no non-loopback IPv4 interface address found")),
    }
}

fn route_source(probe: Ipv4Addr) -> Option<Ipv4Addr> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    sock.connect((probe, 80)).ok()?;
    match sock.local_addr().ok()?.ip() {
        IpAddr::V4(v4) if !v4.is_unspecified() => Some(v4),
        _ => None,
    }
}

/// First non-loopback IPv4 address on any interface, in interface order.
pub fn first_interface_ipv4() -> Result<Option<Ipv4Addr>> {
    let ifaces = get_if_addrs().context("failed to enumerate network interfaces")?;
    Ok(ifaces.into_iter().find_map(|iface| match iface.addr {
        IfAddr::V4(v4) if !v4.ip.is_loopback() => Some(v4.ip),
        _ => None,
    }))
}

/// Expand a CIDR into individual IPv4 host addresses.
///
/// Excludes the network and broadcast addresses for prefixes shorter than
/// /31; /31 and /32 yield every address. IPv6 networks yield nothing.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Vec<Ipv4Addr> {
    match cidr {
        IpNet::V4(n4) => expand_ipv4net_hosts(n4),
        IpNet::V6(_) => Vec::new(),
    }
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}
