//! Local interface lookups without root privileges or netlink
//!
//! The outbound interface is found by connecting an unbound udp socket to a
//! public address. No packet is sent, the kernel only resolves the route and
//! the local address it would use.

use anyhow::{Context, Result, anyhow};
use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use nix::{
    ifaddrs::getifaddrs,
    net::if_::InterfaceFlags,
    sys::socket::SockaddrStorage,
};
use serde::Serialize;
use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddrV4, SocketAddrV6, UdpSocket},
    path::Path,
};

const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Interface currently owning the outbound route
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub ip: IpAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub ethernet: bool,
    #[serde(rename = "static")]
    pub static_config: bool,
    pub ips: Vec<String>,
}

#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait InterfaceProbe: Send + Sync {
    /// Interface carrying the default route
    ///
    /// `Ok(None)` when there is no route at all, e.g. while fully offline.
    fn outbound_interface(&self) -> Result<Option<LocalInterface>>;

    /// Name of the interface `ip` is bound to, if any
    fn interface_for_ip(&self, ip: IpAddr) -> Result<Option<String>>;
}

#[derive(Clone, Debug, Default)]
pub struct SystemInterfaceProbe;

impl InterfaceProbe for SystemInterfaceProbe {
    fn outbound_interface(&self) -> Result<Option<LocalInterface>> {
        let Some(ip) = outbound_ip()? else {
            return Ok(None);
        };

        let name = self
            .interface_for_ip(ip)?
            .ok_or_else(|| anyhow!("found no interface for outbound ip {ip}"))?;

        Ok(Some(LocalInterface { name, ip }))
    }

    fn interface_for_ip(&self, ip: IpAddr) -> Result<Option<String>> {
        Ok(interface_addresses()?
            .into_iter()
            .find(|addr| addr.ip == Some(ip))
            .map(|addr| addr.interface))
    }
}

fn outbound_ip() -> Result<Option<IpAddr>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("failed to bind udp socket")?;

    if let Err(e) = socket.connect(ROUTE_PROBE_ADDR) {
        if matches!(
            e.kind(),
            ErrorKind::NetworkUnreachable | ErrorKind::HostUnreachable
        ) || e.raw_os_error() == Some(nix::libc::ENETUNREACH)
        {
            debug!("no outbound route: {e}");
            return Ok(None);
        }
        return Err(e).context("failed to resolve outbound route");
    }

    let local = socket
        .local_addr()
        .context("failed to read outbound local address")?;

    Ok(Some(local.ip()))
}

/// One `getifaddrs` entry, link-only entries carry no ip
struct InterfaceAddress {
    interface: String,
    ip: Option<IpAddr>,
    prefix: Option<u32>,
    loopback: bool,
}

fn interface_addresses() -> Result<Vec<InterfaceAddress>> {
    let addrs = getifaddrs().context("failed to enumerate network interfaces")?;

    Ok(addrs
        .map(|ifaddr| InterfaceAddress {
            ip: ifaddr.address.as_ref().and_then(socket_ip),
            prefix: ifaddr.netmask.as_ref().and_then(socket_ip).map(prefix_len),
            loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
            interface: ifaddr.interface_name,
        })
        .collect())
}

fn socket_ip(addr: &SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
    }

    addr.as_sockaddr_in6()
        .map(|v6| IpAddr::V6(*SocketAddrV6::from(*v6).ip()))
}

fn prefix_len(mask: IpAddr) -> u32 {
    match mask {
        IpAddr::V4(mask) => u32::from(mask).count_ones(),
        IpAddr::V6(mask) => u128::from(mask).count_ones(),
    }
}

/// Non-loopback interfaces with their ipv4 addresses in cidr notation
///
/// Interfaces without any address are listed with empty `ips`. The ethernet
/// interface is flagged as static when `static_config` exists.
pub fn list_interfaces(ethernet: &str, static_config: &Path) -> Result<Vec<InterfaceInfo>> {
    Ok(group_interfaces(
        interface_addresses()?,
        ethernet,
        static_config.exists(),
    ))
}

fn group_interfaces(
    addrs: Vec<InterfaceAddress>,
    ethernet: &str,
    has_static_config: bool,
) -> Vec<InterfaceInfo> {
    let mut interfaces: Vec<InterfaceInfo> = Vec::new();

    for addr in addrs {
        if addr.loopback {
            continue;
        }

        let index = match interfaces.iter().position(|i| i.name == addr.interface) {
            Some(index) => index,
            None => {
                let is_ethernet = addr.interface == ethernet;
                interfaces.push(InterfaceInfo {
                    ethernet: is_ethernet,
                    static_config: is_ethernet && has_static_config,
                    name: addr.interface.clone(),
                    ips: Vec::new(),
                });
                interfaces.len() - 1
            }
        };

        if let Some(ip) = addr.ip.filter(IpAddr::is_ipv4) {
            let cidr = match addr.prefix {
                Some(prefix) => format!("{ip}/{prefix}"),
                None => ip.to_string(),
            };
            interfaces[index].ips.push(cidr);
        }
    }

    interfaces
}
