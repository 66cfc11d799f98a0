//! Kernel network-interface configuration for the data-call path, plus
//! the published resolver/gateway properties.
//!
//! Plain `SIOCSIF*`/`SIOCADDRT` ioctls on an `AF_INET` control socket; the
//! routing we need (host route to the gateway, then default route through
//! it) predates netlink and works on every kernel this daemon meets.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;

use tracing::{info, warn};

/// Point-to-point interfaces get a host mask.
pub const P2P_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

fn ctl_socket() -> io::Result<OwnedFd> {
    // SAFETY: socket() returns a fresh fd that we immediately own.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    // SAFETY: ifreq is plain-old-data; all-zero is a valid value.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let bytes = name.as_bytes();
    if bytes.len() >= ifr.ifr_name.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name too long: {name}"),
        ));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr {
    // SAFETY: sockaddr_in is plain-old-data.
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = 0;
    sin.sin_addr.s_addr = u32::from_ne_bytes(addr.octets());
    // SAFETY: sockaddr_in and sockaddr are layout-compatible prefixes.
    unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

fn set_flags(name: &str, set: libc::c_short, clear: libc::c_short) -> io::Result<()> {
    let sock = ctl_socket()?;
    let mut ifr = ifreq_for(name)?;

    // SAFETY: ifr outlives both ioctls and SIOCGIFFLAGS/SIOCSIFFLAGS read
    // and write only the flags member.
    unsafe {
        if libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr) < 0 {
            return Err(io::Error::last_os_error());
        }
        ifr.ifr_ifru.ifru_flags = (ifr.ifr_ifru.ifru_flags & !clear) | set;
        if libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &ifr) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Bring the interface up.
pub fn interface_up(name: &str) -> io::Result<()> {
    set_flags(name, libc::IFF_UP as libc::c_short, 0)
}

/// Bring the interface down. Idempotent.
pub fn interface_down(name: &str) -> io::Result<()> {
    set_flags(name, 0, libc::IFF_UP as libc::c_short)
}

fn set_sockaddr(name: &str, request: libc::Ioctl, addr: Ipv4Addr) -> io::Result<()> {
    let sock = ctl_socket()?;
    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru.ifru_addr = sockaddr_in(addr);

    // SAFETY: ifr is valid for the duration of the call.
    if unsafe { libc::ioctl(sock.as_raw_fd(), request, &ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_address(name: &str, addr: Ipv4Addr) -> io::Result<()> {
    set_sockaddr(name, libc::SIOCSIFADDR, addr)
}

fn set_netmask(name: &str, mask: Ipv4Addr) -> io::Result<()> {
    set_sockaddr(name, libc::SIOCSIFNETMASK, mask)
}

fn add_route(
    name: &str,
    dst: Ipv4Addr,
    mask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
    host: bool,
) -> io::Result<()> {
    let sock = ctl_socket()?;
    // SAFETY: rtentry is plain-old-data.
    let mut rt: libc::rtentry = unsafe { std::mem::zeroed() };
    rt.rt_dst = sockaddr_in(dst);
    rt.rt_genmask = sockaddr_in(mask);
    rt.rt_flags = libc::RTF_UP;
    if host {
        rt.rt_flags |= libc::RTF_HOST;
    }
    if let Some(gw) = gateway {
        rt.rt_flags |= libc::RTF_GATEWAY;
        rt.rt_gateway = sockaddr_in(gw);
    }
    let mut dev: Vec<libc::c_char> = name
        .as_bytes()
        .iter()
        .map(|&b| b as libc::c_char)
        .chain(std::iter::once(0))
        .collect();
    rt.rt_dev = dev.as_mut_ptr();

    // SAFETY: rt and the device name buffer are valid for the call.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCADDRT, &rt) } < 0 {
        let err = io::Error::last_os_error();
        // An identical route already installed is fine.
        if err.raw_os_error() == Some(libc::EEXIST) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Full bring-up for a fresh data call: interface up, address and
/// point-to-point mask set, host route to the gateway, default route
/// through it, resolver properties published.
pub fn configure(
    name: &str,
    address: Ipv4Addr,
    gateway: Ipv4Addr,
    dns1: Option<Ipv4Addr>,
    dns2: Option<Ipv4Addr>,
    properties: &Properties,
) -> io::Result<()> {
    interface_up(name)?;
    if let Err(e) = set_address(name, address) {
        let _ = interface_down(name);
        return Err(e);
    }
    if let Err(e) = set_netmask(name, P2P_NETMASK) {
        let _ = interface_down(name);
        return Err(e);
    }
    if let Err(e) = add_route(name, gateway, P2P_NETMASK, None, true) {
        let _ = interface_down(name);
        return Err(e);
    }
    if let Err(e) = add_route(name, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, Some(gateway), false)
    {
        warn!("default route via {gateway} failed: {e}");
    }

    properties.publish_data_call(name, Some(gateway), dns1, dns2);
    info!("interface {name} configured: addr {address}, gw {gateway}");
    Ok(())
}

/// Process-wide published properties, the host's view of the data-call
/// network configuration. Values are dotted quads; absent means empty
/// string.
#[derive(Default)]
pub struct Properties {
    values: Mutex<HashMap<String, String>>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        info!("property {key} = \"{value}\"");
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Value for `key`, empty string when never set.
    pub fn get(&self, key: &str) -> String {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Publish gateway and resolver addresses for the given interface.
    pub fn publish_data_call(
        &self,
        iface: &str,
        gateway: Option<Ipv4Addr>,
        dns1: Option<Ipv4Addr>,
        dns2: Option<Ipv4Addr>,
    ) {
        let quad = |v: Option<Ipv4Addr>| v.map(|a| a.to_string()).unwrap_or_default();
        self.set(&format!("net.{iface}.gw"), &quad(gateway));
        self.set(&format!("net.{iface}.dns1"), &quad(dns1));
        self.set(&format!("net.{iface}.dns2"), &quad(dns2));
        self.set("net.dns1", &quad(dns1));
        self.set("net.dns2", &quad(dns2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_roundtrip() {
        let props = Properties::new();
        props.set("net.usb0.gw", "10.0.0.1");
        assert_eq!(props.get("net.usb0.gw"), "10.0.0.1");
        assert_eq!(props.get("net.usb0.dns1"), "");
    }

    #[test]
    fn test_publish_data_call_properties() {
        let props = Properties::new();
        props.publish_data_call(
            "usb0",
            Some(Ipv4Addr::new(10, 0, 0, 1)),
            Some(Ipv4Addr::new(8, 8, 8, 8)),
            None,
        );
        assert_eq!(props.get("net.usb0.gw"), "10.0.0.1");
        assert_eq!(props.get("net.usb0.dns1"), "8.8.8.8");
        assert_eq!(props.get("net.usb0.dns2"), "");
        assert_eq!(props.get("net.dns1"), "8.8.8.8");
        assert_eq!(props.get("net.dns2"), "");
    }

    #[test]
    fn test_ifreq_name_too_long() {
        assert!(ifreq_for("this-name-is-way-too-long").is_err());
        assert!(ifreq_for("usb0").is_ok());
    }

    #[test]
    fn test_sockaddr_in_network_order() {
        let sa = sockaddr_in(Ipv4Addr::new(10, 0, 0, 2));
        // SAFETY: reinterpreting the sockaddr we just built.
        let sin: libc::sockaddr_in = unsafe { std::mem::transmute(sa) };
        assert_eq!(sin.sin_addr.s_addr.to_ne_bytes(), [10, 0, 0, 2]);
    }
}
