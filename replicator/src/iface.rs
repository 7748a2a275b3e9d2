//! Network interface queries: index, MAC and IPv4 address of the capture
//! interface, and neighbor (ARP) lookups for destination MACs.

use std::fs;
use std::io;
use std::mem;
use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};

/// Interface index for a name.
pub fn interface_index(name: &str) -> Result<u32> {
    let idx = nix::net::if_::if_nametoindex(name)
        .with_context(|| format!("interface '{name}' not found"))?;
    Ok(idx)
}

/// Hardware address of an interface (SIOCGIFHWADDR).
pub fn interface_mac(name: &str) -> Result<[u8; 6]> {
    if name.len() >= libc::IFNAMSIZ {
        bail!("interface name '{name}' too long");
    }

    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(io::Error::last_os_error()).context("creating ioctl socket");
    }

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    let ret = unsafe { libc::ioctl(sock, libc::SIOCGIFHWADDR, &mut ifr) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(sock) };
    if ret < 0 {
        return Err(err).with_context(|| format!("SIOCGIFHWADDR on '{name}'"));
    }

    let data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(data.iter()) {
        *dst = *src as u8;
    }
    Ok(mac)
}

/// First IPv4 address configured on an interface.
pub fn interface_ip(name: &str) -> Result<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().context("listing interface addresses")?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Ok(sin.ip());
        }
    }
    bail!("no IPv4 address configured on interface '{name}'")
}

/// Neighbor-table lookup for a destination IP. `Ok(None)` when the kernel
/// has no (or only an incomplete) entry.
pub fn lookup_arp(ip: Ipv4Addr) -> io::Result<Option<[u8; 6]>> {
    let table = fs::read_to_string("/proc/net/arp")?;
    Ok(find_arp_entry(&table, ip))
}

/// Scan `/proc/net/arp` content. Skips the header line and entries whose
/// MAC is all zeroes (incomplete resolution).
fn find_arp_entry(table: &str, ip: Ipv4Addr) -> Option<[u8; 6]> {
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(entry_ip), Some(_hw_type), Some(_flags), Some(mac)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if entry_ip.parse::<Ipv4Addr>().ok() != Some(ip) {
            continue;
        }
        match parse_mac(mac) {
            Some(mac) if mac != [0u8; 6] => return Some(mac),
            _ => continue,
        }
    }
    None
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}
