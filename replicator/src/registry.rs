//! Runtime-mutable destination set.
//!
//! An ordered set of (IPv4, UDP port) tuples behind a mutex. The control
//! server mutates it; workers take a snapshot once per received batch and
//! iterate the copy without holding the lock.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::iface;

/// Scratch port the ARP-priming probe is aimed at.
const ARP_PROBE_PORT: u16 = 12346;

/// One replication target, totally ordered by (ip, port).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Destination {
    addr: SocketAddrV4,
}

impl Destination {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            addr: SocketAddrV4::new(ip, port),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn sock_addr(&self) -> SocketAddrV4 {
        self.addr
    }
}

impl Ord for Destination {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ip().octets(), self.port()).cmp(&(other.ip().octets(), other.port()))
    }
}

impl PartialOrd for Destination {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

pub struct Registry {
    destinations: Mutex<BTreeSet<Destination>>,
    prime_arp: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            destinations: Mutex::new(BTreeSet::new()),
            prime_arp: true,
        }
    }

    /// A registry that skips the ARP probe on insert.
    #[cfg(test)]
    pub fn without_arp_priming() -> Self {
        Self {
            destinations: Mutex::new(BTreeSet::new()),
            prime_arp: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<Destination>> {
        self.destinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a destination. Returns false when it was already present.
    /// New destinations get a best-effort ARP prime so the first replicated
    /// frame can carry a resolved MAC.
    pub fn add(&self, dest: Destination) -> bool {
        let inserted = self.lock().insert(dest);
        if inserted {
            info!(dest = %dest, "added destination");
            if self.prime_arp {
                prime_arp(dest.ip());
            }
        }
        inserted
    }

    /// Remove a destination. Returns false when it was not present.
    pub fn remove(&self, dest: Destination) -> bool {
        let removed = self.lock().remove(&dest);
        if removed {
            info!(dest = %dest, "removed destination");
        }
        removed
    }

    /// Copy of the current set, in (ip, port) order.
    pub fn snapshot(&self) -> Vec<Destination> {
        self.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Nudge the kernel into resolving a neighbor by sending it a tiny
/// datagram, then give the resolution a moment to land.
fn prime_arp(ip: Ipv4Addr) {
    let probe = (|| {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        sock.send_to(b"ARP", (ip, ARP_PROBE_PORT))
    })();

    match probe {
        Ok(_) => {
            thread::sleep(Duration::from_millis(100));
            match iface::lookup_arp(ip) {
                Ok(Some(mac)) => debug!(
                    ip = %ip,
                    mac = %format_args!(
                        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
                    ),
                    "neighbor resolved"
                ),
                Ok(None) => debug!(ip = %ip, "neighbor resolution still pending"),
                Err(e) => debug!(ip = %ip, error = %e, "could not read ARP table"),
            }
        }
        Err(e) => warn!(ip = %ip, error = %e, "ARP probe failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(last_octet: u8, port: u16) -> Destination {
        Destination::new(Ipv4Addr::new(10, 0, 0, last_octet), port)
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let registry = Registry::without_arp_priming();

        assert!(registry.add(dest(20, 9100)));
        assert!(!registry.add(dest(20, 9100)));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(dest(20, 9100)));
        assert!(!registry.remove(dest(20, 9100)));
        assert!(registry.is_empty());
    }

    #[test]
    fn add_then_remove_restores_the_registry() {
        let registry = Registry::without_arp_priming();
        registry.add(dest(1, 9000));
        let before = registry.snapshot();

        registry.add(dest(20, 9100));
        registry.remove(dest(20, 9100));
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn snapshot_is_ordered_by_ip_then_port() {
        let registry = Registry::without_arp_priming();
        registry.add(dest(21, 9101));
        registry.add(dest(20, 9200));
        registry.add(dest(20, 9100));

        let snap = registry.snapshot();
        assert_eq!(
            snap,
            vec![dest(20, 9100), dest(20, 9200), dest(21, 9101)]
        );
    }

    #[test]
    fn snapshots_are_immune_to_later_mutation() {
        let registry = Registry::without_arp_priming();
        registry.add(dest(20, 9100));

        let snap = registry.snapshot();
        registry.add(dest(21, 9101));
        registry.remove(dest(20, 9100));

        assert_eq!(snap, vec![dest(20, 9100)]);
    }
}
