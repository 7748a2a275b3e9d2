//! UDP control protocol for the destination registry.
//!
//! One datagram per request on a fixed port. Wire format: a 1-byte opcode,
//! then for ADD/REMOVE a 4-byte IPv4 address and 2-byte port, both network
//! byte order. ADD/REMOVE answer a single status byte; LIST answers a
//! count byte followed by (ip, port) pairs. Malformed or unknown requests
//! get no reply.
//!
//! The server runs on its own thread with a 1-second receive timeout so it
//! can observe shutdown.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::registry::{Destination, Registry};

pub const DEFAULT_CONTROL_PORT: u16 = 12345;

const OP_ADD: u8 = 1;
const OP_REMOVE: u8 = 2;
const OP_LIST: u8 = 3;

/// ADD/REMOVE carry opcode + 4-byte IP + 2-byte port.
const OP_ADD_REMOVE_LEN: usize = 7;

/// LIST reports at most this many destinations; the count byte is
/// unsigned.
const MAX_LISTED: usize = 255;

pub struct ControlServer {
    sock: UdpSocket,
    local: SocketAddr,
}

impl ControlServer {
    /// Bind the control socket with SO_REUSEADDR and a 1-second receive
    /// timeout. Port 0 picks an ephemeral port (used by tests).
    pub fn bind(port: u16) -> Result<Self> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("creating control socket")?;
        sock.set_reuse_address(true)
            .context("setting SO_REUSEADDR on control socket")?;
        sock.set_read_timeout(Some(Duration::from_secs(1)))
            .context("setting control socket timeout")?;
        sock.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .with_context(|| format!("binding control socket to port {port}"))?;

        let sock: UdpSocket = sock.into();
        let local = sock.local_addr().context("control socket local address")?;
        Ok(Self { sock, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Serve until the running flag clears.
    pub fn spawn(
        self,
        registry: Arc<Registry>,
        running: Arc<AtomicBool>,
    ) -> Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("control".into())
            .spawn(move || self.run(registry, running))
            .context("spawning control thread")
    }

    fn run(self, registry: Arc<Registry>, running: Arc<AtomicBool>) {
        info!(addr = %self.local, "control protocol listening");

        let mut buf = [0u8; 1024];
        while running.load(Ordering::Relaxed) {
            let (len, peer) = match self.sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    if running.load(Ordering::Relaxed) {
                        warn!(error = %e, "control receive failed");
                    }
                    continue;
                }
            };

            if let Some(reply) = handle_message(&registry, &buf[..len], peer) {
                if let Err(e) = self.sock.send_to(&reply, peer) {
                    warn!(peer = %peer, error = %e, "control reply failed");
                }
            }
        }

        info!("control protocol stopped");
    }
}

/// Dispatch one control datagram. Returns the reply to send, if any.
pub fn handle_message(registry: &Registry, msg: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
    let (&opcode, body) = msg.split_first()?;
    match opcode {
        OP_ADD | OP_REMOVE => {
            if msg.len() < OP_ADD_REMOVE_LEN {
                debug!(opcode, from = %peer, "short control message dropped");
                return None;
            }
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[4], body[5]]);
            let dest = Destination::new(ip, port);

            if opcode == OP_ADD {
                info!(dest = %dest, from = %peer, "control: add destination");
                registry.add(dest);
            } else {
                info!(dest = %dest, from = %peer, "control: remove destination");
                registry.remove(dest);
            }
            Some(vec![1])
        }
        OP_LIST => {
            debug!(from = %peer, "control: list destinations");
            let destinations = registry.snapshot();
            let listed = destinations.len().min(MAX_LISTED);

            let mut reply = Vec::with_capacity(1 + 6 * listed);
            reply.push(listed as u8);
            for dest in &destinations[..listed] {
                reply.extend_from_slice(&dest.ip().octets());
                reply.extend_from_slice(&dest.port().to_be_bytes());
            }
            Some(reply)
        }
        other => {
            warn!(opcode = other, from = %peer, "unknown control opcode dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn add_msg(opcode: u8, ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut msg = vec![opcode];
        msg.extend_from_slice(&ip);
        msg.extend_from_slice(&port.to_be_bytes());
        msg
    }

    #[test]
    fn add_list_remove_round_trip() {
        let registry = Registry::without_arp_priming();

        let reply = handle_message(&registry, &add_msg(OP_ADD, [10, 0, 0, 20], 9100), peer());
        assert_eq!(reply, Some(vec![1]));

        let reply = handle_message(&registry, &[OP_LIST], peer()).unwrap();
        assert_eq!(reply[0], 1);
        assert_eq!(&reply[1..5], &[10, 0, 0, 20]);
        assert_eq!(u16::from_be_bytes([reply[5], reply[6]]), 9100);

        let reply = handle_message(&registry, &add_msg(OP_REMOVE, [10, 0, 0, 20], 9100), peer());
        assert_eq!(reply, Some(vec![1]));

        let reply = handle_message(&registry, &[OP_LIST], peer()).unwrap();
        assert_eq!(reply, vec![0]);
    }

    #[test]
    fn list_is_in_registry_order() {
        let registry = Registry::without_arp_priming();
        handle_message(&registry, &add_msg(OP_ADD, [10, 0, 0, 21], 9101), peer());
        handle_message(&registry, &add_msg(OP_ADD, [10, 0, 0, 20], 9100), peer());

        let reply = handle_message(&registry, &[OP_LIST], peer()).unwrap();
        assert_eq!(reply[0], 2);
        assert_eq!(&reply[1..5], &[10, 0, 0, 20]);
        assert_eq!(&reply[7..11], &[10, 0, 0, 21]);
    }

    #[test]
    fn list_truncates_at_255_destinations() {
        let registry = Registry::without_arp_priming();
        for i in 0..300u16 {
            let ip = [10, 1, (i >> 8) as u8, (i & 0xff) as u8];
            handle_message(&registry, &add_msg(OP_ADD, ip, 9100), peer());
        }
        assert_eq!(registry.len(), 300);

        let reply = handle_message(&registry, &[OP_LIST], peer()).unwrap();
        assert_eq!(reply[0], 255);
        assert_eq!(reply.len(), 1 + 255 * 6);
    }

    #[test]
    fn short_and_empty_messages_get_no_reply() {
        let registry = Registry::without_arp_priming();
        assert_eq!(handle_message(&registry, &[], peer()), None);
        assert_eq!(handle_message(&registry, &[OP_ADD], peer()), None);
        assert_eq!(
            handle_message(&registry, &[OP_ADD, 10, 0, 0, 20, 0x23], peer()),
            None
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_opcode_gets_no_reply() {
        let registry = Registry::without_arp_priming();
        assert_eq!(handle_message(&registry, &[0x7f, 1, 2, 3], peer()), None);
    }

    #[test]
    fn serves_over_a_real_socket() {
        let registry = Arc::new(Registry::without_arp_priming());
        let running = Arc::new(AtomicBool::new(true));

        let server = ControlServer::bind(0).unwrap();
        let server_addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()));
        let handle = server.spawn(registry.clone(), running.clone()).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut buf = [0u8; 2048];

        client
            .send_to(&add_msg(OP_ADD, [10, 0, 0, 20], 9100), server_addr)
            .unwrap();
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1]);

        client.send_to(&[OP_LIST], server_addr).unwrap();
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 10, 0, 0, 20, 0x23, 0x8c]);

        client
            .send_to(&add_msg(OP_REMOVE, [10, 0, 0, 20], 9100), server_addr)
            .unwrap();
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1]);

        client.send_to(&[OP_LIST], server_addr).unwrap();
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0]);

        running.store(false, Ordering::Release);
        handle.join().unwrap();
    }
}
