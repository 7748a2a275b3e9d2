//! Per-queue replication worker.
//!
//! Each worker owns one AF_XDP socket and loops: receive a batch, parse
//! each frame down to its UDP payload, then for every destination in the
//! registry snapshot synthesize a fresh frame into a TX slot and submit
//! it. RX frames go back to the fill ring after the batch. When the
//! zero-copy path refuses a send the worker falls back to a conventional
//! UDP socket so the datagram still goes out.
//!
//! Per-packet failures are counted, never fatal; a failed destination does
//! not skip the remaining ones.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::metrics::Stats;
use crate::packet;
use crate::registry::{Destination, Registry};
use crate::xsk::XskSocket;

/// Packets pulled off the RX ring per iteration.
pub const WORKER_BATCH: u32 = 64;

/// Empty polls before the worker briefly sleeps instead of spinning.
const IDLE_SPINS: u32 = 1024;
const IDLE_SLEEP: Duration = Duration::from_micros(50);

pub struct WorkerConfig {
    pub queue_id: usize,
    /// MAC of the capture interface, used as the source of synthesized
    /// frames.
    pub src_mac: [u8; 6],
    /// Source IP for synthesized frames: the interface address, or the
    /// listen address when the interface has none.
    pub src_ip: Ipv4Addr,
    /// Listen port, used as the source port of synthesized frames.
    pub listen_port: u16,
}

pub struct Worker {
    cfg: WorkerConfig,
    sock: XskSocket,
    registry: Arc<Registry>,
    stats: Arc<Stats>,
    fallback: UdpSocket,
    /// Destination MAC cache; unresolved entries hold the broadcast MAC
    /// and are warned about once.
    mac_cache: HashMap<Ipv4Addr, [u8; 6]>,
    rx_batch: Vec<(u64, u32)>,
    /// Staging buffer for the payload being fanned out.
    scratch: Vec<u8>,
}

impl Worker {
    pub fn new(
        cfg: WorkerConfig,
        sock: XskSocket,
        registry: Arc<Registry>,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        let fallback = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("creating fallback send socket")?;
        fallback
            .set_nonblocking(true)
            .context("setting fallback socket non-blocking")?;

        let frame_size = sock.frame_size() as usize;
        Ok(Self {
            cfg,
            sock,
            registry,
            stats,
            fallback: fallback.into(),
            mac_cache: HashMap::new(),
            rx_batch: Vec::with_capacity(WORKER_BATCH as usize),
            scratch: Vec::with_capacity(frame_size),
        })
    }

    /// Serve until the running flag clears, then close the socket.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        info!(queue_id = self.cfg.queue_id, "worker started");

        let mut idle = 0u32;
        while running.load(Ordering::Relaxed) {
            if self.poll_once() > 0 {
                idle = 0;
            } else if idle < IDLE_SPINS {
                idle += 1;
                std::hint::spin_loop();
            } else {
                thread::sleep(IDLE_SLEEP);
            }
        }

        self.sock.close();
        info!(queue_id = self.cfg.queue_id, "worker stopped");
    }

    /// One receive → replicate → recycle iteration. Returns the number of
    /// packets taken off the RX ring.
    pub fn poll_once(&mut self) -> usize {
        let received = self.sock.receive(WORKER_BATCH, &mut self.rx_batch);
        if received == 0 {
            return 0;
        }

        // One snapshot per batch; the lock is not held while sending.
        let destinations = self.registry.snapshot();
        let queue_id = self.cfg.queue_id;

        for i in 0..received {
            let (addr, len) = self.rx_batch[i];
            self.stats
                .queue(queue_id)
                .packets_received
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_received
                .fetch_add(len as u64, Ordering::Relaxed);

            // The classifier should only redirect our IPv4/UDP tuple, but
            // parse defensively anyway.
            let staged = match self.sock.frame(addr, len) {
                Some(frame) => match packet::parse_udp_payload(frame) {
                    Some((offset, payload_len)) => {
                        self.scratch.clear();
                        self.scratch
                            .extend_from_slice(&frame[offset..offset + payload_len]);
                        true
                    }
                    None => false,
                },
                None => false,
            };
            if !staged {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut sent = 0u64;
            for dest in &destinations {
                if self.replicate_to(*dest) {
                    sent += 1;
                }
            }
            if sent > 0 {
                self.stats
                    .queue(queue_id)
                    .packets_sent
                    .fetch_add(sent, Ordering::Relaxed);
                self.stats
                    .bytes_sent
                    .fetch_add(sent * self.scratch.len() as u64, Ordering::Relaxed);
            }
        }

        self.sock.recycle_frames();
        received
    }

    /// Send the staged payload to one destination: zero-copy when the TX
    /// path has room, conventional socket otherwise.
    fn replicate_to(&mut self, dest: Destination) -> bool {
        let dst_mac = self.dest_mac(dest.ip());

        let frame_nb = self.sock.next_tx_frame();
        let addr = self.sock.tx_frame_addr(frame_nb);
        let written = packet::build_udp_frame(
            self.sock.tx_frame_mut(frame_nb),
            &dst_mac,
            &self.cfg.src_mac,
            self.cfg.src_ip,
            dest.sock_addr(),
            self.cfg.listen_port,
            &self.scratch,
        );
        let Some(total_len) = written else {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            debug!(dest = %dest, payload = self.scratch.len(), "payload too large for a frame");
            return false;
        };

        if self.sock.send_one(addr, total_len as u32) == 1 {
            return true;
        }

        // Ring full after a completion drain: hand the payload to the
        // kernel's UDP stack instead of dropping it.
        self.stats.fallback_sends.fetch_add(1, Ordering::Relaxed);
        match self
            .fallback
            .send_to(&self.scratch, SocketAddr::V4(dest.sock_addr()))
        {
            Ok(_) => true,
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                debug!(dest = %dest, error = %e, "fallback send failed");
                false
            }
        }
    }

    fn dest_mac(&mut self, ip: Ipv4Addr) -> [u8; 6] {
        if let Some(mac) = self.mac_cache.get(&ip) {
            return *mac;
        }
        let mac = match crate::iface::lookup_arp(ip) {
            Ok(Some(mac)) => mac,
            Ok(None) => {
                warn!(ip = %ip, "no ARP entry, using broadcast MAC");
                packet::BROADCAST_MAC
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "ARP table unreadable, using broadcast MAC");
                packet::BROADCAST_MAC
            }
        };
        self.mac_cache.insert(ip, mac);
        mac
    }

    #[cfg(test)]
    fn cache_mac(&mut self, ip: Ipv4Addr, mac: [u8; 6]) {
        self.mac_cache.insert(ip, mac);
    }

    #[cfg(test)]
    fn socket_mut(&mut self) -> &mut XskSocket {
        &mut self.sock
    }
}
