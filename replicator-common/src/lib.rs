//! Types and constants shared between the replicator daemon and its XDP
//! classifier.
//!
//! This crate is `no_std` so the eBPF side can link against it. The
//! userspace daemon enables the `user` feature to get the `aya::Pod`
//! impl needed for map access.

#![no_std]

/// Filter record the daemon writes to `config_map[0]`.
///
/// Both fields are stored in network byte order so the classifier can
/// compare them directly against the wire without conversions.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FilterConfig {
    pub target_ip: u32,
    pub target_port: u16,
    pub _pad: u16,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FilterConfig {}

/// Capacity of `xsks_map`, keyed by RX queue index.
pub const SOCKET_MAP_ENTRIES: u32 = 256;

pub const ETH_P_IP: u16 = 0x0800;
pub const IPPROTO_UDP: u8 = 17;

pub const ETH_HLEN: usize = 14;
pub const IPV4_HLEN_MIN: usize = 20;
pub const UDP_HLEN: usize = 8;
