//! XDP classifier for the AF_XDP packet replicator.
//!
//! Attached to the XDP hook on the capture interface. Classifies incoming
//! packets:
//! - IPv4/UDP packets whose (dst ip, dst port) match `config_map[0]` →
//!   redirect to the AF_XDP socket registered for the packet's RX queue
//! - Everything else (ARP, TCP, other UDP) → XDP_PASS to the kernel stack
//!
//! An unconfigured `config_map` (all zeroes) matches nothing, so the
//! interface behaves normally until the daemon writes its filter.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{Array, XskMap},
    programs::XdpContext,
};
use replicator_common::{
    FilterConfig, ETH_HLEN, ETH_P_IP, IPPROTO_UDP, IPV4_HLEN_MIN, SOCKET_MAP_ENTRIES, UDP_HLEN,
};

// ---------------------------------------------------------------------------
// eBPF Maps
// ---------------------------------------------------------------------------

/// AF_XDP socket map. The daemon registers one socket fd per RX queue;
/// matching packets are redirected to the socket for the queue they
/// arrived on.
#[allow(non_upper_case_globals)]
#[map]
static xsks_map: XskMap = XskMap::with_max_entries(SOCKET_MAP_ENTRIES, 0);

/// Single-entry filter config: the (ip, port) tuple to intercept, in
/// network byte order.
#[allow(non_upper_case_globals)]
#[map]
static config_map: Array<FilterConfig> = Array::with_max_entries(1, 0);

// ---------------------------------------------------------------------------
// XDP Entry Point
// ---------------------------------------------------------------------------

/// Returns:
/// - `XDP_REDIRECT`: packet handed to the AF_XDP socket for this queue
/// - `XDP_PASS`: packet continues into the normal kernel stack
#[xdp]
pub fn unicast_filter(ctx: XdpContext) -> u32 {
    match try_filter(&ctx) {
        Ok(action) => action,
        Err(_) => xdp_action::XDP_PASS,
    }
}

fn try_filter(ctx: &XdpContext) -> Result<u32, ()> {
    let data = ctx.data();
    let data_end = ctx.data_end();

    // Ethernet header; EtherType is at offset 12, big-endian.
    if data + ETH_HLEN > data_end {
        return Ok(xdp_action::XDP_PASS);
    }
    let ether_type =
        u16::from_be(unsafe { (data as *const u8).add(12).cast::<u16>().read_unaligned() });
    if ether_type != ETH_P_IP {
        return Ok(xdp_action::XDP_PASS);
    }

    // IPv4 header.
    if data + ETH_HLEN + IPV4_HLEN_MIN > data_end {
        return Ok(xdp_action::XDP_PASS);
    }
    let ip = data + ETH_HLEN;
    let ver_ihl: u8 = unsafe { *(ip as *const u8) };
    let protocol: u8 = unsafe { *(ip as *const u8).add(9) };
    if protocol != IPPROTO_UDP {
        return Ok(xdp_action::XDP_PASS);
    }
    let ip_hdr_len = ((ver_ihl & 0x0f) as usize) * 4;
    if ip_hdr_len < IPV4_HLEN_MIN {
        return Ok(xdp_action::XDP_PASS);
    }
    // Destination address at offset 16, already in network byte order.
    let dst_ip: u32 = unsafe { (ip as *const u8).add(16).cast::<u32>().read_unaligned() };

    // UDP header; destination port at offset 2, network byte order.
    let udp = ip + ip_hdr_len;
    if udp + UDP_HLEN > data_end {
        return Ok(xdp_action::XDP_PASS);
    }
    let dst_port: u16 = unsafe { (udp as *const u8).add(2).cast::<u16>().read_unaligned() };

    // Compare against the configured target tuple without byte swapping.
    let config = match config_map.get(0) {
        Some(c) => c,
        None => return Ok(xdp_action::XDP_PASS),
    };
    if dst_ip != config.target_ip || dst_port != config.target_port {
        return Ok(xdp_action::XDP_PASS);
    }

    // Redirect to the AF_XDP socket bound to this RX queue. Queues with no
    // registered socket fall back to XDP_PASS.
    let queue_id = unsafe { (*ctx.ctx).rx_queue_index };
    match xsks_map.redirect(queue_id, xdp_action::XDP_PASS as u64) {
        Ok(action) => Ok(action),
        Err(_) => Ok(xdp_action::XDP_PASS),
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
