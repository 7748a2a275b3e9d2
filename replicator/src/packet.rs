//! Frame parsing and synthesis.
//!
//! The worker receives complete L2 frames from the RX ring, extracts the
//! UDP payload, and re-encapsulates it as a fresh Ethernet/IPv4/UDP frame
//! per destination. Both directions are pure functions over byte slices so
//! they are testable without a socket.

use std::net::{Ipv4Addr, SocketAddrV4};

use replicator_common::{ETH_HLEN, ETH_P_IP, IPPROTO_UDP, IPV4_HLEN_MIN, UDP_HLEN};

/// Ethernet + IPv4 (no options) + UDP.
pub const HEADERS_LEN: usize = ETH_HLEN + IPV4_HLEN_MIN + UDP_HLEN;

pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// Fixed IPv4 identification for synthesized frames.
const IP_ID: u16 = 12345;
const IP_TTL: u8 = 64;

/// Locate the UDP payload inside a raw frame.
///
/// Returns `(payload_offset, payload_len)`, or `None` for anything that is
/// not a well-formed IPv4/UDP packet: short frames, other EtherTypes or
/// protocols, a truncated IP header, or a UDP length field inconsistent
/// with the frame.
#[inline]
pub fn parse_udp_payload(frame: &[u8]) -> Option<(usize, usize)> {
    if frame.len() < HEADERS_LEN {
        return None;
    }

    // EtherType at offset 12, big-endian.
    if u16::from_be_bytes([frame[12], frame[13]]) != ETH_P_IP {
        return None;
    }

    let ihl = ((frame[ETH_HLEN] & 0x0f) as usize) * 4;
    if ihl < IPV4_HLEN_MIN {
        return None;
    }
    if frame[ETH_HLEN + 9] != IPPROTO_UDP {
        return None;
    }

    let udp_start = ETH_HLEN + ihl;
    if frame.len() < udp_start + UDP_HLEN {
        return None;
    }

    // The UDP length covers header + payload and must fit the frame.
    let udp_len = u16::from_be_bytes([frame[udp_start + 4], frame[udp_start + 5]]) as usize;
    if udp_len < UDP_HLEN || udp_len > frame.len() - udp_start {
        return None;
    }

    Some((udp_start + UDP_HLEN, udp_len - UDP_HLEN))
}

/// One's-complement sum over the IPv4 header words, folded to 16 bits and
/// inverted. With the checksum field zeroed this produces the header
/// checksum; over a complete header it yields 0 (i.e. `!0xffff`).
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for word in header.chunks_exact(2) {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Write a complete Ethernet/IPv4/UDP frame carrying `payload` into `buf`.
///
/// Returns the total frame length, or `None` when the frame would not fit
/// `buf`. The UDP checksum is left at 0 (optional under IPv4); the IPv4
/// identification is a constant so synthesis stays a pure function of its
/// inputs.
pub fn build_udp_frame(
    buf: &mut [u8],
    dst_mac: &[u8; 6],
    src_mac: &[u8; 6],
    src_ip: Ipv4Addr,
    dst: SocketAddrV4,
    src_port: u16,
    payload: &[u8],
) -> Option<usize> {
    let total = HEADERS_LEN + payload.len();
    if total > buf.len() {
        return None;
    }

    // Ethernet.
    buf[0..6].copy_from_slice(dst_mac);
    buf[6..12].copy_from_slice(src_mac);
    buf[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());

    // IPv4, no options.
    let ip_total = (IPV4_HLEN_MIN + UDP_HLEN + payload.len()) as u16;
    let ip = &mut buf[ETH_HLEN..ETH_HLEN + IPV4_HLEN_MIN];
    ip[0] = 0x45; // version 4, IHL 5
    ip[1] = 0; // TOS
    ip[2..4].copy_from_slice(&ip_total.to_be_bytes());
    ip[4..6].copy_from_slice(&IP_ID.to_be_bytes());
    ip[6..8].copy_from_slice(&[0, 0]); // flags / fragment offset
    ip[8] = IP_TTL;
    ip[9] = IPPROTO_UDP;
    ip[10..12].copy_from_slice(&[0, 0]); // checksum placeholder
    ip[12..16].copy_from_slice(&src_ip.octets());
    ip[16..20].copy_from_slice(&dst.ip().octets());
    let check = ipv4_checksum(ip);
    ip[10..12].copy_from_slice(&check.to_be_bytes());

    // UDP, checksum 0.
    let udp_len = (UDP_HLEN + payload.len()) as u16;
    let udp_start = ETH_HLEN + IPV4_HLEN_MIN;
    let udp = &mut buf[udp_start..udp_start + UDP_HLEN];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
    udp[6..8].copy_from_slice(&[0, 0]);

    buf[HEADERS_LEN..total].copy_from_slice(payload);

    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

    fn dest(ip: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(ip), port)
    }

    fn sample_frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADERS_LEN + payload.len()];
        let n = build_udp_frame(
            &mut buf,
            &DST_MAC,
            &SRC_MAC,
            Ipv4Addr::new(10, 0, 0, 10),
            dest([10, 0, 0, 20], 9100),
            9000,
            payload,
        )
        .unwrap();
        assert_eq!(n, buf.len());
        buf
    }

    #[test]
    fn builds_the_expected_headers() {
        let frame = sample_frame(b"hello");

        assert_eq!(&frame[0..6], &DST_MAC);
        assert_eq!(&frame[6..12], &SRC_MAC);
        assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ETH_P_IP);

        // IPv4: version/IHL, total length, id, TTL, proto, addresses.
        assert_eq!(frame[14], 0x45);
        assert_eq!(u16::from_be_bytes([frame[16], frame[17]]), 20 + 8 + 5);
        assert_eq!(u16::from_be_bytes([frame[18], frame[19]]), 12345);
        assert_eq!(frame[22], 64);
        assert_eq!(frame[23], IPPROTO_UDP);
        assert_eq!(&frame[26..30], &[10, 0, 0, 10]);
        assert_eq!(&frame[30..34], &[10, 0, 0, 20]);

        // UDP: ports and length.
        assert_eq!(u16::from_be_bytes([frame[34], frame[35]]), 9000);
        assert_eq!(u16::from_be_bytes([frame[36], frame[37]]), 9100);
        assert_eq!(u16::from_be_bytes([frame[38], frame[39]]), 8 + 5);
        assert_eq!(&frame[42..], b"hello");
    }

    #[test]
    fn header_checksum_is_self_consistent() {
        let frame = sample_frame(b"payload");
        // Summing all 10 words of a valid header (checksum included) and
        // folding must yield 0xffff.
        let mut sum = 0u32;
        for word in frame[14..34].chunks_exact(2) {
            sum += u16::from_be_bytes([word[0], word[1]]) as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum, 0xffff);
        assert_eq!(ipv4_checksum(&frame[14..34]), 0);
    }

    #[test]
    fn synthesis_is_deterministic() {
        let a = sample_frame(b"same input");
        let b = sample_frame(b"same input");
        assert_eq!(a, b);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let mut buf = vec![0u8; 4096];
        let payload = vec![0xab; 4096 - HEADERS_LEN];
        assert!(build_udp_frame(
            &mut buf,
            &DST_MAC,
            &SRC_MAC,
            Ipv4Addr::new(10, 0, 0, 10),
            dest([10, 0, 0, 20], 9100),
            9000,
            &payload,
        )
        .is_some());

        let too_big = vec![0xab; 4096 - HEADERS_LEN + 1];
        assert!(build_udp_frame(
            &mut buf,
            &DST_MAC,
            &SRC_MAC,
            Ipv4Addr::new(10, 0, 0, 10),
            dest([10, 0, 0, 20], 9100),
            9000,
            &too_big,
        )
        .is_none());
    }

    #[test]
    fn parse_round_trips_the_payload() {
        let frame = sample_frame(b"round trip");
        let (off, len) = parse_udp_payload(&frame).unwrap();
        assert_eq!(&frame[off..off + len], b"round trip");
    }

    #[test]
    fn parse_rejects_short_frames() {
        let frame = sample_frame(b"x");
        assert!(parse_udp_payload(&frame[..40]).is_none());
        assert!(parse_udp_payload(&[]).is_none());
    }

    #[test]
    fn parse_rejects_non_ipv4_ethertype() {
        let mut frame = sample_frame(b"x");
        frame[12] = 0x08;
        frame[13] = 0x06; // ARP
        assert!(parse_udp_payload(&frame).is_none());
    }

    #[test]
    fn parse_rejects_non_udp_protocol() {
        let mut frame = sample_frame(b"x");
        frame[23] = 6; // TCP
        assert!(parse_udp_payload(&frame).is_none());
    }

    #[test]
    fn parse_rejects_bad_ihl() {
        let mut frame = sample_frame(b"x");
        frame[14] = 0x44; // IHL 4 -> 16 bytes, below the minimum
        assert!(parse_udp_payload(&frame).is_none());
    }

    #[test]
    fn parse_rejects_inconsistent_udp_length() {
        let mut frame = sample_frame(b"hello");
        // UDP length claiming more bytes than the frame holds.
        frame[38..40].copy_from_slice(&100u16.to_be_bytes());
        assert!(parse_udp_payload(&frame).is_none());
        // UDP length below the header size.
        frame[38..40].copy_from_slice(&4u16.to_be_bytes());
        assert!(parse_udp_payload(&frame).is_none());
    }

    #[test]
    fn parse_honors_udp_length_over_frame_padding() {
        // A 60-byte minimum Ethernet frame with a 3-byte payload: the UDP
        // length field, not the frame length, bounds the payload.
        let mut frame = sample_frame(b"abc");
        frame.resize(60, 0);
        let (off, len) = parse_udp_payload(&frame).unwrap();
        assert_eq!(len, 3);
        assert_eq!(&frame[off..off + len], b"abc");
    }
}
