//! Packet classification for the scan suppressor.
//!
//! The classifier is a compiled decision function: given a raw frame it
//! returns a tagged verdict the suppressor applies against its own
//! state. Malformed or out-of-scope traffic is always `Forward` — the
//! suppressor never drops what it cannot parse.

use crate::wire::{
    ETHERTYPE_IPV4, ETHERTYPE_IPV6, Ipv4View, PROTO_TCP, PROTO_UDP, TCP_FLAG_ACK, TCP_FLAG_FIN,
    TCP_FLAG_RST, TCP_FLAG_SYN, ipv6_upper_layer, l3_offset, tcp_flags,
};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 prefix, the trusted-network designation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Prefix {
    addr: u32,
    mask: u32,
    len: u8,
}

impl Ipv4Prefix {
    pub fn new(addr: u32, len: u8) -> Self {
        assert!(len <= 32);
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        Self { addr: addr & mask, mask, len }
    }

    /// Parse "a.b.c.d/len"; a bare address is a /32.
    pub fn parse(text: &str) -> Option<Self> {
        let (addr_text, len) = match text.split_once('/') {
            Some((a, l)) => (a, l.parse::<u8>().ok()?),
            None => (text, 32),
        };
        if len > 32 {
            return None;
        }
        let addr = Ipv4Addr::from_str(addr_text).ok()?;
        Some(Self::new(u32::from(addr), len))
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr & self.mask == self.addr
    }
}

impl std::fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.addr), self.len)
    }
}

/// Classification outcome for one frame.
///
/// `port` is the inside endpoint's transport port (source port on
/// egress, destination port on ingress), so both directions of one flow
/// carry the same value; 0 when there is no transport header to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// IPv4, trusted source, untrusted destination.
    Inside { inside: u32, outside: u32, port: u16 },
    /// IPv4, untrusted source, trusted destination.
    Outside { inside: u32, outside: u32, port: u16 },
    /// Everything else: non-IP, malformed, or not crossing the boundary.
    Forward,
}

pub struct Classifier {
    inside: Ipv4Prefix,
}

impl Classifier {
    pub fn new(inside: Ipv4Prefix) -> Self {
        Self { inside }
    }

    pub fn inside_network(&self) -> Ipv4Prefix {
        self.inside
    }

    pub fn classify(&self, frame: &[u8]) -> Verdict {
        let Some((ethertype, l3)) = l3_offset(frame) else {
            return Verdict::Forward;
        };
        if ethertype != ETHERTYPE_IPV4 {
            return Verdict::Forward;
        }
        let Some(ip) = Ipv4View::new(&frame[l3..]) else {
            return Verdict::Forward;
        };
        let src = ip.src();
        let dst = ip.dst();
        match (self.inside.contains(src), self.inside.contains(dst)) {
            (true, false) => Verdict::Inside {
                inside: src,
                outside: dst,
                port: inside_port(ip, &frame[l3..], true),
            },
            (false, true) => Verdict::Outside {
                inside: dst,
                outside: src,
                port: inside_port(ip, &frame[l3..], false),
            },
            _ => Verdict::Forward,
        }
    }
}

/// The inside endpoint's transport port, or 0 when unreadable
/// (non-TCP/UDP, or a non-first fragment with no transport header).
fn inside_port(ip: Ipv4View<'_>, l3: &[u8], inside_is_source: bool) -> u16 {
    if ip.fragment_offset() != 0 {
        return 0;
    }
    match ip.protocol() {
        PROTO_TCP | PROTO_UDP => {}
        _ => return 0,
    }
    let l4 = &l3[ip.header_len()..];
    let at = if inside_is_source { 0 } else { 2 };
    match l4.get(at..at + 2) {
        Some(b) => u16::from_be_bytes([b[0], b[1]]),
        None => 0,
    }
}

/// Transport protocol and L4 header slice, for IPv4 and IPv6 frames.
/// Non-first fragments have no transport header and yield `None`.
fn upper_layer(frame: &[u8]) -> Option<(u8, &[u8])> {
    let (ethertype, l3) = l3_offset(frame)?;
    match ethertype {
        ETHERTYPE_IPV4 => {
            let ip = Ipv4View::new(&frame[l3..])?;
            if ip.fragment_offset() != 0 {
                return None;
            }
            Some((ip.protocol(), frame.get(l3 + ip.header_len()..)?))
        }
        ETHERTYPE_IPV6 => {
            let (proto, at) = ipv6_upper_layer(&frame[l3..])?;
            Some((proto, frame.get(l3 + at..)?))
        }
        _ => None,
    }
}

/// TCP packets that cannot open a new flow: RST, FIN, or SYN+ACK.
/// Dropping an unsolicited one costs nothing, so they never count as
/// connection attempts.
pub fn is_hygiene(frame: &[u8]) -> bool {
    match upper_layer(frame) {
        Some((PROTO_TCP, l4)) => match tcp_flags(l4) {
            Some(flags) => {
                flags & (TCP_FLAG_RST | TCP_FLAG_FIN) != 0
                    || (flags & TCP_FLAG_SYN != 0 && flags & TCP_FLAG_ACK != 0)
            }
            None => false,
        },
        _ => false,
    }
}

/// Packets that would open a new flow from a blocked source: any UDP,
/// or a TCP SYN.
pub fn is_block_sensitive(frame: &[u8]) -> bool {
    match upper_layer(frame) {
        Some((PROTO_UDP, _)) => true,
        Some((PROTO_TCP, l4)) => tcp_flags(l4).is_some_and(|flags| flags & TCP_FLAG_SYN != 0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ETHER_HEADER_LEN;

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, flags: u8) -> Vec<u8> {
        let mut f = vec![0u8; ETHER_HEADER_LEN];
        f[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&40u16.to_be_bytes());
        ip[8] = 64;
        ip[9] = PROTO_TCP;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        f.extend_from_slice(&ip);
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&sport.to_be_bytes());
        tcp[2..4].copy_from_slice(&dport.to_be_bytes());
        tcp[13] = flags;
        f.extend_from_slice(&tcp);
        f
    }

    #[test]
    fn test_prefix_parse_and_contains() {
        let p = Ipv4Prefix::parse("10.0.0.0/8").unwrap();
        assert!(p.contains(u32::from_be_bytes([10, 1, 2, 3])));
        assert!(!p.contains(u32::from_be_bytes([11, 0, 0, 1])));

        let host = Ipv4Prefix::parse("192.0.2.1").unwrap();
        assert!(host.contains(u32::from_be_bytes([192, 0, 2, 1])));
        assert!(!host.contains(u32::from_be_bytes([192, 0, 2, 2])));

        assert!(Ipv4Prefix::parse("10.0.0.0/33").is_none());
        assert!(Ipv4Prefix::parse("not an address").is_none());
    }

    #[test]
    fn test_classify_directions() {
        let c = Classifier::new(Ipv4Prefix::parse("10.0.0.0/8").unwrap());

        let egress = tcp_frame([10, 0, 0, 1], [192, 0, 2, 1], 4321, 80, TCP_FLAG_SYN);
        match c.classify(&egress) {
            Verdict::Inside { inside, outside, port } => {
                assert_eq!(inside, u32::from_be_bytes([10, 0, 0, 1]));
                assert_eq!(outside, u32::from_be_bytes([192, 0, 2, 1]));
                assert_eq!(port, 4321);
            }
            other => panic!("expected Inside, got {:?}", other),
        }

        let ingress = tcp_frame([192, 0, 2, 1], [10, 0, 0, 1], 80, 4321, TCP_FLAG_ACK);
        match c.classify(&ingress) {
            Verdict::Outside { inside, outside, port } => {
                assert_eq!(inside, u32::from_be_bytes([10, 0, 0, 1]));
                assert_eq!(outside, u32::from_be_bytes([192, 0, 2, 1]));
                // Destination port: the inside endpoint's, same as egress.
                assert_eq!(port, 4321);
            }
            other => panic!("expected Outside, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_forwards_everything_else() {
        let c = Classifier::new(Ipv4Prefix::parse("10.0.0.0/8").unwrap());

        // Both inside.
        let f = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 0);
        assert_eq!(c.classify(&f), Verdict::Forward);
        // Both outside.
        let f = tcp_frame([192, 0, 2, 1], [198, 51, 100, 1], 1, 2, 0);
        assert_eq!(c.classify(&f), Verdict::Forward);
        // Truncated frame.
        assert_eq!(c.classify(&[0u8; 6]), Verdict::Forward);
        // Non-IP ethertype.
        let mut f = vec![0u8; 20];
        f[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(c.classify(&f), Verdict::Forward);
    }

    #[test]
    fn test_hygiene_filter() {
        let rst = tcp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, TCP_FLAG_RST);
        assert!(is_hygiene(&rst));
        let fin = tcp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, TCP_FLAG_FIN | TCP_FLAG_ACK);
        assert!(is_hygiene(&fin));
        let synack = tcp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, TCP_FLAG_SYN | TCP_FLAG_ACK);
        assert!(is_hygiene(&synack));
        let syn = tcp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, TCP_FLAG_SYN);
        assert!(!is_hygiene(&syn));
        let ack = tcp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, TCP_FLAG_ACK);
        assert!(!is_hygiene(&ack));
    }

    #[test]
    fn test_block_sensitive_filter() {
        let syn = tcp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, TCP_FLAG_SYN);
        assert!(is_block_sensitive(&syn));
        let ack = tcp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, TCP_FLAG_ACK);
        assert!(!is_block_sensitive(&ack));

        let mut udp = tcp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, 0);
        udp[ETHER_HEADER_LEN + 9] = PROTO_UDP;
        assert!(is_block_sensitive(&udp));
    }

    #[test]
    fn test_filters_walk_ipv6() {
        // IPv6 TCP RST behind a hop-by-hop header.
        let mut f = vec![0u8; 12];
        f.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        let mut l3 = vec![0u8; 40];
        l3[0] = 0x60;
        l3[6] = 0; // hop-by-hop
        l3.extend_from_slice(&[PROTO_TCP, 0]);
        l3.extend_from_slice(&[0u8; 6]);
        let mut tcp = vec![0u8; 20];
        tcp[13] = TCP_FLAG_RST;
        l3.extend_from_slice(&tcp);
        f.extend_from_slice(&l3);
        assert!(is_hygiene(&f));
        assert!(!is_block_sensitive(&f));
    }
}
