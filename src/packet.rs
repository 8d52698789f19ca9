//! IPv4 + TCP header encoding and decoding by explicit byte offsets.
//!
//! Only the fixed 20-byte IPv4 header and the fixed 20-byte TCP header are
//! produced. Inbound packets may carry IP or TCP options; the parser honours
//! the IHL field and ignores everything after the TCP flags.

use std::net::{IpAddr, Ipv4Addr};

use rand::Rng;

use crate::error::{Result, ScanError};

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const PACKET_LEN: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;

pub const IPPROTO_TCP: u8 = 6;
pub const DEFAULT_TTL: u8 = 64;
pub const SYN_WINDOW: u16 = 5840;

/// Ephemeral range for probe source ports.
pub const SOURCE_PORT_MIN: u16 = 10_000;
pub const SOURCE_PORT_MAX: u16 = 65_535;

pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// Every field of a 40-byte IPv4+TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpec {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub ip_id: u16,
    pub ttl: u8,
}

impl SegmentSpec {
    /// A SYN with random IP-ID and ISN.
    pub fn syn(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            seq: rng.gen(),
            ack: 0,
            flags: flags::SYN,
            window: SYN_WINDOW,
            ip_id: rng.gen(),
            ttl: DEFAULT_TTL,
        }
    }
}

/// Pick a random probe source port from the ephemeral range.
pub fn random_source_port() -> u16 {
    rand::thread_rng().gen_range(SOURCE_PORT_MIN..=SOURCE_PORT_MAX)
}

/// Build a SYN probe for `dst:dst_port` from `src:src_port`.
///
/// Both addresses must be IPv4.
pub fn build_syn(src: IpAddr, dst: IpAddr, dst_port: u16, src_port: u16) -> Result<[u8; PACKET_LEN]> {
    let (src, dst) = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => (s, d),
        (s, d) => {
            return Err(ScanError::Encode(format!(
                "SYN probes are IPv4 only (source {s}, destination {d})"
            )))
        }
    };
    Ok(encode_segment(&SegmentSpec::syn(src, dst, src_port, dst_port)))
}

/// Encode a segment with both checksums filled in.
pub fn encode_segment(spec: &SegmentSpec) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];

    // IPv4 header
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(PACKET_LEN as u16).to_be_bytes());
    packet[4..6].copy_from_slice(&spec.ip_id.to_be_bytes());
    // flags + fragment offset stay zero
    packet[8] = spec.ttl;
    packet[9] = IPPROTO_TCP;
    packet[12..16].copy_from_slice(&spec.src_ip.octets());
    packet[16..20].copy_from_slice(&spec.dst_ip.octets());

    // TCP header
    let tcp = &mut packet[IPV4_HEADER_LEN..];
    tcp[0..2].copy_from_slice(&spec.src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&spec.dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&spec.seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&spec.ack.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = spec.flags;
    tcp[14..16].copy_from_slice(&spec.window.to_be_bytes());
    // checksum 16..18 and urgent pointer 18..20 stay zero

    let tcp_sum = tcp_checksum(&packet[IPV4_HEADER_LEN..], spec.src_ip, spec.dst_ip);
    packet[IPV4_HEADER_LEN + 16..IPV4_HEADER_LEN + 18].copy_from_slice(&tcp_sum.to_be_bytes());

    let ip_sum = checksum(&packet[..IPV4_HEADER_LEN]);
    packet[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    packet
}

/// One's-complement sum of big-endian 16-bit words, unfolded.
fn ones_complement_sum(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    // odd trailing byte is padded with zero
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum (RFC 1071) over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    fold(ones_complement_sum(data, 0))
}

/// TCP checksum over the 12-byte IPv4 pseudo-header and `segment`.
///
/// The checksum field inside `segment` must be zero when building, or hold
/// the transmitted value when verifying (the result is then zero).
pub fn tcp_checksum(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = IPPROTO_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = ones_complement_sum(&pseudo, 0);
    fold(ones_complement_sum(segment, sum))
}

/// True when the IPv4 header checksum of `packet` is valid.
pub fn verify_ipv4_checksum(packet: &[u8]) -> bool {
    let Some(ihl) = header_len(packet) else {
        return false;
    };
    checksum(&packet[..ihl]) == 0
}

/// True when the TCP checksum of `packet` (a full IPv4 datagram) is valid.
pub fn verify_tcp_checksum(packet: &[u8]) -> bool {
    let Some(ihl) = header_len(packet) else {
        return false;
    };
    let total = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total < ihl + TCP_HEADER_LEN || total > packet.len() {
        return false;
    }
    let (src, dst) = addresses(packet);
    tcp_checksum(&packet[ihl..total], src, dst) == 0
}

/// Decoded fields of an inbound TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpReply {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
}

impl TcpReply {
    pub fn is_syn_ack(&self) -> bool {
        self.flags & (flags::SYN | flags::ACK) == flags::SYN | flags::ACK
    }
}

/// Parse an IPv4 datagram carrying TCP. Returns `None` for anything short,
/// malformed, fragmented past the first fragment, or not TCP.
pub fn parse_tcp_reply(packet: &[u8]) -> Option<TcpReply> {
    let ihl = header_len(packet)?;
    if packet[9] != IPPROTO_TCP {
        return None;
    }
    let frag_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff;
    if frag_offset != 0 {
        return None;
    }
    let tcp = packet.get(ihl..ihl + TCP_HEADER_LEN)?;
    let (src_ip, dst_ip) = addresses(packet);
    Some(TcpReply {
        src_ip,
        dst_ip,
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        flags: tcp[13],
    })
}

/// Parse and keep only SYN+ACK segments.
pub fn parse_syn_ack(packet: &[u8]) -> Option<TcpReply> {
    parse_tcp_reply(packet).filter(TcpReply::is_syn_ack)
}

fn header_len(packet: &[u8]) -> Option<usize> {
    let first = *packet.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = (first & 0x0f) as usize * 4;
    if ihl < IPV4_HEADER_LEN || packet.len() < ihl {
        return None;
    }
    Some(ihl)
}

fn addresses(packet: &[u8]) -> (Ipv4Addr, Ipv4Addr) {
    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    (src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[test]
    fn syn_layout() {
        let pkt = build_syn(SRC.into(), DST.into(), 443, 40000).unwrap();
        assert_eq!(pkt[0], 0x45);
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), 40);
        assert_eq!(pkt[8], 64);
        assert_eq!(pkt[9], 6);
        assert_eq!(&pkt[12..16], &SRC.octets());
        assert_eq!(&pkt[16..20], &DST.octets());
        assert_eq!(u16::from_be_bytes([pkt[20], pkt[21]]), 40000);
        assert_eq!(u16::from_be_bytes([pkt[22], pkt[23]]), 443);
        assert_eq!(&pkt[28..32], &[0, 0, 0, 0]);
        assert_eq!(pkt[32], 0x50);
        assert_eq!(pkt[33], flags::SYN);
        assert_eq!(u16::from_be_bytes([pkt[34], pkt[35]]), 5840);
        assert_eq!(&pkt[38..40], &[0, 0]);
    }

    #[test]
    fn syn_checksums_verify() {
        for port in [1u16, 22, 443, 65535] {
            let pkt = build_syn(SRC.into(), DST.into(), port, random_source_port()).unwrap();
            assert!(verify_ipv4_checksum(&pkt));
            assert!(verify_tcp_checksum(&pkt));
        }
    }

    #[test]
    fn ipv6_rejected() {
        let v6: IpAddr = "::1".parse().unwrap();
        assert!(matches!(
            build_syn(SRC.into(), v6, 80, 40000),
            Err(ScanError::Encode(_))
        ));
    }

    #[test]
    fn checksum_rfc1071_example() {
        // Sample from RFC 1071 section 3: sum 0x2ddf0 folds to 0xddf2.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn odd_length_padded_with_zero() {
        assert_eq!(checksum(&[0x12, 0x34, 0x56]), checksum(&[0x12, 0x34, 0x56, 0x00]));
    }

    #[test]
    fn source_port_in_ephemeral_range() {
        for _ in 0..1000 {
            assert!(random_source_port() >= SOURCE_PORT_MIN);
        }
    }

    #[test]
    fn parse_syn_ack_reply() {
        let reply = encode_segment(&SegmentSpec {
            src_ip: DST,
            dst_ip: SRC,
            src_port: 22,
            dst_port: 40000,
            seq: 7,
            ack: 1,
            flags: flags::SYN | flags::ACK,
            window: 65535,
            ip_id: 1,
            ttl: 57,
        });
        let parsed = parse_syn_ack(&reply).unwrap();
        assert_eq!(parsed.src_ip, DST);
        assert_eq!(parsed.src_port, 22);
        assert_eq!(parsed.dst_port, 40000);
    }

    #[test]
    fn rst_and_bare_syn_are_not_syn_ack() {
        let mut spec = SegmentSpec::syn(DST, SRC, 22, 40000);
        assert!(parse_syn_ack(&encode_segment(&spec)).is_none());
        spec.flags = flags::RST | flags::ACK;
        assert!(parse_syn_ack(&encode_segment(&spec)).is_none());
    }

    #[test]
    fn short_and_garbage_packets_ignored() {
        assert!(parse_tcp_reply(&[]).is_none());
        assert!(parse_tcp_reply(&[0x45; 30]).is_none());
        let mut v6ish = encode_segment(&SegmentSpec::syn(DST, SRC, 1, 2));
        v6ish[0] = 0x65;
        assert!(parse_tcp_reply(&v6ish).is_none());
        let mut udp = encode_segment(&SegmentSpec::syn(DST, SRC, 1, 2));
        udp[9] = 17;
        assert!(parse_tcp_reply(&udp).is_none());
    }

    #[test]
    fn ip_options_honoured() {
        // 24-byte IP header (IHL 6) followed by a SYN+ACK.
        let base = encode_segment(&SegmentSpec {
            flags: flags::SYN | flags::ACK,
            ..SegmentSpec::syn(DST, SRC, 8080, 50000)
        });
        let mut pkt = Vec::with_capacity(44);
        pkt.extend_from_slice(&base[..20]);
        pkt.extend_from_slice(&[1, 1, 1, 0]);
        pkt.extend_from_slice(&base[20..]);
        pkt[0] = 0x46;
        let parsed = parse_syn_ack(&pkt).unwrap();
        assert_eq!(parsed.src_port, 8080);
    }
}
