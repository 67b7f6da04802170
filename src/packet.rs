use std::io::{BufRead, Cursor, Read};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const ETH_TYP_IP: u16 = 0x0800;
pub const ETH_TYP_ARP: u16 = 0x0806;
pub const ETH_TYP_VLAN: u16 = 0x8100;

pub const IP_PROTO_ICMP: u8 = 0x01;
pub const IP_PROTO_TCP: u8 = 0x06;
pub const IP_PROTO_UDP: u8 = 0x11;

pub fn bytes_of_mac(addr: u64) -> [u8; 6] {
    let mut arr = [0; 6];
    for (i, byte) in arr.iter_mut().enumerate() {
        *byte = ((addr >> (8 * (5 - i))) & 0xff) as u8;
    }
    arr
}

pub fn mac_of_bytes(addr: [u8; 6]) -> u64 {
    fn byte(u: &[u8; 6], i: usize) -> u64 {
        u[i] as u64
    }
    (byte(&addr, 0) << (8 * 5))
        | (byte(&addr, 1) << (8 * 4))
        | (byte(&addr, 2) << (8 * 3))
        | (byte(&addr, 3) << (8 * 2))
        | (byte(&addr, 4) << 8)
        | byte(&addr, 5)
}

pub fn mac_to_string(addr: u64) -> String {
    let b = bytes_of_mac(addr);
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

fn flag(word: u64, bit: u32) -> bool {
    word >> bit & 1 == 1
}

/// Group bit of the destination address, which covers broadcast too.
pub fn is_multicast_mac(addr: u64) -> bool {
    flag(addr, 40)
}

fn remaining(bytes: &Cursor<Vec<u8>>) -> usize {
    bytes.get_ref().len() - bytes.position() as usize
}

fn rest_of(bytes: &mut Cursor<Vec<u8>>) -> Vec<u8> {
    let mut payload = vec![0; remaining(bytes)];
    bytes.read_exact(&mut payload).unwrap();
    payload
}

/// TCP Header flags.
pub struct TcpFlags {
    /// ECN-nonce concealment protection.
    pub ns: bool,
    /// Congestion window reduced.
    pub cwr: bool,
    /// ECN-Echo.
    pub ece: bool,
    /// Indicates the Urgent pointer field is significant.
    pub urg: bool,
    /// Indicates that the Acknowledgment field is significant.
    pub ack: bool,
    /// Asks to push the buffered data to the receiving application.
    pub psh: bool,
    /// Reset the connection.
    pub rst: bool,
    /// Synchronize sequence numbers.
    pub syn: bool,
    /// No more data from sender.
    pub fin: bool,
}

impl TcpFlags {
    fn of_int(d: u16) -> TcpFlags {
        let d = d as u64;
        TcpFlags {
            ns: flag(d, 0),
            cwr: flag(d, 1),
            ece: flag(d, 2),
            urg: flag(d, 3),
            ack: flag(d, 4),
            psh: flag(d, 5),
            rst: flag(d, 6),
            syn: flag(d, 7),
            fin: flag(d, 8),
        }
    }
}

/// TCP frame of a packet.
pub struct Tcp {
    pub src: u16,
    pub dst: u16,
    pub seq: u32,
    pub ack: u32,
    pub offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub chksum: u16,
    pub urgent: u16,
    pub payload: Vec<u8>,
}

impl Tcp {
    fn size_of() -> usize {
        20
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Option<Tcp> {
        if remaining(bytes) < Self::size_of() {
            return None;
        }
        let src = bytes.read_u16::<BigEndian>().unwrap();
        let dst = bytes.read_u16::<BigEndian>().unwrap();
        let seq = bytes.read_u32::<BigEndian>().unwrap();
        let ack = bytes.read_u32::<BigEndian>().unwrap();
        let offset = bytes.read_u16::<BigEndian>().unwrap();
        let flags = TcpFlags::of_int(offset);
        let offset = (offset >> 12) as u8 & 0x0f;
        let window = bytes.read_u16::<BigEndian>().unwrap();
        let chksum = bytes.read_u16::<BigEndian>().unwrap();
        let urgent = bytes.read_u16::<BigEndian>().unwrap();
        let payload = rest_of(bytes);
        Some(Tcp {
            src,
            dst,
            seq,
            ack,
            offset,
            flags,
            window,
            chksum,
            urgent,
            payload,
        })
    }
}

/// UDP frame of a packet.
pub struct Udp {
    pub src: u16,
    pub dst: u16,
    pub chksum: u16,
    pub payload: Vec<u8>,
}

impl Udp {
    fn size_of() -> usize {
        8
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Option<Udp> {
        if remaining(bytes) < Self::size_of() {
            return None;
        }
        let src = bytes.read_u16::<BigEndian>().unwrap();
        let dst = bytes.read_u16::<BigEndian>().unwrap();
        let len = bytes.read_u16::<BigEndian>().unwrap() as usize;
        let chksum = bytes.read_u16::<BigEndian>().unwrap();
        if len < Self::size_of() || len - Self::size_of() > remaining(bytes) {
            return None;
        }
        let mut payload = vec![0; len - Self::size_of()];
        bytes.read_exact(&mut payload).unwrap();
        Some(Udp {
            src,
            dst,
            chksum,
            payload,
        })
    }
}

/// ICMP frame of a packet.
pub struct Icmp {
    pub typ: u8,
    pub code: u8,
    pub chksum: u16,
    pub payload: Vec<u8>,
}

impl Icmp {
    fn size_of() -> usize {
        4
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Option<Icmp> {
        if remaining(bytes) < Self::size_of() {
            return None;
        }
        let typ = bytes.read_u8().unwrap();
        let code = bytes.read_u8().unwrap();
        let chksum = bytes.read_u16::<BigEndian>().unwrap();
        let payload = rest_of(bytes);
        Some(Icmp {
            typ,
            code,
            chksum,
            payload,
        })
    }
}

/// Represents packets at the transport protocol level, which are encapsulated
/// within the IPv4 payload. At present, we only support TCP, UDP, and ICMP
/// explicitly; otherwise, the raw bytes and IPv4 protocol number are provided.
pub enum Tp {
    Tcp(Tcp),
    Udp(Udp),
    Icmp(Icmp),
    Unparsable(u8, Vec<u8>),
}

/// The type of IPv4 flags.
pub struct Flags {
    pub dont_fragment: bool,
    pub more_fragments: bool,
}

impl Flags {
    fn of_int(flags: u32) -> Flags {
        Flags {
            dont_fragment: flag(flags as u64, 1),
            more_fragments: flag(flags as u64, 2),
        }
    }
}

/// IPv4 frame of a packet.
pub struct Ip {
    pub tos: u8,
    pub ident: u16,
    pub flags: Flags,
    pub frag: u16,
    pub ttl: u8,
    pub chksum: u16,
    pub src: u32,
    pub dst: u32,
    pub options: Vec<u8>,
    pub tp: Tp,
}

impl Ip {
    fn size_of() -> usize {
        20
    }

    pub fn proto(&self) -> u8 {
        match self.tp {
            Tp::Tcp(_) => IP_PROTO_TCP,
            Tp::Udp(_) => IP_PROTO_UDP,
            Tp::Icmp(_) => IP_PROTO_ICMP,
            Tp::Unparsable(proto, _) => proto,
        }
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Option<Ip> {
        if remaining(bytes) < Self::size_of() {
            return None;
        }
        let vhl = bytes.read_u8().unwrap();
        if (vhl >> 4) != 4 {
            return None;
        }
        let ihl = vhl & 0x0f;
        if ihl < 5 {
            return None;
        }
        let tos = bytes.read_u8().unwrap();
        bytes.consume(2);
        let ident = bytes.read_u16::<BigEndian>().unwrap();
        let frag = bytes.read_u16::<BigEndian>().unwrap();
        let flags = Flags::of_int((frag as u32) >> 13);
        let ttl = bytes.read_u8().unwrap();
        let proto = bytes.read_u8().unwrap();
        let chksum = bytes.read_u16::<BigEndian>().unwrap();
        let src = bytes.read_u32::<BigEndian>().unwrap();
        let dst = bytes.read_u32::<BigEndian>().unwrap();
        let options_len = (ihl * 4) as usize - Self::size_of();
        if options_len > remaining(bytes) {
            return None;
        }
        let mut options = vec![0; options_len];
        bytes.read_exact(&mut options).unwrap();
        let tp_start = bytes.position();
        let rewound = |bytes: &mut Cursor<Vec<u8>>| {
            bytes.set_position(tp_start);
            rest_of(bytes)
        };
        let tp = match proto {
            IP_PROTO_ICMP => match Icmp::parse(bytes) {
                Some(icmp) => Tp::Icmp(icmp),
                None => Tp::Unparsable(proto, rewound(bytes)),
            },
            IP_PROTO_TCP => match Tcp::parse(bytes) {
                Some(tcp) => Tp::Tcp(tcp),
                None => Tp::Unparsable(proto, rewound(bytes)),
            },
            IP_PROTO_UDP => match Udp::parse(bytes) {
                Some(udp) => Tp::Udp(udp),
                None => Tp::Unparsable(proto, rewound(bytes)),
            },
            _ => Tp::Unparsable(proto, rest_of(bytes)),
        };
        Some(Ip {
            tos,
            ident,
            flags,
            frag,
            ttl,
            chksum,
            src,
            dst,
            options,
            tp,
        })
    }
}

/// Address resolution protocol (ARP) packet payload.
pub enum Arp {
    Query(u64, u32, u32),
    Reply(u64, u32, u64, u32),
}

impl Arp {
    fn size_of() -> usize {
        28
    }

    pub fn opcode(&self) -> u16 {
        match *self {
            Arp::Query(..) => 0x0001,
            Arp::Reply(..) => 0x0002,
        }
    }

    pub fn sender_hw(&self) -> u64 {
        match *self {
            Arp::Query(sha, ..) => sha,
            Arp::Reply(sha, ..) => sha,
        }
    }

    pub fn sender_proto(&self) -> u32 {
        match *self {
            Arp::Query(_, spa, _) => spa,
            Arp::Reply(_, spa, _, _) => spa,
        }
    }

    pub fn target_proto(&self) -> u32 {
        match *self {
            Arp::Query(_, _, tpa) => tpa,
            Arp::Reply(_, _, _, tpa) => tpa,
        }
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Option<Arp> {
        if remaining(bytes) < Self::size_of() {
            return None;
        }
        bytes.consume(6);
        let oper = bytes.read_u16::<BigEndian>().unwrap();
        let mut sha: [u8; 6] = [0; 6];
        bytes.read_exact(&mut sha).unwrap();
        let spa = bytes.read_u32::<BigEndian>().unwrap();
        let mut tha: [u8; 6] = [0; 6];
        bytes.read_exact(&mut tha).unwrap();
        let tpa = bytes.read_u32::<BigEndian>().unwrap();
        match oper {
            0x0001 => Some(Arp::Query(mac_of_bytes(sha), spa, tpa)),
            0x0002 => Some(Arp::Reply(mac_of_bytes(sha), spa, mac_of_bytes(tha), tpa)),
            _ => None,
        }
    }

    pub fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.write_u16::<BigEndian>(0x0001).unwrap();
        bytes.write_u16::<BigEndian>(ETH_TYP_IP).unwrap();
        bytes.write_u8(6).unwrap();
        bytes.write_u8(4).unwrap();
        bytes.write_u16::<BigEndian>(self.opcode()).unwrap();
        match *self {
            Arp::Query(sha, spa, tpa) => {
                bytes.extend_from_slice(&bytes_of_mac(sha));
                bytes.write_u32::<BigEndian>(spa).unwrap();
                bytes.extend_from_slice(&[0; 6]);
                bytes.write_u32::<BigEndian>(tpa).unwrap();
            }
            Arp::Reply(sha, spa, tha, tpa) => {
                bytes.extend_from_slice(&bytes_of_mac(sha));
                bytes.write_u32::<BigEndian>(spa).unwrap();
                bytes.extend_from_slice(&bytes_of_mac(tha));
                bytes.write_u32::<BigEndian>(tpa).unwrap();
            }
        }
    }
}

/// Represents a packet at the network protocol level.
pub enum Nw {
    Ip(Ip),
    Arp(Arp),
    Unparsable(u16, Vec<u8>),
}

/// Represents a packet at the ethernet protocol level.
pub struct Packet {
    pub dl_src: u64,
    pub dl_dst: u64,
    pub dl_vlan: Option<u16>,
    pub dl_vlan_dei: bool,
    pub dl_vlan_pcp: u8,
    pub nw: Nw,
}

impl Packet {
    pub fn eth_typ(&self) -> u16 {
        match self.nw {
            Nw::Ip(_) => ETH_TYP_IP,
            Nw::Arp(_) => ETH_TYP_ARP,
            Nw::Unparsable(typ, _) => typ,
        }
    }

    pub fn parse(buf: &[u8]) -> Option<Packet> {
        let mut bytes = Cursor::new(buf.to_vec());
        if remaining(&bytes) < 14 {
            return None;
        }
        let mut dst: [u8; 6] = [0; 6];
        let mut src: [u8; 6] = [0; 6];
        bytes.read_exact(&mut dst).unwrap();
        bytes.read_exact(&mut src).unwrap();
        let typ = bytes.read_u16::<BigEndian>().unwrap();
        let (tag, dei, pcp, typ) = match typ {
            ETH_TYP_VLAN => {
                if remaining(&bytes) < 4 {
                    return None;
                }
                let tag_and_pcp = bytes.read_u16::<BigEndian>().unwrap();
                let tag = tag_and_pcp & 0xfff;
                let dei = (tag_and_pcp & 0x1000) > 0;
                let pcp = tag_and_pcp >> 13;
                let typ = bytes.read_u16::<BigEndian>().unwrap();
                (Some(tag), dei, pcp as u8, typ)
            }
            _ => (None, false, 0x0, typ),
        };
        let nw_start = bytes.position();
        let rewound = |bytes: &mut Cursor<Vec<u8>>| {
            bytes.set_position(nw_start);
            rest_of(bytes)
        };
        let nw_header = match typ {
            ETH_TYP_IP => match Ip::parse(&mut bytes) {
                Some(ip) => Nw::Ip(ip),
                None => Nw::Unparsable(typ, rewound(&mut bytes)),
            },
            ETH_TYP_ARP => match Arp::parse(&mut bytes) {
                Some(arp) => Nw::Arp(arp),
                None => Nw::Unparsable(typ, rewound(&mut bytes)),
            },
            _ => Nw::Unparsable(typ, rest_of(&mut bytes)),
        };
        Some(Packet {
            dl_src: mac_of_bytes(src),
            dl_dst: mac_of_bytes(dst),
            dl_vlan: tag,
            dl_vlan_dei: dei,
            dl_vlan_pcp: pcp,
            nw: nw_header,
        })
    }
}

/// RFC 1071 checksum over `data`, the one used by IPv4, UDP, and friends.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Wrap `payload` in an Ethernet frame. Crafted frames are never
/// VLAN-tagged; the fabric speaks plain Ethernet II.
pub fn marshal_ethernet(dl_src: u64, dl_dst: u64, eth_typ: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(14 + payload.len());
    bytes.extend_from_slice(&bytes_of_mac(dl_dst));
    bytes.extend_from_slice(&bytes_of_mac(dl_src));
    bytes.write_u16::<BigEndian>(eth_typ).unwrap();
    bytes.extend_from_slice(payload);
    bytes
}

/// Build an IPv4 packet carrying a UDP datagram, with both checksums
/// filled in. Returns the IP packet bytes, ready for Ethernet framing.
pub fn marshal_udp_datagram(
    src_ip: u32,
    dst_ip: u32,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = Udp::size_of() + payload.len();
    let mut seg = Vec::with_capacity(udp_len);
    seg.write_u16::<BigEndian>(src_port).unwrap();
    seg.write_u16::<BigEndian>(dst_port).unwrap();
    seg.write_u16::<BigEndian>(udp_len as u16).unwrap();
    seg.write_u16::<BigEndian>(0).unwrap();
    seg.extend_from_slice(payload);

    let mut pseudo = Vec::with_capacity(12 + udp_len);
    pseudo.write_u32::<BigEndian>(src_ip).unwrap();
    pseudo.write_u32::<BigEndian>(dst_ip).unwrap();
    pseudo.write_u8(0).unwrap();
    pseudo.write_u8(IP_PROTO_UDP).unwrap();
    pseudo.write_u16::<BigEndian>(udp_len as u16).unwrap();
    pseudo.extend_from_slice(&seg);
    let chksum = match internet_checksum(&pseudo) {
        0 => 0xffff,
        ck => ck,
    };
    seg[6..8].copy_from_slice(&chksum.to_be_bytes());

    let total_len = Ip::size_of() + udp_len;
    let mut ip = Vec::with_capacity(total_len);
    ip.write_u8(0x45).unwrap();
    ip.write_u8(0).unwrap();
    ip.write_u16::<BigEndian>(total_len as u16).unwrap();
    ip.write_u16::<BigEndian>(0).unwrap();
    ip.write_u16::<BigEndian>(0).unwrap();
    ip.write_u8(64).unwrap();
    ip.write_u8(IP_PROTO_UDP).unwrap();
    ip.write_u16::<BigEndian>(0).unwrap();
    ip.write_u32::<BigEndian>(src_ip).unwrap();
    ip.write_u32::<BigEndian>(dst_ip).unwrap();
    let chksum = internet_checksum(&ip);
    ip[10..12].copy_from_slice(&chksum.to_be_bytes());
    ip.extend_from_slice(&seg);
    ip
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_bytes_roundtrip() {
        let mac = 0x0000_0000_0102_0304;
        assert_eq!(bytes_of_mac(mac), [0x00, 0x00, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(mac_of_bytes(bytes_of_mac(mac)), mac);
        assert_eq!(mac_to_string(mac), "00:00:01:02:03:04");
    }

    #[test]
    fn multicast_covers_broadcast() {
        assert!(is_multicast_mac(0x0000_ffff_ffff_ffff));
        assert!(is_multicast_mac(0x0000_0100_5e00_0001));
        assert!(!is_multicast_mac(0x0000_0000_0001_0000));
    }

    #[test]
    fn arp_query_roundtrip() {
        let query = Arp::Query(0x0000_0000_0200_0001, 0x0a01_0001, 0x0afe_fefe);
        let mut body = vec![];
        query.marshal(&mut body);
        assert_eq!(body.len(), 28);
        let frame = marshal_ethernet(
            0x0000_0000_0200_0001,
            0x0000_ffff_ffff_ffff,
            ETH_TYP_ARP,
            &body,
        );
        let pk = Packet::parse(&frame).unwrap();
        assert_eq!(pk.dl_src, 0x0000_0000_0200_0001);
        assert_eq!(pk.eth_typ(), ETH_TYP_ARP);
        match pk.nw {
            Nw::Arp(Arp::Query(sha, spa, tpa)) => {
                assert_eq!(sha, 0x0000_0000_0200_0001);
                assert_eq!(spa, 0x0a01_0001);
                assert_eq!(tpa, 0x0afe_fefe);
            }
            _ => panic!("expected ARP query"),
        }
    }

    #[test]
    fn crafted_udp_frame_parses_back() {
        let ip_pkt = marshal_udp_datagram(0x0afe_fefe, 0x0a01_0001, 53, 40000, b"hi there");
        let frame = marshal_ethernet(0x1, 0x2, ETH_TYP_IP, &ip_pkt);
        let pk = Packet::parse(&frame).unwrap();
        let ip = match pk.nw {
            Nw::Ip(ip) => ip,
            _ => panic!("expected IPv4"),
        };
        assert_eq!(ip.src, 0x0afe_fefe);
        assert_eq!(ip.dst, 0x0a01_0001);
        assert_eq!(ip.ttl, 64);
        match ip.tp {
            Tp::Udp(udp) => {
                assert_eq!(udp.src, 53);
                assert_eq!(udp.dst, 40000);
                assert_eq!(udp.payload, b"hi there");
            }
            _ => panic!("expected UDP"),
        }
    }

    #[test]
    fn ip_header_checksum_verifies() {
        let ip_pkt = marshal_udp_datagram(0x0afe_fefe, 0x0a01_0001, 53, 9999, b"1 2");
        // summing the header with its checksum in place folds to zero
        assert_eq!(internet_checksum(&ip_pkt[..20]), 0);
    }

    #[test]
    fn udp_checksum_verifies_with_pseudo_header() {
        let src = 0x0a00_0101u32;
        let dst = 0x0afe_fefeu32;
        let ip_pkt = marshal_udp_datagram(src, dst, 40000, 9999, b"100 2048");
        let udp = &ip_pkt[20..];
        let mut pseudo = vec![];
        pseudo.extend_from_slice(&src.to_be_bytes());
        pseudo.extend_from_slice(&dst.to_be_bytes());
        pseudo.push(0);
        pseudo.push(IP_PROTO_UDP);
        pseudo.extend_from_slice(&(udp.len() as u16).to_be_bytes());
        pseudo.extend_from_slice(udp);
        assert_eq!(internet_checksum(&pseudo), 0);
    }

    #[test]
    fn truncated_frames_do_not_parse() {
        assert!(Packet::parse(&[0u8; 13]).is_none());
        // ARP payload cut short falls back to unparsable, not a panic
        let frame = marshal_ethernet(0x1, 0x2, ETH_TYP_ARP, &[0u8; 10]);
        match Packet::parse(&frame).unwrap().nw {
            Nw::Unparsable(typ, _) => assert_eq!(typ, ETH_TYP_ARP),
            _ => panic!("expected unparsable"),
        }
    }

    #[test]
    fn vlan_tag_is_recorded() {
        let mut frame = vec![];
        frame.extend_from_slice(&bytes_of_mac(0x2));
        frame.extend_from_slice(&bytes_of_mac(0x1));
        frame.extend_from_slice(&ETH_TYP_VLAN.to_be_bytes());
        frame.extend_from_slice(&0x2064u16.to_be_bytes()); // pcp 1, vid 100
        frame.extend_from_slice(&0xffffu16.to_be_bytes());
        let pk = Packet::parse(&frame).unwrap();
        assert_eq!(pk.dl_vlan, Some(100));
        assert_eq!(pk.dl_vlan_pcp, 1);
    }
}
