use std::io::{Cursor, Read};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::ofp_message::ProtocolError;
use crate::packet::{bytes_of_mac, mac_of_bytes, Nw, Packet, Tp};

pub const OFP_VERSION: u8 = 0x01;

/// Default flow priority, matching the datapath's notion of "unspecified".
pub const DEFAULT_PRIORITY: u16 = 0x8000;

const OFPP_IN_PORT: u16 = 0xfff8;
const OFPP_TABLE: u16 = 0xfff9;
const OFPP_NORMAL: u16 = 0xfffa;
const OFPP_FLOOD: u16 = 0xfffb;
const OFPP_ALL: u16 = 0xfffc;
const OFPP_CONTROLLER: u16 = 0xfffd;
const OFPP_LOCAL: u16 = 0xfffe;
const OFPP_NONE: u16 = 0xffff;

/// Match-on-no-VLAN sentinel for `Pattern::dl_vlan`.
pub const VLAN_NONE: u16 = 0xffff;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PseudoPort {
    PhysicalPort(u16),
    InPort,
    Table,
    Normal,
    Flood,
    AllPorts,
    Controller(u64),
    Local,
}

impl PseudoPort {
    fn to_int(self) -> u16 {
        match self {
            PseudoPort::PhysicalPort(p) => p,
            PseudoPort::InPort => OFPP_IN_PORT,
            PseudoPort::Table => OFPP_TABLE,
            PseudoPort::Normal => OFPP_NORMAL,
            PseudoPort::Flood => OFPP_FLOOD,
            PseudoPort::AllPorts => OFPP_ALL,
            PseudoPort::Controller(_) => OFPP_CONTROLLER,
            PseudoPort::Local => OFPP_LOCAL,
        }
    }

    fn of_int(p: u16, len: u64) -> PseudoPort {
        match p {
            OFPP_IN_PORT => PseudoPort::InPort,
            OFPP_TABLE => PseudoPort::Table,
            OFPP_NORMAL => PseudoPort::Normal,
            OFPP_FLOOD => PseudoPort::Flood,
            OFPP_ALL => PseudoPort::AllPorts,
            OFPP_CONTROLLER => PseudoPort::Controller(len),
            OFPP_LOCAL => PseudoPort::Local,
            _ => PseudoPort::PhysicalPort(p),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Output(PseudoPort),
}

impl Action {
    fn size_of(&self) -> usize {
        match *self {
            Action::Output(_) => 8,
        }
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        match *self {
            Action::Output(pp) => {
                bytes.write_u16::<BigEndian>(0).unwrap();
                bytes.write_u16::<BigEndian>(8).unwrap();
                bytes.write_u16::<BigEndian>(pp.to_int()).unwrap();
                let max_len = match pp {
                    PseudoPort::Controller(n) => n as u16,
                    _ => 0,
                };
                bytes.write_u16::<BigEndian>(max_len).unwrap();
            }
        }
    }

    /// Parse `len` bytes worth of actions. Action types other than output
    /// are skipped over; the fabric never emits them.
    fn parse_sequence(bytes: &mut Cursor<Vec<u8>>, len: usize) -> Result<Vec<Action>, ProtocolError> {
        let end = bytes.position() as usize + len;
        let mut actions = vec![];
        while (bytes.position() as usize) < end {
            if end - (bytes.position() as usize) < 4 {
                return Err(ProtocolError::Truncated("action header"));
            }
            let typ = bytes.read_u16::<BigEndian>().unwrap();
            let alen = bytes.read_u16::<BigEndian>().unwrap() as usize;
            if alen < 4 || bytes.position() as usize + (alen - 4) > end {
                return Err(ProtocolError::Malformed("action length"));
            }
            if typ == 0 {
                if alen != 8 {
                    return Err(ProtocolError::Malformed("output action length"));
                }
                let port = bytes.read_u16::<BigEndian>().unwrap();
                let max_len = bytes.read_u16::<BigEndian>().unwrap();
                actions.push(Action::Output(PseudoPort::of_int(port, max_len as u64)));
            } else {
                let mut skip = vec![0; alen - 4];
                bytes.read_exact(&mut skip).unwrap();
            }
        }
        Ok(actions)
    }
}

const OFPFW_IN_PORT: u32 = 0;
const OFPFW_DL_VLAN: u32 = 1;
const OFPFW_DL_SRC: u32 = 2;
const OFPFW_DL_DST: u32 = 3;
const OFPFW_DL_TYPE: u32 = 4;
const OFPFW_NW_PROTO: u32 = 5;
const OFPFW_TP_SRC: u32 = 6;
const OFPFW_TP_DST: u32 = 7;
const OFPFW_NW_SRC_SHIFT: u32 = 8;
const OFPFW_NW_DST_SHIFT: u32 = 14;
const OFPFW_DL_VLAN_PCP: u32 = 20;
const OFPFW_NW_TOS: u32 = 21;

fn wild_bit(bit: u32, is_wild: bool) -> u32 {
    (is_wild as u32) << bit
}

/// An OpenFlow 1.0 `ofp_match`. `None` fields are wildcarded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pattern {
    pub dl_src: Option<u64>,
    pub dl_dst: Option<u64>,
    pub dl_typ: Option<u16>,
    pub dl_vlan: Option<u16>,
    pub dl_vlan_pcp: Option<u8>,
    pub nw_src: Option<u32>,
    pub nw_dst: Option<u32>,
    pub nw_proto: Option<u8>,
    pub nw_tos: Option<u8>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
    pub in_port: Option<u16>,
}

impl Pattern {
    pub fn match_all() -> Pattern {
        Pattern::default()
    }

    /// Exact match for the given parsed frame and its ingress port, the
    /// equivalent of POX's `ofp_match.from_packet`.
    pub fn of_packet(pk: &Packet, in_port: u16) -> Pattern {
        let mut p = Pattern::match_all();
        p.in_port = Some(in_port);
        p.dl_src = Some(pk.dl_src);
        p.dl_dst = Some(pk.dl_dst);
        p.dl_typ = Some(pk.eth_typ());
        p.dl_vlan = Some(pk.dl_vlan.unwrap_or(VLAN_NONE));
        p.dl_vlan_pcp = Some(pk.dl_vlan_pcp);
        match pk.nw {
            Nw::Ip(ref ip) => {
                p.nw_src = Some(ip.src);
                p.nw_dst = Some(ip.dst);
                p.nw_proto = Some(ip.proto());
                p.nw_tos = Some(ip.tos);
                match ip.tp {
                    Tp::Tcp(ref tcp) => {
                        p.tp_src = Some(tcp.src);
                        p.tp_dst = Some(tcp.dst);
                    }
                    Tp::Udp(ref udp) => {
                        p.tp_src = Some(udp.src);
                        p.tp_dst = Some(udp.dst);
                    }
                    Tp::Icmp(ref icmp) => {
                        p.tp_src = Some(icmp.typ as u16);
                        p.tp_dst = Some(icmp.code as u16);
                    }
                    Tp::Unparsable(..) => {}
                }
            }
            Nw::Arp(ref arp) => {
                p.nw_src = Some(arp.sender_proto());
                p.nw_dst = Some(arp.target_proto());
                p.nw_proto = Some(arp.opcode() as u8);
            }
            Nw::Unparsable(..) => {}
        }
        p
    }

    pub fn size_of() -> usize {
        40
    }

    fn wildcards(&self) -> u32 {
        let mut w = wild_bit(OFPFW_IN_PORT, self.in_port.is_none());
        w |= wild_bit(OFPFW_DL_VLAN, self.dl_vlan.is_none());
        w |= wild_bit(OFPFW_DL_SRC, self.dl_src.is_none());
        w |= wild_bit(OFPFW_DL_DST, self.dl_dst.is_none());
        w |= wild_bit(OFPFW_DL_TYPE, self.dl_typ.is_none());
        w |= wild_bit(OFPFW_NW_PROTO, self.nw_proto.is_none());
        w |= wild_bit(OFPFW_TP_SRC, self.tp_src.is_none());
        w |= wild_bit(OFPFW_TP_DST, self.tp_dst.is_none());
        if self.nw_src.is_none() {
            w |= 32 << OFPFW_NW_SRC_SHIFT;
        }
        if self.nw_dst.is_none() {
            w |= 32 << OFPFW_NW_DST_SHIFT;
        }
        w |= wild_bit(OFPFW_DL_VLAN_PCP, self.dl_vlan_pcp.is_none());
        w |= wild_bit(OFPFW_NW_TOS, self.nw_tos.is_none());
        w
    }

    pub fn marshal(p: &Pattern, bytes: &mut Vec<u8>) {
        bytes.write_u32::<BigEndian>(p.wildcards()).unwrap();
        bytes.write_u16::<BigEndian>(p.in_port.unwrap_or(0)).unwrap();
        bytes.extend_from_slice(&bytes_of_mac(p.dl_src.unwrap_or(0)));
        bytes.extend_from_slice(&bytes_of_mac(p.dl_dst.unwrap_or(0)));
        bytes.write_u16::<BigEndian>(p.dl_vlan.unwrap_or(0)).unwrap();
        bytes.write_u8(p.dl_vlan_pcp.unwrap_or(0)).unwrap();
        bytes.write_u8(0).unwrap();
        bytes.write_u16::<BigEndian>(p.dl_typ.unwrap_or(0)).unwrap();
        bytes.write_u8(p.nw_tos.unwrap_or(0)).unwrap();
        bytes.write_u8(p.nw_proto.unwrap_or(0)).unwrap();
        bytes.write_u16::<BigEndian>(0).unwrap();
        bytes.write_u32::<BigEndian>(p.nw_src.unwrap_or(0)).unwrap();
        bytes.write_u32::<BigEndian>(p.nw_dst.unwrap_or(0)).unwrap();
        bytes.write_u16::<BigEndian>(p.tp_src.unwrap_or(0)).unwrap();
        bytes.write_u16::<BigEndian>(p.tp_dst.unwrap_or(0)).unwrap();
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Pattern {
        let w = bytes.read_u32::<BigEndian>().unwrap();
        let in_port = bytes.read_u16::<BigEndian>().unwrap();
        let mut dl_src = [0u8; 6];
        bytes.read_exact(&mut dl_src).unwrap();
        let mut dl_dst = [0u8; 6];
        bytes.read_exact(&mut dl_dst).unwrap();
        let dl_vlan = bytes.read_u16::<BigEndian>().unwrap();
        let dl_vlan_pcp = bytes.read_u8().unwrap();
        bytes.read_u8().unwrap();
        let dl_typ = bytes.read_u16::<BigEndian>().unwrap();
        let nw_tos = bytes.read_u8().unwrap();
        let nw_proto = bytes.read_u8().unwrap();
        bytes.read_u16::<BigEndian>().unwrap();
        let nw_src = bytes.read_u32::<BigEndian>().unwrap();
        let nw_dst = bytes.read_u32::<BigEndian>().unwrap();
        let tp_src = bytes.read_u16::<BigEndian>().unwrap();
        let tp_dst = bytes.read_u16::<BigEndian>().unwrap();
        let exact = |bit: u32| w >> bit & 1 == 0;
        Pattern {
            dl_src: exact(OFPFW_DL_SRC).then(|| mac_of_bytes(dl_src)),
            dl_dst: exact(OFPFW_DL_DST).then(|| mac_of_bytes(dl_dst)),
            dl_typ: exact(OFPFW_DL_TYPE).then_some(dl_typ),
            dl_vlan: exact(OFPFW_DL_VLAN).then_some(dl_vlan),
            dl_vlan_pcp: exact(OFPFW_DL_VLAN_PCP).then_some(dl_vlan_pcp),
            nw_src: ((w >> OFPFW_NW_SRC_SHIFT) & 0x3f < 32).then_some(nw_src),
            nw_dst: ((w >> OFPFW_NW_DST_SHIFT) & 0x3f < 32).then_some(nw_dst),
            nw_proto: exact(OFPFW_NW_PROTO).then_some(nw_proto),
            nw_tos: exact(OFPFW_NW_TOS).then_some(nw_tos),
            tp_src: exact(OFPFW_TP_SRC).then_some(tp_src),
            tp_dst: exact(OFPFW_TP_DST).then_some(tp_dst),
            in_port: exact(OFPFW_IN_PORT).then_some(in_port),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub flow_stats: bool,
    pub table_stats: bool,
    pub port_stats: bool,
    pub stp: bool,
    pub ip_reasm: bool,
    pub queue_stats: bool,
    pub arp_match_ip: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchFeatures {
    pub datapath_id: u64,
    pub num_buffers: u32,
    pub num_tables: u8,
    pub supported_capabilities: Capabilities,
    pub supported_actions: u32,
}

impl SwitchFeatures {
    fn marshal(feats: SwitchFeatures, bytes: &mut Vec<u8>) {
        bytes.write_u64::<BigEndian>(feats.datapath_id).unwrap();
        bytes.write_u32::<BigEndian>(feats.num_buffers).unwrap();
        bytes.write_u8(feats.num_tables).unwrap();
        bytes.extend_from_slice(&[0, 0, 0]);
        let caps = &feats.supported_capabilities;
        let w = (caps.flow_stats as u32)
            | (caps.table_stats as u32) << 1
            | (caps.port_stats as u32) << 2
            | (caps.stp as u32) << 3
            | (caps.ip_reasm as u32) << 5
            | (caps.queue_stats as u32) << 6
            | (caps.arp_match_ip as u32) << 7;
        bytes.write_u32::<BigEndian>(w).unwrap();
        bytes.write_u32::<BigEndian>(feats.supported_actions).unwrap();
    }

    pub fn parse(buf: &[u8]) -> Result<SwitchFeatures, ProtocolError> {
        if buf.len() < 24 {
            return Err(ProtocolError::Truncated("features reply"));
        }
        let mut bytes = Cursor::new(buf.to_vec());
        let datapath_id = bytes.read_u64::<BigEndian>().unwrap();
        let num_buffers = bytes.read_u32::<BigEndian>().unwrap();
        let num_tables = bytes.read_u8().unwrap();
        let mut pad = [0u8; 3];
        bytes.read_exact(&mut pad).unwrap();
        let caps = bytes.read_u32::<BigEndian>().unwrap();
        let supported_actions = bytes.read_u32::<BigEndian>().unwrap();
        let has = |bit: u32| caps >> bit & 1 == 1;
        Ok(SwitchFeatures {
            datapath_id,
            num_buffers,
            num_tables,
            supported_capabilities: Capabilities {
                flow_stats: has(0),
                table_stats: has(1),
                port_stats: has(2),
                stp: has(3),
                ip_reasm: has(5),
                queue_stats: has(6),
                arp_match_ip: has(7),
            },
            supported_actions,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowModCmd {
    AddFlow,
    ModFlow,
    ModStrictFlow,
    DeleteFlow,
    DeleteStrictFlow,
}

impl FlowModCmd {
    fn to_int(self) -> u16 {
        match self {
            FlowModCmd::AddFlow => 0,
            FlowModCmd::ModFlow => 1,
            FlowModCmd::ModStrictFlow => 2,
            FlowModCmd::DeleteFlow => 3,
            FlowModCmd::DeleteStrictFlow => 4,
        }
    }

    fn of_int(cmd: u16) -> Result<FlowModCmd, ProtocolError> {
        match cmd {
            0 => Ok(FlowModCmd::AddFlow),
            1 => Ok(FlowModCmd::ModFlow),
            2 => Ok(FlowModCmd::ModStrictFlow),
            3 => Ok(FlowModCmd::DeleteFlow),
            4 => Ok(FlowModCmd::DeleteStrictFlow),
            _ => Err(ProtocolError::Malformed("flow mod command")),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timeout {
    Permanent,
    ExpiresAfter(u16),
}

impl Timeout {
    fn to_int(self) -> u16 {
        match self {
            Timeout::Permanent => 0,
            Timeout::ExpiresAfter(d) => d,
        }
    }

    fn of_int(tm: u16) -> Timeout {
        if tm == 0 {
            Timeout::Permanent
        } else {
            Timeout::ExpiresAfter(tm)
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlowMod {
    pub command: FlowModCmd,
    pub pattern: Pattern,
    pub priority: u16,
    pub actions: Vec<Action>,
    pub cookie: u64,
    pub idle_timeout: Timeout,
    pub hard_timeout: Timeout,
    pub notify_when_removed: bool,
    pub apply_to_packet: Option<u32>,
    pub out_port: Option<PseudoPort>,
    pub check_overlap: bool,
}

impl FlowMod {
    fn size_of(&self) -> usize {
        Pattern::size_of() + 24 + self.actions.iter().map(Action::size_of).sum::<usize>()
    }

    fn marshal(fm: FlowMod, bytes: &mut Vec<u8>) {
        Pattern::marshal(&fm.pattern, bytes);
        bytes.write_u64::<BigEndian>(fm.cookie).unwrap();
        bytes.write_u16::<BigEndian>(fm.command.to_int()).unwrap();
        bytes.write_u16::<BigEndian>(fm.idle_timeout.to_int()).unwrap();
        bytes.write_u16::<BigEndian>(fm.hard_timeout.to_int()).unwrap();
        bytes.write_u16::<BigEndian>(fm.priority).unwrap();
        bytes
            .write_i32::<BigEndian>(fm.apply_to_packet.map(|id| id as i32).unwrap_or(-1))
            .unwrap();
        bytes
            .write_u16::<BigEndian>(fm.out_port.map(PseudoPort::to_int).unwrap_or(OFPP_NONE))
            .unwrap();
        let mut flags: u16 = 0;
        if fm.notify_when_removed {
            flags |= 1;
        }
        if fm.check_overlap {
            flags |= 1 << 1;
        }
        bytes.write_u16::<BigEndian>(flags).unwrap();
        for act in &fm.actions {
            act.marshal(bytes);
        }
    }

    fn parse(buf: &[u8]) -> Result<FlowMod, ProtocolError> {
        if buf.len() < Pattern::size_of() + 24 {
            return Err(ProtocolError::Truncated("flow mod"));
        }
        let mut bytes = Cursor::new(buf.to_vec());
        let pattern = Pattern::parse(&mut bytes);
        let cookie = bytes.read_u64::<BigEndian>().unwrap();
        let command = FlowModCmd::of_int(bytes.read_u16::<BigEndian>().unwrap())?;
        let idle_timeout = Timeout::of_int(bytes.read_u16::<BigEndian>().unwrap());
        let hard_timeout = Timeout::of_int(bytes.read_u16::<BigEndian>().unwrap());
        let priority = bytes.read_u16::<BigEndian>().unwrap();
        let buffer_id = bytes.read_i32::<BigEndian>().unwrap();
        let out_port = bytes.read_u16::<BigEndian>().unwrap();
        let flags = bytes.read_u16::<BigEndian>().unwrap();
        let actions_len = buf.len() - bytes.position() as usize;
        let actions = Action::parse_sequence(&mut bytes, actions_len)?;
        Ok(FlowMod {
            command,
            pattern,
            priority,
            actions,
            cookie,
            idle_timeout,
            hard_timeout,
            notify_when_removed: flags & 1 != 0,
            apply_to_packet: (buffer_id >= 0).then_some(buffer_id as u32),
            out_port: (out_port != OFPP_NONE).then(|| PseudoPort::of_int(out_port, 0)),
            check_overlap: flags & (1 << 1) != 0,
        })
    }
}

/// Frame bytes handed around with a PacketIn/PacketOut, either resident in
/// a datapath buffer or carried inline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Buffered(u32, Vec<u8>),
    NotBuffered(Vec<u8>),
}

impl Payload {
    pub fn bytes(&self) -> &[u8] {
        match *self {
            Payload::Buffered(_, ref buf) => buf,
            Payload::NotBuffered(ref buf) => buf,
        }
    }

    pub fn buffer_id(&self) -> Option<u32> {
        match *self {
            Payload::Buffered(id, _) => Some(id),
            Payload::NotBuffered(_) => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketInReason {
    NoMatch,
    ExplicitSend,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketIn {
    pub input_payload: Payload,
    pub total_len: u16,
    pub port: u16,
    pub reason: PacketInReason,
}

impl PacketIn {
    fn size_of(&self) -> usize {
        10 + self.input_payload.bytes().len()
    }

    fn marshal(pkt: PacketIn, bytes: &mut Vec<u8>) {
        bytes
            .write_i32::<BigEndian>(pkt.input_payload.buffer_id().map(|id| id as i32).unwrap_or(-1))
            .unwrap();
        bytes.write_u16::<BigEndian>(pkt.total_len).unwrap();
        bytes.write_u16::<BigEndian>(pkt.port).unwrap();
        bytes
            .write_u8(match pkt.reason {
                PacketInReason::NoMatch => 0,
                PacketInReason::ExplicitSend => 1,
            })
            .unwrap();
        bytes.write_u8(0).unwrap();
        bytes.extend_from_slice(pkt.input_payload.bytes());
    }

    fn parse(buf: &[u8]) -> Result<PacketIn, ProtocolError> {
        if buf.len() < 10 {
            return Err(ProtocolError::Truncated("packet in"));
        }
        let mut bytes = Cursor::new(buf.to_vec());
        let buffer_id = bytes.read_i32::<BigEndian>().unwrap();
        let total_len = bytes.read_u16::<BigEndian>().unwrap();
        let port = bytes.read_u16::<BigEndian>().unwrap();
        let reason = match bytes.read_u8().unwrap() {
            0 => PacketInReason::NoMatch,
            1 => PacketInReason::ExplicitSend,
            _ => return Err(ProtocolError::Malformed("packet in reason")),
        };
        bytes.read_u8().unwrap();
        let frame = buf[bytes.position() as usize..].to_vec();
        let input_payload = if buffer_id >= 0 {
            Payload::Buffered(buffer_id as u32, frame)
        } else {
            Payload::NotBuffered(frame)
        };
        Ok(PacketIn {
            input_payload,
            total_len,
            port,
            reason,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketOut {
    pub output_payload: Payload,
    pub port_id: Option<u16>,
    pub apply_actions: Vec<Action>,
}

impl PacketOut {
    fn size_of(&self) -> usize {
        let payload_len = match self.output_payload {
            Payload::Buffered(..) => 0,
            Payload::NotBuffered(ref buf) => buf.len(),
        };
        8 + self.apply_actions.iter().map(Action::size_of).sum::<usize>() + payload_len
    }

    fn marshal(po: PacketOut, bytes: &mut Vec<u8>) {
        bytes
            .write_i32::<BigEndian>(po.output_payload.buffer_id().map(|id| id as i32).unwrap_or(-1))
            .unwrap();
        bytes.write_u16::<BigEndian>(po.port_id.unwrap_or(OFPP_NONE)).unwrap();
        let actions_len: usize = po.apply_actions.iter().map(Action::size_of).sum();
        bytes.write_u16::<BigEndian>(actions_len as u16).unwrap();
        for act in &po.apply_actions {
            act.marshal(bytes);
        }
        if let Payload::NotBuffered(ref buf) = po.output_payload {
            bytes.extend_from_slice(buf);
        }
    }

    fn parse(buf: &[u8]) -> Result<PacketOut, ProtocolError> {
        if buf.len() < 8 {
            return Err(ProtocolError::Truncated("packet out"));
        }
        let mut bytes = Cursor::new(buf.to_vec());
        let buffer_id = bytes.read_i32::<BigEndian>().unwrap();
        let in_port = bytes.read_u16::<BigEndian>().unwrap();
        let actions_len = bytes.read_u16::<BigEndian>().unwrap() as usize;
        if buf.len() < 8 + actions_len {
            return Err(ProtocolError::Truncated("packet out actions"));
        }
        let apply_actions = Action::parse_sequence(&mut bytes, actions_len)?;
        let rest = buf[bytes.position() as usize..].to_vec();
        let output_payload = if buffer_id >= 0 {
            Payload::Buffered(buffer_id as u32, rest)
        } else {
            Payload::NotBuffered(rest)
        };
        Ok(PacketOut {
            output_payload,
            port_id: (in_port != OFPP_NONE).then_some(in_port),
            apply_actions,
        })
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MsgCode {
    Hello,
    Error,
    EchoReq,
    EchoResp,
    Vendor,
    FeaturesReq,
    FeaturesResp,
    GetConfigReq,
    GetConfigResp,
    SetConfig,
    PacketIn,
    FlowRemoved,
    PortStatus,
    PacketOut,
    FlowMod,
    PortMod,
    StatsReq,
    StatsResp,
    BarrierReq,
    BarrierResp,
    QueueGetConfigReq,
    QueueGetConfigResp,
}

impl MsgCode {
    pub fn of_u8(typ: u8) -> Option<MsgCode> {
        match typ {
            0 => Some(MsgCode::Hello),
            1 => Some(MsgCode::Error),
            2 => Some(MsgCode::EchoReq),
            3 => Some(MsgCode::EchoResp),
            4 => Some(MsgCode::Vendor),
            5 => Some(MsgCode::FeaturesReq),
            6 => Some(MsgCode::FeaturesResp),
            7 => Some(MsgCode::GetConfigReq),
            8 => Some(MsgCode::GetConfigResp),
            9 => Some(MsgCode::SetConfig),
            10 => Some(MsgCode::PacketIn),
            11 => Some(MsgCode::FlowRemoved),
            12 => Some(MsgCode::PortStatus),
            13 => Some(MsgCode::PacketOut),
            14 => Some(MsgCode::FlowMod),
            15 => Some(MsgCode::PortMod),
            16 => Some(MsgCode::StatsReq),
            17 => Some(MsgCode::StatsResp),
            18 => Some(MsgCode::BarrierReq),
            19 => Some(MsgCode::BarrierResp),
            20 => Some(MsgCode::QueueGetConfigReq),
            21 => Some(MsgCode::QueueGetConfigResp),
            _ => None,
        }
    }
}

pub mod message {
    use super::*;
    use crate::ofp_header::OfpHeader;
    use crate::ofp_message::{OfpMessage, ProtocolError};

    #[derive(Clone, Debug, PartialEq)]
    pub enum Message {
        Hello,
        EchoRequest(Vec<u8>),
        EchoReply(Vec<u8>),
        FeaturesReq,
        FeaturesReply(SwitchFeatures),
        FlowMod(FlowMod),
        PacketIn(PacketIn),
        PacketOut(PacketOut),
    }

    impl Message {
        fn msg_code_of_message(msg: &Message) -> MsgCode {
            match *msg {
                Message::Hello => MsgCode::Hello,
                Message::EchoRequest(_) => MsgCode::EchoReq,
                Message::EchoReply(_) => MsgCode::EchoResp,
                Message::FeaturesReq => MsgCode::FeaturesReq,
                Message::FeaturesReply(_) => MsgCode::FeaturesResp,
                Message::FlowMod(_) => MsgCode::FlowMod,
                Message::PacketIn(_) => MsgCode::PacketIn,
                Message::PacketOut(_) => MsgCode::PacketOut,
            }
        }
    }

    impl OfpMessage for Message {
        fn size_of(msg: &Message) -> usize {
            match *msg {
                Message::Hello => OfpHeader::size(),
                Message::EchoRequest(ref buf) => OfpHeader::size() + buf.len(),
                Message::EchoReply(ref buf) => OfpHeader::size() + buf.len(),
                Message::FeaturesReq => OfpHeader::size(),
                Message::FeaturesReply(_) => OfpHeader::size() + 24,
                Message::FlowMod(ref fm) => OfpHeader::size() + fm.size_of(),
                Message::PacketIn(ref pkt) => OfpHeader::size() + pkt.size_of(),
                Message::PacketOut(ref po) => OfpHeader::size() + po.size_of(),
            }
        }

        fn header_of(xid: u32, msg: &Message) -> OfpHeader {
            let sizeof_buf = Self::size_of(msg);
            OfpHeader::new(
                OFP_VERSION,
                Self::msg_code_of_message(msg) as u8,
                sizeof_buf as u16,
                xid,
            )
        }

        fn marshal(xid: u32, msg: Message) -> Vec<u8> {
            let hdr = Self::header_of(xid, &msg);
            let mut bytes = vec![];
            OfpHeader::marshal(&mut bytes, hdr);
            match msg {
                Message::Hello | Message::FeaturesReq => {}
                Message::EchoRequest(buf) | Message::EchoReply(buf) => {
                    bytes.extend_from_slice(&buf)
                }
                Message::FeaturesReply(feats) => SwitchFeatures::marshal(feats, &mut bytes),
                Message::FlowMod(fm) => FlowMod::marshal(fm, &mut bytes),
                Message::PacketIn(pkt) => PacketIn::marshal(pkt, &mut bytes),
                Message::PacketOut(po) => PacketOut::marshal(po, &mut bytes),
            }
            bytes
        }

        fn parse(header: &OfpHeader, buf: &[u8]) -> Result<(u32, Message), ProtocolError> {
            let typ = MsgCode::of_u8(header.type_code())
                .ok_or(ProtocolError::UnsupportedMessage(header.type_code()))?;
            let msg = match typ {
                MsgCode::Hello => Message::Hello,
                MsgCode::EchoReq => Message::EchoRequest(buf.to_vec()),
                MsgCode::EchoResp => Message::EchoReply(buf.to_vec()),
                MsgCode::FeaturesReq => Message::FeaturesReq,
                MsgCode::FeaturesResp => Message::FeaturesReply(SwitchFeatures::parse(buf)?),
                MsgCode::FlowMod => Message::FlowMod(FlowMod::parse(buf)?),
                MsgCode::PacketIn => Message::PacketIn(PacketIn::parse(buf)?),
                MsgCode::PacketOut => Message::PacketOut(PacketOut::parse(buf)?),
                other => return Err(ProtocolError::UnsupportedMessage(other as u8)),
            };
            Ok((header.xid(), msg))
        }
    }

    /// A flow-add with the fields every caller tweaks afterwards left at
    /// their datapath defaults: permanent, unbuffered, no flags.
    pub fn add_flow(prio: u16, pattern: Pattern, actions: Vec<Action>) -> FlowMod {
        FlowMod {
            command: FlowModCmd::AddFlow,
            pattern,
            priority: prio,
            actions,
            cookie: 0,
            idle_timeout: Timeout::Permanent,
            hard_timeout: Timeout::Permanent,
            notify_when_removed: false,
            apply_to_packet: None,
            out_port: None,
            check_overlap: false,
        }
    }

    pub fn parse_payload(p: &Payload) -> Option<Packet> {
        Packet::parse(p.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::message::{add_flow, Message};
    use super::*;
    use crate::ofp_header::OfpHeader;
    use crate::ofp_message::OfpMessage;

    fn reparse(msg: Message) -> Message {
        let bytes = Message::marshal(0x42, msg);
        let header = OfpHeader::parse(bytes[..8].try_into().unwrap());
        assert_eq!(header.length(), bytes.len());
        let (xid, msg) = Message::parse(&header, &bytes[8..]).unwrap();
        assert_eq!(xid, 0x42);
        msg
    }

    #[test]
    fn pattern_marshals_to_forty_bytes() {
        let mut bytes = vec![];
        Pattern::marshal(&Pattern::match_all(), &mut bytes);
        assert_eq!(bytes.len(), Pattern::size_of());
    }

    #[test]
    fn flow_mod_roundtrip() {
        let mut pattern = Pattern::match_all();
        pattern.dl_typ = Some(0x0800);
        pattern.nw_proto = Some(0x11);
        pattern.tp_src = Some(53);
        let mut fm = add_flow(
            0xffff,
            pattern,
            vec![Action::Output(PseudoPort::Controller(0xffff))],
        );
        fm.idle_timeout = Timeout::ExpiresAfter(10);
        fm.hard_timeout = Timeout::ExpiresAfter(30);
        fm.apply_to_packet = Some(7);
        let orig = fm.clone();
        match reparse(Message::FlowMod(fm)) {
            Message::FlowMod(parsed) => assert_eq!(parsed, orig),
            other => panic!("expected FlowMod, got {:?}", other),
        }
    }

    #[test]
    fn packet_out_roundtrip_unbuffered() {
        let po = PacketOut {
            output_payload: Payload::NotBuffered(vec![1, 2, 3, 4]),
            port_id: None,
            apply_actions: vec![Action::Output(PseudoPort::PhysicalPort(3))],
        };
        let orig = po.clone();
        match reparse(Message::PacketOut(po)) {
            Message::PacketOut(parsed) => assert_eq!(parsed, orig),
            other => panic!("expected PacketOut, got {:?}", other),
        }
    }

    #[test]
    fn packet_out_roundtrip_buffered() {
        let po = PacketOut {
            output_payload: Payload::Buffered(99, vec![]),
            port_id: Some(2),
            apply_actions: vec![Action::Output(PseudoPort::Flood)],
        };
        let orig = po.clone();
        match reparse(Message::PacketOut(po)) {
            Message::PacketOut(parsed) => assert_eq!(parsed, orig),
            other => panic!("expected PacketOut, got {:?}", other),
        }
    }

    #[test]
    fn packet_in_roundtrip() {
        let pkt = PacketIn {
            input_payload: Payload::Buffered(5, vec![0xde, 0xad]),
            total_len: 2,
            port: 4,
            reason: PacketInReason::NoMatch,
        };
        let orig = pkt.clone();
        match reparse(Message::PacketIn(pkt)) {
            Message::PacketIn(parsed) => assert_eq!(parsed, orig),
            other => panic!("expected PacketIn, got {:?}", other),
        }
    }

    #[test]
    fn unsupported_message_type_is_an_error() {
        let header = OfpHeader::new(OFP_VERSION, 16, 8, 0);
        let mut raw = vec![];
        OfpHeader::marshal(&mut raw, header);
        let header = OfpHeader::parse(raw[..8].try_into().unwrap());
        assert_eq!(
            Message::parse(&header, &[]),
            Err(ProtocolError::UnsupportedMessage(16))
        );
    }

    #[test]
    fn features_reply_parses_dpid() {
        let mut body = vec![];
        body.extend_from_slice(&0x0001_0000_0001_0000u64.to_be_bytes());
        body.extend_from_slice(&256u32.to_be_bytes());
        body.push(1);
        body.extend_from_slice(&[0, 0, 0]);
        body.extend_from_slice(&0b1000_0111u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        let feats = SwitchFeatures::parse(&body).unwrap();
        assert_eq!(feats.datapath_id, 0x0001_0000_0001_0000);
        assert_eq!(feats.num_buffers, 256);
        assert!(feats.supported_capabilities.flow_stats);
        assert!(feats.supported_capabilities.arp_match_ip);
        assert!(!feats.supported_capabilities.port_stats);
    }
}
