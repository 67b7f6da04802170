use std::io::Write;
use std::net::Ipv4Addr;

use log::info;

use crate::learning_switch::LearningSwitch;
use crate::ofp_controller::openflow0x01::send_packet_out;
use crate::openflow0x01::{Action, PacketIn, PacketOut, Payload, PseudoPort};
use crate::packet::{marshal_ethernet, Arp, Nw, Packet, ETH_TYP_ARP};

/// A learning switch that additionally owns an (IP, MAC) identity and
/// answers ARP requests for it. Nothing real sits behind the address; the
/// controller fabricates the L2 presence so the switch is reachable at an
/// anycast IP.
pub struct ArpVisibleSwitch {
    inner: LearningSwitch,
    my_mac: u64,
    my_ip: u32,
}

impl ArpVisibleSwitch {
    /// The switch impersonates the MAC embedded in the low 48 bits of its
    /// own DPID.
    pub fn new(name: &str, dpid: u64, ip: Ipv4Addr) -> ArpVisibleSwitch {
        ArpVisibleSwitch {
            inner: LearningSwitch::new(name, dpid),
            my_mac: dpid & 0x0000_ffff_ffff_ffff,
            my_ip: u32::from(ip),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn dpid(&self) -> u64 {
        self.inner.dpid()
    }

    pub fn my_mac(&self) -> u64 {
        self.my_mac
    }

    pub fn my_ip(&self) -> u32 {
        self.my_ip
    }

    pub fn learning(&self) -> &LearningSwitch {
        &self.inner
    }

    pub fn packet_in(&mut self, pk: &Packet, pkt: PacketIn, writer: &mut dyn Write) {
        match pk.nw {
            Nw::Arp(ref arpp) => self.handle_arp(arpp, pk, pkt, writer),
            _ => self.inner.packet_in(pk, pkt, writer),
        }
    }

    fn handle_arp(&mut self, arpp: &Arp, pk: &Packet, pkt: PacketIn, writer: &mut dyn Write) {
        let &Arp::Query(requester_hw, requester_proto, target_proto) = arpp else {
            self.inner.packet_in(pk, pkt, writer);
            return;
        };
        if target_proto != self.my_ip {
            self.inner.packet_in(pk, pkt, writer);
            return;
        }

        info!(
            "host {} is looking for us",
            Ipv4Addr::from(requester_proto)
        );
        let reply = Arp::Reply(self.my_mac, self.my_ip, requester_hw, requester_proto);
        let mut body = vec![];
        reply.marshal(&mut body);
        let frame = marshal_ethernet(self.my_mac, requester_hw, ETH_TYP_ARP, &body);
        let msg = PacketOut {
            output_payload: Payload::NotBuffered(frame),
            port_id: None,
            apply_actions: vec![Action::Output(PseudoPort::PhysicalPort(pkt.port))],
        };
        send_packet_out(0, msg, writer);
    }
}
