use std::collections::HashMap;
use std::io::Write;

use log::{debug, warn};

use crate::ofp_controller::openflow0x01::{send_flow_mod, send_packet_out};
use crate::openflow0x01::message::add_flow;
use crate::openflow0x01::{
    Action, PacketIn, PacketOut, Pattern, Payload, PseudoPort, Timeout, DEFAULT_PRIORITY,
};
use crate::packet::{is_multicast_mac, mac_to_string, Packet};

const LEARNED_IDLE_TIMEOUT: u16 = 10;
const LEARNED_HARD_TIMEOUT: u16 = 30;
const LOOP_DAMP_TIMEOUT: u16 = 10;

/// Install a flow that drops everything looking like `pk` on its ingress
/// port for `duration = (idle, hard)` seconds, consuming the triggering
/// buffer along the way.
pub fn drop_install(pk: &Packet, pkt: &PacketIn, duration: (u16, u16), writer: &mut dyn Write) {
    let mut fm = add_flow(DEFAULT_PRIORITY, Pattern::of_packet(pk, pkt.port), vec![]);
    fm.idle_timeout = Timeout::ExpiresAfter(duration.0);
    fm.hard_timeout = Timeout::ExpiresAfter(duration.1);
    fm.apply_to_packet = pkt.input_payload.buffer_id();
    send_flow_mod(0, fm, writer);
}

/// Release the datapath buffer holding `pkt` without forwarding it
/// anywhere. A miss that arrived unbuffered needs no reaction at all.
pub fn drop_buffer(pkt: PacketIn, writer: &mut dyn Write) {
    if let Payload::Buffered(..) = pkt.input_payload {
        let msg = PacketOut {
            port_id: Some(pkt.port),
            output_payload: pkt.input_payload,
            apply_actions: vec![],
        };
        send_packet_out(0, msg, writer);
    }
}

/// MAC-learning fast path. Every miss that reaches the controller teaches
/// it where the frame's source lives; the destination then decides the
/// reaction. Multicast (broadcast included) and still-unknown destinations
/// flood. A destination learned on the very port the frame arrived on
/// points at an L2 loop or a just-moved host, so instead of forwarding,
/// the flow is blocked on the datapath for a few seconds to damp it.
/// Anything else gets a flow installed matching the whole packet plus its
/// ingress port, outputting to the learned port, with the triggering
/// frame sent along.
///
/// Learned flows age out on the datapath (10 s idle, 30 s hard), so a
/// stale mapping self-heals by relearning; there is no controller-side
/// expiry.
pub struct LearningSwitch {
    name: String,
    dpid: u64,
    mac_table: HashMap<u64, u16>,
}

impl LearningSwitch {
    pub fn new(name: &str, dpid: u64) -> LearningSwitch {
        LearningSwitch {
            name: name.to_string(),
            dpid,
            mac_table: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dpid(&self) -> u64 {
        self.dpid
    }

    pub fn learned_port(&self, mac: u64) -> Option<u16> {
        self.mac_table.get(&mac).copied()
    }

    fn flood(&self, pkt: PacketIn, writer: &mut dyn Write) {
        let msg = PacketOut {
            port_id: Some(pkt.port),
            output_payload: pkt.input_payload,
            apply_actions: vec![Action::Output(PseudoPort::Flood)],
        };
        send_packet_out(0, msg, writer);
    }

    pub fn packet_in(&mut self, pk: &Packet, pkt: PacketIn, writer: &mut dyn Write) {
        self.mac_table.insert(pk.dl_src, pkt.port);

        if is_multicast_mac(pk.dl_dst) {
            self.flood(pkt, writer);
            return;
        }
        let out_port = match self.learned_port(pk.dl_dst) {
            Some(p) => p,
            None => {
                debug!(
                    "{}: route to {} not found, flooding",
                    self.name,
                    mac_to_string(pk.dl_dst)
                );
                self.flood(pkt, writer);
                return;
            }
        };
        if out_port == pkt.port {
            warn!(
                "{}: same port for {} -> {} on port {}, dropping",
                self.name,
                mac_to_string(pk.dl_src),
                mac_to_string(pk.dl_dst),
                out_port
            );
            drop_install(pk, &pkt, (LOOP_DAMP_TIMEOUT, LOOP_DAMP_TIMEOUT), writer);
            return;
        }

        debug!(
            "{}: installing flow for {}.{} -> {}.{}",
            self.name,
            mac_to_string(pk.dl_src),
            pkt.port,
            mac_to_string(pk.dl_dst),
            out_port
        );
        let mut fm = add_flow(
            DEFAULT_PRIORITY,
            Pattern::of_packet(pk, pkt.port),
            vec![Action::Output(PseudoPort::PhysicalPort(out_port))],
        );
        fm.idle_timeout = Timeout::ExpiresAfter(LEARNED_IDLE_TIMEOUT);
        fm.hard_timeout = Timeout::ExpiresAfter(LEARNED_HARD_TIMEOUT);
        match pkt.input_payload {
            Payload::Buffered(buffer_id, _) => {
                // the flow mod applies straight to the buffered frame
                fm.apply_to_packet = Some(buffer_id);
                send_flow_mod(0, fm, writer);
            }
            Payload::NotBuffered(_) => {
                send_flow_mod(0, fm, writer);
                let msg = PacketOut {
                    port_id: Some(pkt.port),
                    output_payload: pkt.input_payload,
                    apply_actions: vec![Action::Output(PseudoPort::PhysicalPort(out_port))],
                };
                send_packet_out(0, msg, writer);
            }
        }
    }
}
