use std::io::Write;
use std::net::Ipv4Addr;

use log::{debug, error};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::arp_switch::ArpVisibleSwitch;
use crate::dns::{Dns, Question, ResourceRecord, RrData, QTYPE_A, QTYPE_PTR};
use crate::learning_switch::{drop_buffer, drop_install};
use crate::load::{BalanceMode, LoadTable};
use crate::ofp_controller::openflow0x01::{send_flow_mod, send_packet_out};
use crate::openflow0x01::message::add_flow;
use crate::openflow0x01::{Action, PacketIn, PacketOut, Pattern, Payload, PseudoPort};
use crate::packet::{
    marshal_ethernet, marshal_udp_datagram, Ip, Nw, Packet, Tp, Udp, ETH_TYP_IP, IP_PROTO_UDP,
};

/// The one name this fabric is authoritative for.
pub const SERVICE_NAME: &str = "service.psik.com";

/// Backends report `"<cpu_blocks> <bytes>"` to this UDP port.
pub const SERVICE_LOAD_PORT: u16 = 9999;

pub const DNS_PORT: u16 = 53;

const UNWANTED_TRAFFIC_TIMEOUT: (u16, u16) = (10, 10);

/// The ARP-visible switch that also impersonates the authoritative DNS
/// server for [`SERVICE_NAME`] and sinks backend telemetry. DNS answers
/// carry a backend address picked by gap-weighted selection over the
/// configured targets and the telemetry-derived active loads.
pub struct MainServerSwitch {
    arp: ArpVisibleSwitch,
    loads: LoadTable,
    balance: BalanceMode,
    rng: StdRng,
}

impl MainServerSwitch {
    pub fn new(
        name: &str,
        dpid: u64,
        ip: Ipv4Addr,
        loads: LoadTable,
        balance: BalanceMode,
    ) -> MainServerSwitch {
        Self::with_rng(name, dpid, ip, loads, balance, StdRng::from_entropy())
    }

    /// Deterministic variant for statistical tests.
    pub fn with_rng(
        name: &str,
        dpid: u64,
        ip: Ipv4Addr,
        loads: LoadTable,
        balance: BalanceMode,
        rng: StdRng,
    ) -> MainServerSwitch {
        MainServerSwitch {
            arp: ArpVisibleSwitch::new(name, dpid, ip),
            loads,
            balance,
            rng,
        }
    }

    pub fn name(&self) -> &str {
        self.arp.name()
    }

    pub fn dpid(&self) -> u64 {
        self.arp.dpid()
    }

    pub fn my_mac(&self) -> u64 {
        self.arp.my_mac()
    }

    pub fn my_ip(&self) -> u32 {
        self.arp.my_ip()
    }

    pub fn loads(&self) -> &LoadTable {
        &self.loads
    }

    /// Runs once when the datapath binds: capture every UDP datagram with
    /// source port 53 permanently and ahead of anything the learning path
    /// installs. Clients here never see another DNS server, so in effect
    /// all DNS traffic transits the controller.
    pub fn connected(&mut self, writer: &mut dyn Write) {
        let mut pattern = Pattern::match_all();
        pattern.dl_typ = Some(ETH_TYP_IP);
        pattern.nw_proto = Some(IP_PROTO_UDP);
        pattern.tp_src = Some(DNS_PORT);
        let fm = add_flow(
            0xffff,
            pattern,
            vec![Action::Output(PseudoPort::Controller(0xffff))],
        );
        send_flow_mod(0, fm, writer);
    }

    pub fn packet_in(&mut self, pk: &Packet, pkt: PacketIn, writer: &mut dyn Write) {
        if pk.dl_dst != self.arp.my_mac() {
            self.arp.packet_in(pk, pkt, writer);
            return;
        }
        debug!("{}: packet directed to us", self.name());

        let udp = match pk.nw {
            Nw::Ip(ref ip) => match ip.tp {
                Tp::Udp(ref udp) => Some((ip, udp)),
                _ => None,
            },
            _ => None,
        };
        let Some((ip, udp)) = udp else {
            drop_install(pk, &pkt, UNWANTED_TRAFFIC_TIMEOUT, writer);
            return;
        };

        if udp.src == DNS_PORT || udp.dst == DNS_PORT {
            if let Some(query) = Dns::parse(&udp.payload) {
                self.handle_dns(pk, ip, udp, query, pkt, writer);
                return;
            }
        }
        if udp.dst == SERVICE_LOAD_PORT {
            self.handle_load_update(ip, udp, &pkt);
        } else {
            drop_install(pk, &pkt, UNWANTED_TRAFFIC_TIMEOUT, writer);
        }
    }

    /// Pick a backend for the service: a data center first, then a server
    /// inside it. Addresses follow the fabric convention
    /// `10.0.<dc + 1>.<srv + 1>`.
    fn choose_server(&mut self) -> Ipv4Addr {
        let (dc, srv) = self.loads.choose(&mut self.rng);
        Ipv4Addr::new(10, 0, dc as u8 + 1, srv as u8 + 1)
    }

    fn handle_dns(
        &mut self,
        pk: &Packet,
        ip: &Ip,
        udp: &Udp,
        query: Dns,
        pkt: PacketIn,
        writer: &mut dyn Write,
    ) {
        if query.questions.len() != 1 {
            drop_buffer(pkt, writer);
            return;
        }
        let question = &query.questions[0];
        debug!("question: {}", question.name);

        let answer = if question.qtype == QTYPE_A && question.name == SERVICE_NAME {
            // someone is asking about our service, choose a data center
            // server and answer for it
            let dc_ip = self.choose_server();
            RrData::A(u32::from(dc_ip))
        } else if question.qtype == QTYPE_PTR {
            // the only resolvable address around is our own
            RrData::Ptr(SERVICE_NAME.to_string())
        } else {
            drop_buffer(pkt, writer);
            return;
        };
        let response = ResourceRecord {
            name: question.name.clone(),
            typ: question.qtype,
            class: question.qclass,
            ttl: 0,
            data: answer,
        };
        self.send_dns_response(pk, ip, udp, &query, question.clone(), response, pkt.port, writer);
    }

    #[allow(clippy::too_many_arguments)]
    fn send_dns_response(
        &mut self,
        pk: &Packet,
        ip: &Ip,
        udp: &Udp,
        query: &Dns,
        question: Question,
        response: ResourceRecord,
        out_port: u16,
        writer: &mut dyn Write,
    ) {
        let reply = Dns {
            id: query.id,
            is_response: true,
            opcode: 0,
            aa: true,
            tc: false,
            rd: query.rd,
            ra: true,
            rcode: 0,
            questions: vec![question],
            answers: vec![response],
            authorities: vec![],
            additionals: vec![],
        };
        let datagram = marshal_udp_datagram(
            self.my_ip(),
            ip.src,
            DNS_PORT,
            udp.src,
            &reply.marshal(),
        );
        let frame = marshal_ethernet(self.my_mac(), pk.dl_src, ETH_TYP_IP, &datagram);
        let msg = PacketOut {
            output_payload: Payload::NotBuffered(frame),
            port_id: None,
            apply_actions: vec![Action::Output(PseudoPort::PhysicalPort(out_port))],
        };
        send_packet_out(0, msg, writer);
    }

    /// A backend reported its activity since the last round. Data-center
    /// index comes from the ingress port (the DC trunks sit on ports 2
    /// and up by topology construction), server index from the last
    /// octet of the source address.
    fn handle_load_update(&mut self, ip: &Ip, udp: &Udp, pkt: &PacketIn) {
        let Some((cpu_load, net_load)) = parse_load_report(&udp.payload) else {
            error!("malformed load info received");
            return;
        };

        let dc = pkt.port as usize;
        let Some(dc) = dc.checked_sub(2) else {
            error!("load info from unexpected port {}", pkt.port);
            return;
        };
        if dc >= self.loads.ndcs() {
            error!("load info from unexpected port {}", pkt.port);
            return;
        }
        let srv = (ip.src & 0xff) as usize;
        let Some(srv) = srv.checked_sub(1) else {
            error!("load info from unexpected address {}", Ipv4Addr::from(ip.src));
            return;
        };
        if srv >= self.loads.nsrvs(dc) {
            error!("load info from unexpected address {}", Ipv4Addr::from(ip.src));
            return;
        }

        if self.loads.record(dc, srv, cpu_load, net_load, ip.src) {
            self.loads.recompute(self.balance);
        }
    }
}

fn parse_load_report(payload: &[u8]) -> Option<(u64, u64)> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.split_whitespace();
    let cpu = parts.next()?.parse().ok()?;
    let net = parts.next()?.parse().ok()?;
    Some((cpu, net))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::QCLASS_IN;
    use crate::ofp_header::OfpHeader;
    use crate::ofp_message::OfpMessage;
    use crate::openflow0x01::message::Message;
    use crate::openflow0x01::{PacketInReason, Timeout};

    const DPID: u64 = 0x0001_0000_0001_0000;
    const MY_IP: Ipv4Addr = Ipv4Addr::new(10, 254, 254, 254);
    const MY_MAC: u64 = 0x0000_0000_0001_0000;
    const CLIENT_MAC: u64 = 0x0000_0000_0200_0001;
    const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 1);

    fn decode_all(buf: &[u8]) -> Vec<Message> {
        let mut msgs = vec![];
        let mut at = 0;
        while at < buf.len() {
            let header = OfpHeader::parse(buf[at..at + 8].try_into().unwrap());
            let body = &buf[at + 8..at + header.length()];
            msgs.push(Message::parse(&header, body).unwrap().1);
            at += header.length();
        }
        msgs
    }

    fn even_mss() -> MainServerSwitch {
        let loads = LoadTable::new(
            vec![1.0 / 3.0; 3],
            vec![vec![1.0 / 3.0; 3], vec![1.0 / 3.0; 3], vec![1.0 / 3.0; 3]],
        );
        MainServerSwitch::with_rng(
            "mss",
            DPID,
            MY_IP,
            loads,
            BalanceMode::DynamicCpu,
            StdRng::seed_from_u64(1),
        )
    }

    fn udp_frame(src_ip: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let datagram =
            marshal_udp_datagram(u32::from(src_ip), u32::from(MY_IP), sport, dport, payload);
        marshal_ethernet(CLIENT_MAC, MY_MAC, ETH_TYP_IP, &datagram)
    }

    fn deliver(mss: &mut MainServerSwitch, bytes: Vec<u8>, port: u16, out: &mut Vec<u8>) {
        let pk = Packet::parse(&bytes).unwrap();
        let pkt = PacketIn {
            total_len: bytes.len() as u16,
            input_payload: Payload::NotBuffered(bytes),
            port,
            reason: PacketInReason::NoMatch,
        };
        mss.packet_in(&pk, pkt, out);
    }

    fn dns_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        Dns::query(
            id,
            vec![Question {
                name: name.to_string(),
                qtype,
                qclass: QCLASS_IN,
            }],
        )
        .marshal()
    }

    fn parse_reply(out: &[u8]) -> (Packet, Dns) {
        let msgs = decode_all(out);
        let [Message::PacketOut(po)] = &msgs[..] else {
            panic!("expected exactly one PacketOut, got {:?}", msgs);
        };
        let frame = Packet::parse(po.output_payload.bytes()).unwrap();
        let dns = {
            let Nw::Ip(ref ip) = frame.nw else {
                panic!("reply is not IPv4")
            };
            let Tp::Udp(ref udp) = ip.tp else {
                panic!("reply is not UDP")
            };
            assert_eq!(udp.src, DNS_PORT);
            Dns::parse(&udp.payload).unwrap()
        };
        (frame, dns)
    }

    #[test]
    fn connect_installs_dns_capture_flow() {
        let mut mss = even_mss();
        let mut out = vec![];
        mss.connected(&mut out);
        match &decode_all(&out)[..] {
            [Message::FlowMod(fm)] => {
                assert_eq!(fm.priority, 0xffff);
                assert_eq!(fm.idle_timeout, Timeout::Permanent);
                assert_eq!(fm.hard_timeout, Timeout::Permanent);
                assert_eq!(fm.pattern.dl_typ, Some(ETH_TYP_IP));
                assert_eq!(fm.pattern.nw_proto, Some(IP_PROTO_UDP));
                assert_eq!(fm.pattern.tp_src, Some(DNS_PORT));
                assert_eq!(
                    fm.actions,
                    vec![Action::Output(PseudoPort::Controller(0xffff))]
                );
            }
            other => panic!("expected the capture FlowMod, got {:?}", other),
        }
    }

    #[test]
    fn a_query_for_the_service_gets_a_backend() {
        let mut mss = even_mss();
        let mut out = vec![];
        let query = dns_query(0x1234, SERVICE_NAME, QTYPE_A);
        deliver(&mut mss, udp_frame(CLIENT_IP, 40000, 53, &query), 1, &mut out);

        let (frame, reply) = parse_reply(&out);
        assert_eq!(frame.dl_src, MY_MAC);
        assert_eq!(frame.dl_dst, CLIENT_MAC);
        assert_eq!(reply.id, 0x1234);
        assert!(reply.is_response && reply.aa && reply.ra);
        assert!(reply.rd);
        assert_eq!(reply.questions.len(), 1);
        assert_eq!(reply.answers.len(), 1);
        let rr = &reply.answers[0];
        assert_eq!(rr.ttl, 0);
        match rr.data {
            RrData::A(addr) => {
                let ip = Ipv4Addr::from(addr);
                let [a, b, c, d] = ip.octets();
                assert_eq!((a, b), (10, 0));
                assert!((1..=3).contains(&c), "dc out of range: {}", ip);
                assert!((1..=3).contains(&d), "srv out of range: {}", ip);
            }
            ref other => panic!("expected an A record, got {:?}", other),
        }
        // destination port echoes the query's source port
        let Nw::Ip(ref ip) = frame.nw else { unreachable!() };
        let Tp::Udp(ref udp) = ip.tp else { unreachable!() };
        assert_eq!(udp.dst, 40000);
        assert_eq!(ip.dst, u32::from(CLIENT_IP));
        assert_eq!(ip.src, u32::from(MY_IP));
    }

    #[test]
    fn ptr_query_names_the_service() {
        let mut mss = even_mss();
        let mut out = vec![];
        let query = dns_query(7, "254.254.254.10.in-addr.arpa", QTYPE_PTR);
        deliver(&mut mss, udp_frame(CLIENT_IP, 1053, 53, &query), 1, &mut out);

        let (_, reply) = parse_reply(&out);
        assert_eq!(reply.id, 7);
        assert_eq!(
            reply.answers[0].data,
            RrData::Ptr(SERVICE_NAME.to_string())
        );
        assert_eq!(reply.answers[0].name, "254.254.254.10.in-addr.arpa");
    }

    #[test]
    fn a_query_for_another_name_is_dropped() {
        let mut mss = even_mss();
        let mut out = vec![];
        let query = dns_query(9, "elsewhere.example.com", QTYPE_A);
        deliver(&mut mss, udp_frame(CLIENT_IP, 1053, 53, &query), 1, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn unsupported_qtype_is_dropped() {
        let mut mss = even_mss();
        let mut out = vec![];
        let query = dns_query(9, SERVICE_NAME, 28); // AAAA
        deliver(&mut mss, udp_frame(CLIENT_IP, 1053, 53, &query), 1, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn multi_question_query_is_dropped() {
        let mut mss = even_mss();
        let mut out = vec![];
        let q = Question {
            name: SERVICE_NAME.to_string(),
            qtype: QTYPE_A,
            qclass: QCLASS_IN,
        };
        let query = Dns::query(5, vec![q.clone(), q]).marshal();
        deliver(&mut mss, udp_frame(CLIENT_IP, 1053, 53, &query), 1, &mut out);
        assert!(out.is_empty());

        let empty = Dns::query(6, vec![]).marshal();
        deliver(&mut mss, udp_frame(CLIENT_IP, 1053, 53, &empty), 1, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn non_udp_to_our_mac_is_blocked_briefly() {
        let mut mss = even_mss();
        let mut out = vec![];
        let frame = marshal_ethernet(CLIENT_MAC, MY_MAC, 0x4242, b"junk");
        deliver(&mut mss, frame, 1, &mut out);
        match &decode_all(&out)[..] {
            [Message::FlowMod(fm)] => {
                assert!(fm.actions.is_empty());
                assert_eq!(fm.idle_timeout, Timeout::ExpiresAfter(10));
                assert_eq!(fm.hard_timeout, Timeout::ExpiresAfter(10));
            }
            other => panic!("expected a drop FlowMod, got {:?}", other),
        }
    }

    #[test]
    fn udp_to_unknown_port_is_blocked_briefly() {
        let mut mss = even_mss();
        let mut out = vec![];
        deliver(&mut mss, udp_frame(CLIENT_IP, 1000, 1234, b"hm"), 1, &mut out);
        match &decode_all(&out)[..] {
            [Message::FlowMod(fm)] => assert!(fm.actions.is_empty()),
            other => panic!("expected a drop FlowMod, got {:?}", other),
        }
    }

    fn telemetry_frame(dc: u8, srv: u8, payload: &[u8]) -> Vec<u8> {
        let src_ip = Ipv4Addr::new(10, 0, dc + 1, srv + 1);
        let datagram = marshal_udp_datagram(
            u32::from(src_ip),
            u32::from(MY_IP),
            40000,
            SERVICE_LOAD_PORT,
            payload,
        );
        marshal_ethernet(0x0000_0000_0100 + srv as u64 + 1, MY_MAC, ETH_TYP_IP, &datagram)
    }

    #[test]
    fn full_telemetry_round_recomputes() {
        let mut mss = even_mss();
        let mut out = vec![];
        for dc in 0u8..3 {
            for srv in 0u8..3 {
                let report = if (dc, srv) == (0, 0) { "1000 5" } else { "10 5" };
                deliver(
                    &mut mss,
                    telemetry_frame(dc, srv, report.as_bytes()),
                    dc as u16 + 2,
                    &mut out,
                );
            }
        }
        assert!(out.is_empty(), "telemetry must not produce packets");
        let loads = mss.loads().active_dc_load();
        assert!(loads[0] > loads[1] * 10.0);
        assert!((loads.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn partial_telemetry_round_does_not_recompute() {
        let mut mss = even_mss();
        let mut out = vec![];
        for srv in 0u8..3 {
            deliver(&mut mss, telemetry_frame(0, srv, b"1000 5"), 2, &mut out);
        }
        assert_eq!(mss.loads().active_dc_load(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn malformed_telemetry_changes_nothing() {
        let mut mss = even_mss();
        let mut out = vec![];
        for payload in [&b"garbage"[..], b"12", b"", b"1.5 2", b"\xff\xfe 3"] {
            deliver(&mut mss, telemetry_frame(0, 0, payload), 2, &mut out);
        }
        assert!(out.is_empty());
        assert_eq!(mss.loads().active_dc_load(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn out_of_range_telemetry_is_ignored() {
        let mut mss = even_mss();
        let mut out = vec![];
        // port 9 implies dc 7, which does not exist
        deliver(&mut mss, telemetry_frame(0, 0, b"5 5"), 9, &mut out);
        // port below the dc trunk range
        deliver(&mut mss, telemetry_frame(0, 0, b"5 5"), 1, &mut out);
        // last octet 0 implies server index -1
        let src_ip = Ipv4Addr::new(10, 0, 1, 0);
        let datagram = marshal_udp_datagram(
            u32::from(src_ip),
            u32::from(MY_IP),
            40000,
            SERVICE_LOAD_PORT,
            b"5 5",
        );
        let frame = marshal_ethernet(0x42, MY_MAC, ETH_TYP_IP, &datagram);
        deliver(&mut mss, frame, 2, &mut out);
        assert!(out.is_empty());
        assert_eq!(mss.loads().active_dc_load(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn dynamic_selection_steers_away_from_hot_dc() {
        let mut mss = even_mss();
        let mut out = vec![];
        for dc in 0u8..3 {
            for srv in 0u8..3 {
                let report = if dc == 0 { "1000 5" } else { "10 5" };
                deliver(
                    &mut mss,
                    telemetry_frame(dc, srv, report.as_bytes()),
                    dc as u16 + 2,
                    &mut out,
                );
            }
        }
        let mut dc1_hits = 0u32;
        let trials = 1_000;
        for _ in 0..trials {
            let addr = mss.choose_server();
            if addr.octets()[2] == 1 {
                dc1_hits += 1;
            }
        }
        assert!(
            (dc1_hits as f64 / trials as f64) < 1.0 / 3.0,
            "hot dc still selected {}/{} times",
            dc1_hits,
            trials
        );
    }
}
