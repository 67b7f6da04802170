//! OpenFlow controller plumbing: message send helpers and the
//! per-connection session loop that drives controller callbacks.

pub mod openflow0x01 {
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpStream;
    use std::sync::{Arc, Mutex};

    use log::{debug, error, info, warn};

    use crate::ofp_header::OfpHeader;
    use crate::ofp_message::{OfpMessage, ProtocolError};
    use crate::openflow0x01::message::Message;
    use crate::openflow0x01::{FlowMod, PacketIn, PacketOut, SwitchFeatures};

    /// Marshal and write one message. Sends are fire-and-forget: a peer
    /// that went away mid-write is logged and otherwise ignored, the read
    /// side of its loop will notice the close.
    pub fn send_message(xid: u32, message: Message, writer: &mut dyn Write) {
        let raw_msg = Message::marshal(xid, message);
        if let Err(e) = writer.write_all(&raw_msg) {
            warn!("failed to send OpenFlow message: {}", e);
        }
    }

    pub fn send_flow_mod(xid: u32, flow_mod: FlowMod, writer: &mut dyn Write) {
        send_message(xid, Message::FlowMod(flow_mod), writer)
    }

    pub fn send_packet_out(xid: u32, packet_out: PacketOut, writer: &mut dyn Write) {
        send_message(xid, Message::PacketOut(packet_out), writer)
    }

    /// OpenFlow 1.0 controller callbacks plus the per-connection session
    /// loop that drives them. One session loop runs per switch; all of
    /// them share the controller behind a mutex, so callbacks never
    /// overlap.
    pub trait OF0x01Controller: Send {
        /// A datapath completed the handshake and identified itself.
        fn switch_connected(&mut self, sw: u64, feats: SwitchFeatures, writer: &mut dyn Write);

        /// The session with a datapath ended.
        fn switch_disconnected(&mut self, sw: u64);

        /// A frame (or its buffer id) was punted to the controller.
        fn packet_in(&mut self, sw: u64, xid: u32, pkt: PacketIn, writer: &mut dyn Write);

        /// Perform the handshake and run the session loop until the peer
        /// hangs up. Protocol-level surprises are logged and skipped;
        /// only I/O failure ends the session.
        fn handle_client_connected(cntl: Arc<Mutex<Self>>, mut stream: TcpStream)
        where
            Self: Sized,
        {
            send_message(0, Message::Hello, &mut stream);

            let mut dpid: Option<u64> = None;
            let mut header_buf = [0u8; 8];
            loop {
                match stream.read_exact(&mut header_buf) {
                    Ok(()) => {}
                    Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => {
                        info!("connection closed");
                        break;
                    }
                    Err(e) => {
                        error!("error reading OpenFlow header: {}", e);
                        break;
                    }
                }
                let header = OfpHeader::parse(header_buf);
                let message_len = header.length().saturating_sub(OfpHeader::size());
                let mut message_buf = vec![0; message_len];
                if let Err(e) = stream.read_exact(&mut message_buf) {
                    error!("error reading OpenFlow message body: {}", e);
                    break;
                }
                match Message::parse(&header, &message_buf) {
                    Ok((_, Message::Hello)) => {
                        debug!("Hello");
                        send_message(10, Message::FeaturesReq, &mut stream);
                    }
                    Ok((xid, Message::EchoRequest(data))) => {
                        send_message(xid, Message::EchoReply(data), &mut stream);
                    }
                    Ok((_, Message::FeaturesReply(feats))) => {
                        let sw = feats.datapath_id;
                        dpid = Some(sw);
                        let Ok(mut ctl) = cntl.lock() else {
                            error!("controller state poisoned, dropping session");
                            return;
                        };
                        ctl.switch_connected(sw, feats, &mut stream);
                    }
                    Ok((xid, Message::PacketIn(pkt))) => match dpid {
                        Some(sw) => {
                            let Ok(mut ctl) = cntl.lock() else {
                                error!("controller state poisoned, dropping session");
                                return;
                            };
                            ctl.packet_in(sw, xid, pkt, &mut stream);
                        }
                        None => warn!("packet in before features reply, ignoring"),
                    },
                    Ok((_, msg)) => debug!("unhandled message: {:?}", msg),
                    Err(ProtocolError::UnsupportedMessage(typ)) => {
                        debug!("unsupported message type {}", typ)
                    }
                    Err(e) => warn!("dropping undecodable message: {}", e),
                }
            }
            if let Some(sw) = dpid {
                if let Ok(mut ctl) = cntl.lock() {
                    ctl.switch_disconnected(sw);
                }
            }
        }
    }
}
