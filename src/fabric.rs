use std::collections::HashSet;
use std::io::Write;

use log::{debug, error, info};

use crate::config::FabricConfig;
use crate::learning_switch::LearningSwitch;
use crate::load::LoadTable;
use crate::main_server_switch::MainServerSwitch;
use crate::ofp_controller::openflow0x01::OF0x01Controller;
use crate::openflow0x01::{PacketIn, SwitchFeatures};
use crate::packet::Packet;

/// Owns one instance of each switch role and attaches datapaths to them
/// as they connect, by DPID. Everything the fabric mutates is reached
/// from the session loops through one mutex, so handlers never overlap.
pub struct Fabric {
    mss: MainServerSwitch,
    mcs: LearningSwitch,
    dcs: Vec<LearningSwitch>,
    up: HashSet<u64>,
}

impl Fabric {
    pub fn new(cfg: FabricConfig) -> Fabric {
        let dc_targets: Vec<f64> = cfg.dcs_load.iter().map(|dc| dc.weight).collect();
        let srv_targets: Vec<Vec<f64>> =
            cfg.dcs_load.into_iter().map(|dc| dc.srv_weights).collect();
        info!("data center loads: {:?}", dc_targets);
        let loads = LoadTable::new(dc_targets, srv_targets);
        Fabric {
            mss: MainServerSwitch::new("mss", cfg.mss_dpid, cfg.mss_ip, loads, cfg.balance),
            mcs: LearningSwitch::new("mcs", cfg.mcs_dpid),
            dcs: cfg
                .dcs_dpids
                .iter()
                .enumerate()
                .map(|(i, &dpid)| LearningSwitch::new(&format!("dc{}", i + 1), dpid))
                .collect(),
            up: HashSet::new(),
        }
    }

    /// Test seam: swap in a main server switch with a seeded RNG.
    pub fn with_mss(mut self, mss: MainServerSwitch) -> Fabric {
        self.mss = mss;
        self
    }

    pub fn mss(&self) -> &MainServerSwitch {
        &self.mss
    }
}

impl OF0x01Controller for Fabric {
    fn switch_connected(&mut self, sw: u64, _feats: SwitchFeatures, writer: &mut dyn Write) {
        if sw == self.mss.dpid() {
            info!("main server switch found: {:016x}", sw);
            self.mss.connected(writer);
        } else if sw == self.mcs.dpid() {
            info!("main client switch found: {:016x}", sw);
        } else {
            let Some(dc) = self.dcs.iter().find(|dc| dc.dpid() == sw) else {
                error!("unable to identify switch: {:016x}", sw);
                return;
            };
            info!("{} switch found: {:016x}", dc.name(), sw);
        }
        self.up.insert(sw);
    }

    fn switch_disconnected(&mut self, sw: u64) {
        info!("switch disconnected: {:016x}", sw);
        self.up.remove(&sw);
    }

    fn packet_in(&mut self, sw: u64, _xid: u32, pkt: PacketIn, writer: &mut dyn Write) {
        if !self.up.contains(&sw) {
            debug!("packet in from unbound datapath {:016x}, ignoring", sw);
            return;
        }
        let Some(pk) = Packet::parse(pkt.input_payload.bytes()) else {
            debug!("unparsable frame from {:016x}", sw);
            return;
        };
        if sw == self.mss.dpid() {
            self.mss.packet_in(&pk, pkt, writer);
        } else if sw == self.mcs.dpid() {
            self.mcs.packet_in(&pk, pkt, writer);
        } else if let Some(dc) = self.dcs.iter_mut().find(|dc| dc.dpid() == sw) {
            dc.packet_in(&pk, pkt, writer);
        }
    }
}
