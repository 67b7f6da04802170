use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};

use clap::Parser;
use thiserror::Error;

use crate::load::BalanceMode;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid DPID `{0}`: expected AA-BB-CC-DD-EE-FF|VID")]
    InvalidDpid(String),
    #[error("invalid load descriptor `{0}`: expected DC_WEIGHT:SRV_WEIGHT,SRV_WEIGHT,...")]
    InvalidLoad(String),
    #[error("{0} data-center DPIDs configured but {1} load descriptors")]
    LoadLengthMismatch(usize, usize),
    #[error("at least one data center is required")]
    NoDataCenters,
    #[error("duplicate DPID {0:#018x}")]
    DuplicateDpid(u64),
}

/// Decode `"AA-BB-CC-DD-EE-FF|VID"` into `(vid << 48) | mac`. The VID part
/// is optional and defaults to 0.
pub fn parse_dpid(s: &str) -> Result<u64, ConfigError> {
    let bad = || ConfigError::InvalidDpid(s.to_string());
    let (mac_part, vid_part) = match s.split_once('|') {
        Some((mac, vid)) => (mac, Some(vid)),
        None => (s, None),
    };
    let octets: Vec<&str> = mac_part.split('-').collect();
    if octets.len() != 6 {
        return Err(bad());
    }
    let mut mac: u64 = 0;
    for octet in octets {
        if octet.len() != 2 {
            return Err(bad());
        }
        let byte = u8::from_str_radix(octet, 16).map_err(|_| bad())?;
        mac = (mac << 8) | byte as u64;
    }
    let vid: u16 = match vid_part {
        Some(vid) => vid.parse().map_err(|_| bad())?,
        None => 0,
    };
    Ok(((vid as u64) << 48) | mac)
}

/// Target load share of one data center and of the servers inside it.
#[derive(Clone, Debug, PartialEq)]
pub struct DcLoad {
    pub weight: f64,
    pub srv_weights: Vec<f64>,
}

/// Decode `"W:w1,w2,..."`, e.g. `"0.5:0.25,0.75"`. Weights must be finite
/// and non-negative; they are normalized against their siblings later.
pub fn parse_dc_load(s: &str) -> Result<DcLoad, ConfigError> {
    let bad = || ConfigError::InvalidLoad(s.to_string());
    let (weight, srvs) = s.split_once(':').ok_or_else(bad)?;
    let weight: f64 = weight.trim().parse().map_err(|_| bad())?;
    let srv_weights = srvs
        .split(',')
        .map(|w| w.trim().parse::<f64>().map_err(|_| bad()))
        .collect::<Result<Vec<f64>, ConfigError>>()?;
    if srv_weights.is_empty()
        || !weight.is_finite()
        || weight < 0.0
        || srv_weights.iter().any(|w| !w.is_finite() || *w < 0.0)
    {
        return Err(bad());
    }
    Ok(DcLoad {
        weight,
        srv_weights,
    })
}

/// Launch parameters, with the defaults the emulation topology uses: one
/// main server switch, one client switch, and three data centers of three
/// servers each, evenly weighted.
#[derive(Debug, Parser)]
#[command(
    name = "psik_fabric_controller",
    about = "OpenFlow 1.0 controller serving DNS-based load balancing for service.psik.com"
)]
pub struct Opts {
    /// DPID of the main server switch.
    #[arg(long, value_parser = parse_dpid, default_value = "00-00-00-01-00-00|1")]
    pub mss_dpid: u64,

    /// Anycast IP the main server switch serves DNS and telemetry on.
    #[arg(long, default_value = "10.254.254.254")]
    pub mss_ip: Ipv4Addr,

    /// DPID of the main client switch.
    #[arg(long, value_parser = parse_dpid, default_value = "00-00-00-02-00-00|2")]
    pub mcs_dpid: u64,

    /// DPIDs of the data-center switches, in fabric-port order.
    #[arg(
        long = "dcs-dpid",
        value_parser = parse_dpid,
        default_values = [
            "00-00-00-01-01-00|101",
            "00-00-00-01-02-00|102",
            "00-00-00-01-03-00|103",
        ]
    )]
    pub dcs_dpids: Vec<u64>,

    /// Per-data-center target loads as DC_WEIGHT:SRV_WEIGHT,... (one per
    /// data-center switch).
    #[arg(
        long = "dc-load",
        value_parser = parse_dc_load,
        default_values = [
            "0.3333:0.3333,0.3333,0.3333",
            "0.3333:0.3333,0.3333,0.3333",
            "0.3333:0.3333,0.3333,0.3333",
        ]
    )]
    pub dcs_load: Vec<DcLoad>,

    /// What drives the balancing weights.
    #[arg(long, value_enum, default_value = "static")]
    pub balance: BalanceMode,

    /// OpenFlow listen address.
    #[arg(long, default_value = "0.0.0.0:6633")]
    pub listen: SocketAddr,
}

/// Cross-validated launch configuration.
#[derive(Debug, PartialEq)]
pub struct FabricConfig {
    pub mss_dpid: u64,
    pub mss_ip: Ipv4Addr,
    pub mcs_dpid: u64,
    pub dcs_dpids: Vec<u64>,
    pub dcs_load: Vec<DcLoad>,
    pub balance: BalanceMode,
    pub listen: SocketAddr,
}

impl FabricConfig {
    pub fn from_opts(opts: Opts) -> Result<FabricConfig, ConfigError> {
        if opts.dcs_dpids.is_empty() {
            return Err(ConfigError::NoDataCenters);
        }
        if opts.dcs_dpids.len() != opts.dcs_load.len() {
            return Err(ConfigError::LoadLengthMismatch(
                opts.dcs_dpids.len(),
                opts.dcs_load.len(),
            ));
        }
        let mut seen = HashSet::new();
        for &dpid in [opts.mss_dpid, opts.mcs_dpid]
            .iter()
            .chain(&opts.dcs_dpids)
        {
            if !seen.insert(dpid) {
                return Err(ConfigError::DuplicateDpid(dpid));
            }
        }
        Ok(FabricConfig {
            mss_dpid: opts.mss_dpid,
            mss_ip: opts.mss_ip,
            mcs_dpid: opts.mcs_dpid,
            dcs_dpids: opts.dcs_dpids,
            dcs_load: opts.dcs_load,
            balance: opts.balance,
            listen: opts.listen,
        })
    }
}
