//! Two-level (data center / server) load bookkeeping and gap-weighted
//! random selection.

use std::collections::HashSet;

use clap::ValueEnum;
use log::info;
use rand::Rng;

/// Which telemetry channel drives recomputation of the active loads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum BalanceMode {
    /// Weights come from configuration alone; telemetry is recorded but
    /// never changes the selection.
    Static,
    /// Weight by reported CPU blocks consumed since the last report.
    DynamicCpu,
    /// Weight by reported bytes served since the last report.
    DynamicNet,
}

/// Keeps a saturated tier selectable: even at `active >= target` the tier
/// retains this much weight, small enough not to disturb meaningful gaps.
pub const SATURATION_ESCAPE: f64 = 0.01;

pub fn gap(target: f64, active: f64) -> f64 {
    (target - active).max(0.0) + SATURATION_ESCAPE
}

fn normalized(v: Vec<f64>) -> Vec<f64> {
    let total: f64 = v.iter().sum();
    if total > 0.0 {
        v.into_iter().map(|x| x / total).collect()
    } else {
        v
    }
}

/// Target and observed load fractions for every data center and the
/// servers inside each one, plus the raw telemetry they were computed from.
#[derive(Clone, Debug)]
pub struct LoadTable {
    target_dc_load: Vec<f64>,
    target_srv_load: Vec<Vec<f64>>,
    active_dc_load: Vec<f64>,
    active_srv_load: Vec<Vec<f64>>,
    wip: Vec<Vec<(u64, u64)>>,
    info_received: HashSet<u32>,
    nservers: usize,
}

impl LoadTable {
    /// Targets are normalized here, so configurations whose weights do not
    /// quite sum to 1 still behave proportionally.
    pub fn new(target_dc_load: Vec<f64>, target_srv_load: Vec<Vec<f64>>) -> LoadTable {
        assert_eq!(target_dc_load.len(), target_srv_load.len());
        let nservers = target_srv_load.iter().map(Vec::len).sum();
        let active_srv_load: Vec<Vec<f64>> =
            target_srv_load.iter().map(|dc| vec![0.0; dc.len()]).collect();
        let wip = target_srv_load.iter().map(|dc| vec![(0, 0); dc.len()]).collect();
        LoadTable {
            active_dc_load: vec![0.0; target_dc_load.len()],
            target_dc_load: normalized(target_dc_load),
            target_srv_load: target_srv_load.into_iter().map(normalized).collect(),
            active_srv_load,
            wip,
            info_received: HashSet::new(),
            nservers,
        }
    }

    pub fn ndcs(&self) -> usize {
        self.target_dc_load.len()
    }

    pub fn nsrvs(&self, dc: usize) -> usize {
        self.target_srv_load[dc].len()
    }

    pub fn nservers(&self) -> usize {
        self.nservers
    }

    pub fn active_dc_load(&self) -> &[f64] {
        &self.active_dc_load
    }

    pub fn active_srv_load(&self) -> &[Vec<f64>] {
        &self.active_srv_load
    }

    /// Store one telemetry report. Returns true when every server has
    /// reported since the last recompute; the reporting set starts over
    /// either way once full. Indexes must have been validated by the
    /// caller.
    pub fn record(&mut self, dc: usize, srv: usize, cpu: u64, net: u64, src_ip: u32) -> bool {
        self.wip[dc][srv] = (cpu, net);
        self.info_received.insert(src_ip);
        if self.info_received.len() == self.nservers {
            self.info_received.clear();
            true
        } else {
            false
        }
    }

    /// Rebuild the active load fractions from the last full round of
    /// telemetry. A tier that reported nothing at all keeps load 0, so a
    /// fully idle fabric falls back to target-only selection.
    pub fn recompute(&mut self, mode: BalanceMode) {
        let channel = match mode {
            BalanceMode::Static => return,
            BalanceMode::DynamicCpu => 0,
            BalanceMode::DynamicNet => 1,
        };
        let sample = |pair: &(u64, u64)| if channel == 0 { pair.0 } else { pair.1 };
        let mut dc_sums = Vec::with_capacity(self.ndcs());
        for (dc, srv_loads) in self.wip.iter().zip(self.active_srv_load.iter_mut()) {
            let dc_sum: u64 = dc.iter().map(&sample).sum();
            for (srv_data, load) in dc.iter().zip(srv_loads.iter_mut()) {
                *load = if dc_sum != 0 {
                    sample(srv_data) as f64 / dc_sum as f64
                } else {
                    0.0
                };
            }
            dc_sums.push(dc_sum);
        }
        let total: u64 = dc_sums.iter().sum();
        for (load, dc_sum) in self.active_dc_load.iter_mut().zip(dc_sums) {
            *load = if total != 0 {
                dc_sum as f64 / total as f64
            } else {
                0.0
            };
        }
        info!("new load: {:?}", self.active_dc_load);
    }

    /// Pick a data center, then a server inside it, each by a weighted
    /// draw over the target/active gap.
    pub fn choose<R: Rng>(&self, rng: &mut R) -> (usize, usize) {
        let dc = weighted_choice(&self.target_dc_load, &self.active_dc_load, rng);
        let srv = weighted_choice(&self.target_srv_load[dc], &self.active_srv_load[dc], rng);
        (dc, srv)
    }
}

/// Inverse-CDF draw over gap weights. Equal prefix sums break toward the
/// lower index.
fn weighted_choice<R: Rng>(target: &[f64], active: &[f64], rng: &mut R) -> usize {
    let weights: Vec<f64> = target
        .iter()
        .zip(active)
        .map(|(&t, &a)| gap(t, a))
        .collect();
    let total: f64 = weights.iter().sum();
    let r = rng.gen_range(0.0..=total);
    let mut upto = 0.0;
    for (i, w) in weights.iter().enumerate() {
        upto += w;
        if upto >= r {
            return i;
        }
    }
    // unreachable except for floating-point rounding at the very top
    weights.len() - 1
}
