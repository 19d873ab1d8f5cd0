//! Phase of the LED triggers within the flash period.
//!
//! The LED fires every 50 ms, so the GPS nanoseconds of a trigger modulo that period say
//! where in the cycle the trigger landed. Each part and mirror drifts differently, so the
//! phases of a part are shifted to put their mean at one full period before they are binned
//! into the same histogram of 10000 bins spanning two periods.
use std::collections::BTreeMap;

use super::data_store::PartData;
use super::histogram::{Binning, Histogram};
use super::series::ChannelFilter;
use super::table::DataTable;

/// Nanoseconds between two LED flashes
pub const LED_PERIOD_NS: u32 = 50_000_000;

const RESONANCE_BINNING: Binning = Binning {
    nbins: 10_000,
    min: 0.0,
    max: 2.0 * LED_PERIOD_NS as f64,
};

/// Trigger phases of a part by the mirror which triggered
pub fn trigger_phases(part: &PartData, filter: &ChannelFilter) -> BTreeMap<u8, Vec<f64>> {
    let mut phases: BTreeMap<u8, Vec<f64>> = BTreeMap::new();
    for time in part.times() {
        for event in time.events.iter().filter(|e| filter.accepts_mirror(e.mirror)) {
            phases
                .entry(event.mirror)
                .or_default()
                .push((event.nsec % LED_PERIOD_NS) as f64);
        }
    }
    phases
}

/// Shift phases so that their mean sits at one full period
pub fn centre_phases(phases: &[f64]) -> Vec<f64> {
    if phases.is_empty() {
        return Vec::new();
    }
    let mean = phases.iter().sum::<f64>() / phases.len() as f64;
    let shift = LED_PERIOD_NS as f64 - mean;
    phases.iter().map(|phase| phase + shift).collect()
}

/// Histograms of the centred trigger phases of every mirror
#[derive(Debug, Clone, Default)]
pub struct LedResonance {
    hists: BTreeMap<u8, Histogram>,
}

impl LedResonance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_part(&mut self, part: &PartData, filter: &ChannelFilter) {
        for (mirror, phases) in trigger_phases(part, filter) {
            let hist = self
                .hists
                .entry(mirror)
                .or_insert_with(|| Histogram::new(RESONANCE_BINNING));
            for phase in centre_phases(&phases) {
                hist.fill(phase);
            }
        }
    }

    pub fn histogram(&self, mirror: u8) -> Option<&Histogram> {
        self.hists.get(&mirror)
    }

    pub fn new_table() -> DataTable {
        DataTable::new("led_resonance", &["mirror", "phase_ns", "count"])
    }

    /// One row per populated bin
    pub fn fill_table(&self, table: &mut DataTable) {
        for (mirror, hist) in self.hists.iter() {
            for (center, count) in hist.centers().into_iter().zip(hist.counts().iter()) {
                if *count > 0.0 {
                    table.push(vec![*mirror as f64, center, *count]);
                }
            }
        }
    }
}
