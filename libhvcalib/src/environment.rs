use fxhash::FxHashMap;
use regex::Regex;
use std::collections::BTreeMap;

use super::constants::{NOTICE_CLUSTER_PTH, NOTICE_LED_TEMPS};
use super::correlate::Timestamped;
use super::data_store::PartData;
use super::packet::NoticePacket;

/// Temperatures (K) of the four sensors on the reference LED board of a mirror
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedTemps {
    pub time_ms: i64,
    pub mirror: u8,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl LedTemps {
    /// The A and B sensors sit next to the LED itself
    pub fn ab_average(&self) -> f64 {
        (self.a + self.b) / 2.0
    }
}

impl Timestamped for LedTemps {
    fn time_ms(&self) -> i64 {
        self.time_ms
    }
}

/// Pressure, temperature and humidity inside a mirror cluster box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterPth {
    pub time_ms: i64,
    pub mirror: u8,
    pub pressure: f64,
    pub temperature: f64,
    pub humidity: f64,
}

impl Timestamped for ClusterPth {
    fn time_ms(&self) -> i64 {
        self.time_ms
    }
}

/// Parses the environmental readings that the monitoring daemons post as notices.
///
/// Notices whose text does not match are skipped; the daemons occasionally post
/// status messages on the same notice type.
#[derive(Debug, Clone)]
pub struct EnvironmentParser {
    led_temps_regex: Regex,
    pth_regex: Regex,
}

impl Default for EnvironmentParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentParser {
    pub fn new() -> Self {
        Self {
            led_temps_regex: Regex::new(r"^TEMP A (\S+) B (\S+) C (\S+) D (\S+)$")
                .expect("LED temperature regex is valid"),
            pth_regex: Regex::new(r"^m(\d{1,2}): @\d+ (\S+) (\S+) (\S+)")
                .expect("Cluster PTH regex is valid"),
        }
    }

    pub fn parse_led_temps(&self, notice: &NoticePacket) -> Option<LedTemps> {
        if notice.notice_type != NOTICE_LED_TEMPS {
            return None;
        }
        let caps = self.led_temps_regex.captures(&notice.text)?;
        let time_ms = notice.time_ms().ok()?;
        Some(LedTemps {
            time_ms,
            mirror: notice.mirror,
            a: caps[1].parse().ok()?,
            b: caps[2].parse().ok()?,
            c: caps[3].parse().ok()?,
            d: caps[4].parse().ok()?,
        })
    }

    /// The mirror comes from the text, not the packet header; one daemon reports for all
    pub fn parse_cluster_pth(&self, notice: &NoticePacket) -> Option<ClusterPth> {
        if notice.notice_type != NOTICE_CLUSTER_PTH {
            return None;
        }
        let caps = self.pth_regex.captures(&notice.text)?;
        let time_ms = notice.time_ms().ok()?;
        Some(ClusterPth {
            time_ms,
            mirror: caps[1].parse().ok()?,
            pressure: caps[2].parse().ok()?,
            temperature: caps[3].parse().ok()?,
            humidity: caps[4].parse().ok()?,
        })
    }

    /// LED temperatures of a set of parts, by mirror, in time order
    pub fn led_temps<'a>(
        &self,
        parts: impl IntoIterator<Item = &'a PartData>,
    ) -> BTreeMap<u8, Vec<LedTemps>> {
        let mut by_mirror: BTreeMap<u8, Vec<LedTemps>> = BTreeMap::new();
        let mut skipped = 0;
        for part in parts {
            for notice in part.notices().filter(|n| n.notice_type == NOTICE_LED_TEMPS) {
                match self.parse_led_temps(notice) {
                    Some(temps) => by_mirror.entry(temps.mirror).or_default().push(temps),
                    None => skipped += 1,
                }
            }
        }
        if skipped > 0 {
            spdlog::debug!("Skipped {skipped} malformed LED temperature notices");
        }
        for temps in by_mirror.values_mut() {
            temps.sort_by_key(|t| t.time_ms);
        }
        by_mirror
    }

    /// Cluster PTH readings of a set of parts, by mirror, in time order
    pub fn cluster_pth<'a>(
        &self,
        parts: impl IntoIterator<Item = &'a PartData>,
    ) -> BTreeMap<u8, Vec<ClusterPth>> {
        let mut by_mirror: BTreeMap<u8, Vec<ClusterPth>> = BTreeMap::new();
        let mut skipped = 0;
        for part in parts {
            for notice in part.notices().filter(|n| n.notice_type == NOTICE_CLUSTER_PTH) {
                match self.parse_cluster_pth(notice) {
                    Some(pth) => by_mirror.entry(pth.mirror).or_default().push(pth),
                    None => skipped += 1,
                }
            }
        }
        if skipped > 0 {
            spdlog::debug!("Skipped {skipped} malformed cluster PTH notices");
        }
        for readings in by_mirror.values_mut() {
            readings.sort_by_key(|r| r.time_ms);
        }
        by_mirror
    }

    /// Mean cluster temperature of each mirror within a single part
    pub fn mean_cluster_temperature(&self, part: &PartData) -> FxHashMap<u8, f64> {
        let mut sums: FxHashMap<u8, (f64, usize)> = FxHashMap::default();
        for pth in part.notices().filter_map(|n| self.parse_cluster_pth(n)) {
            let entry = sums.entry(pth.mirror).or_insert((0.0, 0));
            entry.0 += pth.temperature;
            entry.1 += 1;
        }
        sums.into_iter()
            .map(|(mirror, (sum, n))| (mirror, sum / n as f64))
            .collect()
    }
}
