//! Time series and profiles pulled out of LED parts.
//!
//! Each extractor reads one part and appends rows to a [DataTable]; the process drivers run
//! them over every LED part in stamp order.
use bit_set::BitSet;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use super::channel_id::ChannelId;
use super::data_store::{minute_time_ms, PartData};
use super::environment::EnvironmentParser;
use super::error::PartError;
use super::flash_stats::FlashStat;
use super::table::DataTable;

/// The series the `series` task can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SeriesKind {
    Supply,
    TubeHv,
    SubclusterHv,
    SubtubeHv,
    Thresholds,
    LedTemps,
    ClusterPth,
    HvProfile,
    QdcbVsEvent,
    FlashCluster,
    FlashTube,
}

impl SeriesKind {
    pub const ALL: [SeriesKind; 11] = [
        Self::Supply,
        Self::TubeHv,
        Self::SubclusterHv,
        Self::SubtubeHv,
        Self::Thresholds,
        Self::LedTemps,
        Self::ClusterPth,
        Self::HvProfile,
        Self::QdcbVsEvent,
        Self::FlashCluster,
        Self::FlashTube,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Supply => "supply",
            Self::TubeHv => "tube-hv",
            Self::SubclusterHv => "subcluster-hv",
            Self::SubtubeHv => "subtube-hv",
            Self::Thresholds => "thresholds",
            Self::LedTemps => "led-temps",
            Self::ClusterPth => "cluster-pth",
            Self::HvProfile => "hv-profile",
            Self::QdcbVsEvent => "qdcb-vs-event",
            Self::FlashCluster => "flash-cluster",
            Self::FlashTube => "flash-tube",
        }
    }

    /// Series built from the flash statistics logs rather than the parts
    pub fn is_from_stats_log(&self) -> bool {
        matches!(self, Self::FlashCluster | Self::FlashTube)
    }

    /// An empty table with the columns of this series
    pub fn new_table(&self) -> DataTable {
        let name = self.name().replace('-', "_");
        match self {
            Self::Supply => DataTable::new(&name, &["time_ms", "mirror", "supply"]),
            Self::TubeHv => DataTable::new(&name, &["time_ms", "mirror", "tube", "hv"]),
            Self::SubclusterHv => DataTable::new(&name, &["time_ms", "mirror", "subcluster", "mean_hv"]),
            Self::SubtubeHv => DataTable::new(&name, &["time_ms", "mirror", "subtube", "mean_hv"]),
            Self::Thresholds => DataTable::new(&name, &["time_ms", "mirror", "mean_threshold"]),
            Self::LedTemps => {
                DataTable::new(&name, &["time_ms", "mirror", "a", "b", "c", "d", "ab_average"])
            }
            Self::ClusterPth => {
                DataTable::new(&name, &["time_ms", "mirror", "pressure", "temperature", "humidity"])
            }
            Self::HvProfile => {
                DataTable::new(&name, &["mirror", "tube", "subcluster", "mean_hv", "readings"])
            }
            Self::QdcbVsEvent => DataTable::new(&name, &["mirror", "tube", "event", "qdcb"]),
            Self::FlashCluster => DataTable::new(
                &name,
                &["time_ms", "mirror", "entries", "hist_mean", "hist_rms", "constant", "mean", "sigma"],
            ),
            Self::FlashTube => DataTable::new(&name, &["time_ms", "mirror", "tube", "entries", "hist_mean"]),
        }
    }
}

impl FromStr for SeriesKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|kind| kind.name() == s)
            .copied()
            .ok_or_else(|| format!("Unknown series {s:?}"))
    }
}

impl Display for SeriesKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which channels a series covers
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    mirrors: Option<BitSet>,
    tube: Option<u16>,
    n_tubes: Option<u16>,
}

impl ChannelFilter {
    pub fn new(mirrors: &[u8], tube: Option<u16>) -> Self {
        let mirrors = if mirrors.is_empty() {
            None
        } else {
            Some(mirrors.iter().map(|m| *m as usize).collect())
        };
        Self {
            mirrors,
            tube,
            n_tubes: None,
        }
    }

    /// Also reject tubes at or past `n_tubes`
    pub fn with_n_tubes(mut self, n_tubes: u16) -> Self {
        self.n_tubes = Some(n_tubes);
        self
    }

    pub fn accepts_mirror(&self, mirror: u8) -> bool {
        self.mirrors
            .as_ref()
            .map(|set| set.contains(mirror as usize))
            .unwrap_or(true)
    }

    pub fn accepts(&self, channel: &ChannelId) -> bool {
        self.accepts_mirror(channel.mirror)
            && self.n_tubes.map(|n| channel.tube < n).unwrap_or(true)
            && self.tube.map(|t| t == channel.tube).unwrap_or(true)
    }
}

/// How tubes are grouped within a mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TubeGroup {
    Subcluster,
    Subtube,
}

impl TubeGroup {
    fn of(&self, channel: &ChannelId) -> u16 {
        match self {
            Self::Subcluster => channel.subcluster(),
            Self::Subtube => channel.subtube(),
        }
    }
}

pub fn supply_series(part: &PartData, filter: &ChannelFilter, table: &mut DataTable) -> Result<(), PartError> {
    let start = part.run_start_ms()?;
    for volts in part.volts().filter(|v| filter.accepts_mirror(v.mirror)) {
        table.push(vec![
            minute_time_ms(start, volts.minute) as f64,
            volts.mirror as f64,
            volts.supply as f64,
        ]);
    }
    Ok(())
}

pub fn tube_hv_series(part: &PartData, filter: &ChannelFilter, table: &mut DataTable) -> Result<(), PartError> {
    let start = part.run_start_ms()?;
    for volts in part.volts() {
        let time_ms = minute_time_ms(start, volts.minute) as f64;
        for (tube, hv) in volts.channel_hv() {
            let channel = ChannelId::new(volts.mirror, tube);
            if filter.accepts(&channel) {
                table.push(vec![time_ms, volts.mirror as f64, tube as f64, hv]);
            }
        }
    }
    Ok(())
}

/// Mean HV of each tube group of a mirror, once per volts packet
pub fn group_hv_series(
    part: &PartData,
    group: TubeGroup,
    filter: &ChannelFilter,
    table: &mut DataTable,
) -> Result<(), PartError> {
    let start = part.run_start_ms()?;
    for volts in part.volts().filter(|v| filter.accepts_mirror(v.mirror)) {
        let time_ms = minute_time_ms(start, volts.minute) as f64;
        let mut groups: BTreeMap<u16, (f64, usize)> = BTreeMap::new();
        for (tube, hv) in volts.channel_hv() {
            let entry = groups
                .entry(group.of(&ChannelId::new(volts.mirror, tube)))
                .or_insert((0.0, 0));
            entry.0 += hv;
            entry.1 += 1;
        }
        for (number, (sum, n)) in groups {
            table.push(vec![time_ms, volts.mirror as f64, number as f64, sum / n as f64]);
        }
    }
    Ok(())
}

pub fn threshold_series(part: &PartData, filter: &ChannelFilter, table: &mut DataTable) -> Result<(), PartError> {
    let start = part.run_start_ms()?;
    for threshold in part.thresholds().filter(|t| filter.accepts_mirror(t.mirror)) {
        if let Some(mean) = threshold.mean() {
            table.push(vec![
                minute_time_ms(start, threshold.minute) as f64,
                threshold.mirror as f64,
                mean,
            ]);
        }
    }
    Ok(())
}

pub fn led_temps_series(
    part: &PartData,
    parser: &EnvironmentParser,
    filter: &ChannelFilter,
    table: &mut DataTable,
) {
    for temps in parser.led_temps([part]).into_values().flatten() {
        if filter.accepts_mirror(temps.mirror) {
            table.push(vec![
                temps.time_ms as f64,
                temps.mirror as f64,
                temps.a,
                temps.b,
                temps.c,
                temps.d,
                temps.ab_average(),
            ]);
        }
    }
}

pub fn cluster_pth_series(
    part: &PartData,
    parser: &EnvironmentParser,
    filter: &ChannelFilter,
    table: &mut DataTable,
) {
    for pth in parser.cluster_pth([part]).into_values().flatten() {
        if filter.accepts_mirror(pth.mirror) {
            table.push(vec![
                pth.time_ms as f64,
                pth.mirror as f64,
                pth.pressure,
                pth.temperature,
                pth.humidity,
            ]);
        }
    }
}

/// QDCB of the selected tubes in every event they took part in
pub fn qdcb_vs_event_series(part: &PartData, filter: &ChannelFilter, table: &mut DataTable) {
    for event in part.events().filter(|e| filter.accepts_mirror(e.mirror)) {
        let mask = event.hit_mask();
        for tube in mask.iter() {
            let channel = ChannelId::new(event.mirror, tube as u16);
            if !filter.accepts(&channel) {
                continue;
            }
            if let Some(hit) = event.hit(channel.tube) {
                table.push(vec![
                    event.mirror as f64,
                    tube as f64,
                    event.event as f64,
                    hit.qdcb as f64,
                ]);
            }
        }
    }
}

/// Mean HV of every tube over all parts added
#[derive(Debug, Clone, Default)]
pub struct HvProfile {
    sums: BTreeMap<ChannelId, (f64, usize)>,
}

impl HvProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_part(&mut self, part: &PartData, filter: &ChannelFilter) {
        for volts in part.volts() {
            for (tube, hv) in volts.channel_hv() {
                let channel = ChannelId::new(volts.mirror, tube);
                if filter.accepts(&channel) {
                    let entry = self.sums.entry(channel).or_insert((0.0, 0));
                    entry.0 += hv;
                    entry.1 += 1;
                }
            }
        }
    }

    pub fn fill_table(&self, table: &mut DataTable) {
        for (channel, (sum, n)) in self.sums.iter() {
            table.push(vec![
                channel.mirror as f64,
                channel.tube as f64,
                channel.subcluster() as f64,
                sum / *n as f64,
                *n as f64,
            ]);
        }
    }
}

/// Cluster statistics of flashes seen by at least `min_entries` tubes, in time order
pub fn flash_cluster_series(
    stats: &[FlashStat],
    min_entries: u64,
    filter: &ChannelFilter,
    table: &mut DataTable,
) {
    let mut kept: Vec<&FlashStat> = stats
        .iter()
        .filter(|s| s.tube.is_none() && s.entries >= min_entries && filter.accepts_mirror(s.mirror))
        .collect();
    kept.sort_by_key(|s| s.time_ms);
    for stat in kept {
        table.push(vec![
            stat.time_ms as f64,
            stat.mirror as f64,
            stat.entries as f64,
            stat.hist_mean,
            stat.hist_rms,
            stat.constant,
            stat.mean,
            stat.sigma,
        ]);
    }
}

/// Histogram mean of every tube statistic over time
pub fn flash_tube_series(stats: &[FlashStat], filter: &ChannelFilter, table: &mut DataTable) {
    for stat in stats.iter() {
        let Some(channel) = stat.channel() else {
            continue;
        };
        if filter.accepts(&channel) {
            table.push(vec![
                stat.time_ms as f64,
                channel.mirror as f64,
                channel.tube as f64,
                stat.entries as f64,
                stat.hist_mean,
            ]);
        }
    }
}
