//! Statistics of the LED flashes.
//!
//! Every LED part holds a few hundred reference flashes per mirror. A flash is summarised
//! by a histogram of the QDCB charge of every tube that saw it (cluster statistics), and
//! every tube is summarised by a histogram of its QDCB over all flashes of a part (tube
//! statistics). The summaries are kept in append-only text logs so that new parts can be
//! added without recomputing old ones.
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use super::channel_id::ChannelId;
use super::correlate::Timestamped;
use super::data_store::{event_time_ms, PartData};
use super::error::{FlashStatsError, PartError, StatsLogError};
use super::hal_stamp::HalStamp;
use super::histogram::Histogram;

fn stat_regex() -> &'static Regex {
    static STAT_REGEX: OnceLock<Regex> = OnceLock::new();
    STAT_REGEX.get_or_init(|| {
        Regex::new(
            r"^(\d+) (y\d{4}m\d{2}d\d{2}p\d{2})m(\d{2})(?:t(\d{3}))? (-?\d+) (\d+) (\S+) (\S+) (\S+) (\S+) (\S+)$",
        )
        .expect("Flash stat regex is valid")
    })
}

/// Which histogram a statistic summarises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsLevel {
    /// One flash, all tubes
    Cluster,
    /// One tube, all flashes of a part
    Tube,
}

/// Summary of one QDCB histogram
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlashStat {
    pub index: u64,
    pub stamp: HalStamp,
    pub mirror: u8,
    pub tube: Option<u16>,
    pub time_ms: i64,
    pub entries: u64,
    pub hist_mean: f64,
    pub hist_rms: f64,
    pub constant: f64,
    pub mean: f64,
    pub sigma: f64,
}

impl FlashStat {
    fn from_histogram(
        index: u64,
        stamp: HalStamp,
        mirror: u8,
        tube: Option<u16>,
        time_ms: i64,
        hist: &Histogram,
    ) -> Self {
        let gaussian = hist.fit_gaussian();
        Self {
            index,
            stamp,
            mirror,
            tube,
            time_ms,
            entries: hist.entries(),
            hist_mean: hist.mean(),
            hist_rms: hist.rms(),
            constant: gaussian.constant,
            mean: gaussian.mean,
            sigma: gaussian.sigma,
        }
    }

    /// Stamp extended with the mirror and, for tube statistics, the tube: `y2009m08d21p01m06t035`
    pub fn label(&self) -> String {
        match self.tube {
            Some(tube) => format!("{}m{:02}t{:03}", self.stamp, self.mirror, tube),
            None => format!("{}m{:02}", self.stamp, self.mirror),
        }
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.tube.map(|tube| ChannelId::new(self.mirror, tube))
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {:.6} {:.6} {:.6} {:.6} {:.6}",
            self.index,
            self.label(),
            self.time_ms,
            self.entries,
            self.hist_mean,
            self.hist_rms,
            self.constant,
            self.mean,
            self.sigma
        )
    }

    /// Parse a log line. Returns None if the line is not a flash statistic.
    pub fn parse_line(line: &str) -> Option<Self> {
        let caps = stat_regex().captures(line.trim_end())?;
        Some(Self {
            index: caps[1].parse().ok()?,
            stamp: HalStamp::from_str(&caps[2]).ok()?,
            mirror: caps[3].parse().ok()?,
            tube: match caps.get(4) {
                Some(tube) => Some(tube.as_str().parse().ok()?),
                None => None,
            },
            time_ms: caps[5].parse().ok()?,
            entries: caps[6].parse().ok()?,
            hist_mean: caps[7].parse().ok()?,
            hist_rms: caps[8].parse().ok()?,
            constant: caps[9].parse().ok()?,
            mean: caps[10].parse().ok()?,
            sigma: caps[11].parse().ok()?,
        })
    }
}

impl Timestamped for FlashStat {
    fn time_ms(&self) -> i64 {
        self.time_ms
    }
}

/// One statistic per event packet of the part, numbered from `first_index`
pub fn cluster_stats(part: &PartData, first_index: u64) -> Result<Vec<FlashStat>, PartError> {
    let start = part.run_start_ms()?;
    let stats = part
        .events()
        .enumerate()
        .map(|(idx, event)| {
            let qdcb: Vec<u16> = event.hits.iter().map(|hit| hit.qdcb).collect();
            let hist = Histogram::from_counts(&qdcb);
            FlashStat::from_histogram(
                first_index + idx as u64,
                part.stamp,
                event.mirror,
                None,
                event_time_ms(start, event),
                &hist,
            )
        })
        .collect();
    Ok(stats)
}

/// One statistic per tube that fired in the part, in channel order, numbered from `first_index`.
///
/// The time of a tube statistic is the (integer) mean time of the events it was filled from.
pub fn tube_stats(part: &PartData, first_index: u64) -> Result<Vec<FlashStat>, PartError> {
    let start = part.run_start_ms()?;
    let mut by_channel: BTreeMap<ChannelId, (Vec<u16>, Vec<i64>)> = BTreeMap::new();
    for event in part.events() {
        let time_ms = event_time_ms(start, event);
        for hit in event.hits.iter() {
            let entry = by_channel
                .entry(ChannelId::new(event.mirror, hit.tube))
                .or_default();
            entry.0.push(hit.qdcb);
            entry.1.push(time_ms);
        }
    }

    let stats = by_channel
        .iter()
        .enumerate()
        .map(|(idx, (channel, (qdcb, times)))| {
            let hist = Histogram::from_counts(qdcb);
            let mean_time = times.iter().sum::<i64>() / times.len() as i64;
            FlashStat::from_histogram(
                first_index + idx as u64,
                part.stamp,
                channel.mirror,
                Some(channel.tube),
                mean_time,
                &hist,
            )
        })
        .collect();
    Ok(stats)
}

pub fn compute_stats(
    part: &PartData,
    level: StatsLevel,
    first_index: u64,
) -> Result<Vec<FlashStat>, PartError> {
    match level {
        StatsLevel::Cluster => cluster_stats(part, first_index),
        StatsLevel::Tube => tube_stats(part, first_index),
    }
}

/// Append-only text log of flash statistics, one per line
#[derive(Debug, Clone)]
pub struct StatsLog {
    path: PathBuf,
}

impl StatsLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every statistic in the log. A missing log is empty.
    pub fn read(&self) -> Result<Vec<FlashStat>, StatsLogError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(std::fs::File::open(&self.path)?);
        let mut stats = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match FlashStat::parse_line(&line) {
                Some(stat) => stats.push(stat),
                None => {
                    return Err(StatsLogError::BadLine(self.path.clone(), line_no + 1, line))
                }
            }
        }
        Ok(stats)
    }

    pub fn last_record(&self) -> Result<Option<FlashStat>, StatsLogError> {
        Ok(self.read()?.pop())
    }

    /// Where to pick up: the next index and the parts not yet logged.
    ///
    /// A new or empty log starts at index 0 with every part. Otherwise the log must end
    /// with a part from `stamps` and only the parts after it remain. A part that logged
    /// nothing and sits before the last logged part is never picked up again.
    pub fn resume_point(
        &self,
        stamps: &[HalStamp],
    ) -> Result<(u64, Vec<HalStamp>), FlashStatsError> {
        let Some(last) = self.last_record()? else {
            return Ok((0, stamps.to_vec()));
        };
        let position = stamps
            .iter()
            .position(|stamp| *stamp == last.stamp)
            .ok_or_else(|| FlashStatsError::UnknownResumePart(last.stamp.to_string()))?;
        Ok((last.index + 1, stamps[position + 1..].to_vec()))
    }

    pub fn append(&self, stats: &[FlashStat]) -> Result<(), StatsLogError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for stat in stats {
            writeln!(writer, "{}", stat.to_line())?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Cluster statistics by mirror in time order, keeping flashes seen by at least `min_entries` tubes
pub fn by_mirror(stats: &[FlashStat], min_entries: u64) -> BTreeMap<u8, Vec<FlashStat>> {
    let mut grouped: BTreeMap<u8, Vec<FlashStat>> = BTreeMap::new();
    for stat in stats.iter().filter(|s| s.entries >= min_entries) {
        grouped.entry(stat.mirror).or_default().push(*stat);
    }
    for group in grouped.values_mut() {
        group.sort_by_key(|s| s.time_ms);
    }
    grouped
}

/// Tube statistics keyed by part and channel. Later duplicates replace earlier ones.
pub fn by_part_and_channel(stats: &[FlashStat]) -> BTreeMap<(HalStamp, ChannelId), FlashStat> {
    stats
        .iter()
        .filter_map(|stat| stat.channel().map(|channel| ((stat.stamp, channel), *stat)))
        .collect()
}
