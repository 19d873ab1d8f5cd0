//! Pairing of asynchronous, time sorted streams.
//!
//! The detector reports flashes, environmental readings and voltages on unrelated clocks.
//! To compare them each record of one stream is paired with the record of the other stream
//! closest to it in time, see [find_nearest].
use std::collections::BTreeMap;

use super::channel_id::ChannelId;
use super::data_store::{minute_time_ms, PartData};
use super::environment::{ClusterPth, EnvironmentParser, LedTemps};
use super::error::PartError;
use super::flash_stats::FlashStat;
use super::hal_stamp::HalStamp;

/// Anything that happened at a known epoch millisecond
pub trait Timestamped {
    fn time_ms(&self) -> i64;
}

impl Timestamped for i64 {
    fn time_ms(&self) -> i64 {
        *self
    }
}

/// Pair every element of `a` with the element of `b` nearest to it in time.
///
/// Both slices must be sorted by time. The scan keeps a cursor into `b` which only ever
/// moves forward: for each `a` the cursor advances while the next element is no farther
/// away than the best so far, so equal distances resolve to the later element of `b`.
/// The result has one pair per element of `a`, or none at all when `b` is empty.
pub fn find_nearest<'a, 'b, A, B>(a: &'a [A], b: &'b [B]) -> Vec<(&'a A, &'b B)>
where
    A: Timestamped,
    B: Timestamped,
{
    let mut pairs = Vec::with_capacity(a.len());
    if b.is_empty() {
        return pairs;
    }
    let mut cursor = 0;
    for item in a.iter() {
        let t = item.time_ms();
        let mut best = (t - b[cursor].time_ms()).abs() + 1;
        for (idx, candidate) in b.iter().enumerate().skip(cursor) {
            let dist = (t - candidate.time_ms()).abs();
            if dist > best {
                break;
            }
            cursor = idx;
            best = dist;
        }
        pairs.push((item, &b[cursor]));
    }
    pairs
}

/// A flash paired with the LED temperatures nearest to it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlashTemps {
    pub flash: FlashStat,
    pub temps: LedTemps,
}

/// A flash paired with the cluster PTH reading nearest to it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlashPth {
    pub flash: FlashStat,
    pub pth: ClusterPth,
}

/// Join per mirror flash statistics to per mirror readings with [find_nearest].
///
/// Mirrors present on only one side produce nothing.
fn join_by_mirror<R, T>(
    flashes: &BTreeMap<u8, Vec<FlashStat>>,
    readings: &BTreeMap<u8, Vec<R>>,
    make: impl Fn(&FlashStat, &R) -> T,
) -> BTreeMap<u8, Vec<T>>
where
    R: Timestamped,
{
    let mut joined = BTreeMap::new();
    for (mirror, mirror_flashes) in flashes.iter() {
        let Some(mirror_readings) = readings.get(mirror) else {
            spdlog::debug!("Mirror {mirror} has flashes but no readings to pair them with");
            continue;
        };
        let pairs: Vec<T> = find_nearest(mirror_flashes, mirror_readings)
            .into_iter()
            .map(|(flash, reading)| make(flash, reading))
            .collect();
        joined.insert(*mirror, pairs);
    }
    joined
}

pub fn flash_vs_led_temps(
    flashes: &BTreeMap<u8, Vec<FlashStat>>,
    temps: &BTreeMap<u8, Vec<LedTemps>>,
) -> BTreeMap<u8, Vec<FlashTemps>> {
    join_by_mirror(flashes, temps, |flash, temps| FlashTemps {
        flash: *flash,
        temps: *temps,
    })
}

pub fn flash_vs_cluster_pth(
    flashes: &BTreeMap<u8, Vec<FlashStat>>,
    pth: &BTreeMap<u8, Vec<ClusterPth>>,
) -> BTreeMap<u8, Vec<FlashPth>> {
    join_by_mirror(flashes, pth, |flash, pth| FlashPth {
        flash: *flash,
        pth: *pth,
    })
}

/// One HV reading of a tube together with the tube's mean LED response in the same part
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QdcbHvPoint {
    pub stamp: HalStamp,
    pub channel: ChannelId,
    pub hv: f64,
    pub qdcb_mean: f64,
}

/// Pair every HV reading of an LED part with the tube statistics of that part.
///
/// `tube_stats` are the per tube statistics keyed by (stamp, channel); readings of tubes
/// without statistics are dropped.
pub fn qdcb_vs_hv(
    part: &PartData,
    tube_stats: &BTreeMap<(HalStamp, ChannelId), FlashStat>,
    mirrors: &[u8],
) -> Vec<QdcbHvPoint> {
    let mut points = Vec::new();
    for volts in part.volts().filter(|v| mirrors.contains(&v.mirror)) {
        for (tube, hv) in volts.channel_hv() {
            let channel = ChannelId::new(volts.mirror, tube);
            if let Some(stat) = tube_stats.get(&(part.stamp, channel)) {
                points.push(QdcbHvPoint {
                    stamp: part.stamp,
                    channel,
                    hv,
                    qdcb_mean: stat.hist_mean,
                });
            }
        }
    }
    points
}

/// One HV reading of a tube against the mean cluster temperature of its part
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HvTempPoint {
    pub time_ms: i64,
    pub channel: ChannelId,
    pub temperature: f64,
    pub hv: f64,
}

/// HV readings of a part against the mean cluster temperature of the same mirror in that
/// part. Mirrors without PTH readings in the part are skipped.
pub fn hv_vs_temperature(
    part: &PartData,
    parser: &EnvironmentParser,
    mirrors: &[u8],
) -> Result<Vec<HvTempPoint>, PartError> {
    let start = part.run_start_ms()?;
    let temperatures = parser.mean_cluster_temperature(part);
    let mut points = Vec::new();
    for volts in part.volts().filter(|v| mirrors.contains(&v.mirror)) {
        let Some(temperature) = temperatures.get(&volts.mirror) else {
            continue;
        };
        let time_ms = minute_time_ms(start, volts.minute);
        for (tube, hv) in volts.channel_hv() {
            points.push(HvTempPoint {
                time_ms,
                channel: ChannelId::new(volts.mirror, tube),
                temperature: *temperature,
                hv,
            });
        }
    }
    Ok(points)
}
