//! HV calibration.
//!
//! During a calibration part the HV supply of every mirror is stepped through a few known
//! voltages while the electronics keep reporting what they read back. Each reading is
//! associated with the step it was taken at, and a straight line mapping readback to
//! supplied voltage is fitted per channel. The fitted lines convert any later readback
//! into the voltage actually applied to the tube.
use bit_set::BitSet;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::OnceLock;

use super::channel_id::ChannelId;
use super::config::{CalibrationConfig, Config};
use super::data_store::PartData;
use super::error::CalibrationError;
use super::fit::{fit_line, FitModel, LineFit};
use super::hal_stamp::HalStamp;
use super::pegs::PegTable;

fn step_regex() -> &'static Regex {
    static STEP_REGEX: OnceLock<Regex> = OnceLock::new();
    STEP_REGEX.get_or_init(|| Regex::new(r"^[0-9.]+$").expect("Step regex is valid"))
}

fn reference_regex() -> &'static Regex {
    static REFERENCE_REGEX: OnceLock<Regex> = OnceLock::new();
    REFERENCE_REGEX.get_or_init(|| {
        Regex::new(
            r"^(?P<mir>\d+) (?P<subcl>\d+) (?P<tube>\d+) (?P<m>\S+) (?P<b>\S+) (?P<m2>\S+) (?P<e>\S+) (?P<e2>\S+) (?P<n>\d+) (?P<n2>\d+) (?P<n0>\d+)$",
        )
        .expect("Reference calibration regex is valid")
    })
}

/// Supply voltage steps of a calibration part, by mirror
pub type StepSchedule = BTreeMap<u8, Vec<f64>>;

/// Read the steps the operator entered as notices.
///
/// Only notices whose whole text is a number count. The first number starts mirror 1 and
/// each number below its predecessor starts the next mirror, since every mirror is stepped
/// upwards from its lowest voltage.
pub fn steps_from_notices(part: &PartData) -> StepSchedule {
    let mut schedule = StepSchedule::new();
    let mut mirror: u8 = 1;
    for notice in part.notices() {
        if !step_regex().is_match(&notice.text) {
            continue;
        }
        let Ok(step) = notice.text.parse::<f64>() else {
            continue;
        };
        match schedule.get(&mirror).and_then(|steps| steps.last()) {
            None => {
                schedule.insert(mirror, vec![step]);
            }
            Some(last) if step < *last => {
                mirror += 1;
                schedule.insert(mirror, vec![step]);
            }
            Some(_) => {
                if let Some(steps) = schedule.get_mut(&mirror) {
                    steps.push(step);
                }
            }
        }
    }
    schedule
}

/// Step schedule of a calibration part. Empty for excluded parts.
pub fn step_schedule(part: &PartData, settings: &CalibrationConfig, n_mirrors: u8) -> StepSchedule {
    if settings.is_excluded(&part.stamp) {
        return StepSchedule::new();
    }
    match settings.fixed_steps_for(&part.stamp) {
        Some(steps) => (1..=n_mirrors).map(|mirror| (mirror, steps.to_vec())).collect(),
        None => steps_from_notices(part),
    }
}

/// The step closest to `value`; the first of equally close steps wins
pub fn nearest_step(steps: &[f64], value: f64) -> Option<f64> {
    let mut best: Option<f64> = None;
    for step in steps {
        match best {
            Some(b) if (b - value).abs() <= (step - value).abs() => (),
            _ => best = Some(*step),
        }
    }
    best
}

/// Paired readback and supplied voltages of one channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibSamples {
    pub measured: Vec<f64>,
    pub supplied: Vec<f64>,
}

impl CalibSamples {
    pub fn len(&self) -> usize {
        self.measured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measured.is_empty()
    }

    pub fn push(&mut self, measured: f64, supplied: f64) {
        self.measured.push(measured);
        self.supplied.push(supplied);
    }

    pub fn extend(&mut self, other: &CalibSamples) {
        self.measured.extend_from_slice(&other.measured);
        self.supplied.extend_from_slice(&other.supplied);
    }
}

/// Associate every HV readback of a part with the supply step it was taken at.
///
/// The step of a volts packet is the one nearest the mean of all its readings, since the
/// whole mirror sits at the same step. Mirrors outside `mirrors` (if given) are ignored.
pub fn associate(
    part: &PartData,
    schedule: &StepSchedule,
    pedestal: f64,
    mirrors: Option<&BitSet>,
) -> BTreeMap<ChannelId, CalibSamples> {
    let mut samples: BTreeMap<ChannelId, CalibSamples> = BTreeMap::new();
    for volts in part.volts() {
        if let Some(filter) = mirrors {
            if !filter.contains(volts.mirror as usize) {
                continue;
            }
        }
        let Some(steps) = schedule.get(&volts.mirror) else {
            continue;
        };
        let Some(step) = volts.mean_hv().and_then(|mean| nearest_step(steps, mean)) else {
            continue;
        };
        for (tube, hv) in volts.channel_hv() {
            samples
                .entry(ChannelId::new(volts.mirror, tube))
                .or_default()
                .push(hv - pedestal, step);
        }
    }
    samples
}

/// Calibration constants of one channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelCalibration {
    pub slope: f64,
    pub slope_var: f64,
    pub intercept: Option<f64>,
    pub intercept_var: Option<f64>,
    pub n_points: usize,
}

impl From<&LineFit> for ChannelCalibration {
    fn from(fit: &LineFit) -> Self {
        Self {
            slope: fit.slope,
            slope_var: fit.slope_var,
            intercept: fit.intercept,
            intercept_var: fit.intercept_var,
            n_points: fit.n_points,
        }
    }
}

impl ChannelCalibration {
    /// Voltage applied to the tube given a raw readback
    pub fn calibrated_voltage(&self, raw: f64, pedestal: f64) -> f64 {
        self.slope * (raw - pedestal) + self.intercept.unwrap_or(0.0)
    }
}

/// Fit every channel. Channels whose fit is degenerate are skipped with a warning.
pub fn fit_channels(
    samples: &BTreeMap<ChannelId, CalibSamples>,
    model: FitModel,
) -> BTreeMap<ChannelId, ChannelCalibration> {
    let mut fits = BTreeMap::new();
    for (channel, channel_samples) in samples.iter() {
        match fit_line(&channel_samples.measured, &channel_samples.supplied, model) {
            Ok(fit) => {
                fits.insert(*channel, ChannelCalibration::from(&fit));
            }
            Err(e) => spdlog::warn!("Skipping calibration of {channel}: {e}"),
        }
    }
    fits
}

/// The calibration of every channel from one set of calibration parts
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRun {
    pub label: String,
    pub stamps: Vec<HalStamp>,
    pub channels: BTreeMap<ChannelId, ChannelCalibration>,
}

/// CalibrationBuilder collects the samples of calibration parts and fits them once every
/// part has been added
#[derive(Debug)]
pub struct CalibrationBuilder {
    settings: CalibrationConfig,
    n_mirrors: u8,
    pedestal: f64,
    mirror_filter: Option<BitSet>,
    parts: BTreeMap<HalStamp, BTreeMap<ChannelId, CalibSamples>>,
}

impl CalibrationBuilder {
    pub const COMBINED_LABEL: &'static str = "combined";

    pub fn new(config: &Config) -> Self {
        let mirror_filter = if config.calibration.mirrors.is_empty() {
            None
        } else {
            Some(
                config
                    .calibration
                    .mirrors
                    .iter()
                    .map(|m| *m as usize)
                    .collect::<BitSet>(),
            )
        };
        Self {
            settings: config.calibration.clone(),
            n_mirrors: config.n_mirrors,
            pedestal: config.volts_pedestal,
            mirror_filter,
            parts: BTreeMap::new(),
        }
    }

    /// Add a calibration part. Returns the number of channels it contributed samples to.
    pub fn add_part(&mut self, part: &PartData) -> usize {
        let schedule = step_schedule(part, &self.settings, self.n_mirrors);
        if schedule.is_empty() {
            spdlog::info!("Calibration part {} has no voltage steps, skipping", part.stamp);
            return 0;
        }
        let samples = associate(part, &schedule, self.pedestal, self.mirror_filter.as_ref());
        let n_channels = samples.len();
        if n_channels > 0 {
            self.parts.insert(part.stamp, samples);
        }
        n_channels
    }

    /// Fit the collected samples, either pooled over every part or part by part
    pub fn finish(self) -> Vec<CalibrationRun> {
        let model = self.settings.fit_model;
        if self.settings.combine_parts {
            if self.parts.is_empty() {
                return Vec::new();
            }
            let mut pooled: BTreeMap<ChannelId, CalibSamples> = BTreeMap::new();
            for samples in self.parts.values() {
                for (channel, channel_samples) in samples.iter() {
                    pooled.entry(*channel).or_default().extend(channel_samples);
                }
            }
            vec![CalibrationRun {
                label: String::from(Self::COMBINED_LABEL),
                stamps: self.parts.keys().copied().collect(),
                channels: fit_channels(&pooled, model),
            }]
        } else {
            self.parts
                .iter()
                .map(|(stamp, samples)| CalibrationRun {
                    label: stamp.to_string(),
                    stamps: vec![*stamp],
                    channels: fit_channels(samples, model),
                })
                .collect()
        }
    }
}

fn format_optional(value: Option<f64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => String::from("nan"),
    }
}

/// Write calibration runs as a text table: `label mirror tube m m_var b b_var n`
pub fn write_calibration_table(path: &Path, runs: &[CalibrationRun]) -> Result<(), CalibrationError> {
    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    writeln!(writer, "# label mirror tube m m_var b b_var n")?;
    for run in runs {
        for (channel, calib) in run.channels.iter() {
            writeln!(
                writer,
                "{} {} {} {} {} {} {} {}",
                run.label,
                channel.mirror,
                channel.tube,
                calib.slope,
                calib.slope_var,
                format_optional(calib.intercept),
                format_optional(calib.intercept_var),
                calib.n_points
            )?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Read a table written by [write_calibration_table]. Runs keep the order of first appearance.
pub fn read_calibration_table(path: &Path) -> Result<Vec<CalibrationRun>, CalibrationError> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut runs: Vec<CalibrationRun> = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let bad_line = || CalibrationError::BadTableLine(path.to_path_buf(), line_no + 1);
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() != 8 {
            return Err(bad_line());
        }
        let mirror: u8 = columns[1].parse().map_err(|_| bad_line())?;
        let tube: u16 = columns[2].parse().map_err(|_| bad_line())?;
        let parse_f64 = |s: &str| s.parse::<f64>().map_err(|_| bad_line());
        let intercept = parse_f64(columns[5])?;
        let intercept_var = parse_f64(columns[6])?;
        let calib = ChannelCalibration {
            slope: parse_f64(columns[3])?,
            slope_var: parse_f64(columns[4])?,
            intercept: (!intercept.is_nan()).then_some(intercept),
            intercept_var: (!intercept_var.is_nan()).then_some(intercept_var),
            n_points: columns[7].parse().map_err(|_| bad_line())?,
        };

        let label = columns[0];
        let run = match runs.iter_mut().position(|r| r.label == label) {
            Some(idx) => &mut runs[idx],
            None => {
                runs.push(CalibrationRun {
                    label: label.to_string(),
                    stamps: HalStamp::find_in(label).into_iter().collect(),
                    channels: BTreeMap::new(),
                });
                let last = runs.len() - 1;
                &mut runs[last]
            }
        };
        run.channels.insert(ChannelId::new(mirror, tube), calib);
    }
    Ok(runs)
}

/// One row of an externally produced calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceCalibration {
    pub m: f64,
    pub b: f64,
    pub m2: f64,
    pub e: f64,
    pub e2: f64,
    pub n: u32,
    pub n2: u32,
    pub n0: u32,
}

/// Read a reference calibration table of `mir subcl tube m b m2 e e2 n n2 n0` rows.
///
/// Subclusters and tubes count from 0 here. Lines which do not match are ignored and the
/// first row of a channel wins.
pub fn read_reference_table(
    path: &Path,
) -> Result<BTreeMap<ChannelId, ReferenceCalibration>, CalibrationError> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut table = BTreeMap::new();
    for line in reader.lines() {
        let line = line?;
        let Some(caps) = reference_regex().captures(line.trim_end()) else {
            continue;
        };
        let row = (|| {
            let channel = ChannelId::from_subcluster(
                caps["mir"].parse().ok()?,
                caps["subcl"].parse().ok()?,
                caps["tube"].parse().ok()?,
            );
            let calib = ReferenceCalibration {
                m: caps["m"].parse().ok()?,
                b: caps["b"].parse().ok()?,
                m2: caps["m2"].parse().ok()?,
                e: caps["e"].parse().ok()?,
                e2: caps["e2"].parse().ok()?,
                n: caps["n"].parse().ok()?,
                n2: caps["n2"].parse().ok()?,
                n0: caps["n0"].parse().ok()?,
            };
            Some((channel, calib))
        })();
        if let Some((channel, calib)) = row {
            table.entry(channel).or_insert(calib);
        }
    }
    Ok(table)
}

/// A fitted calibration next to the reference one for the same channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceComparison {
    pub channel: ChannelId,
    pub slope: f64,
    pub reference_slope: f64,
    pub intercept: Option<f64>,
    pub reference_intercept: f64,
}

impl ReferenceComparison {
    pub fn slope_difference(&self) -> f64 {
        self.slope - self.reference_slope
    }
}

/// Compare every channel present in both calibrations
pub fn compare_with_reference(
    run: &CalibrationRun,
    reference: &BTreeMap<ChannelId, ReferenceCalibration>,
) -> Vec<ReferenceComparison> {
    run.channels
        .iter()
        .filter_map(|(channel, calib)| {
            reference.get(channel).map(|refc| ReferenceComparison {
                channel: *channel,
                slope: calib.slope,
                reference_slope: refc.m,
                intercept: calib.intercept,
                reference_intercept: refc.b,
            })
        })
        .collect()
}

/// Accumulates the calibrated HV of every channel over LED parts
#[derive(Debug, Clone, Default)]
pub struct CalibratedHv {
    sums: BTreeMap<ChannelId, (f64, usize)>,
}

impl CalibratedHv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the readings of a part. Channels without a calibration are ignored.
    pub fn add_part(
        &mut self,
        part: &PartData,
        calibration: &BTreeMap<ChannelId, ChannelCalibration>,
        pedestal: f64,
    ) {
        for volts in part.volts() {
            for (tube, hv) in volts.channel_hv() {
                let channel = ChannelId::new(volts.mirror, tube);
                if let Some(calib) = calibration.get(&channel) {
                    let entry = self.sums.entry(channel).or_insert((0.0, 0));
                    entry.0 += calib.calibrated_voltage(hv, pedestal);
                    entry.1 += 1;
                }
            }
        }
    }

    /// Mean calibrated HV of every channel seen
    pub fn means(&self) -> BTreeMap<ChannelId, f64> {
        self.sums
            .iter()
            .map(|(channel, (sum, n))| (*channel, sum / *n as f64))
            .collect()
    }
}

/// Fit of the mean calibrated HV of a mirror's channels against their pegs
#[derive(Debug, Clone, PartialEq)]
pub struct PegResponse {
    pub mirror: u8,
    /// (peg, mean calibrated HV) of every channel used
    pub points: Vec<(f64, f64)>,
    pub fit: LineFit,
}

pub fn peg_response(
    means: &BTreeMap<ChannelId, f64>,
    pegs: &PegTable,
    mirror: u8,
) -> Result<PegResponse, CalibrationError> {
    let points: Vec<(f64, f64)> = means
        .iter()
        .filter(|(channel, _)| channel.mirror == mirror)
        .filter_map(|(channel, hv)| pegs.get(channel).map(|peg| (peg as f64, *hv)))
        .collect();
    if points.is_empty() {
        return Err(CalibrationError::NoCalibratedChannels(mirror));
    }
    let x: Vec<f64> = points.iter().map(|p| p.0).collect();
    let y: Vec<f64> = points.iter().map(|p| p.1).collect();
    let fit = fit_line(&x, &y, FitModel::Linear)?;
    Ok(PegResponse {
        mirror,
        points,
        fit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::PartKind;
    use crate::packet::{NoticePacket, Packet, VoltsPacket};
    use std::str::FromStr;

    fn text_notice(text: &str) -> Packet {
        Packet::Notice(NoticePacket {
            mirror: 1,
            notice_type: 0,
            year: 2009,
            day: 45,
            hour: 0,
            minute: 0,
            second: 0,
            msec: 0,
            text: text.to_string(),
        })
    }

    fn volts(mirror: u8, hv: Vec<f32>) -> Packet {
        Packet::Volts(VoltsPacket {
            mirror,
            minute: 0,
            hv_channels: hv.len() as u16,
            supply: 0.0,
            hv_supply: 0.0,
            board_temp: 0.0,
            garb_temp: 0.0,
            hv,
        })
    }

    fn part(stamp: &str, packets: Vec<Packet>) -> PartData {
        PartData::new(HalStamp::from_str(stamp).unwrap(), PartKind::HvCalib, packets)
    }

    fn test_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("hvcalib_calibration_{name}"))
    }

    #[test]
    fn test_steps_from_notices() {
        let part = part(
            "y2009m02d14p01",
            vec![
                text_notice("400"),
                text_notice("HV ramp"),
                text_notice("600"),
                text_notice("800.5"),
                text_notice("1.2.3"),
                text_notice("450"),
                text_notice("650"),
                text_notice("300"),
            ],
        );
        let schedule = steps_from_notices(&part);
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule[&1], vec![400.0, 600.0, 800.5]);
        assert_eq!(schedule[&2], vec![450.0, 650.0]);
        assert_eq!(schedule[&3], vec![300.0]);
    }

    #[test]
    fn test_schedule_rules() {
        let settings = CalibrationConfig::default();
        let fixed = part("y2009m08d21p05", vec![text_notice("10")]);
        let schedule = step_schedule(&fixed, &settings, 3);
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule[&3], vec![1000.0]);

        let excluded = part("y2009m08d10p04", vec![text_notice("10")]);
        assert!(step_schedule(&excluded, &settings, 3).is_empty());

        let from_notices = part("y2009m03d01p01", vec![text_notice("10")]);
        assert_eq!(step_schedule(&from_notices, &settings, 3)[&1], vec![10.0]);
    }

    #[test]
    fn test_nearest_step() {
        let steps = [400.0, 600.0, 800.0];
        assert_eq!(nearest_step(&steps, 590.0), Some(600.0));
        assert_eq!(nearest_step(&steps, 500.0), Some(400.0));
        assert_eq!(nearest_step(&steps, 2000.0), Some(800.0));
        assert_eq!(nearest_step(&[], 1.0), None);
    }

    #[test]
    fn test_associate() {
        let p = part(
            "y2009m02d14p01",
            vec![
                volts(1, vec![402.0, 398.0]),
                volts(1, vec![601.0, 603.0]),
                volts(2, vec![500.0, 500.0]),
                volts(3, vec![500.0, 500.0]),
            ],
        );
        let mut schedule = StepSchedule::new();
        schedule.insert(1, vec![400.0, 600.0]);
        schedule.insert(2, vec![500.0]);
        let samples = associate(&p, &schedule, 2.0, None);
        assert_eq!(samples.len(), 4);
        let first = &samples[&ChannelId::new(1, 0)];
        assert_eq!(first.measured, vec![400.0, 599.0]);
        assert_eq!(first.supplied, vec![400.0, 600.0]);

        let filter: BitSet = [2usize].into_iter().collect();
        let samples = associate(&p, &schedule, 2.0, Some(&filter));
        assert_eq!(samples.len(), 2);
        assert!(samples.keys().all(|c| c.mirror == 2));
    }

    fn calibration_parts() -> Vec<PartData> {
        // readback = (supplied - 5) / 1.1 + pedestal 2, for steps 401 and 1000
        let reading = |supplied: f64| ((supplied - 5.0) / 1.1 + 2.0) as f32;
        vec![
            part("y2009m08d21p01", vec![volts(6, vec![reading(401.0), reading(401.0)])]),
            part("y2009m08d21p05", vec![volts(6, vec![reading(1000.0), reading(1000.0)])]),
            part("y2009m08d10p01", vec![volts(6, vec![reading(1000.0)])]),
        ]
    }

    #[test]
    fn test_combined_calibration() {
        let mut config = Config::default();
        config.volts_pedestal = 2.0;
        config.calibration.mirrors = vec![6];
        let mut builder = CalibrationBuilder::new(&config);
        let contributed: Vec<usize> = calibration_parts()
            .iter()
            .map(|p| builder.add_part(p))
            .collect();
        assert_eq!(contributed, vec![2, 2, 0]);

        let runs = builder.finish();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].label, CalibrationBuilder::COMBINED_LABEL);
        assert_eq!(runs[0].stamps.len(), 2);
        let calib = runs[0].channels[&ChannelId::new(6, 1)];
        assert!((calib.slope - 1.1).abs() < 1e-4);
        assert!((calib.intercept.unwrap() - 5.0).abs() < 0.05);
        assert_eq!(calib.n_points, 2);
        let raw = (700.0 - 5.0) / 1.1 + 2.0;
        assert!((calib.calibrated_voltage(raw, 2.0) - 700.0).abs() < 0.05);
    }

    #[test]
    fn test_per_part_calibration_skips_degenerate_channels() {
        let mut config = Config::default();
        config.calibration.combine_parts = false;
        let mut builder = CalibrationBuilder::new(&config);
        for p in calibration_parts() {
            builder.add_part(&p);
        }
        let runs = builder.finish();
        // each part has one reading per channel, too few for a two parameter fit
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.channels.is_empty()));

        config.calibration.fit_model = FitModel::Slope;
        let mut builder = CalibrationBuilder::new(&config);
        for p in calibration_parts() {
            builder.add_part(&p);
        }
        let runs = builder.finish();
        assert_eq!(runs[0].label, "y2009m08d21p01");
        assert_eq!(runs[0].channels.len(), 2);
        assert!(runs[0].channels[&ChannelId::new(6, 0)].intercept.is_none());
    }

    #[test]
    fn test_single_step_part_fits_only_with_jitter() {
        let mut config = Config::default();
        config.volts_pedestal = 2.0;
        config.calibration.combine_parts = false;
        let reading = ((1000.0 - 5.0) / 1.1 + 2.0) as f32;
        let mut builder = CalibrationBuilder::new(&config);
        builder.add_part(&part(
            "y2009m08d21p05",
            vec![
                // tube 0 jitters around the step, tube 1 reads the same every minute
                volts(6, vec![reading - 0.5, reading]),
                volts(6, vec![reading, reading]),
                volts(6, vec![reading + 0.5, reading]),
            ],
        ));
        let runs = builder.finish();
        assert_eq!(runs.len(), 1);
        // one supplied voltage: the line is flat through the step
        let calib = runs[0].channels[&ChannelId::new(6, 0)];
        assert_eq!(calib.n_points, 3);
        assert!(calib.slope.abs() < 1e-6);
        assert!((calib.intercept.unwrap() - 1000.0).abs() < 1e-3);
        assert!(!runs[0].channels.contains_key(&ChannelId::new(6, 1)));
    }

    #[test]
    fn test_table_round_trip() {
        let mut channels = BTreeMap::new();
        channels.insert(
            ChannelId::new(6, 35),
            ChannelCalibration {
                slope: 1.0123,
                slope_var: 1.5e-7,
                intercept: Some(3.25),
                intercept_var: Some(0.04),
                n_points: 14,
            },
        );
        channels.insert(
            ChannelId::new(7, 0),
            ChannelCalibration {
                slope: 0.99,
                slope_var: 0.0,
                intercept: None,
                intercept_var: None,
                n_points: 7,
            },
        );
        let runs = vec![CalibrationRun {
            label: String::from("y2009m08d21p01"),
            stamps: vec![HalStamp::from_str("y2009m08d21p01").unwrap()],
            channels,
        }];
        let path = test_path("table.txt");
        write_calibration_table(&path, &runs).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("y2009m08d21p01 7 0 0.99 0 nan nan 7"));
        assert_eq!(read_calibration_table(&path).unwrap(), runs);

        std::fs::write(&path, "# header\ncombined 6 1 1.0 0.0 nan\n").unwrap();
        assert!(matches!(
            read_calibration_table(&path),
            Err(CalibrationError::BadTableLine(_, 2))
        ));
    }

    #[test]
    fn test_reference_comparison() {
        let path = test_path("reference.txt");
        std::fs::write(
            &path,
            "mir subcl tube m b\n6 2 3 1.05 4.0 0.0 0.1 0.1 10 10 0\n6 2 3 9.0 9.0 0.0 0.1 0.1 10 10 0\n",
        )
        .unwrap();
        let reference = read_reference_table(&path).unwrap();
        assert_eq!(reference.len(), 1);
        let channel = ChannelId::new(6, 35);
        assert_eq!(reference[&channel].m, 1.05);

        let mut channels = BTreeMap::new();
        channels.insert(
            channel,
            ChannelCalibration {
                slope: 1.1,
                slope_var: 0.0,
                intercept: Some(5.0),
                intercept_var: Some(0.0),
                n_points: 3,
            },
        );
        let run = CalibrationRun {
            label: String::from("combined"),
            stamps: vec![],
            channels,
        };
        let comparison = compare_with_reference(&run, &reference);
        assert_eq!(comparison.len(), 1);
        assert!((comparison[0].slope_difference() - 0.05).abs() < 1e-12);
        assert_eq!(comparison[0].reference_intercept, 4.0);
    }

    #[test]
    fn test_calibrated_hv_and_peg_response() {
        let mut calibration = BTreeMap::new();
        for tube in 0..3 {
            calibration.insert(
                ChannelId::new(1, tube),
                ChannelCalibration {
                    slope: 2.0,
                    slope_var: 0.0,
                    intercept: Some(1.0),
                    intercept_var: Some(0.0),
                    n_points: 2,
                },
            );
        }
        let led = PartData::new(
            HalStamp::from_str("y2009m08d22p01").unwrap(),
            PartKind::Led355,
            vec![
                volts(1, vec![100.0, 200.0, 300.0, 999.0]),
                volts(1, vec![102.0, 202.0, 302.0, 999.0]),
            ],
        );
        let mut hv = CalibratedHv::new();
        hv.add_part(&led, &calibration, 0.0);
        let means = hv.means();
        assert_eq!(means.len(), 3);
        assert_eq!(means[&ChannelId::new(1, 0)], 203.0);

        let mut pegs = PegTable::new();
        pegs.insert(ChannelId::new(1, 0), 10);
        pegs.insert(ChannelId::new(1, 1), 20);
        pegs.insert(ChannelId::new(1, 2), 30);
        let response = peg_response(&means, &pegs, 1).unwrap();
        assert_eq!(response.points.len(), 3);
        assert!((response.fit.slope - 20.0).abs() < 1e-9);
        assert!(matches!(
            peg_response(&means, &pegs, 2),
            Err(CalibrationError::NoCalibratedChannels(2))
        ));
    }
}
