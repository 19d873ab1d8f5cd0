use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;
use std::sync::mpsc::Sender;

use super::calibration::{
    compare_with_reference, peg_response, read_reference_table, write_calibration_table,
    CalibratedHv, CalibrationBuilder, CalibrationRun, ReferenceCalibration,
};
use super::channel_id::ChannelId;
use super::cluster_model::{provisional_calibrate, ClusterModel, ProvisionalCalibration};
use super::config::Config;
use super::correlate::{
    flash_vs_cluster_pth, flash_vs_led_temps, hv_vs_temperature, qdcb_vs_hv,
};
use super::data_store::{DataStore, PartData, PartKind};
use super::dump::{dump_part, DumpSummary};
use super::environment::{ClusterPth, EnvironmentParser, LedTemps};
use super::error::{DataStoreError, PartError, ProcessorError};
use super::flash_stats::{by_mirror, by_part_and_channel, compute_stats, StatsLevel, StatsLog};
use super::hal_stamp::HalStamp;
use super::led_resonance::LedResonance;
use super::packet::PacketKind;
use super::pegs::PegTable;
use super::series::{
    cluster_pth_series, flash_cluster_series, flash_tube_series, group_hv_series,
    led_temps_series, qdcb_vs_event_series, supply_series, threshold_series, tube_hv_series,
    ChannelFilter, HvProfile, SeriesKind, TubeGroup,
};
use super::stager::Stager;
use super::table::DataTable;
use super::worker_status::{BarColor, WorkerStatus};

/// Name of the calibration table inside the output path
pub const CALIBRATION_TABLE: &str = "hv_calibration.txt";

/// The long running tasks, each run on a worker thread by the front end
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Stage,
    Calibrate,
    FlashStats,
    Correlate,
    Series {
        kinds: Vec<SeriesKind>,
        tube: Option<u16>,
    },
    Pegs,
    ClusterModel,
    LedResonance,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Calibrate => "calibrate",
            Self::FlashStats => "flash-stats",
            Self::Correlate => "correlate",
            Self::Series { .. } => "series",
            Self::Pegs => "pegs",
            Self::ClusterModel => "cluster-model",
            Self::LedResonance => "led-resonance",
        }
    }
}

fn write_table(config: &Config, table: &DataTable) -> Result<(), ProcessorError> {
    let path = config.get_output_file(&format!("{}.txt", table.name()))?;
    table.write(&path)?;
    Ok(())
}

/// Load every part in `stamps` in order and hand it to `handle`, reporting progress as we go
fn for_each_part<F>(
    store: &DataStore,
    kind: PartKind,
    stamps: &[HalStamp],
    task: (&str, BarColor),
    tx: &Sender<WorkerStatus>,
    mut handle: F,
) -> Result<(), ProcessorError>
where
    F: FnMut(&PartData) -> Result<(), ProcessorError>,
{
    let (task, color) = task;
    for (idx, stamp) in stamps.iter().enumerate() {
        tx.send(WorkerStatus::fraction(idx, stamps.len(), task, &stamp.to_string()).with_color(color))?;
        let part = store.load(kind, stamp)?;
        handle(&part)?;
    }
    tx.send(WorkerStatus::fraction(stamps.len(), stamps.len(), task, "done").with_color(color))?;
    Ok(())
}

/// Copy new part files from the staging path into the data path
pub fn stage(config: &Config, tx: &Sender<WorkerStatus>) -> Result<(), ProcessorError> {
    let stager = Stager::new(config)?;
    let total_copy_size = stager.get_total_data_size();
    spdlog::info!(
        "Staging {} part files with total size: {} ({} already present)",
        stager.copy_meta().len(),
        human_bytes::human_bytes(total_copy_size as f64),
        stager.get_n_skipped()
    );
    let mut copy_count = 0;
    tx.send(WorkerStatus::new(0.0, "stage", "", BarColor::GREEN))?;
    for (src, dst, size) in stager.copy_meta() {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)?;
        copy_count += size;
        let progress = if total_copy_size == 0 {
            1.0
        } else {
            copy_count as f32 / total_copy_size as f32
        };
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        tx.send(WorkerStatus::new(progress, "stage", &name, BarColor::GREEN))?;
        spdlog::info!("Copied {} in {}", name, human_bytes::human_bytes(*size as f64));
    }
    tx.send(WorkerStatus::new(1.0, "stage", "done", BarColor::GREEN))?;
    spdlog::info!("Done with staging files.");
    Ok(())
}

/// Print the packets of the parts of a kind. An empty `stamps` dumps every part.
pub fn dump<W: Write>(
    config: &Config,
    kind: PartKind,
    stamps: &[HalStamp],
    filter: Option<PacketKind>,
    out: &mut W,
) -> Result<Vec<DumpSummary>, ProcessorError> {
    let store = DataStore::scan(&config.data_path)?;
    let stamps = if stamps.is_empty() {
        store.stamps(kind)
    } else {
        stamps.to_vec()
    };
    let mut summaries = Vec::with_capacity(stamps.len());
    for stamp in stamps.iter() {
        match store.path(kind, stamp) {
            Some(path) => summaries.push(
                dump_part(path, filter, out).map_err(DataStoreError::from)?,
            ),
            None => spdlog::warn!("There is no {kind} part {stamp} to dump"),
        }
    }
    Ok(summaries)
}

/// Fit the HV calibration and apply it.
///
/// Writes the calibration table, then a comparison with the reference calibration if one is
/// configured, then the calibrated HV of every channel and the peg response of every mirror
/// if a peg chart is configured.
pub fn calibrate(config: &Config, tx: &Sender<WorkerStatus>) -> Result<(), ProcessorError> {
    let store = DataStore::scan(&config.data_path)?;
    let stamps: Vec<HalStamp> = store
        .stamps(PartKind::HvCalib)
        .into_iter()
        .filter(|stamp| {
            let excluded = config.calibration.is_excluded(stamp);
            if excluded {
                spdlog::info!("Calibration part {stamp} is excluded");
            }
            !excluded
        })
        .collect();
    spdlog::info!("Calibrating from {} parts...", stamps.len());

    let mut builder = CalibrationBuilder::new(config);
    for_each_part(&store, PartKind::HvCalib, &stamps, ("calibrate", BarColor::CYAN), tx, |part| {
        let n_channels = builder.add_part(part);
        spdlog::info!("Part {} gave samples for {} channels", part.stamp, n_channels);
        Ok(())
    })?;
    let runs = builder.finish();
    let table_path = config.get_output_file(CALIBRATION_TABLE)?;
    write_calibration_table(&table_path, &runs)?;
    spdlog::info!(
        "Wrote {} calibration runs to {}",
        runs.len(),
        table_path.to_string_lossy()
    );

    if let Some(reference_path) = config.reference_calib_path.as_deref() {
        let reference = read_reference_table(reference_path)?;
        spdlog::info!("Read {} reference calibrations", reference.len());
        for run in runs.iter() {
            write_table(config, &reference_table(run, &reference))?;
        }
    }

    // The last run is the pooled one, or the latest part when parts are kept apart
    let Some(run) = runs.last() else {
        spdlog::warn!("No channels were calibrated.");
        return Ok(());
    };
    if config.peg_chart_path.is_some() {
        apply_calibration(config, &store, run, tx)?;
    }
    Ok(())
}

fn reference_table(
    run: &CalibrationRun,
    reference: &BTreeMap<ChannelId, ReferenceCalibration>,
) -> DataTable {
    let mut table = DataTable::new(
        &format!("reference_comparison_{}", run.label),
        &[
            "mirror",
            "tube",
            "slope",
            "reference_slope",
            "slope_difference",
            "intercept",
            "reference_intercept",
        ],
    );
    for comparison in compare_with_reference(run, reference) {
        table.push(vec![
            comparison.channel.mirror as f64,
            comparison.channel.tube as f64,
            comparison.slope,
            comparison.reference_slope,
            comparison.slope_difference(),
            comparison.intercept.unwrap_or(f64::NAN),
            comparison.reference_intercept,
        ]);
    }
    table
}

fn apply_calibration(
    config: &Config,
    store: &DataStore,
    run: &CalibrationRun,
    tx: &Sender<WorkerStatus>,
) -> Result<(), ProcessorError> {
    let pegs = PegTable::read_chart(config.get_peg_chart_path()?, config.n_mirrors)?;
    let mut calibrated = CalibratedHv::new();
    let stamps = store.stamps(PartKind::Led355);
    for_each_part(store, PartKind::Led355, &stamps, ("apply calibration", BarColor::CYAN), tx, |part| {
        calibrated.add_part(part, &run.channels, config.volts_pedestal);
        Ok(())
    })?;
    let means = calibrated.means();

    let mut hv_table = DataTable::new("calibrated_hv", &["mirror", "tube", "mean_hv", "peg"]);
    for (channel, hv) in means.iter() {
        let peg = pegs.get(channel).map(|p| p as f64).unwrap_or(f64::NAN);
        hv_table.push(vec![channel.mirror as f64, channel.tube as f64, *hv, peg]);
    }
    write_table(config, &hv_table)?;

    let mut response_table = DataTable::new(
        "peg_response",
        &["mirror", "slope", "slope_var", "intercept", "intercept_var", "n_points"],
    );
    for mirror in config.mirrors() {
        match peg_response(&means, &pegs, mirror) {
            Ok(response) => response_table.push(vec![
                mirror as f64,
                response.fit.slope,
                response.fit.slope_var,
                response.fit.intercept.unwrap_or(f64::NAN),
                response.fit.intercept_var.unwrap_or(f64::NAN),
                response.fit.n_points as f64,
            ]),
            Err(e) => spdlog::warn!("Skipping peg response of mirror {mirror}: {e}"),
        }
    }
    write_table(config, &response_table)?;
    Ok(())
}

/// Compute the cluster and tube flash statistics of every LED part not yet in the logs
pub fn flash_stats(config: &Config, tx: &Sender<WorkerStatus>) -> Result<(), ProcessorError> {
    let store = DataStore::scan(&config.data_path)?;
    let stamps = store.stamps(PartKind::Led355);
    for (level, path) in [
        (StatsLevel::Cluster, config.get_cluster_stats_file()?),
        (StatsLevel::Tube, config.get_tube_stats_file()?),
    ] {
        let log = StatsLog::new(&path);
        let (mut next_index, remaining) = log.resume_point(&stamps)?;
        spdlog::info!(
            "{:?} statistics: {} parts to process, starting at index {} in {}",
            level,
            remaining.len(),
            next_index,
            path.to_string_lossy()
        );
        let task = match level {
            StatsLevel::Cluster => "cluster stats",
            StatsLevel::Tube => "tube stats",
        };
        for_each_part(&store, PartKind::Led355, &remaining, (task, BarColor::MAGENTA), tx, |part| {
            match compute_stats(part, level, next_index) {
                Ok(stats) => {
                    log.append(&stats)?;
                    next_index += stats.len() as u64;
                }
                Err(PartError::NoRunStart(stamp)) => {
                    spdlog::warn!("Part {stamp} has no run start notice, skipping it");
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Pair the flash statistics with the environment and the HV readings
pub fn correlate(config: &Config, tx: &Sender<WorkerStatus>) -> Result<(), ProcessorError> {
    let mirrors = config.mirrors();
    let cluster = StatsLog::new(&config.get_cluster_stats_file()?).read()?;
    let tube = StatsLog::new(&config.get_tube_stats_file()?).read()?;
    if cluster.is_empty() && tube.is_empty() {
        spdlog::warn!("The flash statistics logs are empty; run flash-stats first");
    }
    let mut flashes = by_mirror(&cluster, config.flash_stats.min_tubes);
    flashes.retain(|mirror, _| mirrors.contains(mirror));
    let tube_stats = by_part_and_channel(&tube);

    let parser = EnvironmentParser::new();
    let mut temps: BTreeMap<u8, Vec<LedTemps>> = BTreeMap::new();
    let mut pth: BTreeMap<u8, Vec<ClusterPth>> = BTreeMap::new();
    let mut qdcb_table = DataTable::new(
        "qdcb_vs_hv",
        &["part_day_s", "part", "mirror", "tube", "hv", "qdcb_mean"],
    );
    let mut hv_temp_table =
        DataTable::new("hv_vs_temperature", &["time_ms", "mirror", "tube", "temperature", "hv"]);

    let store = DataStore::scan(&config.data_path)?;
    let stamps = store.stamps(PartKind::Led355);
    for_each_part(&store, PartKind::Led355, &stamps, ("correlate", BarColor::CYAN), tx, |part| {
        for (mirror, readings) in parser.led_temps([part]) {
            temps.entry(mirror).or_default().extend(readings);
        }
        for (mirror, readings) in parser.cluster_pth([part]) {
            pth.entry(mirror).or_default().extend(readings);
        }
        for point in qdcb_vs_hv(part, &tube_stats, &mirrors) {
            qdcb_table.push(vec![
                point.stamp.epoch_seconds() as f64,
                point.stamp.part() as f64,
                point.channel.mirror as f64,
                point.channel.tube as f64,
                point.hv,
                point.qdcb_mean,
            ]);
        }
        match hv_vs_temperature(part, &parser, &mirrors) {
            Ok(points) => hv_temp_table.extend(points.into_iter().map(|point| {
                vec![
                    point.time_ms as f64,
                    point.channel.mirror as f64,
                    point.channel.tube as f64,
                    point.temperature,
                    point.hv,
                ]
            })),
            Err(e) => spdlog::warn!("Skipping HV vs temperature of part {}: {e}", part.stamp),
        }
        Ok(())
    })?;
    for readings in temps.values_mut() {
        readings.sort_by_key(|t| t.time_ms);
    }
    for readings in pth.values_mut() {
        readings.sort_by_key(|r| r.time_ms);
    }

    let mut temps_table = DataTable::new(
        "flash_vs_led_temps",
        &[
            "time_ms", "mirror", "entries", "hist_mean", "mean", "sigma", "temps_time_ms", "a",
            "b", "c", "d", "ab_average",
        ],
    );
    for pair in flash_vs_led_temps(&flashes, &temps).into_values().flatten() {
        temps_table.push(vec![
            pair.flash.time_ms as f64,
            pair.flash.mirror as f64,
            pair.flash.entries as f64,
            pair.flash.hist_mean,
            pair.flash.mean,
            pair.flash.sigma,
            pair.temps.time_ms as f64,
            pair.temps.a,
            pair.temps.b,
            pair.temps.c,
            pair.temps.d,
            pair.temps.ab_average(),
        ]);
    }

    let mut pth_table = DataTable::new(
        "flash_vs_cluster_pth",
        &[
            "time_ms", "mirror", "entries", "hist_mean", "mean", "sigma", "pth_time_ms",
            "pressure", "temperature", "humidity",
        ],
    );
    for pair in flash_vs_cluster_pth(&flashes, &pth).into_values().flatten() {
        pth_table.push(vec![
            pair.flash.time_ms as f64,
            pair.flash.mirror as f64,
            pair.flash.entries as f64,
            pair.flash.hist_mean,
            pair.flash.mean,
            pair.flash.sigma,
            pair.pth.time_ms as f64,
            pair.pth.pressure,
            pair.pth.temperature,
            pair.pth.humidity,
        ]);
    }

    for table in [&temps_table, &pth_table, &qdcb_table, &hv_temp_table] {
        write_table(config, table)?;
    }
    Ok(())
}

/// Extract time series from the LED parts (and the flash statistics logs)
pub fn series(
    config: &Config,
    kinds: &[SeriesKind],
    tube: Option<u16>,
    tx: &Sender<WorkerStatus>,
) -> Result<(), ProcessorError> {
    if let Some(tube) = tube.filter(|tube| *tube >= config.n_tubes) {
        return Err(ProcessorError::TubeOutOfRange(tube, config.n_tubes));
    }
    let filter = ChannelFilter::new(&config.mirrors(), tube).with_n_tubes(config.n_tubes);
    let mut tables: BTreeMap<SeriesKind, DataTable> =
        kinds.iter().map(|kind| (*kind, kind.new_table())).collect();
    let mut profile = HvProfile::new();

    if kinds.iter().any(|kind| !kind.is_from_stats_log()) {
        let parser = EnvironmentParser::new();
        let store = DataStore::scan(&config.data_path)?;
        let stamps = store.stamps(PartKind::Led355);
        for_each_part(&store, PartKind::Led355, &stamps, ("series", BarColor::CYAN), tx, |part| {
            for (kind, table) in tables.iter_mut() {
                let result = match kind {
                    SeriesKind::Supply => supply_series(part, &filter, table),
                    SeriesKind::TubeHv => tube_hv_series(part, &filter, table),
                    SeriesKind::SubclusterHv => {
                        group_hv_series(part, TubeGroup::Subcluster, &filter, table)
                    }
                    SeriesKind::SubtubeHv => {
                        group_hv_series(part, TubeGroup::Subtube, &filter, table)
                    }
                    SeriesKind::Thresholds => threshold_series(part, &filter, table),
                    SeriesKind::LedTemps => {
                        led_temps_series(part, &parser, &filter, table);
                        Ok(())
                    }
                    SeriesKind::ClusterPth => {
                        cluster_pth_series(part, &parser, &filter, table);
                        Ok(())
                    }
                    SeriesKind::HvProfile => {
                        profile.add_part(part, &filter);
                        Ok(())
                    }
                    SeriesKind::QdcbVsEvent => {
                        qdcb_vs_event_series(part, &filter, table);
                        Ok(())
                    }
                    SeriesKind::FlashCluster | SeriesKind::FlashTube => Ok(()),
                };
                if let Err(e) = result {
                    spdlog::warn!("Skipping {kind} series of part {}: {e}", part.stamp);
                }
            }
            Ok(())
        })?;
    }

    if let Some(table) = tables.get_mut(&SeriesKind::HvProfile) {
        profile.fill_table(table);
    }
    if let Some(table) = tables.get_mut(&SeriesKind::FlashCluster) {
        let stats = StatsLog::new(&config.get_cluster_stats_file()?).read()?;
        flash_cluster_series(&stats, config.flash_stats.min_tubes, &filter, table);
    }
    if let Some(table) = tables.get_mut(&SeriesKind::FlashTube) {
        let stats = StatsLog::new(&config.get_tube_stats_file()?).read()?;
        flash_tube_series(&stats, &filter, table);
    }

    for table in tables.values() {
        write_table(config, table)?;
    }
    Ok(())
}

/// Convert the peg list into a peg chart
pub fn convert_pegs(config: &Config) -> Result<(), ProcessorError> {
    let pegs = PegTable::read_list(config.get_peg_list_path()?)?;
    let chart_path = config.get_peg_chart_path()?;
    pegs.write_chart(chart_path, config.n_mirrors)?;
    spdlog::info!(
        "Converted {} pegs into the chart {}",
        pegs.len(),
        chart_path.to_string_lossy()
    );
    Ok(())
}

/// LED parts after the configured first stamp of the cluster model, in order
fn cluster_model_stamps(config: &Config, store: &DataStore) -> Result<Vec<HalStamp>, ProcessorError> {
    let after = match config.cluster_model.after_stamp.as_deref() {
        Some(text) => Some(HalStamp::from_str(text)?),
        None => None,
    };
    Ok(store
        .stamps(PartKind::Led355)
        .into_iter()
        .filter(|stamp| after.map(|after| *stamp > after).unwrap_or(true))
        .collect())
}

fn push_model_rows(
    result: &ProvisionalCalibration,
    model: &ClusterModel,
    cluster_table: &mut DataTable,
    tube_table: &mut DataTable,
) {
    let day_s = result.stamp.epoch_seconds() as f64;
    let part = result.stamp.part() as f64;
    for (pass, fits) in result.passes.iter().enumerate() {
        for (mirror, qdcb) in fits.clusters.iter() {
            let tdc = result.tdc.get(mirror);
            let peak = result.peaks.get(mirror);
            cluster_table.push(vec![
                day_s,
                part,
                *mirror as f64,
                pass as f64,
                model.total(*mirror) as f64,
                fits.tally.get(mirror).copied().unwrap_or(0) as f64,
                tdc.map(|g| g.mean).unwrap_or(f64::NAN),
                tdc.map(|g| g.sigma).unwrap_or(f64::NAN),
                qdcb.constant,
                qdcb.mean,
                qdcb.sigma,
                peak.map(|p| p.0 as f64).unwrap_or(f64::NAN),
                peak.map(|p| p.1 as f64).unwrap_or(0.0),
            ]);
        }
        for (channel, tube) in fits.tubes.iter() {
            tube_table.push(vec![
                day_s,
                part,
                channel.mirror as f64,
                channel.tube as f64,
                pass as f64,
                tube.entries as f64,
                tube.fit.mean,
                tube.fit.sigma,
                if tube.cut { 1.0 } else { 0.0 },
            ]);
        }
    }
}

/// Model the clusters of every LED part and provisionally calibrate their QDCB response
pub fn cluster_model(config: &Config, tx: &Sender<WorkerStatus>) -> Result<(), ProcessorError> {
    let store = DataStore::scan(&config.data_path)?;
    let stamps = cluster_model_stamps(config, &store)?;
    spdlog::info!("Modelling the clusters of {} LED parts...", stamps.len());
    let filter = ChannelFilter::new(&config.mirrors(), None).with_n_tubes(config.n_tubes);
    let mut cluster_table = DataTable::new(
        "cluster_model_cluster",
        &[
            "part_day_s", "part", "mirror", "pass", "hits", "kept", "tdc_mean", "tdc_sigma",
            "qdcb_constant", "qdcb_mean", "qdcb_sigma", "peak_qdcb", "peak_count",
        ],
    );
    let mut tube_table = DataTable::new(
        "cluster_model_tube",
        &[
            "part_day_s", "part", "mirror", "tube", "pass", "entries", "qdcb_mean", "qdcb_sigma",
            "cut",
        ],
    );
    for_each_part(&store, PartKind::Led355, &stamps, ("cluster model", BarColor::MAGENTA), tx, |part| {
        let mut model = ClusterModel::from_part(part, &filter);
        if model.is_empty() {
            spdlog::warn!("Part {} has no event hits to model", part.stamp);
            return Ok(());
        }
        let result = provisional_calibrate(part.stamp, &mut model, &config.cluster_model);
        if let Some(last) = result.passes.last() {
            spdlog::info!("Part {} kept hits per mirror: {:?}", part.stamp, last.tally);
        }
        push_model_rows(&result, &model, &mut cluster_table, &mut tube_table);
        Ok(())
    })?;
    write_table(config, &cluster_table)?;
    write_table(config, &tube_table)?;
    Ok(())
}

/// Histogram the phase of the LED triggers within the flash period
pub fn led_resonance(config: &Config, tx: &Sender<WorkerStatus>) -> Result<(), ProcessorError> {
    let store = DataStore::scan(&config.data_path)?;
    let stamps = store.stamps(PartKind::Led355);
    let filter = ChannelFilter::new(&config.mirrors(), None);
    let mut resonance = LedResonance::new();
    for_each_part(&store, PartKind::Led355, &stamps, ("led resonance", BarColor::CYAN), tx, |part| {
        resonance.add_part(part, &filter);
        Ok(())
    })?;
    let mut table = LedResonance::new_table();
    resonance.fill_table(&mut table);
    write_table(config, &table)?;
    Ok(())
}

fn run_task(config: &Config, task: &Task, tx: &Sender<WorkerStatus>) -> Result<(), ProcessorError> {
    match task {
        Task::Stage => stage(config, tx),
        Task::Calibrate => calibrate(config, tx),
        Task::FlashStats => flash_stats(config, tx),
        Task::Correlate => correlate(config, tx),
        Task::Series { kinds, tube } => series(config, kinds, *tube, tx),
        Task::Pegs => convert_pegs(config),
        Task::ClusterModel => cluster_model(config, tx),
        Task::LedResonance => led_resonance(config, tx),
    }
}

/// The function to be called by a separate thread (typically the CLI worker).
///
/// A failed task sends a last red status before returning its error.
pub fn process(config: Config, task: Task, tx: Sender<WorkerStatus>) -> Result<(), ProcessorError> {
    spdlog::info!("Running task {}...", task.name());
    if let Err(e) = run_task(&config, &task, &tx) {
        // the receiver may be gone already
        let _ = tx.send(WorkerStatus::new(1.0, task.name(), "failed", BarColor::RED));
        return Err(e);
    }
    spdlog::info!("Finished task {}.", task.name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::read_calibration_table;
    use crate::constants::NOTICE_RUN_START;
    use crate::packet::{
        EventPacket, NoticePacket, Packet, TimeEvent, TimePacket, TubeHit, VoltsPacket,
    };
    use crate::packet_file::PacketFileWriter;
    use std::path::PathBuf;
    use std::sync::mpsc::channel;

    fn test_config(name: &str) -> Config {
        let root = std::env::temp_dir().join(format!("hvcalib_process_{name}"));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("data")).unwrap();
        let mut config = Config::default();
        config.data_path = root.join("data");
        config.output_path = root.join("out");
        config.volts_pedestal = 0.0;
        config.n_mirrors = 2;
        config
    }

    fn notice(notice_type: u8, text: &str) -> Packet {
        Packet::Notice(NoticePacket {
            mirror: 1,
            notice_type,
            year: 2009,
            day: 233,
            hour: 3,
            minute: 0,
            second: 0,
            msec: 0,
            text: text.to_string(),
        })
    }

    fn volts(minute: u32, hv: f32) -> Packet {
        Packet::Volts(VoltsPacket {
            mirror: 1,
            minute,
            hv_channels: 2,
            supply: 12.0,
            hv_supply: 0.0,
            board_temp: 0.0,
            garb_temp: 0.0,
            hv: vec![hv, hv],
        })
    }

    fn write_part(config: &Config, stamp: &str, kind: PartKind, packets: &[Packet]) -> PathBuf {
        let path = config
            .data_path
            .join(format!("{stamp}.{}.pkt", kind.suffix()));
        let mut writer = PacketFileWriter::new(&path).unwrap();
        for packet in packets {
            writer.write_packet(packet).unwrap();
        }
        writer.close().unwrap();
        path
    }

    #[test]
    fn test_calibrate_from_step_notices() {
        let mut config = test_config("calibrate");
        config.calibration.fixed_steps.clear();
        let mut packets = vec![notice(NOTICE_RUN_START, "RUN START")];
        for step in [500.0, 750.0, 1000.0] {
            packets.push(notice(1, &format!("{step}")));
        }
        for (minute, step) in [500.0f32, 750.0, 1000.0].iter().enumerate() {
            packets.push(volts(minute as u32, 0.98 * step + 1.0));
        }
        write_part(&config, "y2009m08d21p01", PartKind::HvCalib, &packets);

        let (tx, rx) = channel();
        calibrate(&config, &tx).unwrap();
        let statuses: Vec<WorkerStatus> = rx.try_iter().collect();
        assert_eq!(statuses.last().map(|s| s.progress), Some(1.0));

        let runs = read_calibration_table(&config.output_path.join(CALIBRATION_TABLE)).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].label, CalibrationBuilder::COMBINED_LABEL);
        let calib = runs[0].channels[&ChannelId::new(1, 1)];
        assert!((calib.slope - 1.0 / 0.98).abs() < 1e-3);
        assert_eq!(calib.n_points, 3);
    }

    #[test]
    fn test_flash_stats_resume() {
        let config = test_config("flash_stats");
        let event = |event: u32, msec: u32| {
            Packet::Event(EventPacket {
                mirror: 1,
                event,
                minute: 0,
                msec,
                hits: (0..4)
                    .map(|tube| TubeHit {
                        tube,
                        qdca: 0,
                        qdcb: 800 + tube,
                        tdc: 0,
                    })
                    .collect(),
            })
        };
        write_part(
            &config,
            "y2009m08d21p01",
            PartKind::Led355,
            &[notice(NOTICE_RUN_START, "RUN START"), event(1, 10), event(2, 20)],
        );
        write_part(&config, "y2009m08d21p02", PartKind::Led355, &[event(1, 10)]);

        let (tx, _rx) = channel();
        flash_stats(&config, &tx).unwrap();
        let cluster = StatsLog::new(&config.get_cluster_stats_file().unwrap());
        let tube = StatsLog::new(&config.get_tube_stats_file().unwrap());
        assert_eq!(cluster.read().unwrap().len(), 2);
        assert_eq!(tube.read().unwrap().len(), 4);

        // the part without a run start stays unlogged, so a rerun resumes after p01
        flash_stats(&config, &tx).unwrap();
        let stats = cluster.read().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].index, 1);
        assert_eq!(
            stats[1].stamp,
            HalStamp::from_str("y2009m08d21p01").unwrap()
        );
    }

    #[test]
    fn test_flash_stats_passes_over_part_without_run_start() {
        let config = test_config("flash_stats_gap");
        let event = Packet::Event(EventPacket {
            mirror: 1,
            event: 1,
            minute: 0,
            msec: 10,
            hits: vec![TubeHit {
                tube: 0,
                qdca: 0,
                qdcb: 800,
                tdc: 0,
            }],
        });
        let start = notice(NOTICE_RUN_START, "RUN START");
        write_part(&config, "y2009m08d21p01", PartKind::Led355, &[start.clone(), event.clone()]);
        write_part(&config, "y2009m08d21p02", PartKind::Led355, &[event.clone()]);
        write_part(&config, "y2009m08d21p03", PartKind::Led355, &[start, event]);

        let (tx, _rx) = channel();
        flash_stats(&config, &tx).unwrap();
        let cluster = StatsLog::new(&config.get_cluster_stats_file().unwrap());
        let logged: Vec<String> = cluster
            .read()
            .unwrap()
            .iter()
            .map(|stat| stat.stamp.to_string())
            .collect();
        assert_eq!(logged, vec!["y2009m08d21p01", "y2009m08d21p03"]);

        // resuming starts after p03, so p02 is not visited again
        let store = DataStore::scan(&config.data_path).unwrap();
        let (next_index, remaining) = cluster.resume_point(&store.stamps(PartKind::Led355)).unwrap();
        assert_eq!(next_index, 2);
        assert!(remaining.is_empty());
        flash_stats(&config, &tx).unwrap();
        assert_eq!(cluster.read().unwrap().len(), 2);
    }

    #[test]
    fn test_series_rejects_tube_past_mirror() {
        let mut config = test_config("series_tube");
        config.n_tubes = 16;
        let (tx, _rx) = channel();
        assert!(matches!(
            series(&config, &[SeriesKind::TubeHv], Some(16), &tx),
            Err(ProcessorError::TubeOutOfRange(16, 16))
        ));

        write_part(
            &config,
            "y2009m08d21p01",
            PartKind::Led355,
            &[notice(NOTICE_RUN_START, "RUN START"), volts(1, 1000.0)],
        );
        series(&config, &[SeriesKind::TubeHv], Some(1), &tx).unwrap();
        let tubes = std::fs::read_to_string(config.output_path.join("tube_hv.txt")).unwrap();
        assert_eq!(tubes.lines().count(), 2);
    }

    #[test]
    fn test_cluster_model_tables() {
        let mut config = test_config("cluster_model");
        config.cluster_model.after_stamp = Some(String::from("y2009m08d21p01"));
        // eight tubes around 1000 and one stray tube around 2000
        let bell = [(936u16, 2), (968, 6), (1000, 10), (1032, 6), (1064, 2)];
        let mut packets = Vec::new();
        let mut event = 0;
        for (value, n) in bell {
            for _ in 0..n {
                event += 1;
                packets.push(Packet::Event(EventPacket {
                    mirror: 1,
                    event,
                    minute: 0,
                    msec: event,
                    hits: (0..9)
                        .map(|tube| TubeHit {
                            tube,
                            qdca: 0,
                            qdcb: if tube == 8 { value + 1001 } else { value + 1 },
                            tdc: value + 1,
                        })
                        .collect(),
                }));
            }
        }
        write_part(&config, "y2009m08d21p01", PartKind::Led355, &packets);
        write_part(&config, "y2009m08d21p02", PartKind::Led355, &packets);

        let (tx, rx) = channel();
        cluster_model(&config, &tx).unwrap();
        let statuses: Vec<WorkerStatus> = rx.try_iter().collect();
        assert!(statuses.iter().all(|s| s.color == BarColor::MAGENTA));

        // only p02 is after the configured stamp: two passes of one mirror
        let clusters =
            std::fs::read_to_string(config.output_path.join("cluster_model_cluster.txt")).unwrap();
        let rows: Vec<Vec<f64>> = clusters
            .lines()
            .skip(1)
            .map(|line| line.split_whitespace().map(|v| v.parse().unwrap()).collect())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1], 2.0);
        assert_eq!(rows[1][4], 9.0 * 26.0);
        assert_eq!(rows[1][5], 8.0 * 26.0);
        assert_eq!(rows[1][11], 1001.0);

        let tubes =
            std::fs::read_to_string(config.output_path.join("cluster_model_tube.txt")).unwrap();
        let cut: Vec<&str> = tubes
            .lines()
            .filter(|line| line.ends_with(" 1"))
            .collect();
        assert_eq!(cut.len(), 1);
        assert_eq!(cut[0].split_whitespace().nth(3), Some("8"));
    }

    #[test]
    fn test_led_resonance_table() {
        let config = test_config("led_resonance");
        let time = Packet::Time(TimePacket {
            mirror: 1,
            year: 2009,
            day: 233,
            second_of_day: 10,
            freq: 40_000_000,
            events: [100, 50_000_300, 200]
                .iter()
                .map(|nsec| TimeEvent {
                    msec: 0,
                    nsec: *nsec,
                    mirror: 2,
                })
                .collect(),
        });
        write_part(&config, "y2009m08d21p01", PartKind::Led355, &[time]);
        let (tx, _rx) = channel();
        led_resonance(&config, &tx).unwrap();
        let text = std::fs::read_to_string(config.output_path.join("led_resonance.txt")).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_failed_task_sends_red_status() {
        let config = test_config("failed");
        let (tx, rx) = channel();
        assert!(process(config, Task::Pegs, tx).is_err());
        let last = rx.try_iter().last().unwrap();
        assert_eq!(last.color, BarColor::RED);
        assert_eq!(last.task, "pegs");
    }

    #[test]
    fn test_series_and_pegs() {
        let mut config = test_config("series");
        write_part(
            &config,
            "y2009m08d21p01",
            PartKind::Led355,
            &[notice(NOTICE_RUN_START, "RUN START"), volts(1, 1000.0)],
        );
        let (tx, _rx) = channel();
        series(&config, &[SeriesKind::Supply, SeriesKind::HvProfile], None, &tx).unwrap();
        let supply = std::fs::read_to_string(config.output_path.join("supply.txt")).unwrap();
        assert_eq!(supply.lines().count(), 2);
        let profile = std::fs::read_to_string(config.output_path.join("hv_profile.txt")).unwrap();
        assert_eq!(profile.lines().nth(1), Some("1 0 1 1000 1"));

        let list = config.output_path.join("pegs.list");
        std::fs::write(&list, "1 1 12\n2 1 14\n").unwrap();
        config.peg_list_path = Some(list);
        config.peg_chart_path = Some(config.output_path.join("pegs.chart"));
        convert_pegs(&config).unwrap();
        let chart = PegTable::read_chart(config.get_peg_chart_path().unwrap(), 2).unwrap();
        assert_eq!(chart.get(&ChannelId::new(2, 0)), Some(14));
    }

    #[test]
    fn test_dump_named_part() {
        let config = test_config("dump");
        write_part(
            &config,
            "y2009m08d21p01",
            PartKind::Led355,
            &[notice(NOTICE_RUN_START, "RUN START"), volts(1, 1000.0)],
        );
        let mut out: Vec<u8> = Vec::new();
        let summaries = dump(
            &config,
            PartKind::Led355,
            &[],
            Some(PacketKind::Notice),
            &mut out,
        )
        .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].total(), 1);
        assert!(String::from_utf8(out).unwrap().contains("\"RUN START\""));
    }
}
