//! # hvcalib_cli
//!
//! Part of the hvcalib crate family.
//!
//! Command line front end of libhvcalib. Every subcommand reads the same YAML configuration,
//! given with `-p/--path`:
//!
//! ```bash
//! hvcalib_cli -p config.yaml new
//! hvcalib_cli -p config.yaml stage
//! hvcalib_cli -p config.yaml calibrate
//! hvcalib_cli -p config.yaml flash-stats
//! hvcalib_cli -p config.yaml correlate
//! hvcalib_cli -p config.yaml series --kind supply --kind tube-hv --tube 35
//! hvcalib_cli -p config.yaml dump --part led355 --stamp y2009m08d21p01 --packet notice
//! hvcalib_cli -p config.yaml pegs
//! hvcalib_cli -p config.yaml cluster-model
//! hvcalib_cli -p config.yaml led-resonance
//! ```
//!
//! The long running tasks report their progress with a progress bar; everything else goes to
//! the terminal and to `./hvcalib.log`.
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::Arc;

use libhvcalib::config::Config;
use libhvcalib::data_store::PartKind;
use libhvcalib::hal_stamp::HalStamp;
use libhvcalib::packet::PacketKind;
use libhvcalib::process::{dump, process, Task};
use libhvcalib::series::SeriesKind;
use libhvcalib::worker_status::{BarColor, WorkerStatus};

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could not create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

fn init_logging() {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./hvcalib.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .unwrap(),
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .sinks(spdlog::default_logger().sinks().iter().cloned())
            .sink(file_sink)
            .flush_level_filter(spdlog::LevelFilter::All)
            .build()
            .unwrap(),
    );
    spdlog::set_default_logger(logger);
}

fn bar_style(color: BarColor) -> Option<ProgressStyle> {
    ProgressStyle::with_template(&format!(
        "{{prefix:>12}} [{{bar:40.{}/blue}}] {{pos:>3}}% {{msg}}",
        color.name()
    ))
    .ok()
}

fn series_task(matches: &ArgMatches) -> Option<Task> {
    let kinds = match matches.get_many::<String>("kind") {
        Some(names) => {
            let mut kinds = Vec::new();
            for name in names {
                match SeriesKind::from_str(name) {
                    Ok(kind) => kinds.push(kind),
                    Err(e) => {
                        spdlog::error!("{e}");
                        return None;
                    }
                }
            }
            kinds
        }
        None => SeriesKind::ALL.to_vec(),
    };
    let tube = matches.get_one::<u16>("tube").copied();
    Some(Task::Series { kinds, tube })
}

fn run_dump(config: &Config, matches: &ArgMatches) {
    let part_name = matches
        .get_one::<String>("part")
        .map(|s| s.as_str())
        .unwrap_or("led355");
    let kind = match PartKind::from_str(part_name) {
        Ok(kind) => kind,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    let filter = match matches.get_one::<String>("packet").map(|s| PacketKind::from_str(s)) {
        None => None,
        Some(Ok(packet)) => Some(packet),
        Some(Err(e)) => {
            spdlog::error!("{e}");
            return;
        }
    };
    let mut stamps = Vec::new();
    for text in matches.get_many::<String>("stamp").into_iter().flatten() {
        match HalStamp::from_str(text) {
            Ok(stamp) => stamps.push(stamp),
            Err(e) => {
                spdlog::error!("{e}");
                return;
            }
        }
    }
    let mut out = std::io::stdout().lock();
    match dump(config, kind, &stamps, filter, &mut out) {
        Ok(summaries) => spdlog::info!("Dumped {} parts.", summaries.len()),
        Err(e) => spdlog::error!("Dump failed with error: {e}"),
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("hvcalib_cli")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(Command::new("stage").about("Copy new part files into the data path"))
        .subcommand(
            Command::new("dump")
                .about("Print the packets of parts")
                .arg(Arg::new("part").long("part").help("Part kind (led355, noise-closed, hvcalib)"))
                .arg(
                    Arg::new("stamp")
                        .long("stamp")
                        .action(ArgAction::Append)
                        .help("Hal stamp of a part to dump; all parts if omitted"),
                )
                .arg(Arg::new("packet").long("packet").help("Only dump packets of this kind")),
        )
        .subcommand(Command::new("calibrate").about("Fit and apply the HV calibration"))
        .subcommand(Command::new("flash-stats").about("Log LED flash statistics"))
        .subcommand(
            Command::new("correlate").about("Pair flashes with the environment and the HV"),
        )
        .subcommand(
            Command::new("series")
                .about("Extract time series tables")
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .action(ArgAction::Append)
                        .help("Series to extract; all of them if omitted"),
                )
                .arg(
                    Arg::new("tube")
                        .long("tube")
                        .value_parser(clap::value_parser!(u16))
                        .help("Only this tube"),
                ),
        )
        .subcommand(Command::new("pegs").about("Convert the peg list into a peg chart"))
        .subcommand(
            Command::new("cluster-model")
                .about("Provisionally calibrate LED parts from a model of the clusters"),
        )
        .subcommand(
            Command::new("led-resonance").about("Histogram the LED trigger phase in the flash period"),
        )
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .global(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    init_logging();

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    let task = match matches.subcommand() {
        Some(("new", _)) => {
            spdlog::info!(
                "Making a template config at {}...",
                config_path.to_string_lossy()
            );
            make_template_config(&config_path);
            spdlog::info!("Done.");
            return;
        }
        Some(("stage", _)) => Some(Task::Stage),
        Some(("calibrate", _)) => Some(Task::Calibrate),
        Some(("flash-stats", _)) => Some(Task::FlashStats),
        Some(("correlate", _)) => Some(Task::Correlate),
        Some(("pegs", _)) => Some(Task::Pegs),
        Some(("cluster-model", _)) => Some(Task::ClusterModel),
        Some(("led-resonance", _)) => Some(Task::LedResonance),
        Some(("series", sub)) => match series_task(sub) {
            Some(task) => Some(task),
            None => return,
        },
        // dump runs on this thread once the config is loaded
        _ => None,
    };

    // Load our config
    spdlog::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    spdlog::info!("Config successfully loaded.");
    spdlog::info!("Data Path: {}", config.data_path.to_string_lossy());
    spdlog::info!("Output Path: {}", config.output_path.to_string_lossy());
    spdlog::info!("Mirrors: {:?}", config.mirrors());
    spdlog::info!("Fit Model: {:?}", config.calibration.fit_model);

    if let Some(Task::Series {
        tube: Some(tube), ..
    }) = &task
    {
        if *tube >= config.n_tubes {
            spdlog::error!(
                "Tube {tube} does not exist; mirrors have tubes 0 to {}",
                config.n_tubes.saturating_sub(1)
            );
            return;
        }
    }

    let Some(task) = task else {
        if let Some(("dump", sub)) = matches.subcommand() {
            run_dump(&config, sub);
        }
        return;
    };

    // Setup the progress bar
    let pb = ProgressBar::new(100);
    let mut color = BarColor::default();
    if let Some(style) = bar_style(color) {
        pb.set_style(style);
    }
    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    // Spawn the task!
    let handle = std::thread::spawn(move || process(config, task, tx));

    // The channel closes when the worker returns
    for status in rx.iter() {
        if status.color != color {
            color = status.color;
            if let Some(style) = bar_style(color) {
                pb.set_style(style);
            }
        }
        pb.set_prefix(status.task.clone());
        pb.set_message(status.item.clone());
        pb.set_position((status.progress * 100.0) as u64);
    }
    pb.finish();

    match handle.join() {
        Ok(result) => match result {
            Ok(_) => spdlog::info!("Task finished successfully!"),
            Err(e) => spdlog::error!("Task failed with error: {e}"),
        },
        Err(_) => spdlog::error!("Failed to join worker task!"),
    }

    spdlog::info!("Done.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_config_reads_back() {
        let path = std::env::temp_dir().join("hvcalib_cli_template.yaml");
        make_template_config(&path);
        let config = Config::read_config_file(&path).unwrap();
        assert_eq!(config.n_tubes, 256);
    }

    #[test]
    #[should_panic(expected = "Could not create template config file!")]
    fn test_template_config_bad_directory() {
        let path = std::env::temp_dir()
            .join("hvcalib_cli_missing_dir")
            .join("config.yaml");
        make_template_config(&path);
    }

    #[test]
    fn test_bar_style_for_every_color() {
        for color in [BarColor::CYAN, BarColor::MAGENTA, BarColor::RED, BarColor::GREEN] {
            assert!(bar_style(color).is_some());
        }
    }
}
