//! # libhvcalib
//!
//! libhvcalib calibrates the high voltage (HV) readback of a fluorescence detector and
//! relates the response of its photomultipliers to the LED flashes, the environment and the
//! applied voltage. It reads the packet streams the detector records per part (one data
//! taking period, named by a hal stamp such as `y2009m08d21p01`) and writes plain text
//! tables that any plotting tool can read.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, you will
//! need to install the Rust tool chain, see the
//! [Rust docs](https://www.rust-lang.org/tools/install).
//!
//! To build and install the command line tool use `cargo install --path ./hvcalib_cli` from
//! the top level repository. To use the CLI see the `hvcalib_cli` README.
//!
//! ## Data
//!
//! Part files live anywhere below the data path and are named
//! `<hal stamp>.<kind>.pkt`, where kind is one of `led355`, `noise-closed` or `hvcalib`.
//! A part file is the `HVPK` magic, a little endian format version, then records of
//! `type (u8), crate (u8), body length (u32), body`. Notice, time, volts, event and
//! threshold packets are understood; other record types are skipped.
//!
//! Times are UTC epoch milliseconds. Volts and threshold packets are stamped in minutes and
//! events in minutes plus milliseconds after the run start notice of their part.
//!
//! ## Configuration
//!
//! A template configuration is written by `hvcalib_cli -p config.yaml new`. The YAML format
//! is as follows:
//!
//! ```yml
//! data_path: /data/parts
//! output_path: /data/hvcalib
//! staging_path: /mnt/share/parts
//! peg_chart_path: /data/pegs/chart.txt
//! peg_list_path: null
//! reference_calib_path: null
//! n_mirrors: 14
//! n_tubes: 256
//! volts_pedestal: 1.97747874989
//! calibration:
//!   fit_model: linear
//!   combine_parts: true
//!   mirrors: []
//!   excluded_stamps:
//!   - y2009m08d10
//!   fixed_steps:
//!     y2009m08d21p01:
//!     - 401.0
//! flash_stats:
//!   cluster_file: flash_stats_cluster.txt
//!   tube_file: flash_stats_tube.txt
//!   min_tubes: 241
//! cluster_model:
//!   tdc_sigma_cut: 4.0
//!   tdc_iterations: 1
//!   tube_sigma_cut: 3.0
//!   qdcb_passes: 2
//!   after_stamp: y2009m07d01p01
//! ```
//!
//! `fit_model` is `slope` (supplied = m * readback) or `linear` (supplied = m * readback + b).
//! With `combine_parts` every calibration part feeds one fit per channel, otherwise each
//! part is fitted on its own. An empty `mirrors` list means every mirror. Tubes at or past
//! `n_tubes` are ignored by the series and the cluster model.
//!
//! ## Output
//!
//! Every table is written to the output path as whitespace separated text headed by a `#`
//! line naming the columns:
//!
//! - `hv_calibration.txt`: `label mirror tube m m_var b b_var n` per calibrated channel
//! - `reference_comparison_<label>.txt`, `calibrated_hv.txt`, `peg_response.txt`
//! - `flash_stats_cluster.txt` and `flash_stats_tube.txt`: the append-only flash statistics
//!   logs, resumed where they end
//! - `flash_vs_led_temps.txt`, `flash_vs_cluster_pth.txt`, `qdcb_vs_hv.txt`,
//!   `hv_vs_temperature.txt`
//! - one table per extracted series, e.g. `supply.txt` or `hv_profile.txt`
//! - `cluster_model_cluster.txt` and `cluster_model_tube.txt`: the fits and cuts of the
//!   provisional cluster model of every LED part
//! - `led_resonance.txt`: the phase of the LED triggers within the 50 ms flash period
pub mod calibration;
pub mod channel_id;
pub mod cluster_model;
pub mod config;
pub mod constants;
pub mod correlate;
pub mod data_store;
pub mod dump;
pub mod environment;
pub mod error;
pub mod fit;
pub mod flash_stats;
pub mod hal_stamp;
pub mod histogram;
pub mod led_resonance;
pub mod packet;
pub mod packet_file;
pub mod pegs;
pub mod process;
pub mod series;
pub mod stager;
pub mod table;
pub mod worker_status;
