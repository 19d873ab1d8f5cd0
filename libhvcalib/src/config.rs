use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::constants::{MIN_FLASH_TUBES, NUMBER_OF_MIRRORS, TUBES_PER_MIRROR, VOLTS_PEDESTAL};
use super::error::ConfigError;
use super::fit::FitModel;
use super::hal_stamp::HalStamp;

/// Settings of the HV calibration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub fit_model: FitModel,
    /// Pool the samples of every calibration part into one fit per channel
    pub combine_parts: bool,
    /// Only calibrate these mirrors. Empty means every mirror.
    pub mirrors: Vec<u8>,
    /// Calibration parts whose stamp starts with any of these are ignored
    pub excluded_stamps: Vec<String>,
    /// Supply voltage steps of parts which did not record them as notices
    pub fixed_steps: BTreeMap<String, Vec<f64>>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        let fixed_steps = [401.0, 597.0, 596.0, 796.0, 1000.0, 1197.0, 1398.0]
            .iter()
            .enumerate()
            .map(|(idx, step)| (format!("y2009m08d21p{:02}", idx + 1), vec![*step]))
            .collect();
        Self {
            fit_model: FitModel::Linear,
            combine_parts: true,
            mirrors: Vec::new(),
            excluded_stamps: vec![String::from("y2009m08d10")],
            fixed_steps,
        }
    }
}

impl CalibrationConfig {
    pub fn is_excluded(&self, stamp: &HalStamp) -> bool {
        self.excluded_stamps
            .iter()
            .any(|prefix| stamp.matches_prefix(prefix))
    }

    pub fn fixed_steps_for(&self, stamp: &HalStamp) -> Option<&[f64]> {
        self.fixed_steps
            .get(&stamp.to_string())
            .map(|steps| steps.as_slice())
    }
}

/// Settings of the LED flash statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashStatsConfig {
    /// Log file name of the per event (cluster) statistics, inside the output path
    pub cluster_file: String,
    /// Log file name of the per tube statistics, inside the output path
    pub tube_file: String,
    /// Flashes with fewer tubes than this are dropped from the series
    pub min_tubes: u64,
}

impl Default for FlashStatsConfig {
    fn default() -> Self {
        Self {
            cluster_file: String::from("flash_stats_cluster.txt"),
            tube_file: String::from("flash_stats_tube.txt"),
            min_tubes: MIN_FLASH_TUBES,
        }
    }
}

/// Settings of the provisional cluster model calibration and the LED resonance scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterModelConfig {
    /// Hits further than this many cluster TDC sigmas from the cluster TDC mean are cut
    pub tdc_sigma_cut: f64,
    /// Times the cluster TDC cut is repeated; it stops early once nothing more is cut
    pub tdc_iterations: usize,
    /// Tubes whose QDCB mean is further than this many cluster QDCB sigmas away are cut
    pub tube_sigma_cut: f64,
    /// Passes of the cluster and tube QDCB fits
    pub qdcb_passes: usize,
    /// Only LED parts after this hal stamp are modelled
    pub after_stamp: Option<String>,
}

impl Default for ClusterModelConfig {
    fn default() -> Self {
        Self {
            tdc_sigma_cut: 4.0,
            tdc_iterations: 1,
            tube_sigma_cut: 3.0,
            qdcb_passes: 2,
            after_stamp: Some(String::from("y2009m07d01p01")),
        }
    }
}

/// Structure representing the application configuration. Contains pathing and analysis settings
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_path: PathBuf,
    pub output_path: PathBuf,
    pub staging_path: Option<PathBuf>,
    pub peg_chart_path: Option<PathBuf>,
    pub peg_list_path: Option<PathBuf>,
    pub reference_calib_path: Option<PathBuf>,
    pub n_mirrors: u8,
    pub n_tubes: u16,
    pub volts_pedestal: f64,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub flash_stats: FlashStatsConfig,
    #[serde(default)]
    pub cluster_model: ClusterModelConfig,
}

impl Default for Config {
    /// Generate a new Config object. Paths will be empty/invalid
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("None"),
            output_path: PathBuf::from("None"),
            staging_path: None,
            peg_chart_path: None,
            peg_list_path: None,
            reference_calib_path: None,
            n_mirrors: NUMBER_OF_MIRRORS,
            n_tubes: TUBES_PER_MIRROR,
            volts_pedestal: VOLTS_PEDESTAL,
            calibration: CalibrationConfig::default(),
            flash_stats: FlashStatsConfig::default(),
            cluster_model: ClusterModelConfig::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Path to an output table, creating the output directory if needed
    pub fn get_output_file(&self, name: &str) -> Result<PathBuf, ConfigError> {
        if !self.output_path.exists() {
            std::fs::create_dir_all(&self.output_path)?;
        }
        Ok(self.output_path.join(name))
    }

    pub fn get_cluster_stats_file(&self) -> Result<PathBuf, ConfigError> {
        self.get_output_file(&self.flash_stats.cluster_file)
    }

    pub fn get_tube_stats_file(&self) -> Result<PathBuf, ConfigError> {
        self.get_output_file(&self.flash_stats.tube_file)
    }

    pub fn get_staging_path(&self) -> Result<&Path, ConfigError> {
        self.staging_path
            .as_deref()
            .ok_or(ConfigError::MissingPath("staging"))
    }

    pub fn get_peg_chart_path(&self) -> Result<&Path, ConfigError> {
        self.peg_chart_path
            .as_deref()
            .ok_or(ConfigError::MissingPath("peg chart"))
    }

    pub fn get_peg_list_path(&self) -> Result<&Path, ConfigError> {
        self.peg_list_path
            .as_deref()
            .ok_or(ConfigError::MissingPath("peg list"))
    }

    /// Mirrors the analyses cover: the calibration filter if set, otherwise all of them
    pub fn mirrors(&self) -> Vec<u8> {
        if self.calibration.mirrors.is_empty() {
            (1..=self.n_mirrors).collect()
        } else {
            self.calibration.mirrors.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_default_reference_values() {
        let config = Config::default();
        assert_eq!(config.n_mirrors, 14);
        assert_eq!(config.n_tubes, 256);
        assert_eq!(config.flash_stats.min_tubes, 241);
        assert_eq!(config.cluster_model.tube_sigma_cut, 3.0);
        let stamp = HalStamp::from_str("y2009m08d21p03").unwrap();
        assert_eq!(config.calibration.fixed_steps_for(&stamp), Some(&[596.0][..]));
        let excluded = HalStamp::from_str("y2009m08d10p07").unwrap();
        assert!(config.calibration.is_excluded(&excluded));
        assert!(!config.calibration.is_excluded(&stamp));
        assert_eq!(config.mirrors().len(), 14);
    }

    #[test]
    fn test_yaml_round_trip_and_defaults() {
        let yaml = "data_path: /data\noutput_path: /out\nstaging_path: null\npeg_chart_path: null\n\
                    peg_list_path: null\nreference_calib_path: null\nn_mirrors: 2\nn_tubes: 16\n\
                    volts_pedestal: 2.0\ncalibration:\n  fit_model: slope\n  mirrors: [2]\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.calibration.fit_model, FitModel::Slope);
        assert!(config.calibration.combine_parts);
        assert_eq!(config.mirrors(), vec![2]);
        assert_eq!(config.flash_stats.min_tubes, 241);
        assert_eq!(config.cluster_model.qdcb_passes, 2);
        assert!(matches!(
            config.get_staging_path(),
            Err(ConfigError::MissingPath("staging"))
        ));

        let text = serde_yaml::to_string(&config).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.n_tubes, 16);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::read_config_file(Path::new("/not/a/config.yaml")),
            Err(ConfigError::BadFilePath(_))
        ));
    }
}
