use std::path::PathBuf;
use thiserror::Error;

use super::constants::{PACKET_FILE_MAGIC, PACKET_FILE_VERSION};
use super::worker_status::WorkerStatus;

#[derive(Debug, Clone, Error)]
pub enum HalStampError {
    #[error("String {0:?} is not a hal stamp of the form yYYYYmMMdDDpPP")]
    BadFormat(String),
    #[error("Hal stamp {0:?} names a date that does not exist")]
    BadDate(String),
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Failed to parse buffer into a packet: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Packet of type {0} declared a body of {1} bytes but used {2}")]
    LengthMismatch(u8, u32, u64),
    #[error("Notice packet text is not valid UTF-8: {0}")]
    BadText(#[from] std::string::FromUtf8Error),
    #[error("Packet field {0} holds {1} entries which does not fit the packet format")]
    TooManyEntries(&'static str, usize),
    #[error("Packet has an invalid timestamp: {0}")]
    BadTimestamp(#[from] time::error::ComponentRange),
    #[error("Unknown packet kind {0:?}")]
    UnknownKind(String),
}

#[derive(Debug, Error)]
pub enum PacketFileError {
    #[error("Could not open packet file because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Packet file does not start with the {magic:?} header", magic=PACKET_FILE_MAGIC)]
    BadMagic,
    #[error("Packet file has format version {0}; expected {exp}", exp=PACKET_FILE_VERSION)]
    BadVersion(u16),
    #[error("Packet file ended in the middle of a record")]
    Truncated,
    #[error("Error when parsing packet from packet file: {0}")]
    BadPacket(#[from] PacketError),
    #[error("Packet file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("DataStore could not scan {0:?} because it is not a directory")]
    BadDataPath(PathBuf),
    #[error("DataStore has no {0} part for stamp {1}")]
    MissingPart(String, String),
    #[error("DataStore failed due to packet file error: {0}")]
    FileError(#[from] PacketFileError),
    #[error("DataStore failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PartError {
    #[error("Part {0} has no run start notice")]
    NoRunStart(String),
    #[error("Part has a bad timestamp: {0}")]
    BadTimestamp(#[from] PacketError),
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("Fit needs at least {0} points but was given {1}")]
    TooFewPoints(usize, usize),
    #[error("Fit was given {0} x values and {1} y values")]
    MismatchedLengths(usize, usize),
    #[error("Fit is degenerate; the normal matrix could not be inverted")]
    Singular,
    #[error("Gaussian fit found no peak in the data")]
    NoPeak,
}

#[derive(Debug, Error)]
pub enum StatsLogError {
    #[error("Stats log failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Stats log {0:?} line {1} is malformed: {2:?}")]
    BadLine(PathBuf, usize, String),
    #[error("Stats log line has a bad hal stamp: {0}")]
    BadStamp(#[from] HalStampError),
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Calibration failed due to DataStore error: {0}")]
    StoreError(#[from] DataStoreError),
    #[error("Calibration failed due to stats log error: {0}")]
    LogError(#[from] StatsLogError),
    #[error("Calibration failed due to fit error: {0}")]
    FitError(#[from] FitError),
    #[error("Calibration failed due to part error: {0}")]
    PartError(#[from] PartError),
    #[error("Calibration has no calibrated voltages for mirror {0}")]
    NoCalibratedChannels(u8),
    #[error("Calibration table {0:?} line {1} is malformed")]
    BadTableLine(PathBuf, usize),
    #[error("Calibration failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FlashStatsError {
    #[error("FlashStats failed due to DataStore error: {0}")]
    StoreError(#[from] DataStoreError),
    #[error("FlashStats failed due to stats log error: {0}")]
    LogError(#[from] StatsLogError),
    #[error("FlashStats failed due to part error: {0}")]
    PartError(#[from] PartError),
    #[error("FlashStats log ends with part {0} which is not in the DataStore")]
    UnknownResumePart(String),
}

#[derive(Debug, Error)]
pub enum PegError {
    #[error("Peg table failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Peg table failed to parse an integer: {0}")]
    ParsingError(#[from] std::num::ParseIntError),
    #[error("Peg table {0:?} line {1} has the incorrect number of columns")]
    BadFileFormat(PathBuf, usize),
    #[error("Peg list names tube 0; tubes are numbered from 1")]
    BadTube,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is missing the {0} path")]
    MissingPath(&'static str),
}

#[derive(Debug, Error)]
pub enum StagerError {
    #[error("Stager failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Stager could not read source directory {0:?}")]
    BadSourcePath(PathBuf),
    #[error("Stager failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Stager error: {0}")]
    StagerError(#[from] StagerError),
    #[error("Processor failed due to DataStore error: {0}")]
    StoreError(#[from] DataStoreError),
    #[error("Processor failed due to Calibration error: {0}")]
    CalibrationError(#[from] CalibrationError),
    #[error("Processor failed due to FlashStats error: {0}")]
    FlashStatsError(#[from] FlashStatsError),
    #[error("Processor failed due to stats log error: {0}")]
    LogError(#[from] StatsLogError),
    #[error("Processor failed due to peg table error: {0}")]
    PegError(#[from] PegError),
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to part error: {0}")]
    PartError(#[from] PartError),
    #[error("Processor failed due to hal stamp error: {0}")]
    StampError(#[from] HalStampError),
    #[error("Processor was asked for tube {0} but mirrors only have {1} tubes")]
    TubeOutOfRange(u16, u16),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}
