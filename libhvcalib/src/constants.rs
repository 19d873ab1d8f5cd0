// Detector geometry
pub const NUMBER_OF_MIRRORS: u8 = 14;
pub const TUBES_PER_MIRROR: u16 = 256;
pub const TUBES_PER_SUBCLUSTER: u16 = 16;

/// Offset (V) of the HV readback with the supply off
pub const VOLTS_PEDESTAL: f64 = 1.97747874989;

/// Clusters with fewer tubes than this in an LED flash are not trusted
pub const MIN_FLASH_TUBES: u64 = 241;

// Notice packet types
pub const NOTICE_RUN_START: u8 = 8;
pub const NOTICE_LED_TEMPS: u8 = 10;
pub const NOTICE_CLUSTER_PTH: u8 = 17;

// Packet stream format
pub const PACKET_FILE_MAGIC: &[u8; 4] = b"HVPK";
pub const PACKET_FILE_VERSION: u16 = 1;
pub const PACKET_FILE_EXTENSION: &str = "pkt";

pub const MS_PER_MINUTE: i64 = 60_000;
