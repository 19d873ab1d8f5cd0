use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::constants::{MS_PER_MINUTE, NOTICE_RUN_START, PACKET_FILE_EXTENSION};
use super::error::{DataStoreError, PacketFileError, PartError};
use super::hal_stamp::HalStamp;
use super::packet::{
    EventPacket, NoticePacket, Packet, ThresholdPacket, TimePacket, VoltsPacket,
};
use super::packet_file::PacketFile;

/// The kinds of part recorded by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartKind {
    Led355,
    NoiseClosed,
    HvCalib,
}

impl PartKind {
    pub const ALL: [PartKind; 3] = [Self::Led355, Self::NoiseClosed, Self::HvCalib];

    /// The name used in part file names, e.g. `y2009m08d21p01.hvcalib.pkt`
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Led355 => "led355",
            Self::NoiseClosed => "noise-closed",
            Self::HvCalib => "hvcalib",
        }
    }
}

impl FromStr for PartKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|kind| kind.suffix() == s)
            .copied()
            .ok_or_else(|| format!("Unknown part kind {s:?}"))
    }
}

impl Display for PartKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Decide if a path is a part file, and if so which kind and stamp it holds
pub fn classify_part_file(path: &Path) -> Option<(PartKind, HalStamp)> {
    let name = path.file_name()?.to_str()?;
    let kind = PartKind::ALL
        .iter()
        .find(|kind| name.ends_with(&format!(".{}.{}", kind.suffix(), PACKET_FILE_EXTENSION)))?;
    let stamp = HalStamp::find_in(name)?;
    Some((*kind, stamp))
}

/// Every packet of one part, in file order
#[derive(Debug, Clone)]
pub struct PartData {
    pub stamp: HalStamp,
    pub kind: PartKind,
    pub packets: Vec<Packet>,
}

impl PartData {
    pub fn new(stamp: HalStamp, kind: PartKind, packets: Vec<Packet>) -> Self {
        Self {
            stamp,
            kind,
            packets,
        }
    }

    pub fn load(stamp: HalStamp, kind: PartKind, path: &Path) -> Result<Self, PacketFileError> {
        let mut file = PacketFile::new(path)?;
        Ok(Self::new(stamp, kind, file.read_all()?))
    }

    pub fn notices(&self) -> impl Iterator<Item = &NoticePacket> + '_ {
        self.packets.iter().filter_map(|p| match p {
            Packet::Notice(n) => Some(n),
            _ => None,
        })
    }

    pub fn times(&self) -> impl Iterator<Item = &TimePacket> + '_ {
        self.packets.iter().filter_map(|p| match p {
            Packet::Time(t) => Some(t),
            _ => None,
        })
    }

    pub fn volts(&self) -> impl Iterator<Item = &VoltsPacket> + '_ {
        self.packets.iter().filter_map(|p| match p {
            Packet::Volts(v) => Some(v),
            _ => None,
        })
    }

    pub fn events(&self) -> impl Iterator<Item = &EventPacket> + '_ {
        self.packets.iter().filter_map(|p| match p {
            Packet::Event(e) => Some(e),
            _ => None,
        })
    }

    pub fn thresholds(&self) -> impl Iterator<Item = &ThresholdPacket> + '_ {
        self.packets.iter().filter_map(|p| match p {
            Packet::Threshold(t) => Some(t),
            _ => None,
        })
    }

    /// Epoch milliseconds of the first run start notice.
    ///
    /// Event and minute offsets in the other packets are measured from this point.
    pub fn run_start_ms(&self) -> Result<i64, PartError> {
        match self.notices().find(|n| n.notice_type == NOTICE_RUN_START) {
            Some(notice) => Ok(notice.time_ms()?),
            None => Err(PartError::NoRunStart(self.stamp.to_string())),
        }
    }
}

/// Time of a minute-stamped packet (volts, threshold)
pub fn minute_time_ms(run_start_ms: i64, minute: u32) -> i64 {
    run_start_ms + MS_PER_MINUTE * minute as i64
}

/// Time of an event packet
pub fn event_time_ms(run_start_ms: i64, event: &EventPacket) -> i64 {
    minute_time_ms(run_start_ms, event.minute) + event.msec as i64
}

/// DataStore indexes the part files under a data directory by kind and hal stamp.
///
/// Parts are only read from disk when asked for.
#[derive(Debug, Clone, Default)]
pub struct DataStore {
    parts: BTreeMap<PartKind, BTreeMap<HalStamp, PathBuf>>,
}

impl DataStore {
    /// Scan a directory tree for part files
    pub fn scan(root: &Path) -> Result<Self, DataStoreError> {
        if !root.is_dir() {
            return Err(DataStoreError::BadDataPath(root.to_path_buf()));
        }
        let mut store = Self::default();
        let mut files: Vec<PathBuf> = Vec::new();
        collect_files(root, &mut files)?;
        files.sort(); // first file in path order wins on duplicates
        for path in files {
            if let Some((kind, stamp)) = classify_part_file(&path) {
                store.insert(kind, stamp, path);
            }
        }
        for (kind, stamps) in store.parts.iter() {
            spdlog::info!("Found {} {} parts", stamps.len(), kind);
        }
        Ok(store)
    }

    /// Register a part file. Returns false (and keeps the old file) on a duplicate stamp.
    pub fn insert(&mut self, kind: PartKind, stamp: HalStamp, path: PathBuf) -> bool {
        let by_stamp = self.parts.entry(kind).or_default();
        if let Some(existing) = by_stamp.get(&stamp) {
            spdlog::warn!(
                "Duplicate {} part {}: keeping {} and ignoring {}",
                kind,
                stamp,
                existing.to_string_lossy(),
                path.to_string_lossy()
            );
            return false;
        }
        by_stamp.insert(stamp, path);
        true
    }

    /// Sorted stamps of every part of a kind
    pub fn stamps(&self, kind: PartKind) -> Vec<HalStamp> {
        self.parts
            .get(&kind)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn path(&self, kind: PartKind, stamp: &HalStamp) -> Option<&Path> {
        self.parts
            .get(&kind)
            .and_then(|m| m.get(stamp))
            .map(|p| p.as_path())
    }

    pub fn load(&self, kind: PartKind, stamp: &HalStamp) -> Result<PartData, DataStoreError> {
        let path = self
            .path(kind, stamp)
            .ok_or_else(|| DataStoreError::MissingPart(kind.to_string(), stamp.to_string()))?;
        Ok(PartData::load(*stamp, kind, path)?)
    }
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), DataStoreError> {
    for item in dir.read_dir()? {
        let item_path = item?.path();
        if item_path.is_dir() {
            collect_files(&item_path, files)?;
        } else {
            files.push(item_path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_file::PacketFileWriter;
    use std::str::FromStr;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hvcalib_data_store_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn run_start(mirror: u8) -> Packet {
        Packet::Notice(NoticePacket {
            mirror,
            notice_type: NOTICE_RUN_START,
            year: 1970,
            day: 1,
            hour: 0,
            minute: 1,
            second: 0,
            msec: 0,
            text: String::from("RUN START"),
        })
    }

    #[test]
    fn test_classify() {
        let (kind, stamp) =
            classify_part_file(Path::new("/x/y2009m08d21p03.hvcalib.pkt")).unwrap();
        assert_eq!(kind, PartKind::HvCalib);
        assert_eq!(stamp.to_string(), "y2009m08d21p03");
        let (kind, _) =
            classify_part_file(Path::new("y2008m11d07p02.noise-closed.pkt")).unwrap();
        assert_eq!(kind, PartKind::NoiseClosed);
        assert!(classify_part_file(Path::new("y2008m11d07p02.led355.hal")).is_none());
        assert!(classify_part_file(Path::new("notes.led355.pkt")).is_none());
    }

    #[test]
    fn test_scan_nested_directories() {
        let root = test_dir("scan");
        let day = root.join("y2009m08d21");
        std::fs::create_dir_all(&day).unwrap();
        for part in ["y2009m08d21p02", "y2009m08d21p01"] {
            let mut writer =
                PacketFileWriter::new(&day.join(format!("{part}.hvcalib.pkt"))).unwrap();
            writer.write_packet(&run_start(6)).unwrap();
            writer.close().unwrap();
        }
        std::fs::write(root.join("README"), "not a part").unwrap();

        let store = DataStore::scan(&root).unwrap();
        let stamps = store.stamps(PartKind::HvCalib);
        assert_eq!(stamps.len(), 2);
        assert!(stamps[0] < stamps[1]);
        assert!(store.stamps(PartKind::Led355).is_empty());

        let part = store.load(PartKind::HvCalib, &stamps[0]).unwrap();
        assert_eq!(part.packets.len(), 1);
        assert_eq!(part.run_start_ms().unwrap(), 60_000);

        let missing = HalStamp::from_str("y2001m01d01p01").unwrap();
        assert!(matches!(
            store.load(PartKind::HvCalib, &missing),
            Err(DataStoreError::MissingPart(_, _))
        ));
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let mut store = DataStore::default();
        let stamp = HalStamp::from_str("y2009m08d21p01").unwrap();
        assert!(store.insert(PartKind::Led355, stamp, PathBuf::from("a")));
        assert!(!store.insert(PartKind::Led355, stamp, PathBuf::from("b")));
        assert_eq!(store.path(PartKind::Led355, &stamp), Some(Path::new("a")));
    }

    #[test]
    fn test_missing_run_start() {
        let stamp = HalStamp::from_str("y2009m08d21p01").unwrap();
        let part = PartData::new(stamp, PartKind::Led355, vec![]);
        assert!(matches!(part.run_start_ms(), Err(PartError::NoRunStart(_))));
        assert!(DataStore::scan(Path::new("/definitely/not/here")).is_err());
    }
}
