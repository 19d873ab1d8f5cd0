use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use super::channel_id::ChannelId;
use super::error::PegError;

/// The HV peg (nominal setting) of each channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PegTable {
    pegs: BTreeMap<ChannelId, i32>,
}

impl PegTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: ChannelId, peg: i32) {
        self.pegs.insert(channel, peg);
    }

    pub fn get(&self, channel: &ChannelId) -> Option<i32> {
        self.pegs.get(channel).copied()
    }

    pub fn len(&self) -> usize {
        self.pegs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pegs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChannelId, &i32)> {
        self.pegs.iter()
    }

    /// Read a peg chart.
    ///
    /// The chart is tab separated. Rows which do not start with a digit are headers or notes;
    /// the n-th data row holds the pegs of tube n-1 with mirror `m` in column `m + 2`.
    pub fn read_chart(path: &Path, n_mirrors: u8) -> Result<Self, PegError> {
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut table = Self::new();
        let mut tube: u16 = 0;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if !line.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            let columns: Vec<&str> = line.trim_end().split('\t').collect();
            if columns.len() < n_mirrors as usize + 3 {
                return Err(PegError::BadFileFormat(path.to_path_buf(), line_no + 1));
            }
            for mirror in 1..=n_mirrors {
                let peg: i32 = columns[mirror as usize + 2].trim().parse()?;
                table.insert(ChannelId::new(mirror, tube), peg);
            }
            tube += 1;
        }
        Ok(table)
    }

    /// Read a peg list: space separated `mirror tube peg` rows with tubes counted from 1
    pub fn read_list(path: &Path) -> Result<Self, PegError> {
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut table = Self::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() != 3 {
                return Err(PegError::BadFileFormat(path.to_path_buf(), line_no + 1));
            }
            let mirror: u8 = columns[0].parse()?;
            let tube: u16 = columns[1].parse()?;
            let peg: i32 = columns[2].parse()?;
            if tube == 0 {
                return Err(PegError::BadTube);
            }
            table.insert(ChannelId::new(mirror, tube - 1), peg);
        }
        Ok(table)
    }

    /// Write the table as a peg chart. Channels without a peg are written as 0.
    pub fn write_chart(&self, path: &Path, n_mirrors: u8) -> Result<(), PegError> {
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        let mirror_columns: Vec<String> = (1..=n_mirrors).map(|m| format!("M{m}")).collect();
        writeln!(writer, "Tube\tSub-c #\tTube #\t{}", mirror_columns.join("\t"))?;

        let mut tubes: Vec<u16> = self.pegs.keys().map(|c| c.tube).collect();
        tubes.sort_unstable();
        tubes.dedup();
        let mut missing = 0;
        for tube in tubes {
            let channel = ChannelId::new(1, tube);
            let pegs: Vec<String> = (1..=n_mirrors)
                .map(|mirror| {
                    self.get(&ChannelId::new(mirror, tube)).unwrap_or_else(|| {
                        missing += 1;
                        0
                    })
                })
                .map(|peg| peg.to_string())
                .collect();
            writeln!(
                writer,
                "{}\t{}\t{}\t{}",
                tube,
                channel.subcluster(),
                channel.subtube(),
                pegs.join("\t")
            )?;
        }
        writer.flush()?;
        if missing > 0 {
            spdlog::warn!("Peg chart {path:?} has {missing} channels without a peg, written as 0");
        }
        Ok(())
    }
}
