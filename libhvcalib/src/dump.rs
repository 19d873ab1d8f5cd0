use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use super::error::PacketFileError;
use super::packet::{Packet, PacketKind};
use super::packet_file::PacketFile;

/// One line summary of a packet
pub fn describe(packet: &Packet) -> String {
    match packet {
        Packet::Notice(p) => format!(
            "notice m{:02} type {} {:04}-{:03} {:02}:{:02}:{:02}.{:03} {:?}",
            p.mirror, p.notice_type, p.year, p.day, p.hour, p.minute, p.second, p.msec, p.text
        ),
        Packet::Time(p) => format!(
            "time m{:02} {:04}-{:03} second {} freq {} triggers {}",
            p.mirror,
            p.year,
            p.day,
            p.second_of_day,
            p.freq,
            p.events.len()
        ),
        Packet::Volts(p) => format!(
            "volts m{:02} minute {} supply {:.2} hv_supply {:.2} board {:.1} garb {:.1} channels {} mean_hv {}",
            p.mirror,
            p.minute,
            p.supply,
            p.hv_supply,
            p.board_temp,
            p.garb_temp,
            p.hv_channels,
            p.mean_hv()
                .map(|hv| format!("{hv:.2}"))
                .unwrap_or_else(|| String::from("none"))
        ),
        Packet::Event(p) => {
            let qdcb: Vec<String> = p
                .hits
                .iter()
                .map(|hit| format!("{}:{}", hit.tube, hit.qdcb))
                .collect();
            format!(
                "event m{:02} #{} minute {} msec {} hits {} [{}]",
                p.mirror,
                p.event,
                p.minute,
                p.msec,
                p.hits.len(),
                qdcb.join(" ")
            )
        }
        Packet::Threshold(p) => format!(
            "threshold m{:02} minute {} tubes {} mean {}",
            p.mirror,
            p.minute,
            p.thresholds.len(),
            p.mean()
                .map(|t| format!("{t:.1}"))
                .unwrap_or_else(|| String::from("none"))
        ),
    }
}

/// Count of each packet kind seen in a dump
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub counts: BTreeMap<PacketKind, usize>,
}

impl DumpSummary {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

impl std::fmt::Display for DumpSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<String> = self
            .counts
            .iter()
            .map(|(kind, n)| format!("{kind} {n}"))
            .collect();
        write!(f, "{} packets ({})", self.total(), counts.join(", "))
    }
}

/// Write every packet of a part file (or only those of `filter`) to `out`, one per line,
/// followed by the packet counts
pub fn dump_part<W: Write>(
    path: &Path,
    filter: Option<PacketKind>,
    out: &mut W,
) -> Result<DumpSummary, PacketFileError> {
    let mut file = PacketFile::new(path)?;
    let mut summary = DumpSummary::default();
    while let Some(packet) = file.get_next_packet()? {
        let kind = packet.kind();
        if filter.map(|f| f != kind).unwrap_or(false) {
            continue;
        }
        writeln!(out, "{}", describe(&packet))?;
        *summary.counts.entry(kind).or_default() += 1;
    }
    writeln!(out, "# {}: {}", path.to_string_lossy(), summary)?;
    Ok(summary)
}
