use bit_set::BitSet;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt::Display;
use std::io::Cursor;
use std::str::FromStr;
use time::Date;

use super::error::PacketError;

/// The packet types found in a part file. The discriminant is the type byte on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketKind {
    Notice = 1,
    Time = 2,
    Volts = 3,
    Event = 4,
    Threshold = 5,
}

impl TryFrom<u8> for PacketKind {
    type Error = u8;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Notice),
            2 => Ok(Self::Time),
            3 => Ok(Self::Volts),
            4 => Ok(Self::Event),
            5 => Ok(Self::Threshold),
            _ => Err(value),
        }
    }
}

impl FromStr for PacketKind {
    type Err = PacketError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notice" => Ok(Self::Notice),
            "time" => Ok(Self::Time),
            "volts" => Ok(Self::Volts),
            "event" => Ok(Self::Event),
            "threshold" => Ok(Self::Threshold),
            _ => Err(PacketError::UnknownKind(s.to_string())),
        }
    }
}

impl Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Notice => "notice",
            Self::Time => "time",
            Self::Volts => "volts",
            Self::Event => "event",
            Self::Threshold => "threshold",
        };
        write!(f, "{name}")
    }
}

/// Convert a (year, day of year, second of day, msec) packet clock to epoch milliseconds (UTC)
pub fn epoch_ms(year: u16, day: u16, second_of_day: u32, msec: i64) -> Result<i64, PacketError> {
    let date = Date::from_ordinal_date(year as i32, day)?;
    let midnight = date.midnight().assume_utc().unix_timestamp();
    Ok((midnight + second_of_day as i64) * 1000 + msec)
}

/// Free text notice written by the DAQ operator or by a monitoring daemon
#[derive(Debug, Clone, PartialEq)]
pub struct NoticePacket {
    pub mirror: u8,
    pub notice_type: u8,
    pub year: u16,
    pub day: u16,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub msec: u16,
    pub text: String,
}

impl NoticePacket {
    pub fn time_ms(&self) -> Result<i64, PacketError> {
        let second_of_day =
            self.hour as u32 * 3600 + self.minute as u32 * 60 + self.second as u32;
        epoch_ms(self.year, self.day, second_of_day, self.msec as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeEvent {
    pub msec: u16,
    pub nsec: u32,
    pub mirror: u8,
}

/// GPS timing of the triggers seen during one second
#[derive(Debug, Clone, PartialEq)]
pub struct TimePacket {
    pub mirror: u8,
    pub year: u16,
    pub day: u16,
    pub second_of_day: u32,
    pub freq: u32,
    pub events: Vec<TimeEvent>,
}

impl TimePacket {
    /// Epoch milliseconds of the trigger at `index`, None if there is no such trigger
    pub fn event_time_ms(&self, index: usize) -> Option<Result<i64, PacketError>> {
        self.events.get(index).map(|event| {
            epoch_ms(self.year, self.day, self.second_of_day, event.msec as i64)
        })
    }
}

/// Minute snapshot of the mirror electronics voltages
#[derive(Debug, Clone, PartialEq)]
pub struct VoltsPacket {
    pub mirror: u8,
    pub minute: u32,
    pub hv_channels: u16,
    pub supply: f32,
    pub hv_supply: f32,
    pub board_temp: f32,
    pub garb_temp: f32,
    pub hv: Vec<f32>,
}

impl VoltsPacket {
    /// Mean of every HV reading in the packet
    pub fn mean_hv(&self) -> Option<f64> {
        if self.hv.is_empty() {
            return None;
        }
        Some(self.hv.iter().map(|v| *v as f64).sum::<f64>() / self.hv.len() as f64)
    }

    /// The HV readings of the channels the packet claims to carry
    pub fn channel_hv(&self) -> impl Iterator<Item = (u16, f64)> + '_ {
        self.hv
            .iter()
            .take(self.hv_channels as usize)
            .enumerate()
            .map(|(tube, v)| (tube as u16, *v as f64))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TubeHit {
    pub tube: u16,
    pub qdca: u16,
    pub qdcb: u16,
    pub tdc: u16,
}

/// One triggered event: the tubes that fired and their charge/time digitizations
#[derive(Debug, Clone, PartialEq)]
pub struct EventPacket {
    pub mirror: u8,
    pub event: u32,
    pub minute: u32,
    pub msec: u32,
    pub hits: Vec<TubeHit>,
}

impl EventPacket {
    /// Set of tubes that participated in the event
    pub fn hit_mask(&self) -> BitSet {
        let mut mask = BitSet::with_capacity(256);
        for hit in self.hits.iter() {
            mask.insert(hit.tube as usize);
        }
        mask
    }

    pub fn hit(&self, tube: u16) -> Option<&TubeHit> {
        self.hits.iter().find(|hit| hit.tube == tube)
    }
}

/// Per tube trigger thresholds of a mirror
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPacket {
    pub mirror: u8,
    pub minute: u32,
    pub thresholds: Vec<u16>,
}

impl ThresholdPacket {
    pub fn mean(&self) -> Option<f64> {
        if self.thresholds.is_empty() {
            return None;
        }
        Some(self.thresholds.iter().map(|t| *t as f64).sum::<f64>() / self.thresholds.len() as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Notice(NoticePacket),
    Time(TimePacket),
    Volts(VoltsPacket),
    Event(EventPacket),
    Threshold(ThresholdPacket),
}

fn count_u16(field: &'static str, len: usize) -> Result<u16, PacketError> {
    u16::try_from(len).map_err(|_| PacketError::TooManyEntries(field, len))
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Notice(_) => PacketKind::Notice,
            Self::Time(_) => PacketKind::Time,
            Self::Volts(_) => PacketKind::Volts,
            Self::Event(_) => PacketKind::Event,
            Self::Threshold(_) => PacketKind::Threshold,
        }
    }

    pub fn mirror(&self) -> u8 {
        match self {
            Self::Notice(p) => p.mirror,
            Self::Time(p) => p.mirror,
            Self::Volts(p) => p.mirror,
            Self::Event(p) => p.mirror,
            Self::Threshold(p) => p.mirror,
        }
    }

    /// Decode a packet body. The whole body must be consumed.
    pub fn decode(kind: PacketKind, mirror: u8, body: &[u8]) -> Result<Self, PacketError> {
        let mut cursor = Cursor::new(body);
        let packet = match kind {
            PacketKind::Notice => {
                let notice_type = cursor.read_u8()?;
                let year = cursor.read_u16::<LittleEndian>()?;
                let day = cursor.read_u16::<LittleEndian>()?;
                let hour = cursor.read_u8()?;
                let minute = cursor.read_u8()?;
                let second = cursor.read_u8()?;
                let msec = cursor.read_u16::<LittleEndian>()?;
                let text_len = cursor.read_u16::<LittleEndian>()? as usize;
                let mut text = vec![0u8; text_len];
                std::io::Read::read_exact(&mut cursor, &mut text)?;
                Self::Notice(NoticePacket {
                    mirror,
                    notice_type,
                    year,
                    day,
                    hour,
                    minute,
                    second,
                    msec,
                    text: String::from_utf8(text)?,
                })
            }
            PacketKind::Time => {
                let year = cursor.read_u16::<LittleEndian>()?;
                let day = cursor.read_u16::<LittleEndian>()?;
                let second_of_day = cursor.read_u32::<LittleEndian>()?;
                let freq = cursor.read_u32::<LittleEndian>()?;
                let n_events = cursor.read_u16::<LittleEndian>()?;
                let mut events = Vec::with_capacity(n_events as usize);
                for _ in 0..n_events {
                    events.push(TimeEvent {
                        msec: cursor.read_u16::<LittleEndian>()?,
                        nsec: cursor.read_u32::<LittleEndian>()?,
                        mirror: cursor.read_u8()?,
                    });
                }
                Self::Time(TimePacket {
                    mirror,
                    year,
                    day,
                    second_of_day,
                    freq,
                    events,
                })
            }
            PacketKind::Volts => {
                let minute = cursor.read_u32::<LittleEndian>()?;
                let hv_channels = cursor.read_u16::<LittleEndian>()?;
                let supply = cursor.read_f32::<LittleEndian>()?;
                let hv_supply = cursor.read_f32::<LittleEndian>()?;
                let board_temp = cursor.read_f32::<LittleEndian>()?;
                let garb_temp = cursor.read_f32::<LittleEndian>()?;
                let n_hv = cursor.read_u16::<LittleEndian>()?;
                let mut hv = Vec::with_capacity(n_hv as usize);
                for _ in 0..n_hv {
                    hv.push(cursor.read_f32::<LittleEndian>()?);
                }
                Self::Volts(VoltsPacket {
                    mirror,
                    minute,
                    hv_channels,
                    supply,
                    hv_supply,
                    board_temp,
                    garb_temp,
                    hv,
                })
            }
            PacketKind::Event => {
                let event = cursor.read_u32::<LittleEndian>()?;
                let minute = cursor.read_u32::<LittleEndian>()?;
                let msec = cursor.read_u32::<LittleEndian>()?;
                let n_hits = cursor.read_u16::<LittleEndian>()?;
                let mut hits = Vec::with_capacity(n_hits as usize);
                for _ in 0..n_hits {
                    hits.push(TubeHit {
                        tube: cursor.read_u16::<LittleEndian>()?,
                        qdca: cursor.read_u16::<LittleEndian>()?,
                        qdcb: cursor.read_u16::<LittleEndian>()?,
                        tdc: cursor.read_u16::<LittleEndian>()?,
                    });
                }
                Self::Event(EventPacket {
                    mirror,
                    event,
                    minute,
                    msec,
                    hits,
                })
            }
            PacketKind::Threshold => {
                let minute = cursor.read_u32::<LittleEndian>()?;
                let n_tubes = cursor.read_u16::<LittleEndian>()?;
                let mut thresholds = Vec::with_capacity(n_tubes as usize);
                for _ in 0..n_tubes {
                    thresholds.push(cursor.read_u16::<LittleEndian>()?);
                }
                Self::Threshold(ThresholdPacket {
                    mirror,
                    minute,
                    thresholds,
                })
            }
        };
        if cursor.position() != body.len() as u64 {
            return Err(PacketError::LengthMismatch(
                kind as u8,
                body.len() as u32,
                cursor.position(),
            ));
        }
        Ok(packet)
    }

    /// Encode the packet body (everything after the record header)
    pub fn encode_body(&self) -> Result<Vec<u8>, PacketError> {
        let mut body: Vec<u8> = Vec::new();
        match self {
            Self::Notice(p) => {
                body.write_u8(p.notice_type)?;
                body.write_u16::<LittleEndian>(p.year)?;
                body.write_u16::<LittleEndian>(p.day)?;
                body.write_u8(p.hour)?;
                body.write_u8(p.minute)?;
                body.write_u8(p.second)?;
                body.write_u16::<LittleEndian>(p.msec)?;
                body.write_u16::<LittleEndian>(count_u16("text", p.text.len())?)?;
                body.extend_from_slice(p.text.as_bytes());
            }
            Self::Time(p) => {
                body.write_u16::<LittleEndian>(p.year)?;
                body.write_u16::<LittleEndian>(p.day)?;
                body.write_u32::<LittleEndian>(p.second_of_day)?;
                body.write_u32::<LittleEndian>(p.freq)?;
                body.write_u16::<LittleEndian>(count_u16("events", p.events.len())?)?;
                for event in p.events.iter() {
                    body.write_u16::<LittleEndian>(event.msec)?;
                    body.write_u32::<LittleEndian>(event.nsec)?;
                    body.write_u8(event.mirror)?;
                }
            }
            Self::Volts(p) => {
                body.write_u32::<LittleEndian>(p.minute)?;
                body.write_u16::<LittleEndian>(p.hv_channels)?;
                body.write_f32::<LittleEndian>(p.supply)?;
                body.write_f32::<LittleEndian>(p.hv_supply)?;
                body.write_f32::<LittleEndian>(p.board_temp)?;
                body.write_f32::<LittleEndian>(p.garb_temp)?;
                body.write_u16::<LittleEndian>(count_u16("hv", p.hv.len())?)?;
                for hv in p.hv.iter() {
                    body.write_f32::<LittleEndian>(*hv)?;
                }
            }
            Self::Event(p) => {
                body.write_u32::<LittleEndian>(p.event)?;
                body.write_u32::<LittleEndian>(p.minute)?;
                body.write_u32::<LittleEndian>(p.msec)?;
                body.write_u16::<LittleEndian>(count_u16("hits", p.hits.len())?)?;
                for hit in p.hits.iter() {
                    body.write_u16::<LittleEndian>(hit.tube)?;
                    body.write_u16::<LittleEndian>(hit.qdca)?;
                    body.write_u16::<LittleEndian>(hit.qdcb)?;
                    body.write_u16::<LittleEndian>(hit.tdc)?;
                }
            }
            Self::Threshold(p) => {
                body.write_u32::<LittleEndian>(p.minute)?;
                body.write_u16::<LittleEndian>(count_u16("thresholds", p.thresholds.len())?)?;
                for threshold in p.thresholds.iter() {
                    body.write_u16::<LittleEndian>(*threshold)?;
                }
            }
        }
        Ok(body)
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_time() {
        // 1970 day 2 is one day after the epoch
        let notice = NoticePacket {
            mirror: 3,
            notice_type: 8,
            year: 1970,
            day: 2,
            hour: 1,
            minute: 2,
            second: 3,
            msec: 45,
            text: String::from("RUN START"),
        };
        assert_eq!(notice.time_ms().unwrap(), (86_400 + 3723) * 1000 + 45);
    }

    #[test]
    fn test_volts_body_decodes() {
        let packet = Packet::Volts(VoltsPacket {
            mirror: 6,
            minute: 12,
            hv_channels: 2,
            supply: 1400.5,
            hv_supply: 1.5,
            board_temp: 300.0,
            garb_temp: 301.0,
            hv: vec![1000.0, 1002.0, 998.0],
        });
        let body = packet.encode_body().unwrap();
        let decoded = Packet::decode(PacketKind::Volts, 6, &body).unwrap();
        assert_eq!(decoded, packet);
        if let Packet::Volts(volts) = decoded {
            assert_eq!(volts.mean_hv(), Some(1000.0));
            assert_eq!(volts.channel_hv().count(), 2);
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let packet = Packet::Threshold(ThresholdPacket {
            mirror: 1,
            minute: 0,
            thresholds: vec![10, 20],
        });
        let mut body = packet.encode_body().unwrap();
        body.push(0);
        assert!(matches!(
            Packet::decode(PacketKind::Threshold, 1, &body),
            Err(PacketError::LengthMismatch(5, _, _))
        ));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let body = [0u8; 3];
        assert!(matches!(
            Packet::decode(PacketKind::Event, 1, &body),
            Err(PacketError::IOError(_))
        ));
    }

    #[test]
    fn test_hit_mask() {
        let event = EventPacket {
            mirror: 1,
            event: 7,
            minute: 0,
            msec: 0,
            hits: vec![
                TubeHit { tube: 3, qdca: 0, qdcb: 900, tdc: 0 },
                TubeHit { tube: 200, qdca: 0, qdcb: 910, tdc: 0 },
            ],
        };
        let mask = event.hit_mask();
        assert!(mask.contains(3));
        assert!(mask.contains(200));
        assert!(!mask.contains(4));
        assert_eq!(event.hit(200).map(|h| h.qdcb), Some(910));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(PacketKind::from_str("volts").unwrap(), PacketKind::Volts);
        assert!(PacketKind::from_str("snapshot").is_err());
        assert_eq!(PacketKind::try_from(4), Ok(PacketKind::Event));
        assert_eq!(PacketKind::try_from(9), Err(9));
    }
}
