use regex::Regex;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::OnceLock;
use time::{Date, Month};

use super::error::HalStampError;

fn stamp_regex() -> &'static Regex {
    static STAMP_REGEX: OnceLock<Regex> = OnceLock::new();
    STAMP_REGEX.get_or_init(|| {
        Regex::new(r"y(\d{4})m(\d{2})d(\d{2})p(\d{2})").expect("Hal stamp regex is valid")
    })
}

/// HalStamp identifies one part: a dated data-taking run and its index within that day.
///
/// Stamps order by date first and part second, which is also the order the parts were taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HalStamp {
    date: Date,
    part: u8,
}

impl HalStamp {
    pub fn new(year: i32, month: u8, day: u8, part: u8) -> Result<Self, HalStampError> {
        let bad_date = || HalStampError::BadDate(format!("y{year:04}m{month:02}d{day:02}p{part:02}"));
        let month = Month::try_from(month).map_err(|_| bad_date())?;
        let date = Date::from_calendar_date(year, month, day).map_err(|_| bad_date())?;
        Ok(Self { date, part })
    }

    /// Find the first hal stamp embedded in a string, typically a file name.
    ///
    /// Returns None if there is no stamp or the stamp names an impossible date.
    pub fn find_in(text: &str) -> Option<Self> {
        let found = stamp_regex().find(text)?;
        Self::from_str(found.as_str()).ok()
    }

    pub fn date(&self) -> Date {
        self.date
    }

    pub fn part(&self) -> u8 {
        self.part
    }

    /// The stamp without its part suffix (yYYYYmMMdDD)
    pub fn date_stamp(&self) -> String {
        format!(
            "y{:04}m{:02}d{:02}",
            self.date.year(),
            self.date.month() as u8,
            self.date.day()
        )
    }

    /// Epoch seconds of midnight (UTC) on the day of the part
    pub fn epoch_seconds(&self) -> i64 {
        self.date.midnight().assume_utc().unix_timestamp()
    }

    /// Check the full stamp text against a prefix such as `y2009m08d10`
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.to_string().starts_with(prefix)
    }
}

impl FromStr for HalStamp {
    type Err = HalStampError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = match stamp_regex().captures(s) {
            Some(c) if c.get(0).map(|m| m.as_str().len()) == Some(s.len()) => c,
            _ => return Err(HalStampError::BadFormat(s.to_string())),
        };
        // The regex only admits digits, so these parses cannot fail
        let year: i32 = caps[1].parse().map_err(|_| HalStampError::BadFormat(s.to_string()))?;
        let month: u8 = caps[2].parse().map_err(|_| HalStampError::BadFormat(s.to_string()))?;
        let day: u8 = caps[3].parse().map_err(|_| HalStampError::BadFormat(s.to_string()))?;
        let part: u8 = caps[4].parse().map_err(|_| HalStampError::BadFormat(s.to_string()))?;
        Self::new(year, month, day, part)
    }
}

impl Display for HalStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}p{:02}", self.date_stamp(), self.part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let stamp = HalStamp::from_str("y2009m08d21p01").unwrap();
        assert_eq!(stamp.date().year(), 2009);
        assert_eq!(stamp.date().month(), Month::August);
        assert_eq!(stamp.date().day(), 21);
        assert_eq!(stamp.part(), 1);
        assert_eq!(stamp.to_string(), "y2009m08d21p01");
        assert_eq!(stamp.date_stamp(), "y2009m08d21");
    }

    #[test]
    fn test_rejects_partial_and_impossible_stamps() {
        assert!(HalStamp::from_str("y2009m08d21").is_err());
        assert!(HalStamp::from_str("xy2009m08d21p01").is_err());
        assert!(matches!(
            HalStamp::from_str("y2009m02d30p01"),
            Err(HalStampError::BadDate(_))
        ));
    }

    #[test]
    fn test_ordering() {
        let a = HalStamp::from_str("y2009m02d14p01").unwrap();
        let b = HalStamp::from_str("y2009m02d14p02").unwrap();
        let c = HalStamp::from_str("y2009m03d01p01").unwrap();
        assert!(a < b);
        assert!(b < c);
        let mut stamps = vec![c, a, b];
        stamps.sort();
        assert_eq!(stamps, vec![a, b, c]);
    }

    #[test]
    fn test_find_in_file_name() {
        let stamp = HalStamp::find_in("/data/md/y2008m11d07/y2008m11d07p02.led355.pkt").unwrap();
        assert_eq!(stamp.to_string(), "y2008m11d07p02");
        assert!(HalStamp::find_in("/data/md/readme.txt").is_none());
    }

    #[test]
    fn test_epoch_and_prefix() {
        let stamp = HalStamp::new(1970, 1, 2, 3).unwrap();
        assert_eq!(stamp.epoch_seconds(), 86_400);
        assert!(stamp.matches_prefix("y1970m01d02"));
        assert!(!stamp.matches_prefix("y1970m01d03"));
    }
}
