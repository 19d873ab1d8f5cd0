use std::fmt::Display;

use super::constants::TUBES_PER_SUBCLUSTER;

/// ChannelId is the full address of one photomultiplier: the mirror (crate) and tube.
///
/// Mirrors count from 1, tubes from 0. ChannelIds order by mirror then tube, so maps keyed
/// by them iterate in the same order as the detector layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId {
    pub mirror: u8,
    pub tube: u16,
}

impl ChannelId {
    pub fn new(mirror: u8, tube: u16) -> Self {
        Self { mirror, tube }
    }

    /// Subcluster of the tube, counting from 1
    pub fn subcluster(&self) -> u16 {
        self.tube / TUBES_PER_SUBCLUSTER + 1
    }

    /// Position of the tube within its subcluster, counting from 1
    pub fn subtube(&self) -> u16 {
        self.tube % TUBES_PER_SUBCLUSTER + 1
    }

    /// Build from a subcluster (from 0) and in-subcluster tube (from 0), the layout used by
    /// reference calibration tables
    pub fn from_subcluster(mirror: u8, subcluster: u16, tube: u16) -> Self {
        Self {
            mirror,
            tube: TUBES_PER_SUBCLUSTER * subcluster + tube,
        }
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{:02}t{:03}", self.mirror, self.tube)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcluster_layout() {
        let first = ChannelId::new(6, 0);
        assert_eq!(first.subcluster(), 1);
        assert_eq!(first.subtube(), 1);
        let last = ChannelId::new(6, 255);
        assert_eq!(last.subcluster(), 16);
        assert_eq!(last.subtube(), 16);
        assert_eq!(ChannelId::from_subcluster(6, 2, 3), ChannelId::new(6, 35));
        assert_eq!(ChannelId::new(6, 35).to_string(), "m06t035");
    }
}
