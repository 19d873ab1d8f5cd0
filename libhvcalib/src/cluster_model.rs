//! Provisional calibration of LED parts from a model of the flashing clusters.
//!
//! Dim flashes can trigger the TDC early, cutting off part or all of the LED light, or pick
//! up extra noise. The model keeps every hit of a part at first and then trims it in steps:
//!
//! 1. The TDC distribution of each cluster (mirror) is fitted and hits far from its mean are
//!    cut. This repeats while it still cuts hits, up to a configured number of iterations.
//! 2. The QDCB distribution of each cluster is fitted from the hits still kept.
//! 3. The QDCB distribution of each tube is fitted, and tubes whose mean sits too far from
//!    their cluster mean are cut whole.
//! 4. The kept hits of every cluster are tallied.
//!
//! Steps 2 to 4 run a configured number of passes, each refitting what the previous one
//! kept. All distributions use 128 bins over the 12 bit digitizer range.
use std::collections::BTreeMap;

use super::channel_id::ChannelId;
use super::config::ClusterModelConfig;
use super::data_store::PartData;
use super::fit::Gaussian;
use super::hal_stamp::HalStamp;
use super::histogram::{Binning, Histogram};
use super::series::ChannelFilter;

const DIGITIZER_BINNING: Binning = Binning {
    nbins: 128,
    min: 0.0,
    max: 4096.0,
};

/// One tube hit of the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelHit {
    pub tdc: u16,
    pub qdcb: u16,
    pub kept: bool,
}

/// Which digitization of a hit a fit looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Digitization {
    Tdc,
    Qdcb,
}

impl Digitization {
    fn of(&self, hit: &ModelHit) -> u16 {
        match self {
            Self::Tdc => hit.tdc,
            Self::Qdcb => hit.qdcb,
        }
    }
}

fn fit_kept<'a>(hits: impl Iterator<Item = &'a ModelHit>, what: Digitization) -> Option<Gaussian> {
    let mut hist = Histogram::new(DIGITIZER_BINNING);
    for hit in hits.filter(|hit| hit.kept) {
        hist.fill(what.of(hit) as f64);
    }
    if hist.entries() == 0 {
        return None;
    }
    Some(hist.fit_gaussian_peak())
}

fn outside(value: u16, fit: &Gaussian, n_sigma: f64) -> bool {
    (value as f64 - fit.mean).abs() > n_sigma * fit.sigma
}

/// QDCB fit of one tube and whether the tube was cut for straying from its cluster
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TubeFit {
    pub fit: Gaussian,
    /// Kept hits the fit was made from
    pub entries: usize,
    pub cut: bool,
}

/// The hits of one part, by mirror and tube
#[derive(Debug, Clone, Default)]
pub struct ClusterModel {
    hits: BTreeMap<u8, BTreeMap<u16, Vec<ModelHit>>>,
}

impl ClusterModel {
    /// Gather every event hit of a part accepted by `filter`
    pub fn from_part(part: &PartData, filter: &ChannelFilter) -> Self {
        let mut model = Self::default();
        for event in part.events() {
            for hit in event.hits.iter() {
                if !filter.accepts(&ChannelId::new(event.mirror, hit.tube)) {
                    continue;
                }
                model.push(event.mirror, hit.tube, hit.tdc, hit.qdcb);
            }
        }
        model
    }

    pub fn push(&mut self, mirror: u8, tube: u16, tdc: u16, qdcb: u16) {
        self.hits
            .entry(mirror)
            .or_default()
            .entry(tube)
            .or_default()
            .push(ModelHit {
                tdc,
                qdcb,
                kept: true,
            });
    }

    pub fn mirrors(&self) -> impl Iterator<Item = u8> + '_ {
        self.hits.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn tube_hits(&self, channel: &ChannelId) -> &[ModelHit] {
        self.hits
            .get(&channel.mirror)
            .and_then(|tubes| tubes.get(&channel.tube))
            .map(|hits| hits.as_slice())
            .unwrap_or(&[])
    }

    /// Number of hits of a mirror, kept or not
    pub fn total(&self, mirror: u8) -> usize {
        self.hits
            .get(&mirror)
            .map(|tubes| tubes.values().map(|hits| hits.len()).sum())
            .unwrap_or(0)
    }

    /// Fit the kept TDCs of every cluster and cut the hits outside `n_sigma` of the fit.
    ///
    /// Returns the fits and the number of hits newly cut. Clusters with nothing kept are
    /// not fitted.
    pub fn cut_cluster_tdcs(&mut self, n_sigma: f64) -> (BTreeMap<u8, Gaussian>, usize) {
        let mut fits = BTreeMap::new();
        let mut n_cut = 0;
        for (mirror, tubes) in self.hits.iter_mut() {
            let Some(fit) = fit_kept(tubes.values().flatten(), Digitization::Tdc) else {
                continue;
            };
            for hit in tubes.values_mut().flatten() {
                if hit.kept && outside(hit.tdc, &fit, n_sigma) {
                    hit.kept = false;
                    n_cut += 1;
                }
            }
            fits.insert(*mirror, fit);
        }
        (fits, n_cut)
    }

    /// Fit the kept QDCBs of every cluster
    pub fn fit_cluster_qdcbs(&self) -> BTreeMap<u8, Gaussian> {
        self.hits
            .iter()
            .filter_map(|(mirror, tubes)| {
                fit_kept(tubes.values().flatten(), Digitization::Qdcb).map(|fit| (*mirror, fit))
            })
            .collect()
    }

    /// Fit the kept QDCBs of every tube. Tubes whose mean lies further than `n_sigma`
    /// cluster sigmas from their cluster mean lose all of their hits.
    pub fn cut_tube_qdcbs(
        &mut self,
        clusters: &BTreeMap<u8, Gaussian>,
        n_sigma: f64,
    ) -> BTreeMap<ChannelId, TubeFit> {
        let mut fits = BTreeMap::new();
        for (mirror, tubes) in self.hits.iter_mut() {
            let Some(cluster) = clusters.get(mirror) else {
                continue;
            };
            for (tube, hits) in tubes.iter_mut() {
                let Some(fit) = fit_kept(hits.iter(), Digitization::Qdcb) else {
                    continue;
                };
                let entries = hits.iter().filter(|hit| hit.kept).count();
                let cut = (fit.mean - cluster.mean).abs() > n_sigma * cluster.sigma;
                if cut {
                    hits.iter_mut().for_each(|hit| hit.kept = false);
                }
                fits.insert(ChannelId::new(*mirror, *tube), TubeFit { fit, entries, cut });
            }
        }
        fits
    }

    /// Kept hits of every mirror
    pub fn tally(&self) -> BTreeMap<u8, usize> {
        self.hits
            .iter()
            .map(|(mirror, tubes)| {
                let kept = tubes.values().flatten().filter(|hit| hit.kept).count();
                (*mirror, kept)
            })
            .collect()
    }

    /// QDCBs of the kept hits of a mirror
    pub fn kept_qdcbs(&self, mirror: u8) -> Vec<u16> {
        self.hits
            .get(&mirror)
            .map(|tubes| {
                tubes
                    .values()
                    .flatten()
                    .filter(|hit| hit.kept)
                    .map(|hit| hit.qdcb)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Most common value and how often it occurs. Ties go to the smallest value.
pub fn find_peak(values: &[u16]) -> Option<(u16, usize)> {
    let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(*value).or_default() += 1;
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(u16, usize)>, (value, n)| match best {
            Some((_, best_n)) if best_n >= n => best,
            _ => Some((value, n)),
        })
}

/// Fits and tally of one pass of the QDCB steps
#[derive(Debug, Clone, Default)]
pub struct ModelPass {
    pub clusters: BTreeMap<u8, Gaussian>,
    pub tubes: BTreeMap<ChannelId, TubeFit>,
    pub tally: BTreeMap<u8, usize>,
}

/// Outcome of modelling one part
#[derive(Debug, Clone)]
pub struct ProvisionalCalibration {
    pub stamp: HalStamp,
    /// Cluster TDC fits of the last cut iteration
    pub tdc: BTreeMap<u8, Gaussian>,
    /// Hits cut by each TDC cut iteration
    pub tdc_cuts: Vec<usize>,
    pub passes: Vec<ModelPass>,
    /// Most common kept QDCB of every mirror after the last pass
    pub peaks: BTreeMap<u8, (u16, usize)>,
}

/// Run every step of the model on the hits of one part
pub fn provisional_calibrate(
    stamp: HalStamp,
    model: &mut ClusterModel,
    settings: &ClusterModelConfig,
) -> ProvisionalCalibration {
    let mut tdc = BTreeMap::new();
    let mut tdc_cuts = Vec::new();
    for _ in 0..settings.tdc_iterations.max(1) {
        let (fits, n_cut) = model.cut_cluster_tdcs(settings.tdc_sigma_cut);
        tdc = fits;
        tdc_cuts.push(n_cut);
        if n_cut == 0 {
            break;
        }
    }

    let mut passes = Vec::with_capacity(settings.qdcb_passes);
    for _ in 0..settings.qdcb_passes {
        let clusters = model.fit_cluster_qdcbs();
        let tubes = model.cut_tube_qdcbs(&clusters, settings.tube_sigma_cut);
        let tally = model.tally();
        spdlog::debug!("Part {stamp} cluster model pass {}: kept {tally:?}", passes.len());
        passes.push(ModelPass {
            clusters,
            tubes,
            tally,
        });
    }

    let peaks = model
        .mirrors()
        .filter_map(|mirror| find_peak(&model.kept_qdcbs(mirror)).map(|peak| (mirror, peak)))
        .collect();
    ProvisionalCalibration {
        stamp,
        tdc,
        tdc_cuts,
        passes,
        peaks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::PartKind;
    use crate::packet::{EventPacket, Packet, TubeHit};
    use std::str::FromStr;

    // Bin populations of a bell over five adjacent 32 wide bins
    const BELL: [(u16, usize); 5] = [(936, 2), (968, 6), (1000, 10), (1032, 6), (1064, 2)];

    fn bell_model(mirror: u8, tubes: std::ops::Range<u16>) -> ClusterModel {
        let mut model = ClusterModel::default();
        for tube in tubes {
            for (value, n) in BELL {
                for _ in 0..n {
                    model.push(mirror, tube, value + 1, value + 1);
                }
            }
        }
        model
    }

    fn model_settings() -> ClusterModelConfig {
        ClusterModelConfig {
            after_stamp: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_tdc_cut_removes_early_triggers() {
        let mut model = bell_model(1, 0..4);
        model.push(1, 0, 3000, 1000);
        model.push(1, 1, 3000, 1000);
        assert_eq!(model.total(1), 4 * 26 + 2);

        let (fits, n_cut) = model.cut_cluster_tdcs(4.0);
        assert_eq!(n_cut, 2);
        assert!((fits[&1].mean - 1000.0).abs() < 16.0);
        assert!(model.tube_hits(&ChannelId::new(1, 0)).iter().any(|hit| !hit.kept));
        assert_eq!(model.tally()[&1], 4 * 26);

        // a second iteration on what is left cuts nothing
        let (_, n_cut) = model.cut_cluster_tdcs(4.0);
        assert_eq!(n_cut, 0);
    }

    #[test]
    fn test_tdc_iterations_stop_when_stable() {
        let mut model = bell_model(2, 0..3);
        model.push(2, 0, 4000, 1000);
        let settings = ClusterModelConfig {
            tdc_iterations: 5,
            ..model_settings()
        };
        let result =
            provisional_calibrate(HalStamp::from_str("y2009m08d21p01").unwrap(), &mut model, &settings);
        assert_eq!(result.tdc_cuts, vec![1, 0]);
        assert!(result.tdc.contains_key(&2));
    }

    #[test]
    fn test_tube_cut_and_tally() {
        let mut model = bell_model(3, 0..8);
        // one tube answers at twice the cluster charge
        for (value, n) in BELL {
            for _ in 0..n {
                model.push(3, 8, value + 1, value + 1001);
            }
        }
        let result =
            provisional_calibrate(HalStamp::from_str("y2009m08d21p01").unwrap(), &mut model, &model_settings());
        assert_eq!(result.tdc_cuts, vec![0]);
        assert_eq!(result.passes.len(), 2);

        let first = &result.passes[0];
        assert_eq!(first.tubes.len(), 9);
        let stray = first.tubes[&ChannelId::new(3, 8)];
        assert!((stray.fit.mean - 2000.0).abs() < 16.0);
        assert_eq!(stray.entries, 26);
        assert!(stray.cut);
        assert!(!first.tubes[&ChannelId::new(3, 0)].cut);
        assert_eq!(first.tally[&3], 8 * 26);
        assert!(model.tube_hits(&ChannelId::new(3, 8)).iter().all(|hit| !hit.kept));

        // the cut tube has nothing left to fit on the second pass
        let second = &result.passes[1];
        assert_eq!(second.tubes.len(), 8);
        assert_eq!(second.tally[&3], 8 * 26);
        assert!((second.clusters[&3].mean - 1000.0).abs() < 16.0);
        assert_eq!(result.peaks[&3], (1001, 8 * 10));
    }

    #[test]
    fn test_from_part_respects_filter() {
        let hit = |tube| TubeHit {
            tube,
            qdca: 0,
            qdcb: 900,
            tdc: 700,
        };
        let part = PartData::new(
            HalStamp::from_str("y2009m08d21p01").unwrap(),
            PartKind::Led355,
            vec![
                Packet::Event(EventPacket {
                    mirror: 1,
                    event: 1,
                    minute: 0,
                    msec: 0,
                    hits: vec![hit(0), hit(15), hit(16)],
                }),
                Packet::Event(EventPacket {
                    mirror: 2,
                    event: 1,
                    minute: 0,
                    msec: 0,
                    hits: vec![hit(0)],
                }),
            ],
        );
        let model = ClusterModel::from_part(&part, &ChannelFilter::new(&[1], None).with_n_tubes(16));
        assert_eq!(model.mirrors().collect::<Vec<u8>>(), vec![1]);
        assert_eq!(model.total(1), 2);
        assert_eq!(model.tube_hits(&ChannelId::new(1, 15))[0].tdc, 700);
        assert!(model.tube_hits(&ChannelId::new(1, 16)).is_empty());
    }

    #[test]
    fn test_find_peak() {
        assert_eq!(find_peak(&[]), None);
        assert_eq!(find_peak(&[5, 7, 7, 5, 9]), Some((5, 2)));
        assert_eq!(find_peak(&[3, 8, 8]), Some((8, 2)));
    }
}
