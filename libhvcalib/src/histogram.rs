use super::fit::{fit_gaussian, Gaussian};

/// Fixed, evenly spaced binning over [min, max)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Binning {
    pub nbins: usize,
    pub min: f64,
    pub max: f64,
}

impl Binning {
    pub fn new(nbins: usize, min: f64, max: f64) -> Self {
        Self {
            nbins: nbins.max(1),
            min,
            max,
        }
    }

    pub fn width(&self) -> f64 {
        (self.max - self.min) / self.nbins as f64
    }
}

/// Choose a binning for a sample with the Freedman-Diaconis rule.
///
/// A single value `v` gets three bins over `v` plus or minus ten percent, ordered so the
/// range increases; a lone zero gets three bins over [-0.5, 0.5).
///
/// The quartiles use the integer index `(n/2 + 1)/2`, averaging neighbours when
/// `n % 4` is 0 or 1. The upper edge is one past the largest value so that integer data
/// filled at the centre of its unit interval always lands in range.
pub fn compute_bins(values: &[f64]) -> Binning {
    match values.len() {
        0 => return Binning::new(1, 0.0, 1.0),
        1 => {
            let v = values[0];
            let (lo, hi) = if v == 0.0 {
                (-0.5, 0.5)
            } else {
                let (a, b) = (v - 0.1 * v, v + 0.1 * v);
                (a.min(b), a.max(b))
            };
            return Binning::new(3, lo, hi);
        }
        _ => (),
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let index = (n / 2 + 1) / 2;
    let (first, third) = if n % 4 == 0 || n % 4 == 1 {
        (
            (sorted[index - 1] + sorted[index]) / 2.0,
            (sorted[n - index - 1] + sorted[n - index]) / 2.0,
        )
    } else {
        (sorted[index - 1], sorted[n - index])
    };

    let min = sorted[0];
    let max = sorted[n - 1] + 1.0;
    let width = 2.0 * (third - first) / (n as f64).cbrt();
    let nbins = if width == 0.0 {
        1
    } else {
        ((max - min) / width) as usize
    };
    Binning::new(nbins, min, max)
}

/// One dimensional histogram which also keeps the exact moments of what was filled in range
#[derive(Debug, Clone)]
pub struct Histogram {
    binning: Binning,
    counts: Vec<f64>,
    entries: u64,
    in_range: u64,
    sum: f64,
    sum2: f64,
}

impl Histogram {
    pub fn new(binning: Binning) -> Self {
        Self {
            binning,
            counts: vec![0.0; binning.nbins],
            entries: 0,
            in_range: 0,
            sum: 0.0,
            sum2: 0.0,
        }
    }

    /// Histogram of digitizer counts, binned with [compute_bins]. Each count is filled at the
    /// centre of its unit interval since the digitizer truncates.
    pub fn from_counts(counts: &[u16]) -> Self {
        let values: Vec<f64> = counts.iter().map(|c| *c as f64).collect();
        let mut hist = Self::new(compute_bins(&values));
        for value in values {
            hist.fill(value + 0.5);
        }
        hist
    }

    pub fn fill(&mut self, x: f64) {
        self.entries += 1;
        if x < self.binning.min || x >= self.binning.max || x.is_nan() {
            return;
        }
        let bin = ((x - self.binning.min) / self.binning.width()) as usize;
        self.counts[bin.min(self.binning.nbins - 1)] += 1.0;
        self.in_range += 1;
        self.sum += x;
        self.sum2 += x * x;
    }

    pub fn binning(&self) -> &Binning {
        &self.binning
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn centers(&self) -> Vec<f64> {
        let width = self.binning.width();
        (0..self.binning.nbins)
            .map(|bin| self.binning.min + (bin as f64 + 0.5) * width)
            .collect()
    }

    /// Every fill, including those outside the binning
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn mean(&self) -> f64 {
        if self.in_range == 0 {
            return 0.0;
        }
        self.sum / self.in_range as f64
    }

    pub fn rms(&self) -> f64 {
        if self.in_range == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum2 / self.in_range as f64 - mean * mean).max(0.0).sqrt()
    }

    /// Fit a Gaussian to the bin contents.
    ///
    /// Histograms too sparse or too flat to fit fall back to the moments of the data.
    pub fn fit_gaussian(&self) -> Gaussian {
        match fit_gaussian(&self.centers(), &self.counts) {
            Ok(gaussian) => gaussian,
            Err(e) => {
                spdlog::debug!("Gaussian fit fell back to moments: {e}");
                let sigma = self.rms();
                let constant = if sigma > 0.0 {
                    self.in_range as f64 * self.binning.width()
                        / (sigma * (2.0 * std::f64::consts::PI).sqrt())
                } else {
                    self.counts.iter().cloned().fold(0.0, f64::max)
                };
                Gaussian {
                    constant,
                    mean: self.mean(),
                    sigma,
                }
            }
        }
    }

    /// Fit a Gaussian to the run of populated bins around the fullest bin only, so that
    /// isolated clumps away from the peak do not widen it.
    ///
    /// Falls back to [Histogram::fit_gaussian] when the run is too short to fit.
    pub fn fit_gaussian_peak(&self) -> Gaussian {
        let Some(peak) = self
            .counts
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (bin, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((bin, *count)),
            })
            .filter(|(_, count)| *count > 0.0)
            .map(|(bin, _)| bin)
        else {
            return self.fit_gaussian();
        };
        let mut first = peak;
        while first > 0 && self.counts[first - 1] > 0.0 {
            first -= 1;
        }
        let mut last = peak;
        while last + 1 < self.counts.len() && self.counts[last + 1] > 0.0 {
            last += 1;
        }
        let centers = self.centers();
        match fit_gaussian(&centers[first..=last], &self.counts[first..=last]) {
            Ok(gaussian) => gaussian,
            Err(_) => self.fit_gaussian(),
        }
    }
}
