//! Scoring of match-between-runs hypotheses
//!
//! Each acceptor run gets its own [`MbrScorer`], fit to the run's unambiguous
//! MS2-identified peaks. A hypothesis is scored by the densities of its ppm
//! error, retention time, intensity, isotope correlation and scan count under
//! those distributions. Each density is compressed with `asinh`, i.e.
//! `ln(d + sqrt(d^2 + 1))`, before summing. This transform is an empirical
//! choice: it keeps tiny densities near zero and large ones finite.

use crate::alignment::{best_peak_per_sequence, RtPrediction};
use crate::engine::Identification;
use crate::ml::{interquartile_range, mean, median, sample_std};
use crate::peak::{ChromatographicPeak, MbrScore};
use fnv::FnvHashMap;
use statrs::distribution::{Continuous, Gamma, Normal};

/// Minimum number of unambiguous MS2 peaks needed to fit the distributions
pub const MIN_ACCEPTOR_PEAKS: usize = 3;
/// Minimum number of shared peptides needed to fit a fold-change distribution
const MIN_FOLD_CHANGE_PEPTIDES: usize = 100;
/// Sample size at which the ppm and scan count spreads switch estimators
const MIN_FOR_STD_DEV: usize = 30;
/// IQR of a normal distribution, in standard deviations
const IQR_TO_STD_DEV: f64 = 1.36;
/// Spreads are floored here, so that identical observations still yield a
/// valid distribution
const MIN_SPREAD: f64 = 1e-6;
/// The file-specific ppm tolerance spans this many spreads around the median
const PPM_TOLERANCE_SPREADS: f64 = 4.0;

fn normal(mean: f64, spread: f64) -> Option<Normal> {
    if !spread.is_finite() {
        return None;
    }
    Normal::new(mean, spread.max(MIN_SPREAD)).ok()
}

fn iqr_spread(values: &[f64]) -> f64 {
    interquartile_range(values) / IQR_TO_STD_DEV
}

pub struct MbrScorer {
    ppm: Option<Normal>,
    ppm_tolerance: f64,
    log_intensity: Option<Normal>,
    median_log_intensity: f64,
    isotope: Option<Gamma>,
    scan_count: Option<Normal>,
    fold_change: FnvHashMap<usize, Normal>,
}

impl MbrScorer {
    /// Fit the acceptor run's distributions. Returns `None` if the run has
    /// too few unambiguous MS2 peaks
    pub fn new(acceptor: &[ChromatographicPeak], max_ppm_tolerance: f64) -> Option<Self> {
        let peaks = acceptor
            .iter()
            .filter(|p| !p.is_mbr() && !p.is_ambiguous() && p.apex.is_some())
            .collect::<Vec<_>>();
        if peaks.len() < MIN_ACCEPTOR_PEAKS {
            return None;
        }

        let ppm_errors = peaks
            .iter()
            .map(|p| p.mass_error)
            .filter(|x| x.is_finite())
            .collect::<Vec<_>>();
        let ppm_median = median(&ppm_errors);
        let ppm_spread = if ppm_errors.len() > MIN_FOR_STD_DEV {
            iqr_spread(&ppm_errors)
        } else {
            sample_std(&ppm_errors)
        };
        let ppm = normal(ppm_median, ppm_spread);
        let ppm_tolerance = match ppm {
            Some(_) => (ppm_median.abs() + PPM_TOLERANCE_SPREADS * ppm_spread.max(MIN_SPREAD))
                .min(max_ppm_tolerance),
            None => max_ppm_tolerance,
        };

        let log_intensities = peaks
            .iter()
            .filter(|p| p.intensity > 0.0)
            .map(|p| p.intensity.log2())
            .collect::<Vec<_>>();
        let median_log_intensity = median(&log_intensities);
        let log_intensity = normal(median_log_intensity, iqr_spread(&log_intensities));

        let isotope_errors = peaks
            .iter()
            .filter_map(|p| p.apex.map(|a| 1.0 - a.pearson))
            .filter(|x| x.is_finite())
            .collect::<Vec<_>>();
        let isotope = gamma_moments(&isotope_errors);

        let scan_counts = peaks
            .iter()
            .map(|p| p.envelopes.len() as f64)
            .collect::<Vec<_>>();
        let scan_spread = if scan_counts.len() > MIN_FOR_STD_DEV {
            sample_std(&scan_counts)
        } else {
            iqr_spread(&scan_counts)
        };
        let scan_count = normal(mean(&scan_counts), scan_spread);

        Some(MbrScorer {
            ppm,
            ppm_tolerance,
            log_intensity,
            median_log_intensity,
            isotope,
            scan_count,
            fold_change: FnvHashMap::default(),
        })
    }

    /// Fit the log2 fold-change between peptides quantified in both a donor
    /// run and the acceptor run
    pub fn add_fold_change(
        &mut self,
        donor_file: usize,
        donor: &[ChromatographicPeak],
        acceptor: &[ChromatographicPeak],
        ids: &[Identification],
    ) -> bool {
        let donor = best_peak_per_sequence(donor, ids);
        let acceptor = best_peak_per_sequence(acceptor, ids);
        let changes = donor
            .iter()
            .filter_map(|(seq, d)| {
                let a = acceptor.get(seq)?;
                if d.intensity > 0.0 && a.intensity > 0.0 {
                    Some(a.intensity.log2() - d.intensity.log2())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();

        if changes.len() < MIN_FOLD_CHANGE_PEPTIDES {
            return false;
        }
        match normal(median(&changes), sample_std(&changes)) {
            Some(dist) => {
                self.fold_change.insert(donor_file, dist);
                true
            }
            None => false,
        }
    }

    /// Acceptor-specific ppm tolerance for MBR searches
    pub fn ppm_tolerance(&self) -> f64 {
        self.ppm_tolerance
    }

    fn intensity_density(&self, acceptor: &ChromatographicPeak, donor: &ChromatographicPeak) -> f64 {
        if acceptor.intensity <= 0.0 {
            return f64::NAN;
        }
        if let Some(dist) = self.fold_change.get(&donor.file) {
            if donor.intensity > 0.0 {
                return dist.pdf(acceptor.intensity.log2() - donor.intensity.log2());
            }
        }
        match &self.log_intensity {
            Some(dist) => {
                // Intensities above the median are never penalized
                let x = acceptor.intensity.log2().min(self.median_log_intensity);
                dist.pdf(x)
            }
            None => f64::NAN,
        }
    }

    /// Score `acceptor`, a hypothesis transferred from `donor`. Returns the
    /// individual densities and the combined score
    pub fn score(
        &self,
        acceptor: &ChromatographicPeak,
        donor: &ChromatographicPeak,
        prediction: &RtPrediction,
        donor_pep: f64,
    ) -> (MbrScore, f64) {
        let apex = match acceptor.apex {
            Some(apex) => apex,
            None => return (MbrScore::default(), f64::NAN),
        };

        let retention_time = normal(prediction.retention_time, prediction.window / 6.0)
            .map(|d| d.pdf(apex.peak.retention_time))
            .unwrap_or(f64::NAN);
        let ppm = self
            .ppm
            .as_ref()
            .map(|d| d.pdf(acceptor.mass_error))
            .unwrap_or(f64::NAN);
        let intensity = self.intensity_density(acceptor, donor);
        let isotope = self
            .isotope
            .as_ref()
            .map(|d| d.pdf((1.0 - apex.pearson).max(MIN_SPREAD)))
            .unwrap_or(f64::NAN);
        let scan_count = self
            .scan_count
            .as_ref()
            .map(|d| d.pdf(acceptor.envelopes.len() as f64))
            .unwrap_or(f64::NAN);

        let components = MbrScore {
            ppm,
            retention_time,
            intensity,
            isotope,
            scan_count,
        };
        let sum = [ppm, retention_time, intensity, isotope, scan_count]
            .iter()
            .map(|&d| if d.is_finite() { d.asinh() } else { 0.0 })
            .sum::<f64>();

        let donor_pep = if donor_pep.is_finite() {
            donor_pep.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (components, sum * (1.0 - donor_pep))
    }
}

/// Gamma distribution fit by the method of moments
fn gamma_moments(values: &[f64]) -> Option<Gamma> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let var = sample_std(values).powi(2);
    if !(m > 0.0 && var > 0.0) {
        return None;
    }
    Gamma::new(m * m / var, m / var).ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::{IndexedPeak, PeakIx};
    use crate::peak::IsotopicEnvelope;

    fn peak(file: usize, intensity: f64, mass_error: f64, pearson: f64, scans: usize) -> ChromatographicPeak {
        let mut peak = ChromatographicPeak::new(file, vec![], &[]);
        peak.envelopes = (0..scans)
            .map(|s| IsotopicEnvelope {
                ix: PeakIx(s as u32),
                peak: IndexedPeak {
                    mz: 500.0,
                    intensity,
                    scan: s as u32,
                    retention_time: 10.0 + s as f64 * 0.01,
                },
                charge: 2,
                intensity: if s == scans / 2 { intensity } else { intensity / 2.0 },
                pearson,
            })
            .collect();
        peak.calculate_intensity(false, &[]);
        peak.mass_error = mass_error;
        peak
    }

    fn acceptor() -> Vec<ChromatographicPeak> {
        (0..20)
            .map(|i| {
                peak(
                    1,
                    1e6 * (1.0 + (i % 5) as f64),
                    (i % 7) as f64 - 3.0,
                    0.9 + (i % 4) as f64 * 0.02,
                    5 + i % 3,
                )
            })
            .collect()
    }

    #[test]
    fn needs_enough_peaks() {
        let peaks = acceptor();
        assert!(MbrScorer::new(&peaks[..2], 10.0).is_none());
        assert!(MbrScorer::new(&peaks[..3], 10.0).is_some());
    }

    #[test]
    fn ppm_tolerance_is_capped() {
        let scorer = MbrScorer::new(&acceptor(), 10.0).unwrap();
        assert!(scorer.ppm_tolerance() > 0.0 && scorer.ppm_tolerance() <= 10.0);
        let scorer = MbrScorer::new(&acceptor(), 1.0).unwrap();
        assert_eq!(scorer.ppm_tolerance(), 1.0);
    }

    #[test]
    fn closer_hypotheses_score_higher() {
        let scorer = MbrScorer::new(&acceptor(), 10.0).unwrap();
        let donor = peak(0, 2e6, 0.0, 0.95, 6);
        let prediction = RtPrediction {
            retention_time: 10.03,
            window: 0.3,
            std_dev: Some(0.05),
            iqr: None,
        };

        let good = peak(1, 3e6, 0.0, 0.95, 6);
        let bad = peak(1, 3e6, 8.0, 0.95, 6);
        let (components, good_score) = scorer.score(&good, &donor, &prediction, 0.0);
        let (_, bad_score) = scorer.score(&bad, &donor, &prediction, 0.0);
        assert!(components.ppm > 0.0);
        assert!(good_score.is_finite());
        assert!(good_score > bad_score);

        // Uncertain donors discount the score
        let (_, discounted) = scorer.score(&good, &donor, &prediction, 0.5);
        assert!((discounted - good_score * 0.5).abs() < 1e-9);
    }

    #[test]
    fn high_intensity_is_not_penalized() {
        let scorer = MbrScorer::new(&acceptor(), 10.0).unwrap();
        let donor = peak(0, 2e6, 0.0, 0.95, 6);
        let prediction = RtPrediction {
            retention_time: 10.03,
            window: 0.3,
            std_dev: None,
            iqr: None,
        };
        let typical = peak(1, 3e6, 0.0, 0.95, 6);
        let huge = peak(1, 3e9, 0.0, 0.95, 6);
        let (a, _) = scorer.score(&typical, &donor, &prediction, 0.0);
        let (b, _) = scorer.score(&huge, &donor, &prediction, 0.0);
        assert!(b.intensity >= a.intensity);
    }

    #[test]
    fn degenerate_distributions() {
        // Identical peaks: every spread is zero
        let peaks = (0..5).map(|_| peak(1, 1e6, 0.0, 1.0, 1)).collect::<Vec<_>>();
        let scorer = MbrScorer::new(&peaks, 10.0).unwrap();
        let prediction = RtPrediction {
            retention_time: 10.0,
            window: 0.0,
            std_dev: None,
            iqr: None,
        };
        let (_, score) = scorer.score(&peaks[0], &peaks[0], &prediction, 0.0);
        assert!(score.is_finite());
        assert!(score > 0.0);
    }
}
