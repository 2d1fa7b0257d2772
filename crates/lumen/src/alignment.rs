//! Local retention time calibration between a donor and an acceptor run
//!
//! Peptides identified by MS2 in both runs anchor the calibration. To predict
//! where a donor-only peptide elutes in the acceptor, we take the anchors
//! eluting closest to it in the donor run and shift its retention time by
//! their median offset.

use crate::engine::{Identification, MbrSettings};
use crate::ml::{interquartile_range, median, sample_std};
use crate::peak::ChromatographicPeak;
use fnv::FnvHashMap;
use serde::Serialize;

/// Window width, in standard deviations of the neighbors' offsets
const STD_DEV_WIDTH: f64 = 6.0;
/// Window width, in interquartile ranges of the neighbors' offsets
const IQR_WIDTH: f64 = 4.5;
/// With at least this many neighbors, the window is derived from the IQR
const MIN_NEIGHBORS_FOR_IQR: usize = 6;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RtCalibrationPoint {
    pub donor_rt: f64,
    pub acceptor_rt: f64,
    /// Donor minus acceptor apex retention time
    pub rt_diff: f64,
}

/// Predicted acceptor retention time, and the half-width of the window to
/// search around it
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct RtPrediction {
    pub retention_time: f64,
    pub window: f64,
    pub std_dev: Option<f64>,
    pub iqr: Option<f64>,
}

impl RtPrediction {
    pub fn bounds(&self) -> (f64, f64) {
        (self.retention_time - self.window, self.retention_time + self.window)
    }
}

pub struct RtCalibration {
    /// Ordered by donor retention time
    points: Vec<RtCalibrationPoint>,
}

/// The most intense unambiguous MS2 peak for each modified sequence
pub fn best_peak_per_sequence<'a>(
    peaks: &'a [ChromatographicPeak],
    ids: &'a [Identification],
) -> FnvHashMap<&'a str, &'a ChromatographicPeak> {
    let mut best: FnvHashMap<&str, &ChromatographicPeak> = FnvHashMap::default();
    for peak in peaks {
        if peak.is_mbr() || peak.is_ambiguous() || peak.apex.is_none() {
            continue;
        }
        let id = match peak.first_identification(ids) {
            Some(id) => id,
            None => continue,
        };
        let entry = best.entry(id.modified_sequence.as_str()).or_insert(peak);
        if peak.intensity > entry.intensity {
            *entry = peak;
        }
    }
    best
}

impl RtCalibration {
    pub fn new(
        donor: &[ChromatographicPeak],
        acceptor: &[ChromatographicPeak],
        ids: &[Identification],
    ) -> Self {
        let donor = best_peak_per_sequence(donor, ids);
        let acceptor = best_peak_per_sequence(acceptor, ids);

        let mut points = donor
            .iter()
            .filter_map(|(sequence, d)| {
                let a = acceptor.get(sequence)?;
                let donor_rt = d.apex_rt()?;
                let acceptor_rt = a.apex_rt()?;
                Some((
                    *sequence,
                    RtCalibrationPoint {
                        donor_rt,
                        acceptor_rt,
                        rt_diff: donor_rt - acceptor_rt,
                    },
                ))
            })
            .collect::<Vec<_>>();

        // Sequence breaks ties, so that the order doesn't depend on hashing
        points.sort_by(|a, b| {
            a.1.donor_rt
                .total_cmp(&b.1.donor_rt)
                .then_with(|| a.0.cmp(b.0))
        });

        RtCalibration {
            points: points.into_iter().map(|(_, p)| p).collect(),
        }
    }

    pub fn from_points(mut points: Vec<RtCalibrationPoint>) -> Self {
        points.sort_by(|a, b| a.donor_rt.total_cmp(&b.donor_rt));
        RtCalibration { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Predict the acceptor retention time of an analyte eluting at
    /// `donor_rt` in the donor run. Returns `None` if no anchor elutes
    /// nearby.
    pub fn predict(&self, donor_rt: f64, settings: &MbrSettings) -> Option<RtPrediction> {
        let start = self.points.partition_point(|p| p.donor_rt < donor_rt);
        let near = |p: &&RtCalibrationPoint| (p.donor_rt - donor_rt).abs() < settings.rt_neighbor_window;

        let forward = self.points[start..]
            .iter()
            .take_while(near)
            .take(settings.max_neighbors);
        let backward = self.points[..start]
            .iter()
            .rev()
            .take_while(near)
            .take(settings.max_neighbors);
        let diffs = forward
            .chain(backward)
            .map(|p| p.rt_diff)
            .collect::<Vec<_>>();

        let retention_time = donor_rt - median(&diffs);
        let prediction = match diffs.len() {
            0 => return None,
            1 => RtPrediction {
                retention_time,
                window: settings.fallback_rt_window,
                std_dev: None,
                iqr: None,
            },
            n if n < MIN_NEIGHBORS_FOR_IQR => {
                let std_dev = sample_std(&diffs);
                RtPrediction {
                    retention_time,
                    window: (STD_DEV_WIDTH * std_dev).min(settings.max_rt_window),
                    std_dev: Some(std_dev),
                    iqr: None,
                }
            }
            _ => {
                let iqr = interquartile_range(&diffs);
                RtPrediction {
                    retention_time,
                    window: (IQR_WIDTH * iqr).min(settings.max_rt_window),
                    std_dev: None,
                    iqr: Some(iqr),
                }
            }
        };
        Some(prediction)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn calibration(points: &[(f64, f64)]) -> RtCalibration {
        RtCalibration::from_points(
            points
                .iter()
                .map(|&(donor_rt, acceptor_rt)| RtCalibrationPoint {
                    donor_rt,
                    acceptor_rt,
                    rt_diff: donor_rt - acceptor_rt,
                })
                .collect(),
        )
    }

    #[test]
    fn local_neighbors() {
        let cal = calibration(&[(1.01, 1.00), (1.02, 1.025), (1.04, 1.055), (1.05, 1.07)]);
        let settings = MbrSettings::default();
        let pred = cal.predict(1.03, &settings).unwrap();
        // Median offset of the four neighbors is -0.01
        assert!((pred.retention_time - 1.04).abs() < 1e-9);
        let std_dev = pred.std_dev.unwrap();
        assert!((pred.window - 6.0 * std_dev).abs() < 1e-12);
        assert!(pred.iqr.is_none());
        let (lo, hi) = pred.bounds();
        assert!(lo < 1.04 && hi > 1.04);
    }

    #[test]
    fn window_is_capped() {
        let cal = calibration(&[(10.0, 5.0), (10.1, 12.0), (10.2, 8.0)]);
        let settings = MbrSettings::default();
        let pred = cal.predict(10.05, &settings).unwrap();
        assert_eq!(pred.window, settings.max_rt_window);
    }

    #[test]
    fn degenerate_neighbors() {
        let settings = MbrSettings::default();
        let cal = calibration(&[(10.0, 10.5)]);
        let pred = cal.predict(10.2, &settings).unwrap();
        assert!((pred.retention_time - 10.7).abs() < 1e-9);
        assert_eq!(pred.window, settings.fallback_rt_window);

        // Too far away
        assert!(cal.predict(20.0, &settings).is_none());
        assert!(calibration(&[]).predict(10.0, &settings).is_none());
    }

    #[test]
    fn many_neighbors_use_iqr() {
        let points = (0..10)
            .map(|i| (10.0 + i as f64 * 0.01, 10.0 + i as f64 * 0.01 - 0.1))
            .collect::<Vec<_>>();
        let cal = calibration(&points);
        let settings = MbrSettings::default();
        let pred = cal.predict(10.045, &settings).unwrap();
        assert!(pred.iqr.is_some());
        assert!(pred.std_dev.is_none());
        // Acceptor elutes 0.1 min earlier
        assert!((pred.retention_time - 9.945).abs() < 1e-9);
        assert!(pred.window.abs() < 1e-9, "constant offsets have no spread");
    }
}
