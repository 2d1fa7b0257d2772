//! Chromatographic peaks: the unit of quantification

use crate::engine::{IdIx, Identification};
use crate::index::{IndexedPeak, PeakIx};
use crate::mass::{ppm_error, to_mass};
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};

/// Peaks with fewer envelopes at the apex charge state are never cut
const MIN_ENVELOPES_TO_CUT: usize = 5;

/// One charge state's isotopic signal in one scan
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct IsotopicEnvelope {
    /// Handle to the peakfinding isotope
    pub ix: PeakIx,
    /// Copy of the peakfinding isotope, so that envelopes outlive their index
    pub peak: IndexedPeak,
    pub charge: u8,
    /// Summed isotope intensity, divided by charge
    pub intensity: f64,
    /// Correlation with the theoretical isotope pattern
    pub pearson: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DetectionType {
    Msms,
    Mbr,
    MsmsAmbiguousPeakfinding,
    MsmsIdentifiedButNotQuantified,
    NotDetected,
}

impl DetectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionType::Msms => "MSMS",
            DetectionType::Mbr => "MBR",
            DetectionType::MsmsAmbiguousPeakfinding => "MSMSAmbiguousPeakfinding",
            DetectionType::MsmsIdentifiedButNotQuantified => "MSMSIdentifiedButNotQuantified",
            DetectionType::NotDetected => "NotDetected",
        }
    }
}

impl std::fmt::Display for DetectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Densities of the individual MBR score terms
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct MbrScore {
    pub ppm: f64,
    pub retention_time: f64,
    pub intensity: f64,
    pub isotope: f64,
    pub scan_count: f64,
}

/// Provenance and confidence of a peak transferred by match-between-runs
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MbrInfo {
    pub donor_file: usize,
    pub donor_identification: IdIx,
    /// Predicted acceptor retention time
    pub rt_hypothesis: f64,
    /// Half-width of the searched retention time window
    pub rt_window: f64,
    pub rt_std_dev: Option<f64>,
    pub rt_iqr: Option<f64>,
    /// Decoy hypothesis: searched at a randomly chosen donor's retention time
    pub random_rt: bool,
    pub components: MbrScore,
    pub score: f64,
    pub pep: Option<f64>,
    pub q_value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChromatographicPeak {
    pub file: usize,
    pub identifications: Vec<IdIx>,
    /// Accepted envelopes, across charge states, ordered by scan
    pub envelopes: Vec<IsotopicEnvelope>,
    pub apex: Option<IsotopicEnvelope>,
    pub intensity: f64,
    /// Signed ppm error of the apex, against the closest identification
    pub mass_error: f64,
    pub num_charge_states: usize,
    pub split_rt: Option<f64>,
    pub unique_base_sequences: usize,
    pub unique_full_sequences: usize,
    pub mbr: Option<MbrInfo>,
}

impl ChromatographicPeak {
    pub fn new(file: usize, identifications: Vec<IdIx>, ids: &[Identification]) -> Self {
        let mut peak = ChromatographicPeak {
            file,
            identifications,
            envelopes: Vec::new(),
            apex: None,
            intensity: 0.0,
            mass_error: f64::NAN,
            num_charge_states: 0,
            split_rt: None,
            unique_base_sequences: 0,
            unique_full_sequences: 0,
            mbr: None,
        };
        peak.resolve_identifications(ids);
        peak
    }

    pub fn detection_type(&self) -> DetectionType {
        match self.mbr {
            Some(_) => DetectionType::Mbr,
            None => DetectionType::Msms,
        }
    }

    pub fn is_mbr(&self) -> bool {
        self.mbr.is_some()
    }

    /// Identified by more than one full sequence
    pub fn is_ambiguous(&self) -> bool {
        self.unique_full_sequences > 1
    }

    pub fn score(&self) -> f64 {
        self.mbr.as_ref().map(|m| m.score).unwrap_or(f64::NAN)
    }

    pub fn first_identification<'a>(&self, ids: &'a [Identification]) -> Option<&'a Identification> {
        self.identifications
            .first()
            .and_then(|ix| ids.get(ix.0 as usize))
    }

    pub fn apex_rt(&self) -> Option<f64> {
        self.apex.map(|a| a.peak.retention_time)
    }

    /// First and last retention time covered by the envelopes
    pub fn rt_span(&self) -> Option<(f64, f64)> {
        let lo = self
            .envelopes
            .iter()
            .map(|e| e.peak.retention_time)
            .min_by(|a, b| a.total_cmp(b))?;
        let hi = self
            .envelopes
            .iter()
            .map(|e| e.peak.retention_time)
            .max_by(|a, b| a.total_cmp(b))?;
        Some((lo, hi))
    }

    /// Recompute the apex, intensity, mass error and charge state count from
    /// the current envelopes
    pub fn calculate_intensity(&mut self, integrate: bool, ids: &[Identification]) {
        let mut apex: Option<IsotopicEnvelope> = None;
        for env in &self.envelopes {
            if apex.map(|a| env.intensity > a.intensity).unwrap_or(true) {
                apex = Some(*env);
            }
        }
        self.apex = apex;

        let apex = match apex {
            Some(apex) => apex,
            None => {
                self.intensity = 0.0;
                self.mass_error = f64::NAN;
                self.num_charge_states = 0;
                return;
            }
        };

        self.intensity = if integrate {
            self.envelopes.iter().map(|e| e.intensity).sum()
        } else {
            apex.intensity
        };

        let observed = to_mass(apex.peak.mz, apex.charge);
        self.mass_error = self
            .identifications
            .iter()
            .filter_map(|ix| ids.get(ix.0 as usize))
            .map(|id| ppm_error(observed, id.peakfinding_mass))
            .min_by(|a, b| a.abs().total_cmp(&b.abs()))
            .unwrap_or(f64::NAN);

        let charges = self
            .envelopes
            .iter()
            .map(|e| e.charge)
            .collect::<FnvHashSet<_>>();
        self.num_charge_states = charges.len();
    }

    pub fn resolve_identifications(&mut self, ids: &[Identification]) {
        let resolved = self
            .identifications
            .iter()
            .filter_map(|ix| ids.get(ix.0 as usize));
        let mut base = FnvHashSet::default();
        let mut full = FnvHashSet::default();
        for id in resolved {
            base.insert(id.base_sequence.as_str());
            full.insert(id.modified_sequence.as_str());
        }
        self.unique_base_sequences = base.len();
        self.unique_full_sequences = full.len();
    }

    /// Absorb the identifications and any new envelopes of `other`
    pub fn merge(&mut self, other: ChromatographicPeak, integrate: bool, ids: &[Identification]) {
        for ix in other.identifications {
            if !self.identifications.contains(&ix) {
                self.identifications.push(ix);
            }
        }

        let seen = self
            .envelopes
            .iter()
            .map(|e| (e.ix, e.charge))
            .collect::<FnvHashSet<_>>();
        self.envelopes.extend(
            other
                .envelopes
                .into_iter()
                .filter(|e| !seen.contains(&(e.ix, e.charge))),
        );
        self.envelopes
            .sort_by(|a, b| a.peak.scan.cmp(&b.peak.scan).then(a.charge.cmp(&b.charge)));

        self.resolve_identifications(ids);
        self.calculate_intensity(integrate, ids);
    }
}

/// Split `peak` at intensity valleys until no further cut is warranted,
/// keeping the side that contains `anchor_rt`
pub fn cut(
    mut peak: ChromatographicPeak,
    anchor_rt: f64,
    discrimination_factor: f64,
    integrate: bool,
    ids: &[Identification],
) -> ChromatographicPeak {
    while let Some(valley_rt) = find_valley(&peak, discrimination_factor) {
        let before = peak.envelopes.len();
        if anchor_rt > valley_rt {
            peak.envelopes.retain(|e| e.peak.retention_time > valley_rt);
        } else {
            peak.envelopes.retain(|e| e.peak.retention_time < valley_rt);
        }
        peak.split_rt = Some(valley_rt);
        peak.calculate_intensity(integrate, ids);

        if peak.envelopes.len() >= before {
            break;
        }
    }
    peak
}

/// Retention time of the first valley that separates two species, walking
/// outwards from the apex along the apex charge state's trace
fn find_valley(peak: &ChromatographicPeak, discrimination_factor: f64) -> Option<f64> {
    let apex = peak.apex?;
    let mut trace = peak
        .envelopes
        .iter()
        .filter(|e| e.charge == apex.charge)
        .collect::<Vec<_>>();
    if trace.len() < MIN_ENVELOPES_TO_CUT {
        return None;
    }
    trace.sort_by_key(|e| e.peak.scan);
    let apex_pos = trace.iter().position(|e| e.ix == apex.ix)?;
    let within = |i: isize| i >= 0 && (i as usize) < trace.len();

    for direction in [1isize, -1] {
        let mut valley: Option<usize> = None;
        let mut i = apex_pos as isize + direction;
        while within(i) {
            let current = trace[i as usize];
            let v = match valley {
                Some(v) if trace[v].intensity <= current.intensity => v,
                _ => i as usize,
            };
            valley = Some(v);

            let drop = (current.intensity - trace[v].intensity) / current.intensity;
            let beyond = v as isize + direction;
            if drop > discrimination_factor && within(beyond) {
                let second = (current.intensity - trace[beyond as usize].intensity) / current.intensity;
                if second > discrimination_factor {
                    return Some(trace[v].peak.retention_time);
                }
                // A hole in the trace right next to the valley also separates
                let adjacent = trace[v].peak.scan as isize + direction;
                if !trace.iter().any(|e| e.peak.scan as isize == adjacent) {
                    return Some(trace[v].peak.retention_time);
                }
            }
            i += direction;
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn close(x: Option<f64>, y: f64) -> bool {
        x.map(|x| (x - y).abs() < 1e-9).unwrap_or(false)
    }

    fn envelope(scan: u32, rt: f64, intensity: f64, charge: u8) -> IsotopicEnvelope {
        IsotopicEnvelope {
            ix: PeakIx(scan),
            peak: IndexedPeak {
                mz: 500.0,
                intensity,
                scan,
                retention_time: rt,
            },
            charge,
            intensity,
            pearson: 1.0,
        }
    }

    fn peak_from(intensities: &[f64]) -> ChromatographicPeak {
        let mut peak = ChromatographicPeak::new(0, vec![], &[]);
        peak.envelopes = intensities
            .iter()
            .enumerate()
            .map(|(s, &i)| envelope(s as u32, 1.0 + s as f64 / 10.0, i, 2))
            .collect();
        peak.calculate_intensity(false, &[]);
        peak
    }

    #[test]
    fn apex_and_intensity() {
        let mut peak = peak_from(&[1.0, 2.0, 5.0, 5.0, 1.0]);
        assert_eq!(peak.apex.unwrap().peak.scan, 2, "first maximum wins");
        assert_eq!(peak.intensity, 5.0);
        assert_eq!(peak.num_charge_states, 1);
        assert!(peak.mass_error.is_nan());

        peak.calculate_intensity(true, &[]);
        assert_eq!(peak.intensity, 14.0);
        let (lo, hi) = peak.rt_span().unwrap();
        assert!(close(Some(lo), 1.0) && close(Some(hi), 1.4));
    }

    #[test]
    fn unimodal_is_not_cut() {
        let peak = peak_from(&[1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
        let cut = cut(peak.clone(), 1.4, 0.6, false, &[]);
        assert_eq!(cut.envelopes.len(), 9);
        assert_eq!(cut.split_rt, None);
        assert_eq!(cut.envelopes, peak.envelopes);
        assert_eq!(cut.apex, peak.apex);
        assert_eq!(cut.intensity, peak.intensity);
    }

    #[test]
    fn bimodal_is_cut_at_valley() {
        let peak = peak_from(&[1.0, 3.0, 1.0, 1.0, 3.0, 5.0, 10.0, 5.0, 3.0, 1.0]);
        let cut = cut(peak, 1.701, 0.6, false, &[]);
        assert_eq!(cut.envelopes.len(), 6);
        assert!(close(cut.apex_rt(), 1.6));
        assert!(close(cut.split_rt, 1.3));
    }

    #[test]
    fn anchor_picks_side() {
        let peak = peak_from(&[1.0, 5.0, 10.0, 5.0, 1.0, 0.5, 0.5, 4.0, 8.0, 4.0, 1.0]);
        let left = cut(peak.clone(), 1.2, 0.6, false, &[]);
        assert!(close(left.apex_rt(), 1.2));
        assert!(close(left.split_rt, 1.5));
        assert!(left.envelopes.iter().all(|e| e.peak.scan < 5));

        let right = cut(peak, 1.8, 0.6, false, &[]);
        assert!(close(right.apex_rt(), 1.8));
        assert!(right.envelopes.iter().all(|e| e.peak.scan > 5));
    }

    #[test]
    fn short_traces_are_not_cut() {
        let peak = peak_from(&[10.0, 1.0, 10.0, 1.0]);
        assert_eq!(cut(peak, 1.0, 0.6, false, &[]).envelopes.len(), 4);
    }

    #[test]
    fn missing_scan_next_to_valley() {
        // Scan 3 is missing from the trace
        let mut peak = peak_from(&[2.0, 8.0, 6.0, 0.0, 1.0, 3.0, 6.0, 10.0, 5.0, 2.0]);
        peak.envelopes.remove(3);
        peak.calculate_intensity(false, &[]);
        let cut = cut(peak, 1.7, 0.6, false, &[]);
        assert!(close(cut.split_rt, 1.4));
        assert_eq!(cut.envelopes.len(), 5);
        assert!(cut.envelopes.iter().all(|e| e.peak.scan > 4));
    }

    #[test]
    fn merge_unions_envelopes() {
        let mut a = peak_from(&[1.0, 2.0, 3.0]);
        a.identifications = vec![IdIx(0)];
        let mut b = peak_from(&[1.0, 2.0, 3.0, 6.0]);
        b.identifications = vec![IdIx(0), IdIx(1)];
        a.merge(b, false, &[]);
        assert_eq!(a.envelopes.len(), 4);
        assert_eq!(a.identifications, vec![IdIx(0), IdIx(1)]);
        assert_eq!(a.intensity, 6.0);
    }

    /// Two triangles separated by a short run of low-intensity scans
    #[quickcheck]
    fn bimodal_traces_are_split(h1: u8, h2: u8, w1: u8, w2: u8, anchor_left: bool) -> bool {
        let triangle = |h: u8, w: u8| {
            let h = 10.0 + h as f64;
            let k = 1 + (w % 4) as usize;
            (0..=2 * k)
                .map(|j| {
                    let d = (j as isize - k as isize).unsigned_abs();
                    h * (1.0 - d as f64 / (k + 1) as f64)
                })
                .collect::<Vec<_>>()
        };
        let left = triangle(h1, w1);
        let right = triangle(h2, w2);
        let mut trace = left.clone();
        trace.extend([0.5, 0.5]);
        trace.extend(right.iter().copied());

        let peak = peak_from(&trace);
        let left_scans = 0..left.len() as u32;
        let right_scans = (left.len() as u32 + 2)..trace.len() as u32;
        let anchor = if anchor_left {
            1.0 + (left.len() / 2) as f64 / 10.0
        } else {
            1.0 + (left.len() + 2 + right.len() / 2) as f64 / 10.0
        };

        let cut = cut(peak, anchor, 0.6, false, &[]);
        let in_left = cut.envelopes.iter().any(|e| left_scans.contains(&e.peak.scan));
        let in_right = cut.envelopes.iter().any(|e| right_scans.contains(&e.peak.scan));
        cut.envelopes.len() < trace.len() && !(in_left && in_right)
    }
}
