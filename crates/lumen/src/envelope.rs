//! Isotopic envelope extraction and validation
//!
//! For every point of an XIC traced on the most abundant isotope, we look up
//! each theoretical isotope peak in the same scan under three hypotheses: the
//! supplied monoisotopic mass is correct, or it is off by one isotope in
//! either direction. A point only yields an envelope if the unshifted
//! hypothesis correlates with the theoretical pattern, and explains the data
//! at least as well as both of its neighbors.

use crate::index::{IndexedPeak, PeakIndex, PeakIx};
use crate::isotopes::TheoreticalEnvelope;
use crate::mass::{to_mass, to_mz, Tolerance, C13_C12};
use crate::ml::pearson;
use crate::peak::IsotopicEnvelope;

/// Minimum correlation of the unshifted hypothesis with the theoretical pattern
const MIN_PEARSON: f64 = 0.7;
/// How much better a shifted hypothesis may correlate before we reject
const MAX_SHIFTED_ADVANTAGE: f64 = 0.1;
/// Observed isotopes must fall within this factor of their expected intensity
const INTENSITY_RATIO_LIMIT: f64 = 4.0;
const SHIFTS: [i32; 3] = [-1, 0, 1];

/// The analyte we are extracting envelopes for
#[derive(Copy, Clone, Debug)]
pub struct Target<'a> {
    pub monoisotopic_mass: f64,
    /// Mass of the most abundant isotope
    pub peakfinding_mass: f64,
    pub theoretical: &'a TheoreticalEnvelope,
}

/// Walk the index from the last scan before `retention_time`, tracing the
/// most abundant isotope of `mass` at `charge`
pub fn peakfind(
    index: &PeakIndex,
    retention_time: f64,
    mass: f64,
    charge: u8,
    tolerance: Tolerance,
    missed_scans_allowed: usize,
) -> Vec<PeakIx> {
    let start = index.scan_before(retention_time).unwrap_or(0);
    index.xic(to_mz(mass, charge), start, tolerance, missed_scans_allowed)
}

pub struct Extractor<'a> {
    index: &'a PeakIndex,
    isotope_tolerance: Tolerance,
    num_isotopes_required: usize,
}

struct Hypothesis {
    /// (observed, expected) intensity pairs
    pairs: Vec<(f64, f64)>,
    lightest_mass: f64,
}

impl Hypothesis {
    fn correlation(&self) -> f64 {
        let (x, y): (Vec<f64>, Vec<f64>) = self.pairs.iter().copied().unzip();
        pearson(&x, &y)
    }
}

impl<'a> Extractor<'a> {
    pub fn new(index: &'a PeakIndex, isotope_tolerance: Tolerance, num_isotopes_required: usize) -> Self {
        Self {
            index,
            isotope_tolerance,
            num_isotopes_required,
        }
    }

    fn isotope_peak(&self, mass: f64, scan: usize, charge: u8) -> Option<&IndexedPeak> {
        self.index
            .get_mass(mass, charge, scan, self.isotope_tolerance)
            .map(|ix| self.index.peak(ix))
    }

    /// Keep the XIC points that are within `tolerance` of the target's
    /// peakfinding mass, once converted back from m/z
    pub fn filter_xic(&self, xic: &[PeakIx], target: &Target, charge: u8, tolerance: Tolerance) -> Vec<PeakIx> {
        xic.iter()
            .copied()
            .filter(|&ix| {
                tolerance.contains(
                    target.peakfinding_mass,
                    to_mass(self.index.peak(ix).mz, charge),
                )
            })
            .collect()
    }

    /// Build validated envelopes for each point of `xic`
    pub fn envelopes(&self, xic: &[PeakIx], target: &Target, charge: u8) -> Vec<IsotopicEnvelope> {
        xic.iter()
            .filter_map(|&ix| self.envelope(ix, target, charge))
            .collect()
    }

    /// Match theoretical isotopes outwards from the peakfinding isotope,
    /// assuming the monoisotopic mass is off by `shift` isotopes. Each
    /// direction stops at the first isotope that is missing, or whose
    /// intensity is implausible.
    fn walk(&self, peak: &IndexedPeak, target: &Target, charge: u8, shift: i32, observed: &mut [f64]) -> Hypothesis {
        let theo = target.theoretical;
        let pf = theo.peakfinding_index;
        let mass_error = to_mass(peak.mz, charge) - target.peakfinding_mass;

        let mut hypothesis = Hypothesis {
            pairs: Vec::with_capacity(theo.len() + 1),
            lightest_mass: f64::MAX,
        };

        let mut matches = |isotope: usize| -> bool {
            let mass = target.monoisotopic_mass
                + mass_error
                + theo.shifts[isotope]
                + shift as f64 * C13_C12;
            let expected = theo.abundances[isotope] * peak.intensity;
            let found = self
                .isotope_peak(mass, peak.scan as usize, charge)
                .filter(|p| {
                    p.intensity >= expected / INTENSITY_RATIO_LIMIT
                        && p.intensity <= expected * INTENSITY_RATIO_LIMIT
                });
            match found {
                Some(p) => {
                    hypothesis.pairs.push((p.intensity, expected));
                    hypothesis.lightest_mass = hypothesis.lightest_mass.min(mass);
                    if shift == 0 {
                        observed[isotope] = p.intensity;
                    }
                    true
                }
                None => false,
            }
        };

        for isotope in (0..pf).rev() {
            if !matches(isotope) {
                break;
            }
        }
        for isotope in pf..theo.len() {
            if !matches(isotope) {
                break;
            }
        }
        hypothesis
    }

    /// Add the peak one isotope below the lightest matched isotope, which
    /// should be absent if the hypothesis is right
    fn pad(&self, hypothesis: &mut Hypothesis, scan: usize, charge: u8) {
        if hypothesis.pairs.is_empty() {
            return;
        }
        let mass = hypothesis.lightest_mass - C13_C12;
        let observed = self
            .isotope_peak(mass, scan, charge)
            .map(|p| p.intensity)
            .unwrap_or(0.0);
        hypothesis.pairs.push((observed, 0.0));
    }

    fn envelope(&self, ix: PeakIx, target: &Target, charge: u8) -> Option<IsotopicEnvelope> {
        let peak = *self.index.peak(ix);
        let theo = target.theoretical;
        let mut observed = vec![0.0; theo.len()];

        let mut hypotheses = SHIFTS
            .iter()
            .map(|&shift| self.walk(&peak, target, charge, shift, &mut observed))
            .collect::<Vec<_>>();

        if hypotheses[1].pairs.len() < self.num_isotopes_required {
            return None;
        }
        let correlation = hypotheses[1].correlation();

        for h in hypotheses.iter_mut() {
            self.pad(h, peak.scan as usize, charge);
        }
        let padded = hypotheses[1].correlation();
        let left = nan_to(hypotheses[0].correlation(), -1.0);
        let right = nan_to(hypotheses[2].correlation(), -1.0);

        let accepted = correlation > MIN_PEARSON
            && left - padded < MAX_SHIFTED_ADVANTAGE
            && right - padded < MAX_SHIFTED_ADVANTAGE;
        if !accepted {
            return None;
        }

        // Impute unobserved isotopes from the peakfinding isotope
        let reference = observed[theo.peakfinding_index];
        let total = observed
            .iter()
            .zip(&theo.abundances)
            .map(|(&obs, &abundance)| if obs == 0.0 { abundance * reference } else { obs })
            .sum::<f64>();

        Some(IsotopicEnvelope {
            ix,
            peak,
            charge,
            intensity: total / charge as f64,
            pearson: correlation,
        })
    }
}

fn nan_to(x: f64, fallback: f64) -> f64 {
    if x.is_nan() {
        fallback
    } else {
        x
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::Ms1Scan;
    use crate::isotopes::{Averagine, ElementTable};
    use crate::mass::Composition;

    fn peptide() -> (f64, TheoreticalEnvelope) {
        let table = ElementTable::natural();
        let mass = table.monoisotopic_mass(&Composition::peptide("PEPTIDE").unwrap());
        let env = TheoreticalEnvelope::new(&table, &Averagine::default(), mass, None, "PEPTIDE", 2);
        (mass, env)
    }

    /// One scan holding the listed (isotope offset, intensity) peaks for a
    /// singly charged ion of `mass`
    fn scan(mass: f64, peaks: &[(f64, f64)]) -> Vec<Ms1Scan> {
        let mut peaks = peaks
            .iter()
            .map(|&(offset, intensity)| (to_mz(mass + offset * C13_C12, 1), intensity))
            .collect::<Vec<_>>();
        peaks.sort_by(|a, b| a.0.total_cmp(&b.0));
        vec![Ms1Scan {
            scan_number: 1,
            retention_time: 1.0,
            mz: peaks.iter().map(|p| p.0).collect(),
            intensity: peaks.iter().map(|p| p.1).collect(),
        }]
    }

    fn extract(index: &PeakIndex, mass: f64, env: &TheoreticalEnvelope) -> Vec<IsotopicEnvelope> {
        let target = Target {
            monoisotopic_mass: mass,
            peakfinding_mass: mass + env.peakfinding_shift(),
            theoretical: env,
        };
        let xic = peakfind(index, 1.5, target.peakfinding_mass, 1, Tolerance::ppm(20.0), 1);
        Extractor::new(index, Tolerance::ppm(5.0), 2).envelopes(&xic, &target, 1)
    }

    #[test]
    fn textbook_envelope() {
        let (mass, env) = peptide();
        let peaks = env
            .shifts
            .iter()
            .zip(&env.abundances)
            .map(|(s, a)| (s / C13_C12, 1e6 * a))
            .collect::<Vec<_>>();
        let index = PeakIndex::build("run", &scan(mass, &peaks)).unwrap();

        let envelopes = extract(&index, mass, &env);
        assert_eq!(envelopes.len(), 1);
        let total = env.abundances.iter().sum::<f64>() * 1e6;
        assert!((envelopes[0].intensity - total).abs() < 1e-6);
        assert!(envelopes[0].pearson > 0.99);
    }

    #[test]
    fn heavier_species_is_rejected() {
        let (mass, env) = peptide();
        let a = &env.abundances;
        // The real analyte is one isotope heavier; a smaller peak sits at the
        // supplied monoisotopic mass
        let peaks = [(0.0, 0.7e6), (1.0, 1e6), (2.0, a[1] * 1e6), (3.0, a[2] * 1e6)];
        let index = PeakIndex::build("run", &scan(mass, &peaks)).unwrap();
        assert!(extract(&index, mass, &env).is_empty());
    }

    #[test]
    fn lighter_species_is_rejected() {
        let (mass, env) = peptide();
        let a = &env.abundances;
        // The unshifted hypothesis correlates perfectly, but the peak one
        // isotope lighter explains the data better
        let peaks = [(-1.0, 1e6), (0.0, a[1] * 1e6), (1.0, a[2] * 1e6)];
        let index = PeakIndex::build("run", &scan(mass, &peaks)).unwrap();
        assert!(extract(&index, mass, &env).is_empty());

        // Searching for the lighter species succeeds
        let lighter = mass - C13_C12;
        let index = PeakIndex::build("run", &scan(lighter, &[(0.0, 1e6), (1.0, a[1] * 1e6), (2.0, a[2] * 1e6)])).unwrap();
        assert_eq!(extract(&index, lighter, &env).len(), 1);
    }

    #[test]
    fn missing_isotopes_are_imputed() {
        let (mass, env) = peptide();
        // Only the first two isotopes are observed
        let peaks = [(0.0, 1e6), (1.0, env.abundances[1] * 1e6)];
        let index = PeakIndex::build("run", &scan(mass, &peaks)).unwrap();
        let envelopes = extract(&index, mass, &env);
        assert_eq!(envelopes.len(), 1);
        let total = env.abundances.iter().sum::<f64>() * 1e6;
        assert!((envelopes[0].intensity - total).abs() < 1e-6);
    }

    #[test]
    fn too_few_isotopes() {
        let (mass, env) = peptide();
        let index = PeakIndex::build("run", &scan(mass, &[(0.0, 1e6)])).unwrap();
        assert!(extract(&index, mass, &env).is_empty());
    }
}
