//! False discovery rate control for match-between-runs
//!
//! MBR hypotheses from every run are pooled and ranked. Two kinds of decoys
//! are tracked: hypotheses transferred from a decoy peptide identification,
//! and hypotheses searched at a randomized retention time. A hypothesis can
//! be both ("double decoy").

use crate::engine::{Identification, MbrSettings};
use crate::ml::kde::{Builder, Estimator};
use crate::peak::ChromatographicPeak;
use fnv::FnvHashSet;
use serde::Serialize;

/// Posterior error probability model, fit to pooled MBR scores
pub trait PepModel: Send + Sync {
    /// Fit the model; `decoy[i]` labels `scores[i]`. Returns false if the
    /// data cannot support a fit
    fn fit(&mut self, scores: &[f64], decoy: &[bool]) -> bool;

    fn posterior_error(&self, score: f64) -> f64;
}

/// Non-parametric PEP from kernel density estimates of target and decoy scores
#[derive(Default)]
pub struct KdePep {
    estimator: Option<Estimator>,
}

impl PepModel for KdePep {
    fn fit(&mut self, scores: &[f64], decoy: &[bool]) -> bool {
        self.estimator = Builder::default().build(scores, decoy);
        self.estimator.is_some()
    }

    fn posterior_error(&self, score: f64) -> f64 {
        match &self.estimator {
            Some(est) if score.is_finite() => est.posterior_error(score),
            _ => 1.0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct Candidate {
    pub score: f64,
    pub decoy_peptide: bool,
    pub random_rt: bool,
}

impl Candidate {
    pub fn is_decoy(&self) -> bool {
        self.decoy_peptide || self.random_rt
    }
}

/// Estimated false discovery rate at each rank
///
/// # Invariants
/// * `candidates` must be sorted best first
pub fn false_discovery_rates(candidates: &[Candidate]) -> Vec<f64> {
    let mut decoy_rt = 0usize;
    let mut decoy_peptide = 0usize;
    let mut double_decoy = 0usize;

    candidates
        .iter()
        .enumerate()
        .map(|(rank, c)| {
            decoy_rt += c.random_rt as usize;
            decoy_peptide += c.decoy_peptide as usize;
            double_decoy += (c.random_rt && c.decoy_peptide) as usize;
            let false_hits = 1 + decoy_rt + decoy_peptide.saturating_sub(double_decoy);
            false_hits as f64 / (rank + 1) as f64
        })
        .collect()
}

/// Q-values for `candidates`, which must be sorted best first
pub fn q_values(candidates: &[Candidate]) -> Vec<f64> {
    let mut q = false_discovery_rates(candidates);
    // Q-value is the minimum FDR at any lower-ranked threshold
    // `q = q[::-1].cummin()[::-1] in python`
    let mut q_min = f64::MAX;
    for x in q.iter_mut().rev() {
        q_min = q_min.min(*x);
        *x = q_min;
    }
    q
}

/// Assign q-values, and PEPs when `model` can be fit, to every MBR
/// hypothesis in `peaks`. Returns a mask of the hypotheses to keep: when
/// PEPs are used, only the best hypothesis for each donor identification
/// survives.
pub fn control(
    peaks: &mut [&mut ChromatographicPeak],
    ids: &[Identification],
    settings: &MbrSettings,
    model: &mut dyn PepModel,
) -> Vec<bool> {
    let candidates = peaks
        .iter()
        .map(|p| Candidate {
            score: p.score(),
            decoy_peptide: p.first_identification(ids).map(|id| id.decoy).unwrap_or(false),
            random_rt: p.mbr.as_ref().map(|m| m.random_rt).unwrap_or(false),
        })
        .collect::<Vec<_>>();

    let decoys = candidates.iter().filter(|c| c.is_decoy()).count();
    let use_pep = candidates.len() >= settings.min_pep_peaks
        && decoys >= settings.min_pep_decoys
        && {
            let (scores, labels): (Vec<f64>, Vec<bool>) = candidates
                .iter()
                .map(|c| (c.score, c.is_decoy()))
                .unzip();
            model.fit(&scores, &labels)
        };
    log::debug!(
        "{} MBR hypotheses, {} decoys, PEP refinement {}",
        candidates.len(),
        decoys,
        if use_pep { "enabled" } else { "skipped" }
    );

    let peps = candidates
        .iter()
        .map(|c| use_pep.then(|| model.posterior_error(c.score)))
        .collect::<Vec<_>>();

    let by_score = |a: &usize, b: &usize| {
        let (sa, sb) = (candidates[*a].score, candidates[*b].score);
        // NaN scores rank last
        sa.is_nan()
            .cmp(&sb.is_nan())
            .then_with(|| sb.total_cmp(&sa))
    };
    let mut order = (0..candidates.len()).collect::<Vec<_>>();
    if use_pep {
        order.sort_by(|a, b| {
            peps[*a]
                .unwrap_or(1.0)
                .total_cmp(&peps[*b].unwrap_or(1.0))
                .then_with(|| by_score(a, b))
        });
    } else {
        order.sort_by(by_score);
    }

    let mut keep = vec![true; peaks.len()];
    if use_pep {
        let mut seen = FnvHashSet::default();
        for &i in &order {
            let donor = peaks[i].mbr.as_ref().map(|m| m.donor_identification);
            if !seen.insert(donor) {
                keep[i] = false;
            }
        }
        order.retain(|&i| keep[i]);
    }

    let ranked = order.iter().map(|&i| candidates[i]).collect::<Vec<_>>();
    let q = q_values(&ranked);
    for (&i, &q) in order.iter().zip(q.iter()) {
        if let Some(mbr) = peaks[i].mbr.as_mut() {
            mbr.q_value = q;
            mbr.pep = peps[i];
        }
    }
    keep
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn candidate(score: f64, decoy_peptide: bool, random_rt: bool) -> Candidate {
        Candidate {
            score,
            decoy_peptide,
            random_rt,
        }
    }

    #[test]
    fn hand_computed_fdr() {
        let c = [
            candidate(10.0, false, false),
            candidate(9.0, false, true),
            candidate(8.0, true, false),
            candidate(7.0, true, true),
            candidate(6.0, false, false),
        ];
        let fdr = false_discovery_rates(&c);
        assert_eq!(fdr, vec![1.0, 1.0, 1.0, 1.0, 0.8]);
        let q = q_values(&c);
        assert_eq!(q, vec![0.8, 0.8, 0.8, 0.8, 0.8]);
    }

    struct Fixed;

    impl PepModel for Fixed {
        fn fit(&mut self, _: &[f64], _: &[bool]) -> bool {
            true
        }

        fn posterior_error(&self, score: f64) -> f64 {
            (1.0 / score).min(1.0)
        }
    }

    #[quickcheck]
    fn q_values_are_monotone(scores: Vec<(u16, bool, bool)>) -> bool {
        let mut c = scores
            .into_iter()
            .map(|(s, d, r)| candidate(s as f64, d, r))
            .collect::<Vec<_>>();
        c.sort_by(|a, b| b.score.total_cmp(&a.score));
        let q = q_values(&c);
        q.windows(2).all(|w| w[0] <= w[1])
    }

    #[test]
    fn pep_requires_enough_decoys() {
        let settings = MbrSettings {
            min_pep_peaks: 4,
            min_pep_decoys: 2,
            ..Default::default()
        };
        let mut peaks = crate::reconcile::test::mbr_peaks(&[(5.0, false, 0), (4.0, true, 1), (3.0, false, 2), (2.0, false, 3)]);
        let mut refs = peaks.iter_mut().collect::<Vec<_>>();
        let keep = control(&mut refs, &[], &settings, &mut Fixed);
        assert!(keep.iter().all(|&k| k));
        assert!(peaks.iter().all(|p| p.mbr.as_ref().unwrap().pep.is_none()));
    }

    #[test]
    fn pep_keeps_best_hypothesis_per_donor() {
        let settings = MbrSettings {
            min_pep_peaks: 4,
            min_pep_decoys: 2,
            ..Default::default()
        };
        // Two hypotheses each for donors 0 and 1
        let mut peaks = crate::reconcile::test::mbr_peaks(&[(5.0, false, 0), (4.0, true, 0), (3.0, false, 1), (2.0, true, 1)]);
        let mut refs = peaks.iter_mut().collect::<Vec<_>>();
        let keep = control(&mut refs, &[], &settings, &mut Fixed);
        assert_eq!(keep, vec![true, false, true, false]);
        let pep = peaks[0].mbr.as_ref().unwrap().pep.unwrap();
        assert!((pep - 0.2).abs() < 1e-12);
        assert!((peaks[0].mbr.as_ref().unwrap().q_value - 0.5).abs() < 1e-12);
    }
}
