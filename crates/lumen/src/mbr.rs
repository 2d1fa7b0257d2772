//! Match-between-runs: transfer identifications from donor runs into
//! acceptor runs that lack them
//!
//! One donor peak is chosen per modified sequence across all runs. For each
//! acceptor, every eligible donor is searched for inside the retention time
//! window predicted by [`RtCalibration`]. Alongside each genuine search, a
//! decoy search looks for the same mass at the predicted retention time of a
//! different, randomly chosen donor peak.

use crate::alignment::{RtCalibration, RtPrediction};
use crate::engine::{DonorStrategy, Identification, LfqSettings, MbrSettings, SpectraFile};
use crate::envelope::{Extractor, Target};
use crate::index::{PeakIndex, PeakIx};
use crate::isotopes::TheoreticalEnvelope;
use crate::mass::{to_mz, Tolerance};
use crate::peak::{cut, ChromatographicPeak, IsotopicEnvelope, MbrInfo};
use crate::scoring::MbrScorer;
use dashmap::DashMap;
use fnv::{FnvBuildHasher, FnvHashMap, FnvHashSet};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

/// A donor peak, and the run it was quantified in
#[derive(Clone, Debug)]
pub struct Donor {
    pub file: usize,
    pub peak: ChromatographicPeak,
}

/// Peaks that could donate their identification to other runs: unambiguous,
/// quantified MS2 peaks whose identification passes the donor q-value
/// threshold, and whose sequence is found in only one peak of the run
fn candidate_donors<'a>(
    peaks: &'a [ChromatographicPeak],
    ids: &'a [Identification],
    q_value_threshold: f64,
) -> Vec<(&'a ChromatographicPeak, &'a Identification)> {
    let mut counts: FnvHashMap<&str, usize> = FnvHashMap::default();
    for peak in peaks.iter().filter(|p| !p.is_mbr()) {
        if let Some(id) = peak.first_identification(ids) {
            *counts.entry(id.modified_sequence.as_str()).or_default() += 1;
        }
    }

    peaks
        .iter()
        .filter(|p| !p.is_mbr() && !p.is_ambiguous() && p.apex.is_some())
        .filter_map(|p| Some((p, p.first_identification(ids)?)))
        .filter(|(_, id)| {
            id.q_value <= q_value_threshold && counts.get(id.modified_sequence.as_str()) == Some(&1)
        })
        .collect()
}

/// Choose one donor per modified sequence across all runs, using `strategy`
/// to rank the candidates. Ties go to the run listed first. Donors are
/// returned ordered by sequence.
pub fn select_donors(
    runs: &[Vec<ChromatographicPeak>],
    ids: &[Identification],
    strategy: DonorStrategy,
    q_value_threshold: f64,
    neighbor_rt_window: f64,
) -> Vec<Donor> {
    // sequence -> (metric, file, peak)
    let best: DashMap<&str, (f64, usize, &ChromatographicPeak), FnvBuildHasher> = DashMap::default();

    runs.par_iter().enumerate().for_each(|(file, peaks)| {
        let mut apexes = peaks
            .iter()
            .filter(|p| !p.is_mbr())
            .filter_map(|p| p.apex_rt())
            .collect::<Vec<_>>();
        apexes.sort_by(|a, b| a.total_cmp(b));

        for (peak, id) in candidate_donors(peaks, ids, q_value_threshold) {
            let metric = match strategy {
                DonorStrategy::Score => id.score,
                DonorStrategy::Intensity => peak.intensity,
                DonorStrategy::Neighbors => {
                    let rt = peak.apex_rt().unwrap_or(f64::NAN);
                    let lo = apexes.partition_point(|&x| x < rt - neighbor_rt_window);
                    let hi = apexes.partition_point(|&x| x <= rt + neighbor_rt_window);
                    // Don't count the peak itself
                    hi.saturating_sub(lo).saturating_sub(1) as f64
                }
            };
            let metric = if metric.is_nan() { f64::NEG_INFINITY } else { metric };

            best.entry(id.modified_sequence.as_str())
                .and_modify(|entry| {
                    if metric > entry.0 || (metric == entry.0 && file < entry.1) {
                        *entry = (metric, file, peak);
                    }
                })
                .or_insert((metric, file, peak));
        }
    });

    let mut donors = best
        .into_iter()
        .map(|(sequence, (_, file, peak))| {
            (
                sequence,
                Donor {
                    file,
                    peak: peak.clone(),
                },
            )
        })
        .collect::<Vec<_>>();
    donors.sort_by(|a, b| a.0.cmp(b.0));
    log::debug!("selected {} MBR donors", donors.len());
    donors.into_iter().map(|(_, donor)| donor).collect()
}

/// MBR hypotheses for one acceptor run
#[derive(Default)]
pub struct MbrOutcome {
    /// Best hypothesis per sequence
    pub targets: Vec<ChromatographicPeak>,
    /// Best randomized retention time hypothesis per donor
    pub decoys: Vec<ChromatographicPeak>,
}

/// Per-worker accumulation of hypotheses
#[derive(Default)]
struct Shard {
    targets: FnvHashMap<String, Vec<ChromatographicPeak>>,
    decoys: Vec<ChromatographicPeak>,
}

fn apex_ix(peak: &ChromatographicPeak) -> Option<PeakIx> {
    peak.apex.map(|a| a.ix)
}

impl Shard {
    /// Hypotheses for the same sequence that share an apex are combined:
    /// their scores add up, and their identifications are pooled
    fn insert(&mut self, sequence: &str, peak: ChromatographicPeak, ids: &[Identification]) {
        let list = self.targets.entry(sequence.to_string()).or_default();
        let existing = list
            .iter_mut()
            .find(|p| apex_ix(p).is_some() && apex_ix(p) == apex_ix(&peak));
        match existing {
            Some(existing) => {
                if let (Some(a), Some(b)) = (existing.mbr.as_mut(), peak.mbr.as_ref()) {
                    a.score += b.score;
                }
                for ix in peak.identifications {
                    if !existing.identifications.contains(&ix) {
                        existing.identifications.push(ix);
                    }
                }
                existing.resolve_identifications(ids);
            }
            None => list.push(peak),
        }
    }

    fn absorb(mut self, other: Shard, ids: &[Identification]) -> Shard {
        for (sequence, peaks) in other.targets {
            for peak in peaks {
                self.insert(&sequence, peak, ids);
            }
        }
        self.decoys.extend(other.decoys);
        self
    }
}

/// Best-first ordering of MBR hypotheses. NaN scores sort last
fn by_score(a: &ChromatographicPeak, b: &ChromatographicPeak) -> std::cmp::Ordering {
    let (sa, sb) = (a.score(), b.score());
    sa.is_nan()
        .cmp(&sb.is_nan())
        .then_with(|| sb.total_cmp(&sa))
        .then_with(|| apex_ix(a).cmp(&apex_ix(b)))
}

/// Keep the best hypothesis per sequence, folding in hypotheses for other
/// charge states whose apex elutes inside it
fn finalize(
    targets: FnvHashMap<String, Vec<ChromatographicPeak>>,
    integrate: bool,
    ids: &[Identification],
) -> Vec<ChromatographicPeak> {
    let mut targets = targets.into_iter().collect::<Vec<_>>();
    targets.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::with_capacity(targets.len());
    for (_, mut hypotheses) in targets {
        if hypotheses.is_empty() {
            continue;
        }
        hypotheses.sort_by(by_score);
        let mut hypotheses = hypotheses.into_iter();
        let mut best = match hypotheses.next() {
            Some(best) => best,
            None => continue,
        };
        let (charge, span) = match (best.apex, best.rt_span()) {
            (Some(apex), Some(span)) => (apex.charge, span),
            _ => continue,
        };
        for other in hypotheses {
            let inside = other
                .apex
                .map(|a| a.charge != charge && a.peak.retention_time > span.0 && a.peak.retention_time < span.1)
                .unwrap_or(false);
            if inside {
                best.merge(other, integrate, ids);
            }
        }
        out.push(best);
    }
    out
}

/// The doubled search window, capped at the maximum, or `None` once it can't
/// grow. A zero-width window restarts from the fallback width
fn widen(window: f64, mbr: &MbrSettings) -> Option<f64> {
    let wider = if window > 0.0 {
        window * 2.0
    } else {
        mbr.fallback_rt_window
    };
    let wider = wider.min(mbr.max_rt_window);
    (wider > window).then(|| wider)
}

/// Searches one acceptor run for donor peaks
pub struct Matcher<'a> {
    acceptor: usize,
    index: &'a PeakIndex,
    files: &'a [SpectraFile],
    ids: &'a [Identification],
    envelopes: &'a FnvHashMap<String, TheoreticalEnvelope>,
    settings: &'a LfqSettings,
    scorer: MbrScorer,
    calibrations: FnvHashMap<usize, RtCalibration>,
    /// Sequences confidently identified in the acceptor
    identified: FnvHashSet<&'a str>,
    /// Apexes of the acceptor's MS2 peaks
    ms2_apexes: FnvHashSet<PeakIx>,
    /// Protein groups identified by MS2 in the acceptor's condition
    condition_proteins: Option<FnvHashSet<&'a str>>,
}

impl<'a> Matcher<'a> {
    /// Prepare to match into `runs[acceptor]`, whose index must be loaded.
    /// Returns `None` if the acceptor lacks the data to fit a scorer
    pub fn new(
        acceptor: usize,
        runs: &'a [Vec<ChromatographicPeak>],
        index: &'a PeakIndex,
        files: &'a [SpectraFile],
        ids: &'a [Identification],
        envelopes: &'a FnvHashMap<String, TheoreticalEnvelope>,
        settings: &'a LfqSettings,
    ) -> Option<Self> {
        let acceptor_peaks = runs.get(acceptor)?;
        let mut scorer = MbrScorer::new(acceptor_peaks, settings.mbr.ppm_tolerance)?;

        let mut calibrations = FnvHashMap::default();
        for (donor, peaks) in runs.iter().enumerate() {
            if donor == acceptor {
                continue;
            }
            calibrations.insert(donor, RtCalibration::new(peaks, acceptor_peaks, ids));
            if files[donor].condition != files[acceptor].condition
                && scorer.add_fold_change(donor, peaks, acceptor_peaks, ids)
            {
                log::trace!("{}: fitted fold change from {}", files[acceptor].name, files[donor].name);
            }
        }

        let identified = ids
            .iter()
            .filter(|id| id.file == acceptor && id.q_value <= settings.mbr.donor_q_value_threshold)
            .map(|id| id.modified_sequence.as_str())
            .collect();

        let ms2_apexes = acceptor_peaks
            .iter()
            .filter(|p| !p.is_mbr())
            .filter_map(apex_ix)
            .collect();

        let condition_proteins = settings.mbr.require_msms_id_in_condition.then(|| {
            runs.iter()
                .enumerate()
                .filter(|(file, _)| files[*file].condition == files[acceptor].condition)
                .flat_map(|(_, peaks)| peaks.iter().filter(|p| !p.is_mbr()))
                .flat_map(|p| p.identifications.iter())
                .filter_map(|ix| ids.get(ix.0 as usize))
                .flat_map(|id| id.protein_groups.iter().map(|g| g.as_str()))
                .collect()
        });

        Some(Matcher {
            acceptor,
            index,
            files,
            ids,
            envelopes,
            settings,
            scorer,
            calibrations,
            identified,
            ms2_apexes,
            condition_proteins,
        })
    }

    fn eligible(&self, donor: &Donor) -> bool {
        if donor.file == self.acceptor {
            return false;
        }
        let id = match donor.peak.first_identification(self.ids) {
            Some(id) => id,
            None => return false,
        };
        if self.identified.contains(id.modified_sequence.as_str()) {
            return false;
        }
        let fraction = |file: usize| self.files.get(file).map(|f| f.fraction as i64).unwrap_or(0);
        if (fraction(donor.file) - fraction(self.acceptor)).abs() > 1 {
            return false;
        }
        match &self.condition_proteins {
            Some(proteins) => id.protein_groups.iter().any(|g| proteins.contains(g.as_str())),
            None => true,
        }
    }

    /// Search the acceptor for every eligible donor
    pub fn run(&self, donors: &[Donor]) -> MbrOutcome {
        let eligible = donors
            .iter()
            .enumerate()
            .filter(|(_, d)| self.eligible(d))
            .collect::<Vec<_>>();
        log::info!(
            "{}: match-between-runs for {} donor peaks",
            self.files[self.acceptor].name,
            eligible.len()
        );

        let merged = eligible
            .par_iter()
            .fold(Shard::default, |mut shard, (donor_ix, donor)| {
                self.match_donor(*donor_ix, donor, &eligible, &mut shard);
                shard
            })
            .collect::<Vec<_>>()
            .into_iter()
            .fold(Shard::default(), |acc, shard| acc.absorb(shard, self.ids));

        let mut decoys = merged.decoys;
        decoys.sort_by_key(|p| p.mbr.as_ref().map(|m| m.donor_identification));
        let targets = finalize(merged.targets, self.settings.integrate, self.ids);
        log::debug!(
            "{}: {} MBR targets, {} decoys",
            self.files[self.acceptor].name,
            targets.len(),
            decoys.len()
        );
        MbrOutcome { targets, decoys }
    }

    fn target(&self, id: &'a Identification) -> Option<Target<'a>> {
        Some(Target {
            monoisotopic_mass: id.monoisotopic_mass,
            peakfinding_mass: id.peakfinding_mass,
            theoretical: self.envelopes.get(&id.modified_sequence)?,
        })
    }

    fn match_donor(&self, donor_ix: usize, donor: &Donor, eligible: &[(usize, &Donor)], shard: &mut Shard) {
        let mbr = &self.settings.mbr;
        let id = match donor.peak.first_identification(self.ids) {
            Some(id) => id,
            None => return,
        };
        let (target, donor_rt, calibration) = match (
            self.target(id),
            donor.peak.apex_rt(),
            self.calibrations.get(&donor.file),
        ) {
            (Some(t), Some(rt), Some(c)) => (t, rt, c),
            _ => return,
        };
        let mut prediction = match calibration.predict(donor_rt, mbr) {
            Some(p) => p,
            None => return,
        };

        let mut charges = donor
            .peak
            .identifications
            .iter()
            .filter_map(|ix| self.ids.get(ix.0 as usize))
            .map(|id| id.precursor_charge)
            .chain(donor.peak.apex.map(|a| a.charge))
            .collect::<Vec<_>>();
        charges.sort_unstable();
        charges.dedup();

        loop {
            let hypotheses = self.search(donor, &target, &charges, &prediction, false);
            let decoy = self.decoy(donor_ix, donor, id, &target, &charges, eligible, calibration, prediction.window);

            if !hypotheses.is_empty() || decoy.is_some() {
                for peak in hypotheses {
                    shard.insert(&id.modified_sequence, peak, self.ids);
                }
                shard.decoys.extend(decoy);
                return;
            }

            prediction.window = match widen(prediction.window, mbr) {
                Some(wider) => wider,
                None => return,
            };
        }
    }

    /// Search for the donor's mass at the predicted retention time of a
    /// random, unrelated donor peak from the same run
    #[allow(clippy::too_many_arguments)]
    fn decoy(
        &self,
        donor_ix: usize,
        donor: &Donor,
        id: &Identification,
        target: &Target,
        charges: &[u8],
        eligible: &[(usize, &Donor)],
        calibration: &RtCalibration,
        window: f64,
    ) -> Option<ChromatographicPeak> {
        let mbr = &self.settings.mbr;
        let donor_rt = donor.peak.apex_rt()?;
        let pool = eligible
            .iter()
            .map(|(_, d)| *d)
            .filter(|d| d.file == donor.file)
            .filter(|d| {
                let (other, rt) = match (d.peak.first_identification(self.ids), d.peak.apex_rt()) {
                    (Some(other), Some(rt)) => (other, rt),
                    _ => return false,
                };
                other.modified_sequence != id.modified_sequence
                    && (other.monoisotopic_mass - id.monoisotopic_mass).abs() >= mbr.decoy_min_mass_delta
                    && (rt - donor_rt).abs() >= mbr.decoy_min_rt_delta
            })
            .collect::<Vec<_>>();

        let seed = self.settings.random_seed ^ ((self.acceptor as u64) << 32) ^ donor_ix as u64;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let random = pool.choose(&mut rng)?;

        let mut prediction = calibration.predict(random.peak.apex_rt()?, mbr)?;
        prediction.window = window;
        self.search(donor, target, charges, &prediction, true)
            .into_iter()
            .min_by(by_score)
    }

    /// Candidate acceptor peaks for `target` inside the predicted window, one
    /// per unclaimed seed envelope
    fn search(
        &self,
        donor: &Donor,
        target: &Target,
        charges: &[u8],
        prediction: &RtPrediction,
        random_rt: bool,
    ) -> Vec<ChromatographicPeak> {
        let (lo, hi) = prediction.bounds();
        let (first, last) = match self.index.scans_covering(lo, hi) {
            Some(range) => range,
            None => return Vec::new(),
        };

        let settings = self.settings;
        let extractor = Extractor::new(
            self.index,
            Tolerance::ppm(settings.isotope_ppm_tolerance),
            settings.num_isotopes_required,
        );
        let tolerance = Tolerance::ppm(self.scorer.ppm_tolerance());

        let mut seeds: Vec<IsotopicEnvelope> = Vec::new();
        for &charge in charges {
            for scan in first..=last {
                if let Some(ix) = self.index.get_mass(target.peakfinding_mass, charge, scan, tolerance) {
                    seeds.extend(extractor.envelopes(&[ix], target, charge));
                }
            }
        }
        seeds.sort_by(|a, b| b.intensity.total_cmp(&a.intensity).then(a.ix.cmp(&b.ix)));

        let donor_id = match donor.peak.identifications.first() {
            Some(&ix) => ix,
            None => return Vec::new(),
        };
        let donor_pep = self
            .ids
            .get(donor_id.0 as usize)
            .map(|id| id.posterior_error_probability)
            .unwrap_or(0.0);

        let mut claimed = FnvHashSet::default();
        let mut hypotheses = Vec::new();
        for seed in seeds {
            if !claimed.insert((seed.ix, seed.charge)) {
                continue;
            }
            let xic = self.index.xic(
                to_mz(target.peakfinding_mass, seed.charge),
                seed.peak.scan as usize,
                Tolerance::ppm(settings.peakfinding_ppm_tolerance),
                settings.missed_scans_allowed,
            );
            let xic = extractor.filter_xic(&xic, target, seed.charge, tolerance);

            let mut peak = ChromatographicPeak::new(self.acceptor, donor.peak.identifications.clone(), self.ids);
            peak.envelopes = extractor.envelopes(&xic, target, seed.charge);
            peak.calculate_intensity(settings.integrate, self.ids);
            let mut peak = cut(
                peak,
                seed.peak.retention_time,
                settings.discrimination_factor,
                settings.integrate,
                self.ids,
            );

            claimed.extend(peak.envelopes.iter().map(|e| (e.ix, e.charge)));
            let apex = match peak.apex {
                Some(apex) => apex,
                None => continue,
            };
            if self.ms2_apexes.contains(&apex.ix) {
                continue;
            }

            let (components, score) = self.scorer.score(&peak, &donor.peak, prediction, donor_pep);
            peak.mbr = Some(MbrInfo {
                donor_file: donor.file,
                donor_identification: donor_id,
                rt_hypothesis: prediction.retention_time,
                rt_window: prediction.window,
                rt_std_dev: prediction.std_dev,
                rt_iqr: prediction.iqr,
                random_rt,
                components,
                score,
                pep: None,
                q_value: 1.0,
            });
            hypotheses.push(peak);
        }
        hypotheses
    }
}
