//! Settings, inputs and orchestration of a quantification run

use crate::envelope::{peakfind, Extractor, Target};
use crate::fdr::{self, KdePep, PepModel};
use crate::index::{Ms1Scan, PeakIndex};
use crate::isotopes::{Averagine, ElementTable, TheoreticalEnvelope};
use crate::mass::{Composition, Tolerance};
use crate::mbr::{select_donors, Matcher, MbrOutcome};
use crate::peak::{cut, ChromatographicPeak};
use crate::reconcile::reconcile;
use crate::results::LfqResults;
use crate::{Error, Result};
use fnv::{FnvHashMap, FnvHashSet};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Handle to an [`Identification`], its position in the engine's input
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdIx(pub u32);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectraFile {
    pub name: String,
    pub condition: String,
    pub biological_replicate: usize,
    pub fraction: usize,
    pub technical_replicate: usize,
}

/// A peptide-spectrum match supplied by an upstream search engine
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    /// Position of the run in the engine's file list
    pub file: usize,
    pub base_sequence: String,
    pub modified_sequence: String,
    pub monoisotopic_mass: f64,
    /// Mass of the most abundant isotope. Filled in by [`Engine::new`]
    #[serde(default)]
    pub peakfinding_mass: f64,
    /// MS2 retention time, in minutes
    pub ms2_retention_time: f64,
    pub precursor_charge: u8,
    #[serde(default)]
    pub protein_groups: Vec<String>,
    #[serde(default)]
    pub formula: Option<Composition>,
    pub score: f64,
    pub q_value: f64,
    #[serde(default)]
    pub posterior_error_probability: f64,
    #[serde(default)]
    pub decoy: bool,
    #[serde(default = "default_true")]
    pub use_for_quant: bool,
}

fn default_true() -> bool {
    true
}

/// How to choose the donor run for a sequence identified in several runs
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DonorStrategy {
    /// Highest identification score
    Score,
    /// Most MS2 peaks eluting nearby in the same run
    Neighbors,
    /// Most intense peak
    Intensity,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MbrSettings {
    pub enabled: bool,
    /// Upper bound for the acceptor-specific ppm tolerance
    pub ppm_tolerance: f64,
    /// Maximum half-width of the retention time search window, in minutes
    pub max_rt_window: f64,
    /// MBR peaks above this q-value are not reported as detections
    pub q_value_threshold: f64,
    /// Identifications above this q-value neither donate nor block donations
    pub donor_q_value_threshold: f64,
    pub donor_strategy: DonorStrategy,
    pub require_msms_id_in_condition: bool,
    /// Calibration points further than this from the donor retention time are
    /// not used
    pub rt_neighbor_window: f64,
    /// Calibration points used on either side of the donor retention time
    pub max_neighbors: usize,
    /// Window half-width when only one calibration point is available
    pub fallback_rt_window: f64,
    /// Retention time window used by [`DonorStrategy::Neighbors`]
    pub donor_neighbor_rt_window: f64,
    pub decoy_min_mass_delta: f64,
    pub decoy_min_rt_delta: f64,
    pub min_pep_peaks: usize,
    pub min_pep_decoys: usize,
}

impl Default for MbrSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ppm_tolerance: 10.0,
            max_rt_window: 2.5,
            q_value_threshold: 0.05,
            donor_q_value_threshold: 0.01,
            donor_strategy: DonorStrategy::Score,
            require_msms_id_in_condition: false,
            rt_neighbor_window: 0.5,
            max_neighbors: 3,
            fallback_rt_window: 0.5,
            donor_neighbor_rt_window: 1.0,
            decoy_min_mass_delta: 5.0,
            decoy_min_rt_delta: 1.0,
            min_pep_peaks: 100,
            min_pep_decoys: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LfqSettings {
    /// Tolerance used to trace XICs
    pub peakfinding_ppm_tolerance: f64,
    /// Tolerance applied to XIC points, against the peakfinding mass
    pub ppm_tolerance: f64,
    pub isotope_ppm_tolerance: f64,
    pub num_isotopes_required: usize,
    pub missed_scans_allowed: usize,
    /// Only search the identification's own charge state
    pub id_specific_charge_state: bool,
    /// Sum envelopes instead of taking the apex
    pub integrate: bool,
    pub discrimination_factor: f64,
    pub quantify_ambiguous_peptides: bool,
    pub workers: usize,
    pub random_seed: u64,
    /// Where spilled peak indices are written. Defaults to the system
    /// temporary directory
    pub spill_directory: Option<PathBuf>,
    pub mbr: MbrSettings,
}

impl Default for LfqSettings {
    fn default() -> Self {
        Self {
            peakfinding_ppm_tolerance: 20.0,
            ppm_tolerance: 10.0,
            isotope_ppm_tolerance: 5.0,
            num_isotopes_required: 2,
            missed_scans_allowed: 1,
            id_specific_charge_state: false,
            integrate: false,
            discrimination_factor: 0.6,
            quantify_ambiguous_peptides: false,
            workers: 1,
            random_seed: 42,
            spill_directory: None,
            mbr: MbrSettings::default(),
        }
    }
}

/// Supplies the MS1 scans of a run, ordered by retention time
pub trait Ms1Source: Sync {
    fn scans(&self, file: &SpectraFile) -> Result<Vec<Ms1Scan>>;
}

/// In-memory scans, keyed by file name
impl Ms1Source for FnvHashMap<String, Vec<Ms1Scan>> {
    fn scans(&self, file: &SpectraFile) -> Result<Vec<Ms1Scan>> {
        self.get(&file.name).cloned().ok_or_else(|| Error::Source {
            file: file.name.clone(),
            message: "no scans available".into(),
        })
    }
}

pub struct Engine {
    settings: LfqSettings,
    files: Vec<SpectraFile>,
    ids: Vec<Identification>,
    /// Theoretical envelopes, by modified sequence
    envelopes: FnvHashMap<String, TheoreticalEnvelope>,
    /// Charge states searched for every identification
    charges: (u8, u8),
    pep: Box<dyn PepModel>,
}

impl Engine {
    pub fn new(settings: LfqSettings, files: Vec<SpectraFile>, identifications: Vec<Identification>) -> Result<Self> {
        Self::with_chemistry(
            settings,
            files,
            identifications,
            &ElementTable::natural(),
            &Averagine::default(),
        )
    }

    /// Build an engine whose theoretical envelopes come from `table` and
    /// `averagine`
    pub fn with_chemistry(
        settings: LfqSettings,
        files: Vec<SpectraFile>,
        mut identifications: Vec<Identification>,
        table: &ElementTable,
        averagine: &Averagine,
    ) -> Result<Self> {
        if files.is_empty() {
            return Err(Error::NoFiles);
        }
        if identifications.is_empty() {
            return Err(Error::NoIdentifications);
        }

        let orphans = identifications.iter().filter(|id| id.file >= files.len()).count();
        if orphans > 0 {
            log::warn!("{} identifications refer to unknown files and will be ignored", orphans);
        }

        let mut envelopes: FnvHashMap<String, TheoreticalEnvelope> = FnvHashMap::default();
        for id in identifications.iter_mut() {
            let envelope = envelopes
                .entry(id.modified_sequence.clone())
                .or_insert_with(|| {
                    TheoreticalEnvelope::new(
                        table,
                        averagine,
                        id.monoisotopic_mass,
                        id.formula.as_ref(),
                        &id.base_sequence,
                        settings.num_isotopes_required,
                    )
                });
            id.peakfinding_mass = id.monoisotopic_mass + envelope.peakfinding_shift();
        }

        let charges = identifications
            .iter()
            .map(|id| id.precursor_charge)
            .filter(|&z| z > 0)
            .fold((u8::MAX, 0), |(lo, hi), z| (lo.min(z), hi.max(z)));

        log::debug!(
            "{} identifications, {} distinct sequences, charges {}..={}",
            identifications.len(),
            envelopes.len(),
            charges.0,
            charges.1
        );

        Ok(Engine {
            settings,
            files,
            ids: identifications,
            envelopes,
            charges,
            pep: Box::new(KdePep::default()),
        })
    }

    /// Replace the default KDE posterior error model
    pub fn with_pep_model(mut self, model: Box<dyn PepModel>) -> Self {
        self.pep = model;
        self
    }

    pub fn settings(&self) -> &LfqSettings {
        &self.settings
    }

    pub fn identifications(&self) -> &[Identification] {
        &self.ids
    }

    /// Quantify every run, then transfer identifications between runs if
    /// match-between-runs is enabled
    pub fn run(&mut self, source: &dyn Ms1Source) -> Result<LfqResults> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.workers.max(1))
            .build();
        match pool {
            Ok(pool) => pool.install(|| self.execute(source)),
            Err(err) => {
                log::warn!("failed to build thread pool, using the global pool: {}", err);
                self.execute(source)
            }
        }
    }

    fn execute(&mut self, source: &dyn Ms1Source) -> Result<LfqResults> {
        let settings = &self.settings;
        let spill_directory = settings
            .spill_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        let mut indices: Vec<Option<PeakIndex>> = Vec::with_capacity(self.files.len());
        let mut peaks: Vec<Vec<ChromatographicPeak>> = Vec::with_capacity(self.files.len());

        for (run, file) in self.files.iter().enumerate() {
            let index = source
                .scans(file)
                .and_then(|scans| PeakIndex::build(&file.name, &scans));
            let mut index = match index {
                Ok(index) => index,
                Err(err) => {
                    log::warn!("{}: skipping run: {}", file.name, err);
                    indices.push(None);
                    peaks.push(Vec::new());
                    continue;
                }
            };
            log::info!("{}: indexed {} peaks", file.name, index.len());

            let quantified = self.quantify_run(run, &index);
            peaks.push(reconcile(quantified, settings.integrate, &self.ids));

            if settings.mbr.enabled {
                if let Err(err) = index.spill(&spill_directory, run) {
                    log::warn!("{}: failed to spill peak index, keeping it in memory: {}", file.name, err);
                }
                indices.push(Some(index));
            } else {
                indices.push(None);
            }
        }

        let mut decoys = vec![Vec::new(); self.files.len()];
        if settings.mbr.enabled && self.files.len() > 1 {
            let donors = select_donors(
                &peaks,
                &self.ids,
                settings.mbr.donor_strategy,
                settings.mbr.donor_q_value_threshold,
                settings.mbr.donor_neighbor_rt_window,
            );

            for acceptor in 0..self.files.len() {
                let index = match indices[acceptor].as_mut() {
                    Some(index) => index,
                    None => continue,
                };
                if let Err(err) = index.restore() {
                    log::warn!("{}: failed to restore peak index: {}", self.files[acceptor].name, err);
                    continue;
                }

                let matcher = Matcher::new(
                    acceptor,
                    &peaks,
                    index,
                    &self.files,
                    &self.ids,
                    &self.envelopes,
                    settings,
                );
                let outcome = match matcher {
                    Some(matcher) => matcher.run(&donors),
                    None => {
                        log::warn!(
                            "{}: too few MS2 peaks to score match-between-runs hypotheses",
                            self.files[acceptor].name
                        );
                        MbrOutcome::default()
                    }
                };
                index.clear();

                let mut run = std::mem::take(&mut peaks[acceptor]);
                run.extend(outcome.targets);
                peaks[acceptor] = reconcile(run, settings.integrate, &self.ids);
                decoys[acceptor] = outcome.decoys;
            }

            self.control_fdr(&mut peaks, &mut decoys);
        }
        drop(indices);

        Ok(LfqResults::new(
            self.files.clone(),
            self.ids.clone(),
            peaks,
            decoys,
            &self.settings,
        ))
    }

    /// Pool every MBR hypothesis, assign q-values and PEPs, and drop the
    /// hypotheses that PEP deduplication discards
    fn control_fdr(&mut self, peaks: &mut [Vec<ChromatographicPeak>], decoys: &mut [Vec<ChromatographicPeak>]) {
        // (run, is decoy list, position)
        let mut addresses = Vec::new();
        let mut pooled = Vec::new();
        for (run, (targets, random)) in peaks.iter_mut().zip(decoys.iter_mut()).enumerate() {
            for (i, peak) in targets.iter_mut().enumerate() {
                if peak.is_mbr() {
                    addresses.push((run, false, i));
                    pooled.push(peak);
                }
            }
            for (i, peak) in random.iter_mut().enumerate() {
                addresses.push((run, true, i));
                pooled.push(peak);
            }
        }
        if pooled.is_empty() {
            return;
        }

        let keep = fdr::control(&mut pooled, &self.ids, &self.settings.mbr, self.pep.as_mut());
        drop(pooled);

        let dropped = addresses
            .into_iter()
            .zip(keep)
            .filter(|(_, keep)| !keep)
            .map(|(address, _)| address)
            .collect::<FnvHashSet<_>>();
        if dropped.is_empty() {
            return;
        }
        log::debug!("dropped {} redundant MBR hypotheses", dropped.len());

        for (run, (targets, random)) in peaks.iter_mut().zip(decoys.iter_mut()).enumerate() {
            let mut i = 0;
            targets.retain(|_| {
                i += 1;
                !dropped.contains(&(run, false, i - 1))
            });
            let mut i = 0;
            random.retain(|_| {
                i += 1;
                !dropped.contains(&(run, true, i - 1))
            });
        }
    }

    fn quantify_run(&self, run: usize, index: &PeakIndex) -> Vec<ChromatographicPeak> {
        let ids = self
            .ids
            .iter()
            .enumerate()
            .filter(|(_, id)| id.file == run && id.precursor_charge > 0)
            .map(|(ix, _)| IdIx(ix as u32))
            .collect::<Vec<_>>();
        log::info!("{}: quantifying {} identifications", index.name(), ids.len());

        ids.par_iter()
            .map(|&ix| self.quantify_identification(ix, index))
            .collect()
    }

    /// Trace, validate and cut the MS1 signal of one identification
    fn quantify_identification(&self, ix: IdIx, index: &PeakIndex) -> ChromatographicPeak {
        let settings = &self.settings;
        let id = &self.ids[ix.0 as usize];
        let mut peak = ChromatographicPeak::new(id.file, vec![ix], &self.ids);

        let target = match self.envelopes.get(&id.modified_sequence) {
            Some(theoretical) => Target {
                monoisotopic_mass: id.monoisotopic_mass,
                peakfinding_mass: id.peakfinding_mass,
                theoretical,
            },
            None => return peak,
        };

        let extractor = Extractor::new(
            index,
            Tolerance::ppm(settings.isotope_ppm_tolerance),
            settings.num_isotopes_required,
        );
        let tolerance = Tolerance::ppm(settings.ppm_tolerance);
        let charges = if settings.id_specific_charge_state {
            id.precursor_charge..=id.precursor_charge
        } else {
            self.charges.0..=self.charges.1
        };

        for charge in charges {
            let xic = peakfind(
                index,
                id.ms2_retention_time,
                target.peakfinding_mass,
                charge,
                Tolerance::ppm(settings.peakfinding_ppm_tolerance),
                settings.missed_scans_allowed,
            );
            let xic = extractor.filter_xic(&xic, &target, charge, tolerance);
            peak.envelopes.extend(extractor.envelopes(&xic, &target, charge));
        }
        peak.envelopes
            .sort_by(|a, b| a.peak.scan.cmp(&b.peak.scan).then(a.charge.cmp(&b.charge)));
        peak.calculate_intensity(settings.integrate, &self.ids);

        let mut peak = cut(
            peak,
            id.ms2_retention_time,
            settings.discrimination_factor,
            settings.integrate,
            &self.ids,
        );

        // Other charge states may only extend as far as the identified one
        let span = peak
            .envelopes
            .iter()
            .filter(|e| e.charge == id.precursor_charge)
            .map(|e| e.peak.scan)
            .fold(None, |acc: Option<(u32, u32)>, scan| match acc {
                Some((lo, hi)) => Some((lo.min(scan), hi.max(scan))),
                None => Some((scan, scan)),
            });
        match span {
            Some((lo, hi)) => peak.envelopes.retain(|e| e.peak.scan >= lo && e.peak.scan <= hi),
            None => peak.envelopes.clear(),
        }
        peak.calculate_intensity(settings.integrate, &self.ids);
        peak
    }
}
