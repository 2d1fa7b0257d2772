//! Quantification results: per-run peaks, and one detection per peptide and run

use crate::engine::{Identification, LfqSettings, SpectraFile};
use crate::peak::{ChromatographicPeak, DetectionType};
use fnv::{FnvHashMap, FnvHashSet};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeptideQuant {
    pub modified_sequence: String,
    pub base_sequence: String,
    pub protein_groups: Vec<String>,
    /// Indexed by file
    pub intensities: Vec<f64>,
    /// Indexed by file
    pub detections: Vec<DetectionType>,
}

pub struct LfqResults {
    pub files: Vec<SpectraFile>,
    pub identifications: Vec<Identification>,
    /// Quantified peaks, MS2 and MBR, for each run
    pub peaks: Vec<Vec<ChromatographicPeak>>,
    /// Randomized retention time MBR hypotheses for each run
    pub decoys: Vec<Vec<ChromatographicPeak>>,
    /// Target peptides, ordered by modified sequence
    pub peptides: Vec<PeptideQuant>,
}

impl LfqResults {
    pub fn new(
        files: Vec<SpectraFile>,
        identifications: Vec<Identification>,
        peaks: Vec<Vec<ChromatographicPeak>>,
        decoys: Vec<Vec<ChromatographicPeak>>,
        settings: &LfqSettings,
    ) -> Self {
        let peptides = summarize(&files, &identifications, &peaks, settings);
        LfqResults {
            files,
            identifications,
            peaks,
            decoys,
            peptides,
        }
    }

    pub fn peptide(&self, modified_sequence: &str) -> Option<&PeptideQuant> {
        self.peptides
            .binary_search_by(|p| p.modified_sequence.as_str().cmp(modified_sequence))
            .ok()
            .map(|ix| &self.peptides[ix])
    }

    /// MBR peaks across all runs
    pub fn mbr_peaks(&self) -> impl Iterator<Item = &ChromatographicPeak> {
        self.peaks.iter().flatten().filter(|p| p.is_mbr())
    }
}

/// Whether `peak` may be reported as a detection
fn reportable(peak: &ChromatographicPeak, q_value_threshold: f64) -> bool {
    match &peak.mbr {
        Some(mbr) => mbr.q_value < q_value_threshold && !mbr.random_rt,
        None => true,
    }
}

fn summarize(
    files: &[SpectraFile],
    ids: &[Identification],
    peaks: &[Vec<ChromatographicPeak>],
    settings: &LfqSettings,
) -> Vec<PeptideQuant> {
    let mut peptides: FnvHashMap<&str, PeptideQuant> = FnvHashMap::default();
    let mut identified: FnvHashSet<(&str, usize)> = FnvHashSet::default();
    for id in ids.iter().filter(|id| id.use_for_quant && !id.decoy) {
        identified.insert((id.modified_sequence.as_str(), id.file));
        let entry = peptides
            .entry(id.modified_sequence.as_str())
            .or_insert_with(|| PeptideQuant {
                modified_sequence: id.modified_sequence.clone(),
                base_sequence: id.base_sequence.clone(),
                protein_groups: Vec::new(),
                intensities: vec![0.0; files.len()],
                detections: vec![DetectionType::NotDetected; files.len()],
            });
        for group in &id.protein_groups {
            if !entry.protein_groups.contains(group) {
                entry.protein_groups.push(group.clone());
            }
        }
    }

    let mut peptides = peptides.into_values().collect::<Vec<_>>();
    peptides.sort_by(|a, b| a.modified_sequence.cmp(&b.modified_sequence));

    // Per run: sequence -> (best unambiguous intensity, detection), and the
    // best intensity among ambiguous peaks
    for (file, run) in peaks.iter().enumerate().take(files.len()) {
        let mut best: FnvHashMap<&str, (f64, DetectionType)> = FnvHashMap::default();
        let mut ambiguous: FnvHashMap<&str, f64> = FnvHashMap::default();

        for peak in run.iter().filter(|p| reportable(p, settings.mbr.q_value_threshold)) {
            if peak.apex.is_none() {
                continue;
            }
            let sequences = peak
                .identifications
                .iter()
                .filter_map(|ix| ids.get(ix.0 as usize))
                .map(|id| id.modified_sequence.as_str())
                .collect::<FnvHashSet<_>>();

            for sequence in sequences {
                if peak.is_ambiguous() {
                    let entry = ambiguous.entry(sequence).or_insert(0.0);
                    *entry = entry.max(peak.intensity);
                } else {
                    let entry = best.entry(sequence).or_insert((f64::NEG_INFINITY, DetectionType::NotDetected));
                    if peak.intensity > entry.0 {
                        *entry = (peak.intensity, peak.detection_type());
                    }
                }
            }
        }

        for peptide in peptides.iter_mut() {
            let sequence = peptide.modified_sequence.as_str();
            let (intensity, detection) = if let Some(&(intensity, detection)) = best.get(sequence) {
                (intensity, detection)
            } else if let Some(&intensity) = ambiguous.get(sequence) {
                let intensity = if settings.quantify_ambiguous_peptides {
                    intensity
                } else {
                    0.0
                };
                (intensity, DetectionType::MsmsAmbiguousPeakfinding)
            } else if identified.contains(&(sequence, file)) {
                (0.0, DetectionType::MsmsIdentifiedButNotQuantified)
            } else {
                (0.0, DetectionType::NotDetected)
            };
            peptide.intensities[file] = intensity;
            peptide.detections[file] = detection;
        }
    }
    peptides
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reconcile::test::peak;

    fn ids() -> Vec<Identification> {
        let id = |file: usize, seq: &str| Identification {
            file,
            base_sequence: seq.into(),
            modified_sequence: seq.into(),
            protein_groups: vec!["P1".into()],
            use_for_quant: true,
            ..Default::default()
        };
        vec![id(0, "AAA"), id(0, "CCC"), id(1, "AAA"), id(1, "DDD"), id(0, "EEE")]
    }

    fn files() -> Vec<SpectraFile> {
        vec![SpectraFile::default(), SpectraFile::default()]
    }

    #[test]
    fn detection_types() {
        let ids = ids();
        let mut ambiguous = peak(30, &[1, 4], None);
        ambiguous.resolve_identifications(&ids);
        let mut mbr = peak(40, &[0], Some((5.0, false, 0)));
        mbr.file = 1;
        mbr.mbr.as_mut().unwrap().q_value = 0.01;

        let runs = vec![
            vec![peak(10, &[0], None), ambiguous],
            vec![peak(20, &[2], None), mbr],
        ];
        let results = LfqResults::new(files(), ids, runs, vec![vec![], vec![]], &LfqSettings::default());

        let aaa = results.peptide("AAA").unwrap();
        assert_eq!(aaa.detections, vec![DetectionType::Msms, DetectionType::Msms]);
        assert_eq!(aaa.protein_groups, vec!["P1".to_string()]);

        let ccc = results.peptide("CCC").unwrap();
        assert_eq!(ccc.detections[0], DetectionType::MsmsAmbiguousPeakfinding);
        assert_eq!(ccc.intensities[0], 0.0);
        assert_eq!(ccc.detections[1], DetectionType::NotDetected);

        let ddd = results.peptide("DDD").unwrap();
        assert_eq!(ddd.detections[1], DetectionType::MsmsIdentifiedButNotQuantified);

        assert_eq!(results.mbr_peaks().count(), 1);
        let names = results
            .peptides
            .iter()
            .map(|p| p.modified_sequence.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["AAA", "CCC", "DDD", "EEE"]);
    }

    #[test]
    fn mbr_detection_respects_q_value() {
        let ids = ids();
        let mut mbr = peak(40, &[3], Some((5.0, false, 3)));
        mbr.mbr.as_mut().unwrap().q_value = 0.01;
        let mut rejected = peak(50, &[4], Some((1.0, false, 4)));
        rejected.mbr.as_mut().unwrap().q_value = 0.5;

        let runs = vec![vec![mbr, rejected], vec![]];
        let results = LfqResults::new(files(), ids, runs, vec![vec![], vec![]], &LfqSettings::default());
        let ddd = results.peptide("DDD").unwrap();
        assert_eq!(ddd.detections[0], DetectionType::Mbr);
        assert_eq!(ddd.intensities[0], 10.0);
        let eee = results.peptide("EEE").unwrap();
        assert_eq!(eee.detections[0], DetectionType::MsmsIdentifiedButNotQuantified);
    }
}
