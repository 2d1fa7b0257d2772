use anyhow::{ensure, Context};
use clap::ArgMatches;
use lumen_core::engine::{DonorStrategy, Identification, LfqSettings, MbrSettings, SpectraFile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub fn read_json<S: AsRef<str>, T: for<'de> Deserialize<'de>>(path: S) -> anyhow::Result<T> {
    let file = std::fs::File::open(path.as_ref())?;
    let reader = std::io::BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

#[derive(Serialize)]
/// Actual quantification parameters - may include overrides or default values not set by user
pub struct Quant {
    pub version: String,
    pub settings: LfqSettings,
    pub files: Vec<SpectraFile>,
    /// Scan files, parallel to `files`
    pub scan_paths: Vec<String>,
    pub identifications: String,
    pub output_paths: Vec<String>,

    #[serde(skip_serializing)]
    pub output_directory: PathBuf,
}

#[derive(Deserialize, Debug)]
/// One run, as listed in the parameter file
pub struct RunOptions {
    /// JSON file holding the run's MS1 scans
    pub path: String,
    /// Name used in the identification table. Defaults to the file stem of `path`
    pub name: Option<String>,
    pub condition: Option<String>,
    pub biological_replicate: Option<usize>,
    pub fraction: Option<usize>,
    pub technical_replicate: Option<usize>,
}

impl RunOptions {
    fn into_file(self) -> (SpectraFile, String) {
        let name = self.name.unwrap_or_else(|| {
            std::path::Path::new(&self.path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.clone())
        });
        let file = SpectraFile {
            name,
            condition: self.condition.unwrap_or_default(),
            biological_replicate: self.biological_replicate.unwrap_or(0),
            fraction: self.fraction.unwrap_or(0),
            technical_replicate: self.technical_replicate.unwrap_or(0),
        };
        (file, self.path)
    }
}

#[derive(Deserialize)]
/// Input quantification parameters deserialized from JSON file
pub struct Input {
    runs: Option<Vec<RunOptions>>,
    identifications: Option<String>,
    output_directory: Option<String>,
    workers: Option<usize>,
    #[serde(rename = "lfq_settings")]
    lfq_options: Option<LfqOptions>,
}

#[derive(Serialize, Deserialize, Default, Debug)]
pub struct LfqOptions {
    peakfinding_ppm_tolerance: Option<f64>,
    ppm_tolerance: Option<f64>,
    isotope_ppm_tolerance: Option<f64>,
    num_isotopes_required: Option<usize>,
    missed_scans_allowed: Option<usize>,
    id_specific_charge_state: Option<bool>,
    integrate: Option<bool>,
    discrimination_factor: Option<f64>,
    quantify_ambiguous_peptides: Option<bool>,
    random_seed: Option<u64>,
    spill_directory: Option<PathBuf>,
    #[serde(rename = "mbr_settings")]
    mbr_options: Option<MbrOptions>,
}

#[derive(Serialize, Deserialize, Default, Debug)]
pub struct MbrOptions {
    enabled: Option<bool>,
    ppm_tolerance: Option<f64>,
    max_rt_window: Option<f64>,
    q_value_threshold: Option<f64>,
    donor_q_value_threshold: Option<f64>,
    donor_strategy: Option<DonorStrategy>,
    require_msms_id_in_condition: Option<bool>,
    rt_neighbor_window: Option<f64>,
    max_neighbors: Option<usize>,
    fallback_rt_window: Option<f64>,
    donor_neighbor_rt_window: Option<f64>,
    decoy_min_mass_delta: Option<f64>,
    decoy_min_rt_delta: Option<f64>,
    min_pep_peaks: Option<usize>,
    min_pep_decoys: Option<usize>,
}

impl From<MbrOptions> for MbrSettings {
    fn from(value: MbrOptions) -> MbrSettings {
        let default = MbrSettings::default();
        let settings = MbrSettings {
            enabled: value.enabled.unwrap_or(default.enabled),
            ppm_tolerance: value.ppm_tolerance.unwrap_or(default.ppm_tolerance).abs(),
            max_rt_window: value.max_rt_window.unwrap_or(default.max_rt_window).abs(),
            q_value_threshold: value.q_value_threshold.unwrap_or(default.q_value_threshold),
            donor_q_value_threshold: value
                .donor_q_value_threshold
                .unwrap_or(default.donor_q_value_threshold),
            donor_strategy: value.donor_strategy.unwrap_or(default.donor_strategy),
            require_msms_id_in_condition: value
                .require_msms_id_in_condition
                .unwrap_or(default.require_msms_id_in_condition),
            rt_neighbor_window: value.rt_neighbor_window.unwrap_or(default.rt_neighbor_window),
            max_neighbors: value.max_neighbors.unwrap_or(default.max_neighbors),
            fallback_rt_window: value.fallback_rt_window.unwrap_or(default.fallback_rt_window),
            donor_neighbor_rt_window: value
                .donor_neighbor_rt_window
                .unwrap_or(default.donor_neighbor_rt_window),
            decoy_min_mass_delta: value.decoy_min_mass_delta.unwrap_or(default.decoy_min_mass_delta),
            decoy_min_rt_delta: value.decoy_min_rt_delta.unwrap_or(default.decoy_min_rt_delta),
            min_pep_peaks: value.min_pep_peaks.unwrap_or(default.min_pep_peaks),
            min_pep_decoys: value.min_pep_decoys.unwrap_or(default.min_pep_decoys),
        };
        if settings.ppm_tolerance > 20.0 {
            log::warn!("mbr_settings.ppm_tolerance is higher than expected");
        }
        if settings.q_value_threshold < settings.donor_q_value_threshold {
            log::warn!("mbr_settings.q_value_threshold is stricter than the donor threshold");
        }
        settings
    }
}

impl From<LfqOptions> for LfqSettings {
    fn from(value: LfqOptions) -> LfqSettings {
        let default = LfqSettings::default();
        let settings = LfqSettings {
            peakfinding_ppm_tolerance: value
                .peakfinding_ppm_tolerance
                .unwrap_or(default.peakfinding_ppm_tolerance)
                .abs(),
            ppm_tolerance: value.ppm_tolerance.unwrap_or(default.ppm_tolerance).abs(),
            isotope_ppm_tolerance: value
                .isotope_ppm_tolerance
                .unwrap_or(default.isotope_ppm_tolerance)
                .abs(),
            num_isotopes_required: value.num_isotopes_required.unwrap_or(default.num_isotopes_required),
            missed_scans_allowed: value.missed_scans_allowed.unwrap_or(default.missed_scans_allowed),
            id_specific_charge_state: value
                .id_specific_charge_state
                .unwrap_or(default.id_specific_charge_state),
            integrate: value.integrate.unwrap_or(default.integrate),
            discrimination_factor: value.discrimination_factor.unwrap_or(default.discrimination_factor),
            quantify_ambiguous_peptides: value
                .quantify_ambiguous_peptides
                .unwrap_or(default.quantify_ambiguous_peptides),
            workers: default.workers,
            random_seed: value.random_seed.unwrap_or(default.random_seed),
            spill_directory: value.spill_directory.or(default.spill_directory),
            mbr: value.mbr_options.map(Into::into).unwrap_or_default(),
        };
        if settings.ppm_tolerance > 20.0 || settings.peakfinding_ppm_tolerance > 20.0 {
            log::warn!("lfq_settings.ppm_tolerance is higher than expected");
        }
        if settings.discrimination_factor <= 0.0 || settings.discrimination_factor >= 1.0 {
            log::warn!("lfq_settings.discrimination_factor should lie between 0 and 1");
        }
        settings
    }
}

impl Input {
    pub fn from_arguments(matches: ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .context("`parameters` must be provided")?;
        let mut input = Input::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            log::trace!("overriding `output_directory` parameter.");
            input.output_directory = Some(output_directory.into());
        }
        if let Some(identifications) = matches.get_one::<String>("identifications") {
            log::trace!("overriding `identifications` parameter.");
            input.identifications = Some(identifications.into());
        }
        if let Some(workers) = matches.get_one::<u16>("workers").copied() {
            input.workers = Some(workers as usize);
        }
        if matches.get_flag("mbr") {
            log::trace!("overriding `lfq_settings.mbr_settings.enabled` parameter.");
            input
                .lfq_options
                .get_or_insert_with(LfqOptions::default)
                .mbr_options
                .get_or_insert_with(MbrOptions::default)
                .enabled = Some(true);
        }

        ensure!(
            input.identifications.is_some(),
            "`identifications` must be set. For more information try '--help'"
        );
        ensure!(
            input.runs.as_ref().map(|r| !r.is_empty()).unwrap_or(false),
            "`runs` must list at least one run"
        );

        Ok(input)
    }

    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        read_json(path)
    }

    pub fn build(self) -> anyhow::Result<Quant> {
        let identifications = self
            .identifications
            .context("`identifications` must be provided")?;
        let runs = self.runs.unwrap_or_default();
        ensure!(!runs.is_empty(), "`runs` must list at least one run");

        let (files, scan_paths): (Vec<_>, Vec<_>) = runs.into_iter().map(RunOptions::into_file).unzip();
        let mut names = files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        names.sort_unstable();
        names.dedup();
        ensure!(names.len() == files.len(), "run names must be unique");

        let mut settings: LfqSettings = self.lfq_options.map(Into::into).unwrap_or_default();
        settings.workers = self
            .workers
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
            .max(1);

        let output_directory = match self.output_directory {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("Failed to create `{}`", path.display()))?;
                path
            }
            None => std::env::current_dir()?,
        };

        Ok(Quant {
            version: clap::crate_version!().into(),
            settings,
            files,
            scan_paths,
            identifications,
            output_paths: Vec::new(),
            output_directory,
        })
    }
}

#[derive(Deserialize)]
/// One row of the identification table
struct IdentificationRow {
    file: String,
    base_sequence: String,
    modified_sequence: String,
    monoisotopic_mass: f64,
    ms2_retention_time: f64,
    precursor_charge: u8,
    /// Semicolon-separated
    #[serde(default)]
    protein_groups: String,
    score: f64,
    q_value: f64,
    #[serde(default)]
    posterior_error_probability: f64,
    #[serde(default)]
    decoy: bool,
    #[serde(default = "default_true")]
    use_for_quant: bool,
}

fn default_true() -> bool {
    true
}

/// Read a tab-separated identification table. Rows naming a run that is not
/// in `files` are skipped
pub fn read_identifications(path: &str, files: &[SpectraFile]) -> anyhow::Result<Vec<Identification>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("Failed to open identifications `{path}`"))?;

    let mut identifications = Vec::new();
    let mut skipped = 0;
    for (line, row) in rdr.deserialize::<IdentificationRow>().enumerate() {
        let row = row.with_context(|| format!("Malformed identification on line {}", line + 2))?;
        let file = match files.iter().position(|f| f.name == row.file) {
            Some(file) => file,
            None => {
                skipped += 1;
                continue;
            }
        };
        identifications.push(Identification {
            file,
            base_sequence: row.base_sequence,
            modified_sequence: row.modified_sequence,
            monoisotopic_mass: row.monoisotopic_mass,
            peakfinding_mass: 0.0,
            ms2_retention_time: row.ms2_retention_time,
            precursor_charge: row.precursor_charge,
            protein_groups: row
                .protein_groups
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            formula: None,
            score: row.score,
            q_value: row.q_value,
            posterior_error_probability: row.posterior_error_probability,
            decoy: row.decoy,
            use_for_quant: row.use_for_quant,
        });
    }
    if skipped > 0 {
        log::warn!("skipped {} identifications from runs that are not listed", skipped);
    }
    Ok(identifications)
}
