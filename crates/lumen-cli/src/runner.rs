use super::input::{read_identifications, Quant};
use super::scans::JsonScans;
use anyhow::Context;
use log::info;
use lumen_core::engine::Engine;
use lumen_core::peak::DetectionType;
use lumen_core::results::LfqResults;
use std::path::PathBuf;
use std::time::Instant;

pub struct Runner {
    pub parameters: Quant,
    start: Instant,
}

impl Runner {
    pub fn new(parameters: Quant) -> anyhow::Result<Self> {
        Ok(Self {
            parameters,
            start: Instant::now(),
        })
    }

    // Create a path for `file_name` in the specified output directory
    pub(crate) fn make_path<S: AsRef<str>>(&self, file_name: S) -> PathBuf {
        self.parameters.output_directory.join(file_name.as_ref())
    }

    fn quantify(&self) -> anyhow::Result<LfqResults> {
        let identifications =
            read_identifications(&self.parameters.identifications, &self.parameters.files)?;
        info!(
            "read {} identifications for {} runs",
            identifications.len(),
            self.parameters.files.len()
        );

        let mut engine = Engine::new(
            self.parameters.settings.clone(),
            self.parameters.files.clone(),
            identifications,
        )
        .context("Failed to set up quantification")?;

        let source = JsonScans::new(&self.parameters.files, self.parameters.scan_paths.iter());
        let results = engine.run(&source)?;
        info!("- quant:   {:8} ms", self.start.elapsed().as_millis());
        Ok(results)
    }

    pub fn run(mut self) -> anyhow::Result<Quant> {
        let results = self.quantify()?;

        let count = |detection: DetectionType| {
            results
                .peptides
                .iter()
                .flat_map(|p| p.detections.iter())
                .filter(|&&d| d == detection)
                .count()
        };
        info!("quantified {} peptides", results.peptides.len());
        info!(
            "{} MS/MS detections, {} match-between-runs detections",
            count(DetectionType::Msms),
            count(DetectionType::Mbr)
        );

        log::trace!("writing outputs");
        let peaks = self.write_peaks(&results)?;
        self.parameters.output_paths.push(peaks);
        let quant = self.write_quant(&results)?;
        self.parameters.output_paths.push(quant);

        let path = self.make_path("results.json");
        self.parameters.output_paths.push(path.display().to_string());
        println!("{}", serde_json::to_string_pretty(&self.parameters)?);

        let bytes = serde_json::to_vec_pretty(&self.parameters)?;
        std::fs::write(&path, bytes)?;

        info!("finished in {}s", self.start.elapsed().as_secs());
        Ok(self.parameters)
    }
}
