use fnv::FnvHashMap;
use lumen_core::engine::{Ms1Source, SpectraFile};
use lumen_core::index::Ms1Scan;
use lumen_core::{Error, Result};
use std::io::BufReader;
use std::path::PathBuf;

/// MS1 scans stored as one JSON array of [`Ms1Scan`] per run. Files are read
/// on demand, so only the runs currently being indexed are held in memory
pub struct JsonScans {
    paths: FnvHashMap<String, PathBuf>,
}

impl JsonScans {
    pub fn new<P: Into<PathBuf>>(files: &[SpectraFile], paths: impl IntoIterator<Item = P>) -> Self {
        let paths = files
            .iter()
            .map(|f| f.name.clone())
            .zip(paths.into_iter().map(Into::into))
            .collect();
        JsonScans { paths }
    }
}

impl Ms1Source for JsonScans {
    fn scans(&self, file: &SpectraFile) -> Result<Vec<Ms1Scan>> {
        let path = self.paths.get(&file.name).ok_or_else(|| Error::Source {
            file: file.name.clone(),
            message: "no scan file was listed".into(),
        })?;
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut scans: Vec<Ms1Scan> = serde_json::from_reader(reader)?;

        if scans.iter().any(|s| s.mz.len() != s.intensity.len()) {
            return Err(Error::Source {
                file: file.name.clone(),
                message: "m/z and intensity arrays differ in length".into(),
            });
        }
        scans.sort_by(|a, b| a.retention_time.total_cmp(&b.retention_time));
        log::trace!("{}: read {} MS1 scans from {}", file.name, scans.len(), path.display());
        Ok(scans)
    }
}
