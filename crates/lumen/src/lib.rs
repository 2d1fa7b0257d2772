pub mod alignment;
pub mod engine;
pub mod envelope;
pub mod fdr;
pub mod index;
pub mod isotopes;
pub mod mass;
pub mod mbr;
pub mod ml;
pub mod peak;
pub mod reconcile;
pub mod results;
pub mod scoring;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("spill file error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("no spectra files were supplied")]
    NoFiles,
    #[error("no identifications were supplied")]
    NoIdentifications,
    #[error("{file}: run contains no MS1 peaks")]
    EmptyRun { file: String },
    #[error("peak index is neither loaded nor spilled")]
    IndexNotLoaded,
    #[error("spilled peak index {path:?} is corrupt")]
    CorruptIndex { path: PathBuf },
    #[error("{file}: {message}")]
    Source { file: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
