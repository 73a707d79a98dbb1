use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed address: {0:?} does not match <experiment>_<well>[T####][F###][L##][A##][Z###][C##]<suffix>.<extension>")]
    MalformedAddress(String),

    #[error("directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("destination already exists, but is not a directory: {}", .0.display())]
    DestinationConflict(PathBuf),

    #[error("out of bounds: {what} at (row {row}, col {col}) with extent {extent_rows}x{extent_cols} exceeds raster of {rows}x{cols}")]
    OutOfBounds {
        what: &'static str,
        row: i64,
        col: i64,
        extent_rows: usize,
        extent_cols: usize,
        rows: usize,
        cols: usize,
    },

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("unsupported pixel format in {}: {format}", .path.display())]
    UnsupportedPixelFormat { path: PathBuf, format: String },

    #[error("invalid npy file {}: {reason}", .path.display())]
    InvalidNpy { path: PathBuf, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("segmentation model failed: {0}")]
    Model(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("npy read error: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error("npy write error: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error("npz read error: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    #[error("npz write error: {0}")]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

impl PipelineError {
    /// Errors that invalidate the whole run rather than a single item.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingDirectory(_) | PipelineError::DestinationConflict(_)
        )
    }
}
