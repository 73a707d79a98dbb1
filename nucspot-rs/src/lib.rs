//! Nuclear spot positioning for multi-channel, multi-z microscopy plates.
//!
//! Stages communicate only through address-encoded files: raw z-planes are
//! projected, nuclei are segmented and split into masks, cells are cropped to
//! their nucleus and detected spots are joined into CSV rows.

pub mod address;
pub mod batch;
pub mod context;
pub mod crop;
pub mod error;
pub mod mask;
pub mod masks;
pub mod npy;
pub mod paths;
pub mod pattern;
pub mod plan;
pub mod projection;
pub mod raster;
pub mod segment;
pub mod spot;

pub use error::{PipelineError, Result};
