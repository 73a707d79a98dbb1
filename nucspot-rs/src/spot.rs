//! Spot: join detected spot coordinates against the z-center crop and the
//! nuclear distance transform, producing one CSV row per spot.
//!
//! Spot files are 1-D f64 `.npy` arrays, `[y, x]` or
//! `[y, x, area, eccentricity, solidity]`, in the coordinate frame of the
//! nucleus crop they were detected on. Their suffix carries the nucleus and
//! spot index, e.g. `_maximum_projection_nuclear_mask_007_3`.

use clap::Args;
use ndarray::Array1;
use ndarray_npy::ReadNpyExt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::address::{Address, Field, Suffix, SuffixPart};
use crate::context::{run_items, BatchOutcome, RunContext};
use crate::error::{PipelineError, Result};
use crate::mask::NuclearMask;
use crate::paths;
use crate::raster::{self, Raster};

#[derive(Args, Clone)]
pub struct SpotArgs {
    #[arg(long, help = "Root the spot files are relative to")]
    pub source_directory: PathBuf,
    #[arg(long, help = "Root holding the cropped z-center rasters")]
    pub z_centers: PathBuf,
    #[arg(long, help = "Root holding the per-nucleus distance transforms")]
    pub distance_transforms: PathBuf,
    #[arg(long, help = "Root holding the nuclear masks (adds mask offset columns)")]
    pub masks: Option<PathBuf>,
    #[arg(long, help = "Root directory for per-spot CSV files")]
    pub destination: PathBuf,
    #[arg(help = "Spot .npy files")]
    pub spots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotShape {
    pub area: f64,
    pub eccentricity: f64,
    pub solidity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotDetection {
    pub y: f64,
    pub x: f64,
    pub shape: Option<SpotShape>,
}

impl SpotDetection {
    pub fn read(path: &Path) -> Result<Self> {
        let values = Array1::<f64>::read_npy(fs::File::open(path)?)?;
        match values.as_slice() {
            Some(&[y, x]) => Ok(SpotDetection { y, x, shape: None }),
            Some(&[y, x, area, eccentricity, solidity]) => Ok(SpotDetection {
                y,
                x,
                shape: Some(SpotShape {
                    area,
                    eccentricity,
                    solidity,
                }),
            }),
            _ => Err(PipelineError::InvalidNpy {
                path: path.to_path_buf(),
                reason: format!("expected 2 or 5 values, got {}", values.len()),
            }),
        }
    }
}

/// Nearest pixel to a sub-pixel coordinate. Halves round to even, so 2.5 -> 2
/// and 3.5 -> 4.
pub fn pixel_center(y: f64, x: f64) -> Result<(usize, usize)> {
    let (row, col) = (y.round_ties_even(), x.round_ties_even());
    if !(row >= 0.0 && col >= 0.0) {
        return Err(PipelineError::OutOfBounds {
            what: "spot pixel",
            row: row as i64,
            col: col as i64,
            extent_rows: 1,
            extent_cols: 1,
            rows: 0,
            cols: 0,
        });
    }
    Ok((row as usize, col as usize))
}

fn sample(raster: &Raster, what: &'static str, (row, col): (usize, usize)) -> Result<f64> {
    raster.get_f64(row, col).ok_or_else(|| {
        let (rows, cols) = raster.dim();
        PipelineError::OutOfBounds {
            what,
            row: row as i64,
            col: col as i64,
            extent_rows: 1,
            extent_cols: 1,
            rows,
            cols,
        }
    })
}

/// One CSV row.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotRecord {
    pub filename: String,
    pub experiment: String,
    pub well: String,
    pub field: Option<u32>,
    pub channel: Option<u32>,
    pub nucleus_index: u32,
    pub spot_index: u32,
    pub center_x: f64,
    pub center_y: f64,
    pub center_z: f64,
    pub center_r: f64,
    pub shape: Option<SpotShape>,
    /// `(row, col)` of the nucleus crop in the full image.
    pub mask_offset: Option<(usize, usize)>,
}

fn indices(address: &Address) -> Result<(u32, u32)> {
    match (address.suffix.nucleus_index(), address.suffix.spot_index()) {
        (Some(nucleus), Some(spot)) => Ok((nucleus, spot)),
        _ => Err(PipelineError::MalformedAddress(format!(
            "{}: suffix carries no nucleus and spot index",
            address.file_name()
        ))),
    }
}

pub fn extract(
    address: &Address,
    spot: &SpotDetection,
    z_center: &Raster,
    distance: &Raster,
    mask: Option<&NuclearMask>,
) -> Result<SpotRecord> {
    let (nucleus_index, spot_index) = indices(address)?;
    let pixel = pixel_center(spot.y, spot.x)?;
    Ok(SpotRecord {
        filename: address.file_name(),
        experiment: address.experiment.clone(),
        well: address.well.clone(),
        field: address.f,
        channel: address.c,
        nucleus_index,
        spot_index,
        center_x: spot.x,
        center_y: spot.y,
        center_z: sample(z_center, "z-center lookup", pixel)?,
        center_r: sample(distance, "distance transform lookup", pixel)?,
        shape: spot.shape,
        mask_offset: mask.map(|m| m.offset),
    })
}

impl SpotRecord {
    fn columns(&self) -> Vec<(&'static str, String)> {
        let optional = |v: Option<u32>| v.map(|v| v.to_string()).unwrap_or_default();
        let mut columns = vec![
            ("filename", self.filename.clone()),
            ("experiment", self.experiment.clone()),
            ("well", self.well.clone()),
            ("field", optional(self.field)),
            ("channel", optional(self.channel)),
            ("nucleus_index", format!("{:03}", self.nucleus_index)),
            ("spot_index", self.spot_index.to_string()),
            ("center_x", self.center_x.to_string()),
            ("center_y", self.center_y.to_string()),
            ("center_z", self.center_z.to_string()),
            ("center_r", self.center_r.to_string()),
        ];
        if let Some(shape) = self.shape {
            columns.push(("area", shape.area.to_string()));
            columns.push(("eccentricity", shape.eccentricity.to_string()));
            columns.push(("solidity", shape.solidity.to_string()));
        }
        if let Some((row, col)) = self.mask_offset {
            columns.push(("nuclear_mask_offset_x", col.to_string()));
            columns.push(("nuclear_mask_offset_y", row.to_string()));
        }
        columns
    }

    /// Write a header row and this record.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let columns = self.columns();
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(columns.iter().map(|(k, _)| *k))?;
        writer.write_record(columns.iter().map(|(_, v)| v.as_str()))?;
        writer.flush()?;
        Ok(())
    }
}

/// Files a spot is joined against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Siblings {
    pub z_center: PathBuf,
    pub distance_transform: PathBuf,
    pub mask: Option<PathBuf>,
}

pub struct Roots<'a> {
    pub spots: &'a Path,
    pub z_centers: &'a Path,
    pub distance_transforms: &'a Path,
    pub masks: Option<&'a Path>,
}

/// Sibling names are derived from the spot's address: the z-center crop keeps
/// every field and any source suffix, while transforms and masks come from a
/// segmentation that has no action or channel token.
pub fn sibling_addresses(spot: &Address) -> Result<(Address, Address, Address)> {
    let (nucleus, _) = indices(spot)?;
    let source = match spot.suffix.parts() {
        [head @ .., SuffixPart::MaximumProjection, SuffixPart::NuclearMask(_), SuffixPart::Spot { .. }] => head,
        [head @ .., SuffixPart::NuclearMask(_), SuffixPart::Spot { .. }] => head,
        _ => {
            return Err(PipelineError::MalformedAddress(format!(
                "{}: suffix does not end in a nucleus and spot index",
                spot.file_name()
            )))
        }
    };
    let z_center = spot
        .with_suffix(
            Suffix::new(source.to_vec())
                .with(SuffixPart::ZCenter)
                .with(SuffixPart::NuclearMask(nucleus)),
        )
        .with_extension("npy");
    let nucleus_base = spot.without(&[Field::A, Field::C]);
    let distance = nucleus_base
        .with_suffix(Suffix::new(vec![SuffixPart::DistanceTransform(nucleus)]))
        .with_extension("npy");
    let mask = nucleus_base
        .with_suffix(Suffix::new(vec![SuffixPart::NuclearMask(nucleus)]))
        .with_extension("npz");
    Ok((z_center, distance, mask))
}

pub fn resolve_siblings(spot_path: &Path, roots: &Roots<'_>) -> Result<Siblings> {
    let address = Address::from_path(spot_path)?;
    let (z_center, distance, mask) = sibling_addresses(&address)?;
    let relative = paths::relative_parent(roots.spots, spot_path);
    Ok(Siblings {
        z_center: roots.z_centers.join(&relative).join(z_center.file_name()),
        distance_transform: roots
            .distance_transforms
            .join(&relative)
            .join(distance.file_name()),
        mask: roots.masks.map(|root| root.join(&relative).join(mask.file_name())),
    })
}

pub fn join_file(spot_path: &Path, roots: &Roots<'_>, destination_root: &Path) -> Result<PathBuf> {
    let address = Address::from_path(spot_path)?;
    let siblings = resolve_siblings(spot_path, roots)?;
    let spot = SpotDetection::read(spot_path)?;
    let z_center = raster::read_npy(&siblings.z_center)?;
    let distance = raster::read_npy(&siblings.distance_transform)?;
    let mask = siblings.mask.as_deref().map(NuclearMask::read).transpose()?;
    let record = extract(&address, &spot, &z_center, &distance, mask.as_ref())?;
    let dir = paths::mirrored_dir(destination_root, roots.spots, spot_path)?;
    let out = dir.join(format!("{}.csv", address.stem()));
    record.write_csv(&out)?;
    Ok(out)
}

pub fn run(args: SpotArgs, ctx: &RunContext<'_>) -> Result<BatchOutcome> {
    let spots = paths::source_root(&args.source_directory)?;
    let z_centers = paths::source_root(&args.z_centers)?;
    let distance_transforms = paths::source_root(&args.distance_transforms)?;
    let masks = args.masks.as_deref().map(paths::source_root).transpose()?;
    paths::ensure_dir(&args.destination)?;
    let roots = Roots {
        spots: &spots,
        z_centers: &z_centers,
        distance_transforms: &distance_transforms,
        masks: masks.as_deref(),
    };
    run_items(
        ctx,
        "spot",
        &args.spots,
        |p| p.display().to_string(),
        |path| join_file(path, &roots, &args.destination).map(|_| ()),
    )
}
