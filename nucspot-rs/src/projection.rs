//! Projection: flatten a z-stack into a maximum-intensity projection and a
//! per-pixel intensity-weighted z-centroid.
//!
//! Slices are streamed once; only the running maximum, intensity sum and
//! z-weighted sum are held in memory.

use clap::Args;
use half::f16;
use ndarray::{Array2, Zip};
use std::path::{Path, PathBuf};

use crate::address::{Address, Field, SuffixPart};
use crate::context::{display_label, run_items, BatchOutcome, RunContext};
use crate::error::{PipelineError, Result};
use crate::paths;
use crate::pattern::{find_matches, Glob};
use crate::raster::{self, Raster};

#[derive(Args, Clone)]
pub struct ProjectionArgs {
    #[arg(long, help = "Root directory holding the raw z-plane TIFFs")]
    pub source_directory: PathBuf,
    #[arg(long, help = "Root directory for projections and z-centers")]
    pub destination: PathBuf,
    #[arg(help = "Globs, one per z-stack, relative to the source directory (z as Z???)")]
    pub patterns: Vec<String>,
}

/// One plane of a z-stack.
#[derive(Debug, Clone)]
pub struct ZSlice {
    pub raster: Array2<u16>,
    pub z: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub maximum: Array2<u16>,
    pub z_center: Array2<f16>,
}

/// Fold a lazy sequence of slices into a projection.
///
/// Pixels with no signal anywhere in the stack get a z-center of 0.
pub fn project<I>(slices: I) -> Result<Projection>
where
    I: IntoIterator<Item = Result<ZSlice>>,
{
    let mut acc: Option<(Array2<u16>, Array2<f64>, Array2<f64>)> = None;
    for slice in slices {
        let ZSlice { raster, z } = slice?;
        let (maximum, sum, weighted) = acc.get_or_insert_with(|| {
            let dim = raster.dim();
            (Array2::zeros(dim), Array2::zeros(dim), Array2::zeros(dim))
        });
        if raster.dim() != maximum.dim() {
            return Err(PipelineError::ShapeMismatch {
                expected: maximum.dim(),
                actual: raster.dim(),
            });
        }
        let z = z as f64;
        Zip::from(maximum)
            .and(sum)
            .and(weighted)
            .and(&raster)
            .for_each(|m, s, w, &v| {
                *m = (*m).max(v);
                *s += v as f64;
                *w += v as f64 * z;
            });
    }
    let (maximum, sum, weighted) =
        acc.ok_or_else(|| PipelineError::EmptyInput("z-stack has no slices".to_string()))?;
    let z_center = Zip::from(&sum).and(&weighted).map_collect(|&s, &w| {
        if s == 0.0 {
            f16::ZERO
        } else {
            f16::from_f64(w / s)
        }
    });
    Ok(Projection { maximum, z_center })
}

/// Destination addresses for a stack: `z` cleared, stage tag appended.
pub fn output_addresses(plane: &Address) -> (Address, Address) {
    let base = plane.without(&[Field::Z]);
    let maximum = base
        .with_suffix(base.suffix.with(SuffixPart::MaximumProjection))
        .with_extension("tif");
    let z_center = base
        .with_suffix(base.suffix.with(SuffixPart::ZCenter))
        .with_extension("npy");
    (maximum, z_center)
}

/// Project every plane matching `pattern` under `source_root` and write the two
/// outputs into the mirrored directory under `destination_root`.
pub fn project_pattern(source_root: &Path, pattern: &str, destination_root: &Path) -> Result<(PathBuf, PathBuf)> {
    let glob = Glob::new(pattern)?;
    let mut planes: Vec<(PathBuf, Address)> = Vec::new();
    for path in find_matches(&glob, source_root)? {
        let path = path?;
        let address = Address::from_path(&path)?;
        if address.z.is_none() {
            return Err(PipelineError::MalformedAddress(format!(
                "{}: no z-plane token",
                path.display()
            )));
        }
        planes.push((path, address));
    }
    let Some((first_path, first)) = planes.first().cloned() else {
        return Err(PipelineError::EmptyInput(format!("no planes match {pattern}")));
    };
    let stack = first.without(&[Field::Z]);
    if let Some((path, _)) = planes.iter().find(|(_, a)| a.without(&[Field::Z]) != stack) {
        return Err(PipelineError::InvalidArgument(format!(
            "{} does not belong to the stack of {}",
            path.display(),
            first_path.display()
        )));
    }

    let projection = project(planes.iter().map(|(path, address)| {
        Ok(ZSlice {
            raster: raster::read_tiff(path)?,
            z: address.z.unwrap_or_default(),
        })
    }))?;

    let dir = paths::mirrored_dir(destination_root, source_root, &first_path)?;
    let (maximum_address, z_center_address) = output_addresses(&first);
    let maximum_path = dir.join(maximum_address.file_name());
    let z_center_path = dir.join(z_center_address.file_name());
    raster::write_tiff(&maximum_path, projection.maximum.view())?;
    raster::write_npy(&z_center_path, &Raster::F16(projection.z_center))?;
    log::debug!(
        "projected {} planes into {}",
        planes.len(),
        maximum_path.display()
    );
    Ok((maximum_path, z_center_path))
}

pub fn run(args: ProjectionArgs, ctx: &RunContext<'_>) -> Result<BatchOutcome> {
    let source_root = paths::source_root(&args.source_directory)?;
    paths::ensure_dir(&args.destination)?;
    run_items(ctx, "project", &args.patterns, display_label, |pattern| {
        project_pattern(&source_root, pattern, &args.destination).map(|_| ())
    })
}
