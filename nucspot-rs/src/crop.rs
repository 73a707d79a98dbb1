//! Crop: cut each nucleus out of a projected raster and normalise it.
//!
//! Intensity images (TIFF projections) are rescaled so the darkest pixel in
//! the nucleus maps to 0 and the brightest to 1. Derived rasters such as the
//! z-center are only masked, keeping their stored precision.

use clap::Args;
use ndarray::{s, Array2, ArrayView2};
use std::path::{Path, PathBuf};

use crate::address::Address;
use crate::context::{run_items, BatchOutcome, RunContext};
use crate::error::{PipelineError, Result};
use crate::mask::NuclearMask;
use crate::paths;
use crate::raster::{self, Raster};

#[derive(Args, Clone)]
pub struct CropArgs {
    #[arg(long, help = "Root directory for cropped cell rasters")]
    pub destination: PathBuf,
    #[arg(long, help = "Root the source images are relative to")]
    pub source_images_dir: PathBuf,
    #[arg(long, help = "Root the nuclear masks are relative to")]
    pub source_masks_dir: PathBuf,
    #[arg(help = "Alternating image and mask paths: IMAGE MASK [IMAGE MASK ...]")]
    pub pairs: Vec<PathBuf>,
}

fn masked<T: Copy>(rect: ArrayView2<'_, T>, mask: &Array2<bool>, zero: T) -> Array2<T> {
    let mut out = rect.to_owned();
    out.zip_mut_with(mask, |v, &inside| {
        if !inside {
            *v = zero;
        }
    });
    out
}

fn rescale_in_mask(rect: ArrayView2<'_, f64>, mask: &Array2<bool>) -> Result<Array2<f64>> {
    let (lo, hi) = rect
        .iter()
        .zip(mask.iter())
        .filter(|&(_, &inside)| inside)
        .fold(None, |acc: Option<(f64, f64)>, (&v, _)| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
        .ok_or_else(|| PipelineError::EmptyInput("nuclear mask has no pixels".to_string()))?;
    let range = hi - lo;
    let scaled = rect.mapv(|v| {
        if range > 0.0 {
            ((v - lo) / range).clamp(0.0, 1.0)
        } else {
            0.0
        }
    });
    Ok(masked(scaled.view(), mask, 0.0))
}

/// Crop `image` to `mask`'s rectangle, optionally rescale, and zero everything
/// outside the nucleus.
pub fn crop_and_mask(image: &Raster, mask: &NuclearMask, is_intensity_image: bool) -> Result<Raster> {
    let (rows, cols) = image.dim();
    let (mask_rows, mask_cols) = mask.dim();
    let (row, col) = mask.offset;
    if row + mask_rows > rows || col + mask_cols > cols {
        return Err(PipelineError::OutOfBounds {
            what: "crop rectangle",
            row: row as i64,
            col: col as i64,
            extent_rows: mask_rows,
            extent_cols: mask_cols,
            rows,
            cols,
        });
    }
    let window = s![row..row + mask_rows, col..col + mask_cols];
    if is_intensity_image {
        let rect = match image {
            Raster::U16(a) => a.slice(window).mapv(f64::from),
            Raster::U32(a) => a.slice(window).mapv(f64::from),
            Raster::F16(a) => a.slice(window).mapv(|v| v.to_f64()),
            Raster::F64(a) => a.slice(window).to_owned(),
        };
        return Ok(Raster::F64(rescale_in_mask(rect.view(), &mask.mask)?));
    }
    Ok(match image {
        Raster::U16(a) => Raster::U16(masked(a.slice(window), &mask.mask, 0)),
        Raster::U32(a) => Raster::U32(masked(a.slice(window), &mask.mask, 0)),
        Raster::F16(a) => Raster::F16(masked(a.slice(window), &mask.mask, half::f16::ZERO)),
        Raster::F64(a) => Raster::F64(masked(a.slice(window), &mask.mask, 0.0)),
    })
}

/// `<image address><mask suffix>` with the image's own suffix kept in front.
pub fn cropped_address(image: &Address, mask: &Address) -> Address {
    image
        .with_suffix(image.suffix.concat(&mask.suffix))
        .with_extension("npy")
}

/// Crops of consecutive pairs usually share an image; keep the last one loaded.
#[derive(Default)]
pub struct ImageCache {
    last: Option<(PathBuf, Raster)>,
}

impl ImageCache {
    pub fn load(&mut self, path: &Path) -> Result<&Raster> {
        let hit = matches!(&self.last, Some((cached, _)) if cached == path);
        if !hit {
            self.last = Some((path.to_path_buf(), raster::read_raster(path)?));
        }
        match &self.last {
            Some((_, raster)) => Ok(raster),
            None => Err(PipelineError::EmptyInput(path.display().to_string())),
        }
    }
}

pub fn crop_pair(
    cache: &mut ImageCache,
    image_path: &Path,
    mask_path: &Path,
    images_root: &Path,
    destination_root: &Path,
) -> Result<PathBuf> {
    let image_address = Address::from_path(image_path)?;
    let mask_address = Address::from_path(mask_path)?;
    let mask = NuclearMask::read(mask_path)?;
    let image = cache.load(image_path)?;
    let is_intensity_image = image_address.extension == "tif";
    let cropped = crop_and_mask(image, &mask, is_intensity_image)?;
    let dir = paths::mirrored_dir(destination_root, images_root, image_path)?;
    let out = dir.join(cropped_address(&image_address, &mask_address).file_name());
    raster::write_npy(&out, &cropped)?;
    Ok(out)
}

pub fn run(args: CropArgs, ctx: &RunContext<'_>) -> Result<BatchOutcome> {
    if args.pairs.len() % 2 != 0 {
        return Err(PipelineError::InvalidArgument(format!(
            "expected IMAGE MASK pairs, got {} paths",
            args.pairs.len()
        )));
    }
    let images_root = paths::source_root(&args.source_images_dir)?;
    paths::source_root(&args.source_masks_dir)?;
    paths::ensure_dir(&args.destination)?;
    let pairs: Vec<(PathBuf, PathBuf)> = args
        .pairs
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    let mut cache = ImageCache::default();
    run_items(
        ctx,
        "crop",
        &pairs,
        |(image, mask)| format!("{} x {}", image.display(), mask.display()),
        |(image, mask)| {
            crop_pair(&mut cache, image, mask, &images_root, &args.destination).map(|_| ())
        },
    )
}
