//! Masks: split a nuclear segmentation into one mask and one distance
//! transform per nucleus.

use clap::Args;
use std::path::{Path, PathBuf};

use crate::address::{Address, Suffix, SuffixPart};
use crate::context::{run_items, BatchOutcome, RunContext};
use crate::error::{PipelineError, Result};
use crate::mask::{distance_transform, split_labels};
use crate::paths;
use crate::raster::{self, Raster};

#[derive(Args, Clone)]
pub struct MasksArgs {
    #[arg(long, help = "Root the segmentations are relative to")]
    pub source_directory: PathBuf,
    #[arg(long, help = "Root directory for nuclear masks and distance transforms")]
    pub destination: PathBuf,
    #[arg(help = "`_nuclear_segmentation.npy` label rasters")]
    pub inputs: Vec<PathBuf>,
}

/// `(mask, distance transform)` addresses for nucleus `index` of a segmentation.
pub fn nucleus_addresses(segmentation: &Address, index: u32) -> (Address, Address) {
    let mask = segmentation
        .with_suffix(Suffix::new(vec![SuffixPart::NuclearMask(index)]))
        .with_extension("npz");
    let distance = segmentation
        .with_suffix(Suffix::new(vec![SuffixPart::DistanceTransform(index)]))
        .with_extension("npy");
    (mask, distance)
}

/// Write every nucleus of one segmentation. Returns the number of nuclei.
pub fn split_file(path: &Path, source_root: &Path, destination_root: &Path) -> Result<usize> {
    let address = Address::from_path(path)?;
    let labels = raster::read_npy(path)?.into_labels().ok_or_else(|| {
        PipelineError::UnsupportedPixelFormat {
            path: path.to_path_buf(),
            format: "labels must be an integer raster".to_string(),
        }
    })?;
    let nuclei = split_labels(&labels);
    let dir = paths::mirrored_dir(destination_root, source_root, path)?;
    for (label, nucleus) in &nuclei {
        if *label > 999 {
            return Err(PipelineError::InvalidArgument(format!(
                "label {label} does not fit the three-digit nucleus index"
            )));
        }
        let (mask_address, distance_address) = nucleus_addresses(&address, *label);
        nucleus.write(&dir.join(mask_address.file_name()))?;
        let distance = distance_transform(&nucleus.mask);
        raster::write_npy(&dir.join(distance_address.file_name()), &Raster::F64(distance))?;
    }
    log::debug!("{}: {} nuclei", path.display(), nuclei.len());
    Ok(nuclei.len())
}

pub fn run(args: MasksArgs, ctx: &RunContext<'_>) -> Result<BatchOutcome> {
    let source_root = paths::source_root(&args.source_directory)?;
    paths::ensure_dir(&args.destination)?;
    run_items(
        ctx,
        "masks",
        &args.inputs,
        |p| p.display().to_string(),
        |path| split_file(path, &source_root, &args.destination).map(|_| ()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::NuclearMask;
    use ndarray::array;

    #[test]
    fn nucleus_names_replace_the_segmentation_tag() {
        let seg = Address::parse("384_B07T0001F007L01_nuclear_segmentation.npy").unwrap();
        let (mask, distance) = nucleus_addresses(&seg, 7);
        assert_eq!(mask.file_name(), "384_B07T0001F007L01_nuclear_mask_007.npz");
        assert_eq!(distance.file_name(), "384_B07T0001F007L01_distance_transform_007.npy");
    }

    #[test]
    fn writes_one_mask_and_distance_per_label() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let path = src.path().join("384_B07T0001F007L01_nuclear_segmentation.npy");
        let labels = array![
            [0u32, 0, 0, 0, 0, 0],
            [0, 1, 1, 1, 0, 0],
            [0, 1, 1, 1, 0, 2],
            [0, 1, 1, 1, 0, 0],
        ];
        raster::write_npy(&path, &Raster::U32(labels)).unwrap();

        assert_eq!(split_file(&path, src.path(), dst.path()).unwrap(), 2);

        let first = NuclearMask::read(&dst.path().join("384_B07T0001F007L01_nuclear_mask_001.npz")).unwrap();
        assert_eq!(first.offset, (1, 1));
        assert_eq!(first.area(), 9);
        let Raster::F64(distance) =
            raster::read_npy(&dst.path().join("384_B07T0001F007L01_distance_transform_001.npy")).unwrap()
        else {
            panic!("distance transforms are f64");
        };
        assert_eq!(distance.dim(), (3, 3));
        assert_eq!(distance[(1, 1)], 2.0);
        assert_eq!(distance[(0, 0)], 1.0);

        let second = NuclearMask::read(&dst.path().join("384_B07T0001F007L01_nuclear_mask_002.npz")).unwrap();
        assert_eq!(second.offset, (2, 5));
        assert_eq!(second.mask, array![[true]]);
    }

    #[test]
    fn float_rasters_are_not_labels() {
        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("384_B07T0001F007L01_nuclear_segmentation.npy");
        raster::write_npy(&path, &Raster::F64(array![[0.5]])).unwrap();
        assert!(matches!(
            split_file(&path, src.path(), src.path()),
            Err(PipelineError::UnsupportedPixelFormat { .. })
        ));
    }
}
