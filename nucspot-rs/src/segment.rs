//! Segment: label nuclei in a projected nuclear-channel image.
//!
//! Pipeline per image:
//!   1. Rescale so the nominal nucleus diameter maps to the model's 30 px.
//!   2. Cellpose (ONNX) inference via cellpose-rs: integer label image.
//!   3. Resize labels back to the source shape (nearest neighbour).
//!   4. Grow every label by one pixel, then drop labels touching the border.
//!   Write the labels as `<addr>_nuclear_segmentation.npy` with a, z, c cleared.

use cellpose_rs::{CellposeSession, SegmentParams};
use clap::{ArgAction, Args};
use image::{imageops, ImageBuffer, Luma};
use ndarray::{Array2, ArrayView2};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::address::{Address, Field, Suffix, SuffixPart};
use crate::context::{run_items, BatchOutcome, RunContext};
use crate::error::{PipelineError, Result};
use crate::paths;
use crate::raster::{self, Raster};

/// Object diameter, in pixels, the nuclei model was trained on.
const MODEL_DIAMETER: f64 = 30.0;

#[derive(Args, Clone)]
pub struct SegmentArgs {
    #[arg(long, help = "Root the projected images are relative to")]
    pub source_directory: PathBuf,
    #[arg(long, help = "Root directory for nuclear segmentations")]
    pub destination: PathBuf,
    #[arg(long, help = "Path to model directory containing model.onnx")]
    pub model: PathBuf,
    #[arg(long, default_value_t = 100, help = "Nominal nucleus diameter in pixels")]
    pub diameter: u32,
    #[arg(long = "no-invert", action = ArgAction::SetFalse, help = "Skip inverting intensities before inference")]
    pub invert: bool,
    #[arg(long, default_value_t = 1, help = "Batch size for ONNX inference (256x256 tiles per forward pass)")]
    pub batch_size: usize,
    #[arg(long, help = "Force CPU (skip CUDA)")]
    pub cpu: bool,
    #[arg(help = "Maximum projection TIFFs of the nuclear channel")]
    pub inputs: Vec<PathBuf>,
}

/// Image in, label raster out (background 0).
pub trait NuclearSegmenter {
    fn segment(&mut self, image: ArrayView2<'_, f32>, diameter: u32) -> Result<Array2<u32>>;
}

pub struct CellposeSegmenter {
    session: CellposeSession,
    batch_size: usize,
    invert: bool,
}

impl CellposeSegmenter {
    pub fn new(model_dir: &Path, cpu: bool, batch_size: usize, invert: bool) -> Result<Self> {
        let model_file = model_dir.join("model.onnx");
        if !model_file.exists() {
            return Err(PipelineError::InvalidArgument(format!(
                "model not found at {}",
                model_file.display()
            )));
        }
        let session =
            CellposeSession::new(&model_file, cpu).map_err(|e| PipelineError::Model(e.to_string()))?;
        Ok(CellposeSegmenter {
            session,
            batch_size,
            invert,
        })
    }
}

impl NuclearSegmenter for CellposeSegmenter {
    fn segment(&mut self, image: ArrayView2<'_, f32>, diameter: u32) -> Result<Array2<u32>> {
        let (rows, cols) = image.dim();
        let scaled = rescale_for_model(image, diameter)?;
        let (h, w) = scaled.dim();
        let mut plane: Vec<f32> = scaled.iter().copied().collect();
        if self.invert {
            let hi = plane.iter().copied().fold(f32::MIN, f32::max);
            let lo = plane.iter().copied().fold(f32::MAX, f32::min);
            plane.iter_mut().for_each(|v| *v = hi + lo - *v);
        }
        let chw = cellpose_rs::preprocess::build_chw_image(plane.clone(), plane, h, w);
        let params = SegmentParams {
            batch_size: self.batch_size,
            ..Default::default()
        };
        let labels = self
            .session
            .segment(&chw, h, w, params)
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let labels = Array2::from_shape_vec((h, w), labels)?;
        Ok(resize_nearest(labels.view(), rows, cols))
    }
}

/// Resize so an object of `diameter` pixels becomes `MODEL_DIAMETER` pixels.
fn rescale_for_model(image: ArrayView2<'_, f32>, diameter: u32) -> Result<Array2<f32>> {
    if diameter == 0 {
        return Err(PipelineError::InvalidArgument("diameter must be positive".to_string()));
    }
    let (rows, cols) = image.dim();
    let scale = MODEL_DIAMETER / diameter as f64;
    let new_rows = ((rows as f64 * scale).round() as u32).max(1);
    let new_cols = ((cols as f64 * scale).round() as u32).max(1);
    if new_rows as usize == rows && new_cols as usize == cols {
        return Ok(image.to_owned());
    }
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(cols as u32, rows as u32, image.iter().copied().collect())
            .ok_or_else(|| PipelineError::InvalidArgument(format!("cannot view {rows}x{cols} raster as an image")))?;
    let resized = imageops::resize(&buffer, new_cols, new_rows, imageops::FilterType::Triangle);
    Ok(Array2::from_shape_vec(
        (new_rows as usize, new_cols as usize),
        resized.into_raw(),
    )?)
}

/// Nearest-neighbour resize; labels must not be interpolated.
pub fn resize_nearest(labels: ArrayView2<'_, u32>, rows: usize, cols: usize) -> Array2<u32> {
    let (src_rows, src_cols) = labels.dim();
    if (src_rows, src_cols) == (rows, cols) {
        return labels.to_owned();
    }
    if src_rows == 0 || src_cols == 0 {
        return Array2::zeros((rows, cols));
    }
    let pick = |i: usize, from: usize, to: usize| {
        (((i as f64 + 0.5) * from as f64 / to as f64) as usize).min(from - 1)
    };
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        labels[(pick(r, src_rows, rows), pick(c, src_cols, cols))]
    })
}

/// Grow labels into background pixels within `distance` (4-connected steps).
/// Contested pixels go to the first labelled neighbour in up, down, left, right order.
pub fn expand_labels(labels: &Array2<u32>, distance: usize) -> Array2<u32> {
    let (rows, cols) = labels.dim();
    let mut current = labels.clone();
    for _ in 0..distance {
        let previous = current.clone();
        for ((r, c), out) in current.indexed_iter_mut() {
            if *out != 0 {
                continue;
            }
            let neighbours = [
                (r > 0).then(|| (r - 1, c)),
                (r + 1 < rows).then(|| (r + 1, c)),
                (c > 0).then(|| (r, c - 1)),
                (c + 1 < cols).then(|| (r, c + 1)),
            ];
            if let Some(label) = neighbours
                .into_iter()
                .flatten()
                .map(|idx| previous[idx])
                .find(|&l| l != 0)
            {
                *out = label;
            }
        }
    }
    current
}

/// Zero every label that has a pixel on the image border.
pub fn clear_border(labels: &Array2<u32>) -> Array2<u32> {
    let (rows, cols) = labels.dim();
    let touching: BTreeSet<u32> = labels
        .indexed_iter()
        .filter(|((r, c), l)| **l != 0 && (*r == 0 || *c == 0 || *r + 1 == rows || *c + 1 == cols))
        .map(|(_, &l)| l)
        .collect();
    labels.mapv(|l| if touching.contains(&l) { 0 } else { l })
}

pub fn segmentation_address(image: &Address) -> Address {
    image
        .without(&[Field::A, Field::Z, Field::C])
        .with_suffix(Suffix::new(vec![SuffixPart::NuclearSegmentation]))
        .with_extension("npy")
}

pub fn segment_file(
    segmenter: &mut dyn NuclearSegmenter,
    image_path: &Path,
    source_root: &Path,
    destination_root: &Path,
    diameter: u32,
) -> Result<PathBuf> {
    let address = Address::from_path(image_path)?;
    let image = raster::read_tiff(image_path)?.mapv(f32::from);
    let labels = segmenter.segment(image.view(), diameter)?;
    if labels.dim() != image.dim() {
        return Err(PipelineError::ShapeMismatch {
            expected: image.dim(),
            actual: labels.dim(),
        });
    }
    let filtered = clear_border(&expand_labels(&labels, 1));
    let dir = paths::mirrored_dir(destination_root, source_root, image_path)?;
    let out = dir.join(segmentation_address(&address).file_name());
    raster::write_npy(&out, &Raster::U32(filtered))?;
    Ok(out)
}

pub fn run(args: SegmentArgs, ctx: &RunContext<'_>) -> Result<BatchOutcome> {
    let source_root = paths::source_root(&args.source_directory)?;
    paths::ensure_dir(&args.destination)?;
    let mut segmenter = CellposeSegmenter::new(&args.model, args.cpu, args.batch_size, args.invert)?;
    log::info!(
        "[{}] segmenting {} images at diameter {}",
        ctx.run_id,
        args.inputs.len(),
        args.diameter
    );
    run_items(
        ctx,
        "segment",
        &args.inputs,
        |p| p.display().to_string(),
        |path| {
            segment_file(&mut segmenter, path, &source_root, &args.destination, args.diameter)
                .map(|_| ())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Labels each pixel by its intensity in hundreds.
    struct ByIntensity;

    impl NuclearSegmenter for ByIntensity {
        fn segment(&mut self, image: ArrayView2<'_, f32>, _diameter: u32) -> Result<Array2<u32>> {
            Ok(image.mapv(|v| (v / 100.0) as u32))
        }
    }

    #[test]
    fn expand_grows_by_one_pixel_without_overwriting() {
        let labels = array![
            [0u32, 0, 0, 0, 0],
            [0, 0, 0, 0, 0],
            [0, 0, 1, 0, 2],
            [0, 0, 0, 0, 0],
        ];
        let grown = expand_labels(&labels, 1);
        assert_eq!(
            grown,
            array![
                [0u32, 0, 0, 0, 0],
                [0, 0, 1, 0, 2],
                [0, 1, 1, 1, 2],
                [0, 0, 1, 0, 2],
            ]
        );
    }

    #[test]
    fn clear_border_drops_edge_labels() {
        let labels = array![
            [0u32, 0, 0, 3],
            [0, 1, 1, 3],
            [0, 1, 1, 0],
            [2, 0, 0, 0],
        ];
        assert_eq!(
            clear_border(&labels),
            array![[0u32, 0, 0, 0], [0, 1, 1, 0], [0, 1, 1, 0], [0, 0, 0, 0]]
        );
    }

    #[test]
    fn nearest_resize_keeps_label_values() {
        let labels = array![[1u32, 2], [3, 4]];
        let up = resize_nearest(labels.view(), 4, 4);
        assert_eq!(up[(0, 0)], 1);
        assert_eq!(up[(1, 1)], 1);
        assert_eq!(up[(0, 3)], 2);
        assert_eq!(up[(3, 0)], 3);
        assert_eq!(up[(3, 3)], 4);
        let down = resize_nearest(up.view(), 2, 2);
        assert_eq!(down, labels);
    }

    #[test]
    fn rescale_maps_diameter_to_model_size() {
        let image = Array2::<f32>::zeros((200, 100));
        assert_eq!(rescale_for_model(image.view(), 60).unwrap().dim(), (100, 50));
        assert_eq!(rescale_for_model(image.view(), 30).unwrap().dim(), (200, 100));
        assert!(rescale_for_model(image.view(), 0).is_err());
    }

    #[test]
    fn output_clears_action_plane_and_channel() {
        let image = Address::parse("384_B07T0001F007L01A01C01_maximum_projection.tif").unwrap();
        assert_eq!(
            segmentation_address(&image).file_name(),
            "384_B07T0001F007L01_nuclear_segmentation.npy"
        );
    }

    #[test]
    fn segment_file_filters_and_mirrors() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let plate = src.path().join("plate");
        std::fs::create_dir_all(&plate).unwrap();
        let image_path = plate.join("384_B07T0001F007L01A01C01_maximum_projection.tif");
        let mut image = Array2::<u16>::zeros((6, 6));
        image[(2, 2)] = 100;
        image[(0, 5)] = 200;
        raster::write_tiff(&image_path, image.view()).unwrap();

        let out = segment_file(&mut ByIntensity, &image_path, src.path(), dst.path(), 100).unwrap();
        assert_eq!(out, dst.path().join("plate").join("384_B07T0001F007L01_nuclear_segmentation.npy"));
        let labels = raster::read_npy(&out).unwrap().into_labels().unwrap();
        // The corner object touches the border and is removed; the centre one grows.
        assert_eq!(labels[(0, 5)], 0);
        assert_eq!(labels[(2, 2)], 1);
        assert_eq!(labels[(1, 2)], 1);
        assert_eq!(labels[(1, 1)], 0);
    }

    #[test]
    fn inversion_is_on_unless_disabled() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[command(flatten)]
            segment: SegmentArgs,
        }

        let base = ["segment", "--source-directory=p", "--destination=s", "--model=m"];
        assert!(Cli::parse_from(base).segment.invert);
        let disabled = Cli::parse_from(base.iter().copied().chain(["--no-invert"]));
        assert!(!disabled.segment.invert);
    }
}
