use half::f16;
use ndarray::{array, s, Array2};
use ndarray_npy::WriteNpyExt;
use std::fs;
use std::path::Path;

use nucspot::address::{Address, SuffixPart};
use nucspot::crop::{crop_pair, ImageCache};
use nucspot::masks::split_file;
use nucspot::plan::projection_patterns;
use nucspot::projection::project_pattern;
use nucspot::raster::{self, Raster};
use nucspot::spot::{join_file, Roots};

const SIZE: usize = 6;

/// Three planes of one stack. The nucleus (rows/cols 1..4) is brightest on
/// plane 1, except its centre pixel which only lights up on plane 2.
fn write_stack(dir: &Path) {
    write_named_stack(dir, |z| format!("384_B07T0001F007L01A01Z{z:03}C02_raw.tif"));
}

fn write_named_stack(dir: &Path, name: impl Fn(u32) -> String) {
    fs::create_dir_all(dir).unwrap();
    for (z, level) in [(0u32, 10u16), (1, 30), (2, 10)] {
        let mut plane = Array2::<u16>::zeros((SIZE, SIZE));
        plane.slice_mut(s![1..4, 1..4]).fill(level);
        plane[(2, 2)] = if z == 2 { 50 } else { 0 };
        raster::write_tiff(&dir.join(name(z)), plane.view()).unwrap();
    }
}

#[test]
fn projection_clears_z_and_appends_stage_tag() {
    let root = tempfile::tempdir().unwrap();
    let raw = root.path().join("raw");
    write_stack(&raw.join("plate"));

    let (maximum, z_center) = project_pattern(
        &raw,
        "plate/384_B07T0001F007L01A01Z???C02_raw.tif",
        &root.path().join("projections"),
    )
    .unwrap();

    let address = Address::from_path(&maximum).unwrap();
    assert_eq!(address.z, None);
    assert_eq!((address.f, address.c), (Some(7), Some(2)));
    assert_eq!(address.suffix.to_string(), "_raw_maximum_projection");
    assert!(address.suffix.ends_with(&SuffixPart::MaximumProjection));
    assert_eq!(maximum.parent().unwrap(), root.path().join("projections").join("plate"));

    let projected = raster::read_tiff(&maximum).unwrap();
    assert_eq!(projected[(1, 1)], 30);
    assert_eq!(projected[(2, 2)], 50);
    assert_eq!(projected[(0, 0)], 0);

    let Raster::F16(centroid) = raster::read_npy(&z_center).unwrap() else {
        panic!("z-centers are stored as f16");
    };
    assert_eq!(centroid[(1, 1)], f16::from_f32(1.0));
    assert_eq!(centroid[(2, 2)], f16::from_f32(2.0));
    assert_eq!(centroid[(0, 0)], f16::ZERO);
}

#[test]
fn legacy_separated_stack_is_planned_and_projected() {
    let root = tempfile::tempdir().unwrap();
    let raw = root.path().join("raw");
    write_named_stack(&raw.join("plate"), |z| format!("384_B07_T0001F007L01A01Z{z:03}C01.tif"));

    let patterns = projection_patterns(&raw).unwrap();
    assert_eq!(patterns, vec!["plate/384_B07_T0001F007L01A01Z???C01.tif"]);

    let (maximum, z_center) = project_pattern(&raw, &patterns[0], &root.path().join("projections")).unwrap();
    assert_eq!(
        maximum.file_name().unwrap(),
        "384_B07_T0001F007L01A01C01_maximum_projection.tif"
    );
    assert_eq!(z_center.file_name().unwrap(), "384_B07_T0001F007L01A01C01_z_center.npy");
    assert_eq!(raster::read_tiff(&maximum).unwrap()[(2, 2)], 50);
}

#[test]
fn projection_crop_and_spot_join() {
    let root = tempfile::tempdir().unwrap();
    let raw = root.path().join("raw");
    let projections = root.path().join("projections");
    let segmentations = root.path().join("segmentations");
    let masks = root.path().join("masks");
    let crops = root.path().join("crops");
    let spots = root.path().join("spots");
    let results = root.path().join("results");

    write_stack(&raw.join("plate"));
    let (maximum, z_center) = project_pattern(
        &raw,
        "plate/384_B07T0001F007L01A01Z???C02_raw.tif",
        &projections,
    )
    .unwrap();

    // Stand-in for the model: one nucleus covering the bright square.
    let mut labels = Array2::<u32>::zeros((SIZE, SIZE));
    labels.slice_mut(s![1..4, 1..4]).fill(1);
    let segmentation = segmentations
        .join("plate")
        .join("384_B07T0001F007L01_nuclear_segmentation.npy");
    fs::create_dir_all(segmentation.parent().unwrap()).unwrap();
    raster::write_npy(&segmentation, &Raster::U32(labels)).unwrap();
    assert_eq!(split_file(&segmentation, &segmentations, &masks).unwrap(), 1);
    let mask = masks.join("plate").join("384_B07T0001F007L01_nuclear_mask_001.npz");

    let mut cache = ImageCache::default();
    let cropped = crop_pair(&mut cache, &maximum, &mask, &projections, &crops).unwrap();
    assert_eq!(
        cropped.file_name().unwrap(),
        "384_B07T0001F007L01A01C02_raw_maximum_projection_nuclear_mask_001.npy"
    );
    let Raster::F64(intensity) = raster::read_npy(&cropped).unwrap() else {
        panic!("intensity crops are f64");
    };
    assert_eq!(intensity.dim(), (3, 3));
    assert_eq!(intensity[(1, 1)], 1.0);
    assert_eq!(intensity[(0, 0)], 0.0);

    let cropped_z = crop_pair(&mut cache, &z_center, &mask, &projections, &crops).unwrap();
    let Raster::F16(z_crop) = raster::read_npy(&cropped_z).unwrap() else {
        panic!("z-center crops keep f16");
    };
    assert_eq!(z_crop[(1, 1)], f16::from_f32(2.0));

    let spot = spots
        .join("plate")
        .join("384_B07T0001F007L01A01C02_raw_maximum_projection_nuclear_mask_001_0.npy");
    fs::create_dir_all(spot.parent().unwrap()).unwrap();
    array![1.2f64, 0.9].write_npy(fs::File::create(&spot).unwrap()).unwrap();

    let roots = Roots {
        spots: &spots,
        z_centers: &crops,
        distance_transforms: &masks,
        masks: Some(&masks),
    };
    let csv_path = join_file(&spot, &roots, &results).unwrap();
    let text = fs::read_to_string(&csv_path).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "filename,experiment,well,field,channel,nucleus_index,spot_index,center_x,center_y,center_z,center_r,nuclear_mask_offset_x,nuclear_mask_offset_y"
    );
    assert_eq!(
        lines.next().unwrap(),
        "384_B07T0001F007L01A01C02_raw_maximum_projection_nuclear_mask_001_0.npy,384,B07,7,2,001,0,0.9,1.2,2,2,1,1"
    );
}
