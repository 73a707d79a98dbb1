//! Plan: enumerate a stage's inputs, shard them into batches and write the
//! scheduler request (`<job_name>.swarm` + `<job_name>.json`).

use clap::{Args, Subcommand};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::address::{Address, Field, SuffixPart};
use crate::batch::{job_name, partition, JobRequest, ResourceProfile, WorkItem};
use crate::context::RunContext;
use crate::error::{PipelineError, Result};
use crate::paths;
use crate::pattern::{find_matches, pattern_from, Glob};

#[derive(Args, Clone)]
pub struct PlanArgs {
    #[command(subcommand)]
    pub stage: PlanStage,
}

#[derive(Args, Clone)]
pub struct PlanCommon {
    #[arg(long, help = "Directory for the generated swarm and JSON files")]
    pub log_dir: PathBuf,
    #[arg(long, help = "Items per invocation (stage default when omitted)")]
    pub batch_size: Option<usize>,
    #[arg(long, help = "Memory per invocation in GB (stage default when omitted)")]
    pub memory_gb: Option<f64>,
    #[arg(long, default_value = "nucspot", help = "Program the generated commands invoke")]
    pub program: String,
}

#[derive(Subcommand, Clone)]
pub enum PlanStage {
    /// One invocation item per z-stack
    Projections {
        #[command(flatten)]
        common: PlanCommon,
        #[arg(long)]
        source_directory: PathBuf,
        #[arg(long)]
        destination: PathBuf,
    },
    /// Nuclear-channel maximum projections
    Segmentation {
        #[command(flatten)]
        common: PlanCommon,
        #[arg(long)]
        source_directory: PathBuf,
        #[arg(long)]
        destination: PathBuf,
        #[arg(long)]
        model: PathBuf,
        #[arg(long, default_value_t = 100)]
        diameter: u32,
        #[arg(long, default_value_t = 1, help = "Channel index of the nuclear stain")]
        dapi_channel: u32,
        #[arg(long, help = "Forward --no-invert to every segment command")]
        no_invert: bool,
    },
    /// Nuclear segmentations to split into per-nucleus masks
    Masks {
        #[command(flatten)]
        common: PlanCommon,
        #[arg(long)]
        source_directory: PathBuf,
        #[arg(long)]
        destination: PathBuf,
    },
    /// Image and mask pairs
    Crops {
        #[command(flatten)]
        common: PlanCommon,
        #[arg(long)]
        source_images_dir: PathBuf,
        #[arg(long)]
        source_masks_dir: PathBuf,
        #[arg(long)]
        destination: PathBuf,
        #[arg(long, default_value_t = 1, help = "Channel index of the nuclear stain (not cropped)")]
        dapi_channel: u32,
    },
    /// Spot files to join into CSV rows
    Spots {
        #[command(flatten)]
        common: PlanCommon,
        #[arg(long)]
        source_directory: PathBuf,
        #[arg(long)]
        z_centers: PathBuf,
        #[arg(long)]
        distance_transforms: PathBuf,
        #[arg(long)]
        masks: Option<PathBuf>,
        #[arg(long)]
        destination: PathBuf,
    },
}

/// Per-stage scheduler defaults.
pub struct StageDefaults {
    pub job_kind: &'static str,
    pub memory_gb: f64,
    pub items_per_invocation: usize,
}

pub const PROJECTIONS: StageDefaults = StageDefaults {
    job_kind: "generate_all_maximum_projections",
    memory_gb: 4.0,
    items_per_invocation: 500,
};
pub const SEGMENTATION: StageDefaults = StageDefaults {
    job_kind: "generate_all_nuclear_segmentations",
    memory_gb: 8.0,
    items_per_invocation: 50,
};
pub const MASKS: StageDefaults = StageDefaults {
    job_kind: "generate_all_nuclear_masks",
    memory_gb: 2.0,
    items_per_invocation: 200,
};
pub const CROPS: StageDefaults = StageDefaults {
    job_kind: "generate_all_cropped_cell_images",
    memory_gb: 1.5,
    items_per_invocation: 20000,
};
pub const SPOTS: StageDefaults = StageDefaults {
    job_kind: "generate_all_spot_result_lines",
    memory_gb: 1.0,
    items_per_invocation: 20000,
};

fn arg(path: &Path) -> String {
    path.display().to_string()
}

/// Parse every match, skipping (with a warning) names outside the grammar.
fn addressed(glob: &str, root: &Path) -> Result<Vec<(PathBuf, Address)>> {
    let glob = Glob::new(glob)?;
    let mut out = Vec::new();
    for path in find_matches(&glob, root)? {
        let path = path?;
        match Address::from_path(&path) {
            Ok(address) => out.push((path, address)),
            Err(e) => log::warn!("skipping {}: {e}", path.display()),
        }
    }
    Ok(out)
}

/// One relative glob per z-stack, in first-seen order.
pub fn projection_patterns(source_root: &Path) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut patterns = Vec::new();
    for (path, address) in addressed("*.tif", source_root)? {
        if address.z.is_none() {
            continue;
        }
        let name = pattern_from(&address, &[Field::Z], None, None).to_string();
        let parent = paths::relative_parent(source_root, &path);
        let mut pattern = parent
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if !pattern.is_empty() {
            pattern.push('/');
        }
        pattern.push_str(&name);
        if seen.insert(pattern.clone()) {
            patterns.push(pattern);
        }
    }
    Ok(patterns)
}

pub fn segmentation_inputs(source_root: &Path, dapi_channel: u32) -> Result<Vec<PathBuf>> {
    Ok(addressed("*_maximum_projection.tif", source_root)?
        .into_iter()
        .filter(|(_, a)| a.c == Some(dapi_channel))
        .map(|(p, _)| p)
        .collect())
}

pub fn mask_inputs(source_root: &Path) -> Result<Vec<PathBuf>> {
    Ok(addressed("*_nuclear_segmentation.npy", source_root)?
        .into_iter()
        .map(|(p, _)| p)
        .collect())
}

/// Every non-nuclear projection and z-center, paired with each mask of its
/// field. Masks carry no action or channel token.
pub fn crop_pairs(images_root: &Path, masks_root: &Path, dapi_channel: u32) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut images = addressed("*_maximum_projection.tif", images_root)?;
    images.extend(addressed("*_z_center.npy", images_root)?);
    let mut pairs = Vec::new();
    for (image, address) in images {
        if address.c == Some(dapi_channel) {
            continue;
        }
        let masks = pattern_from(
            &address.without(&[Field::A, Field::C]),
            &[],
            Some("_nuclear_mask_???"),
            Some("npz"),
        )
        .glob()?;
        for mask in find_matches(&masks, masks_root)? {
            pairs.push((image.clone(), mask?));
        }
    }
    Ok(pairs)
}

/// Spot files: `.npy` whose suffix ends in a nucleus mask and spot index.
pub fn spot_inputs(source_root: &Path) -> Result<Vec<PathBuf>> {
    Ok(addressed("*.npy", source_root)?
        .into_iter()
        .filter(|(_, a)| {
            matches!(a.suffix.parts(), [.., SuffixPart::NuclearMask(_), SuffixPart::Spot { .. }])
        })
        .map(|(p, _)| p)
        .collect())
}

fn request(
    ctx: &RunContext<'_>,
    common: &PlanCommon,
    defaults: &StageDefaults,
    fixed_args: Vec<String>,
    items: Vec<WorkItem>,
) -> Result<JobRequest> {
    let size = common.batch_size.unwrap_or(defaults.items_per_invocation);
    let batch_size = NonZeroUsize::new(size)
        .ok_or_else(|| PipelineError::InvalidArgument("batch size must be at least 1".to_string()))?;
    let item_count = items.len();
    let batches = partition(items, batch_size);
    let resources = ResourceProfile {
        memory_gb: common.memory_gb.unwrap_or(defaults.memory_gb),
        items_per_invocation: size,
    };
    let request = JobRequest::from_batches(
        job_name(defaults.job_kind, &ctx.started),
        &common.program,
        &fixed_args,
        &batches,
        resources,
    );
    let (swarm, _) = request.write(&common.log_dir)?;
    log::info!(
        "[{}] {}: {} items in {} batches -> {}",
        ctx.run_id,
        request.job_name,
        item_count,
        batches.len(),
        swarm.display()
    );
    ctx.progress(1.0, &format!("planned {} batches", batches.len()));
    Ok(request)
}

fn files(paths: Vec<PathBuf>) -> Vec<WorkItem> {
    paths.into_iter().map(|path| WorkItem::File { path }).collect()
}

pub fn run(args: PlanArgs, ctx: &RunContext<'_>) -> Result<JobRequest> {
    match args.stage {
        PlanStage::Projections {
            common,
            source_directory,
            destination,
        } => {
            let root = paths::source_root(&source_directory)?;
            let items = projection_patterns(&root)?
                .into_iter()
                .map(|glob| WorkItem::Pattern { glob })
                .collect();
            let fixed = vec![
                "project".to_string(),
                format!("--source-directory={}", arg(&root)),
                format!("--destination={}", arg(&destination)),
            ];
            request(ctx, &common, &PROJECTIONS, fixed, items)
        }
        PlanStage::Segmentation {
            common,
            source_directory,
            destination,
            model,
            diameter,
            dapi_channel,
            no_invert,
        } => {
            let root = paths::source_root(&source_directory)?;
            let items = files(segmentation_inputs(&root, dapi_channel)?);
            let mut fixed = vec![
                "segment".to_string(),
                format!("--source-directory={}", arg(&root)),
                format!("--destination={}", arg(&destination)),
                format!("--model={}", arg(&model)),
                format!("--diameter={diameter}"),
            ];
            if no_invert {
                fixed.push("--no-invert".to_string());
            }
            request(ctx, &common, &SEGMENTATION, fixed, items)
        }
        PlanStage::Masks {
            common,
            source_directory,
            destination,
        } => {
            let root = paths::source_root(&source_directory)?;
            let items = files(mask_inputs(&root)?);
            let fixed = vec![
                "masks".to_string(),
                format!("--source-directory={}", arg(&root)),
                format!("--destination={}", arg(&destination)),
            ];
            request(ctx, &common, &MASKS, fixed, items)
        }
        PlanStage::Crops {
            common,
            source_images_dir,
            source_masks_dir,
            destination,
            dapi_channel,
        } => {
            let images = paths::source_root(&source_images_dir)?;
            let masks = paths::source_root(&source_masks_dir)?;
            let items = crop_pairs(&images, &masks, dapi_channel)?
                .into_iter()
                .map(|(image, mask)| WorkItem::ImageMask { image, mask })
                .collect();
            let fixed = vec![
                "crop".to_string(),
                format!("--destination={}", arg(&destination)),
                format!("--source-images-dir={}", arg(&images)),
                format!("--source-masks-dir={}", arg(&masks)),
            ];
            request(ctx, &common, &CROPS, fixed, items)
        }
        PlanStage::Spots {
            common,
            source_directory,
            z_centers,
            distance_transforms,
            masks,
            destination,
        } => {
            let root = paths::source_root(&source_directory)?;
            let items = files(spot_inputs(&root)?);
            let mut fixed = vec![
                "spot".to_string(),
                format!("--source-directory={}", arg(&root)),
                format!("--z-centers={}", arg(&z_centers)),
                format!("--distance-transforms={}", arg(&distance_transforms)),
                format!("--destination={}", arg(&destination)),
            ];
            if let Some(masks) = masks {
                fixed.push(format!("--masks={}", arg(&masks)));
            }
            request(ctx, &common, &SPOTS, fixed, items)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, relative: &str) -> PathBuf {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn one_pattern_per_stack() {
        let dir = tempfile::tempdir().unwrap();
        for z in 0..3 {
            for c in 1..=2 {
                touch(dir.path(), &format!("plate/384_B07T0001F007L01A01Z{z:03}C{c:02}.tif"));
            }
        }
        touch(dir.path(), "plate/notes.tif");
        let patterns = projection_patterns(dir.path()).unwrap();
        assert_eq!(
            patterns,
            vec![
                "plate/384_B07T0001F007L01A01Z???C01.tif",
                "plate/384_B07T0001F007L01A01Z???C02.tif",
            ]
        );
    }

    #[test]
    fn crops_skip_nuclear_channel_and_stay_within_field() {
        let images = tempfile::tempdir().unwrap();
        let masks = tempfile::tempdir().unwrap();
        touch(images.path(), "384_B07T0001F007L01A01C01_maximum_projection.tif");
        let projection = touch(images.path(), "384_B07T0001F007L01A01C02_maximum_projection.tif");
        let z_center = touch(images.path(), "384_B07T0001F007L01A01C02_z_center.npy");
        let m1 = touch(masks.path(), "384_B07T0001F007L01_nuclear_mask_001.npz");
        let m2 = touch(masks.path(), "384_B07T0001F007L01_nuclear_mask_002.npz");
        touch(masks.path(), "384_B07T0001F008L01_nuclear_mask_001.npz");
        touch(masks.path(), "384_B07T0001F007L01_distance_transform_001.npy");

        let pairs = crop_pairs(images.path(), masks.path(), 1).unwrap();
        assert_eq!(
            pairs,
            vec![
                (projection.clone(), m1.clone()),
                (projection, m2.clone()),
                (z_center.clone(), m1),
                (z_center, m2),
            ]
        );
    }

    #[test]
    fn segmentation_takes_only_nuclear_channel() {
        let dir = tempfile::tempdir().unwrap();
        let nuclear = touch(dir.path(), "384_B07T0001F007L01A01C01_maximum_projection.tif");
        touch(dir.path(), "384_B07T0001F007L01A01C02_maximum_projection.tif");
        assert_eq!(segmentation_inputs(dir.path(), 1).unwrap(), vec![nuclear]);
    }

    #[test]
    fn spots_need_nucleus_and_spot_index() {
        let dir = tempfile::tempdir().unwrap();
        let spot = touch(dir.path(), "384_B07T0001F007L01A01C02_maximum_projection_nuclear_mask_001_0.npy");
        let padded = touch(dir.path(), "384_B07T0001F007L01A01C02_maximum_projection_nuclear_mask_001_07.npy");
        touch(dir.path(), "384_B07T0001F007L01A01C02_maximum_projection_nuclear_mask_001.npy");
        touch(dir.path(), "384_B07T0001F007L01A01C02_z_center.npy");
        assert_eq!(spot_inputs(dir.path()).unwrap(), vec![spot, padded]);
    }

    #[test]
    fn masks_plan_writes_batched_request() {
        let src = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        for f in 1..=5 {
            touch(src.path(), &format!("384_B07T0001F{f:03}L01_nuclear_segmentation.npy"));
        }
        let progress = |_: f64, _: &str| {};
        let ctx = RunContext::new(&progress);
        let args = PlanArgs {
            stage: PlanStage::Masks {
                common: PlanCommon {
                    log_dir: logs.path().to_path_buf(),
                    batch_size: Some(2),
                    memory_gb: None,
                    program: "nucspot".to_string(),
                },
                source_directory: src.path().to_path_buf(),
                destination: PathBuf::from("/out/masks"),
            },
        };
        let request = run(args, &ctx).unwrap();
        assert_eq!(request.commands.len(), 3);
        assert_eq!(request.resources.memory_gb, 2.0);
        assert_eq!(request.commands[2].args.len(), 4);
        assert!(request.job_name.starts_with("generate_all_nuclear_masks_"));
        let swarm = fs::read_to_string(logs.path().join(format!("{}.swarm", request.job_name))).unwrap();
        assert_eq!(swarm.lines().count(), 3);
        assert!(swarm.lines().all(|l| l.starts_with("nucspot masks --source-directory=")));
    }

    #[test]
    fn segmentation_plan_inverts_unless_told_not_to() {
        let src = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        touch(src.path(), "384_B07T0001F007L01A01C01_maximum_projection.tif");
        let progress = |_: f64, _: &str| {};
        let ctx = RunContext::new(&progress);
        let plan = |no_invert: bool| PlanArgs {
            stage: PlanStage::Segmentation {
                common: PlanCommon {
                    log_dir: logs.path().to_path_buf(),
                    batch_size: None,
                    memory_gb: None,
                    program: "nucspot".to_string(),
                },
                source_directory: src.path().to_path_buf(),
                destination: PathBuf::from("/out/segmentations"),
                model: PathBuf::from("/models/nuclei"),
                diameter: 100,
                dapi_channel: 1,
                no_invert,
            },
        };
        let inverted = run(plan(false), &ctx).unwrap();
        assert!(!inverted.commands[0].args.iter().any(|a| a == "--no-invert"));
        let plain = run(plan(true), &ctx).unwrap();
        assert!(plain.commands[0].args.iter().any(|a| a == "--no-invert"));
    }
}
