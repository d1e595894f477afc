//! Everything that happens before the first outer iteration: stack
//! decomposition, template selection, the mask pipeline, volumetric
//! registration with intensity normalisation, and slice creation.

use ndarray::Array2;
use tracing::{info, warn};

use crate::backend::BackendDispatcher;
use crate::config::ReconstructionConfig;
use crate::decompose::{RawStack, StackDecomposer, StackSet, split_into_packages};
use crate::engine::EngineSetup;
use crate::error::{ReconstructionError, Result};
use crate::logging::{LogSinks, Phase};
use crate::mask::{
    create_average, create_mask, create_mask_from_overlap, create_template, crop_to_mask,
    mask_on_grid, masked_voxels, transform_mask,
};
use crate::normalize::match_stack_intensities;
use crate::output::OutputSink;
use crate::perf::PerfStats;
use crate::registration::register_stacks_to_template;
use crate::sampling::HostSampler;
use crate::slices::{create_slices, mask_slices, replace_slices, replace_transforms};
use crate::template::{MotionEstimator, TemplateSelector, marker_template};
use crate::transform::{RigidTransform, StackTransform};
use crate::volume::{Mask, Volume};

/// Slice thickness given to T1 package stacks.
const T1_PACKAGE_THICKNESS: f32 = 4.0;

/// A mask drawn on the template stack that is carried into reconstruction
/// space through the slice PSFs at the end of the run.
#[derive(Clone, Debug)]
pub struct ManualMask {
    pub name: String,
    pub volume: Volume,
}

/// The inputs of one run, already read from disk.
#[derive(Clone, Debug, Default)]
pub struct ReconstructionInputs {
    pub stacks: Vec<RawStack>,
    /// One per input; `None` makes stack 0 the template.
    pub transforms: Option<Vec<StackTransform>>,
    /// Canonical mask in template space.
    pub mask: Option<Mask>,
    pub manual_mask: Option<ManualMask>,
    /// Seeds the reconstruction grid instead of the template stack.
    pub reference_volume: Option<Volume>,
    /// Externally registered slices replacing the decomposed ones.
    pub slices: Option<Vec<Array2<f32>>>,
    pub slice_transforms: Option<Vec<RigidTransform>>,
}

/// Result of the setup phase, ready to build an engine from.
pub struct PreparedRun {
    pub setup: EngineSetup,
    pub template: usize,
    /// Package counts per stack after decomposition; empty when none.
    pub packages: Vec<usize>,
    pub stacks: usize,
    pub manual_mask: Option<ManualMask>,
    pub reference_volume: bool,
}

enum MaskSource {
    Given,
    Derived,
    Missing,
}

/// Runs the setup states of the scheduler.
///
/// Writes `generatedMask` when the mask was derived, and the intermediate
/// crops and averages in debug mode.
pub fn prepare(
    inputs: ReconstructionInputs,
    config: &ReconstructionConfig,
    dispatcher: &BackendDispatcher,
    sink: &mut dyn OutputSink,
    logs: &LogSinks,
    perf: &mut PerfStats,
) -> Result<PreparedRun> {
    let ReconstructionInputs {
        stacks: raw,
        transforms,
        mask,
        manual_mask,
        reference_volume,
        slices: replayed,
        slice_transforms,
    } = inputs;

    if let Some(transforms) = transforms.as_ref() {
        if transforms.len() != raw.len() {
            return Err(ReconstructionError::invalid(format!(
                "{} transformations for {} stacks",
                transforms.len(),
                raw.len()
            )));
        }
    }

    let mut set = perf.time("Decompose", || {
        StackDecomposer::new(&config.thickness, &config.packages, config.partition).decompose(&raw)
    })?;
    let mut transforms: Option<Vec<StackTransform>> =
        transforms.map(|t| set.source.iter().map(|&i| t[i]).collect());
    if config.num_stacks_tuner > 0 && config.num_stacks_tuner < set.len() {
        info!(kept = config.num_stacks_tuner, of = set.len(), "Limiting the number of stacks");
        set.truncate(config.num_stacks_tuner);
        if let Some(t) = transforms.as_mut() {
            t.truncate(config.num_stacks_tuner);
        }
    }

    let t1_packages = config.t1_package_size > 0;
    if t1_packages {
        if reference_volume.is_none() {
            return Err(ReconstructionError::invalid(
                "T1 package mode needs a reference volume",
            ));
        }
        set = split_t1_packages(&set, config)?;
        transforms = Some(vec![StackTransform::Identity; set.len()]);
    }
    set.default_thickness();

    let replay = replayed.is_some();
    let mut poses: Vec<RigidTransform> = match transforms.as_ref() {
        Some(t) => t.iter().map(StackTransform::stack_to_template).collect(),
        None => vec![RigidTransform::IDENTITY; set.len()],
    };

    let mut template = marker_template(transforms.as_deref())
        .filter(|&i| i < set.len())
        .ok_or(ReconstructionError::NoTemplate)?;

    let (mut mask, source) = match mask {
        Some(mask) => (Some(mask), MaskSource::Given),
        None if replay => (None, MaskSource::Missing),
        None => {
            if let Some(manual) = manual_mask.as_ref() {
                info!(name = %manual.name, "Manual mask recorded for the final PSF transform");
            }
            (Some(derive_mask(&set, &poses, template, config)), MaskSource::Derived)
        }
    };

    if config.auto_template {
        let estimator = dispatcher.motion_estimator();
        template = perf.time("TemplateSelection", || {
            reselect_template(
                &set,
                transforms.as_deref(),
                &mut poses,
                template,
                &mut mask,
                &source,
                estimator,
                config,
            )
        })?;
    }
    info!(template, stacks = set.len(), "Template stack");

    if let (Some(mask), MaskSource::Derived) = (mask.as_ref(), &source) {
        info!(voxels = masked_voxels(mask), "Generated mask");
        sink.write_mask("generatedMask", mask)?;
    }

    if let Some(mask) = mask.as_ref() {
        let local = crop_stack(&mut set, template, mask, &poses[template]);
        if config.debug {
            sink.write_mask("maskTemplate", &local)?;
            sink.write_volume("croppedTemplate", &set.stacks[template])?;
        }
    }

    let register = !t1_packages && !replay;
    let mut factors = vec![1.0f32; set.len()];

    if register {
        volumetric_registration(&set.stacks, &mut poses, template, config, logs, perf)?;
    }
    if !replay {
        normalize(&mut set.stacks, &poses, mask.as_ref(), config, &mut factors);
    }
    if config.debug && register {
        let (grid, _) = create_template(&set.stacks[template], config.resolution);
        sink.write_volume("average1", &create_average(&set.stacks, &poses, &grid))?;
    }

    if let Some(mask) = mask.as_ref() {
        for i in (0..set.len()).filter(|&i| i != template) {
            let local = crop_stack(&mut set, i, mask, &poses[i]);
            if config.debug {
                sink.write_mask(&format!("mask{i}"), &local)?;
                sink.write_volume(&format!("cropped{i}"), &set.stacks[i])?;
            }
        }
    }

    if register {
        volumetric_registration(&set.stacks, &mut poses, template, config, logs, perf)?;
    }
    if !replay {
        normalize(&mut set.stacks, &poses, mask.as_ref(), config, &mut factors);
    }

    let reconstruction = match reference_volume.as_ref() {
        Some(reference) => {
            info!(dim = ?reference.dim(), "Reconstruction grid taken from the reference volume");
            reference.clone()
        }
        None => {
            let (grid, resolution) = create_template(&set.stacks[template], config.resolution);
            info!(resolution, dim = ?grid.dim(), "Reconstruction grid");
            grid
        }
    };
    if config.debug && register {
        sink.write_volume("average2", &create_average(&set.stacks, &poses, &reconstruction))?;
    }

    let grid_mask = match mask.as_ref() {
        Some(mask) => mask_on_grid(mask, &reconstruction, config.smooth_mask),
        None => reconstruction.with_data(ndarray::Array3::<u8>::ones(reconstruction.dim())),
    };

    let mut slices = perf.time("CreateSlices", || {
        create_slices(
            &set.stacks,
            &poses,
            &set.thickness,
            config.partition,
            set.labels.as_deref(),
        )
    })?;
    if let Some(replacements) = replayed {
        replace_slices(&mut slices, replacements)?;
        info!(slices = slices.len(), "Replaced slices with the supplied ones");
    }
    if let Some(transforms) = slice_transforms.as_ref() {
        replace_transforms(&mut slices, transforms);
    }
    if mask.is_some() {
        mask_slices(&mut slices, &grid_mask);
    }

    Ok(PreparedRun {
        setup: EngineSetup {
            slices,
            reconstruction,
            mask: grid_mask,
            stack_factors: factors,
            settings: config.engine_settings(),
        },
        template,
        packages: set.packages.clone(),
        stacks: set.len(),
        manual_mask,
        reference_volume: reference_volume.is_some(),
    })
}

/// Replaces every stack by its interleaved packages, all in the reference
/// frame.
fn split_t1_packages(set: &StackSet, config: &ReconstructionConfig) -> Result<StackSet> {
    let raw: Vec<RawStack> = set
        .stacks
        .iter()
        .flat_map(|s| split_into_packages(s, config.t1_package_size))
        .map(RawStack::from)
        .collect();
    let thickness = vec![T1_PACKAGE_THICKNESS; raw.len()];
    info!(stacks = set.len(), packages = raw.len(), "Split stacks into T1 packages");
    StackDecomposer::new(&thickness, &[], config.partition).decompose(&raw)
}

fn derive_mask(set: &StackSet, poses: &[RigidTransform], template: usize, config: &ReconstructionConfig) -> Mask {
    if config.partition.uses_overlap_mask() {
        create_mask_from_overlap(&set.stacks, poses, template)
    } else {
        create_mask(&set.stacks[template])
    }
}

/// Picks the template by motion score. When it moves, every pose is
/// rebased onto the new template and a derived mask is derived again.
#[allow(clippy::too_many_arguments)]
fn reselect_template(
    set: &StackSet,
    transforms: Option<&[StackTransform]>,
    poses: &mut [RigidTransform],
    template: usize,
    mask: &mut Option<Mask>,
    source: &MaskSource,
    estimator: Option<&dyn MotionEstimator>,
    config: &ReconstructionConfig,
) -> Result<usize> {
    let chosen = TemplateSelector::new(estimator).select(&set.stacks, transforms, poses, mask.as_ref(), true)?;
    if chosen != template {
        rebase_poses(poses, chosen);
        if matches!(source, MaskSource::Derived) {
            *mask = Some(derive_mask(set, poses, chosen, config));
        }
    }
    Ok(chosen)
}

/// Re-expresses every pose relative to the new template.
fn rebase_poses(poses: &mut [RigidTransform], template: usize) {
    let into_new = poses[template].inverse();
    for pose in poses.iter_mut() {
        *pose = pose.then(&into_new);
    }
    poses[template] = RigidTransform::IDENTITY;
}

/// Crops stack `i`, and its label stack, to the canonical mask as seen from
/// pose `pose`. Returns the stack-space mask.
fn crop_stack(set: &mut StackSet, i: usize, mask: &Mask, pose: &RigidTransform) -> Mask {
    let local = transform_mask(&set.stacks[i], mask, pose);
    if masked_voxels(&local) == 0 {
        warn!(stack = i, "Mask does not overlap the stack");
    }
    set.stacks[i] = crop_to_mask(&set.stacks[i], &local);
    if let Some(labels) = set.labels.as_mut() {
        labels[i] = crop_to_mask(&labels[i], &local);
    }
    local
}

fn volumetric_registration(
    stacks: &[Volume],
    poses: &mut [RigidTransform],
    template: usize,
    config: &ReconstructionConfig,
    logs: &LogSinks,
    perf: &mut PerfStats,
) -> Result<()> {
    let _phase = logs.enter(Phase::Registration);
    let sampler = HostSampler::new(&stacks[template]);
    perf.time("VolumetricRegistration", || {
        register_stacks_to_template(stacks, poses, template, &sampler, &config.registration())
    })
}

/// Matches stack intensities and folds the factors into `factors`.
fn normalize(
    stacks: &mut [Volume],
    poses: &[RigidTransform],
    mask: Option<&Mask>,
    config: &ReconstructionConfig,
    factors: &mut [f32],
) {
    let applied = match_stack_intensities(stacks, poses, mask, config.average, !config.intensity_matching);
    for (total, f) in factors.iter_mut().zip(applied) {
        *total *= f;
    }
}
