//! Rigid registration of 2D planes against a volume.
//!
//! Poses are optimised by batched coordinate descent: every candidate move
//! for every pose group is sampled in one [`VolumeSampler`] call, so the
//! same code drives the host sampler and the device pool.

use nalgebra::{Matrix4, Vector3};
use ndarray::{ArrayView2, s};
use tracing::{debug, info};

use crate::enums::SimilarityMetric;
use crate::error::Result;
use crate::sampling::{SampleJob, Sampled, VolumeSampler, point_psf};
use crate::schedule::PackageSplit;
use crate::slices::{Slice, is_valid};
use crate::transform::RigidTransform;
use crate::volume::Volume;

/// Histogram bins used by normalised mutual information.
const NMI_BINS: usize = 32;
/// Fewer overlapping pixels than this cannot be scored.
const MIN_OVERLAP: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegistrationSettings {
    pub metric: SimilarityMetric,
    /// Initial translation step in millimetres.
    pub translation_step: f32,
    /// Initial rotation step in degrees.
    pub rotation_step: f32,
    /// Steps are halved until they drop below this fraction of the initial step.
    pub min_step_fraction: f32,
    pub max_rounds: usize,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            metric: SimilarityMetric::Ncc,
            translation_step: 2.0,
            rotation_step: 2.0,
            min_step_fraction: 1.0 / 16.0,
            max_rounds: 40,
        }
    }
}

/// A plane that moves rigidly with its group.
#[derive(Clone, Debug)]
pub struct Plane<'a> {
    pub data: ArrayView2<'a, f32>,
    /// Pixel `(i, j, 0, 1)` to the plane's local world frame.
    pub pixel_to_local: Matrix4<f32>,
}

impl<'a> From<&'a Slice> for Plane<'a> {
    fn from(slice: &'a Slice) -> Self {
        Self {
            data: slice.data.view(),
            pixel_to_local: slice.pixel_to_stack,
        }
    }
}

/// Planes sharing one pose.
pub type PoseGroup<'a> = Vec<Plane<'a>>;

/// Similarity of paired samples; higher is better. `None` when the overlap
/// is too small or degenerate.
pub fn similarity(metric: SimilarityMetric, moving: &[f32], fixed: &[f32]) -> Option<f32> {
    if moving.len() < MIN_OVERLAP || moving.len() != fixed.len() {
        return None;
    }
    match metric {
        SimilarityMetric::Ncc => ncc(moving, fixed),
        SimilarityMetric::Nmi => nmi(moving, fixed),
    }
}

fn ncc(a: &[f32], b: &[f32]) -> Option<f32> {
    let n = a.len() as f64;
    let mean_a = a.iter().map(|v| *v as f64).sum::<f64>() / n;
    let mean_b = b.iter().map(|v| *v as f64).sum::<f64>() / n;
    let (mut ab, mut aa, mut bb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let dx = *x as f64 - mean_a;
        let dy = *y as f64 - mean_b;
        ab += dx * dy;
        aa += dx * dx;
        bb += dy * dy;
    }
    if aa <= 0.0 || bb <= 0.0 {
        return None;
    }
    Some((ab / (aa * bb).sqrt()) as f32)
}

fn bin_index(v: f32, lo: f32, hi: f32) -> usize {
    if hi <= lo {
        return 0;
    }
    (((v - lo) / (hi - lo) * NMI_BINS as f32) as usize).min(NMI_BINS - 1)
}

fn nmi(a: &[f32], b: &[f32]) -> Option<f32> {
    let range = |v: &[f32]| {
        v.iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), x| (lo.min(*x), hi.max(*x)))
    };
    let (alo, ahi) = range(a);
    let (blo, bhi) = range(b);
    let mut joint = vec![0.0f64; NMI_BINS * NMI_BINS];
    for (x, y) in a.iter().zip(b) {
        joint[bin_index(*x, alo, ahi) * NMI_BINS + bin_index(*y, blo, bhi)] += 1.0;
    }
    let n = a.len() as f64;
    let mut pa = [0.0f64; NMI_BINS];
    let mut pb = [0.0f64; NMI_BINS];
    for i in 0..NMI_BINS {
        for j in 0..NMI_BINS {
            let p = joint[i * NMI_BINS + j] / n;
            pa[i] += p;
            pb[j] += p;
        }
    }
    let entropy = |p: &mut dyn Iterator<Item = f64>| -> f64 {
        p.filter(|v| *v > 0.0).map(|v| -v * v.ln()).sum()
    };
    let ha = entropy(&mut pa.iter().copied());
    let hb = entropy(&mut pb.iter().copied());
    let hab = entropy(&mut joint.iter().map(|c| c / n));
    if hab <= 0.0 {
        return None;
    }
    Some(((ha + hb) / hab) as f32)
}

/// Scores one pose per group against the fixed volume in a single batch.
fn score_poses(
    groups: &[PoseGroup<'_>],
    poses: &[RigidTransform],
    fixed_world_to_index: &Matrix4<f32>,
    sampler: &dyn VolumeSampler,
    metric: SimilarityMetric,
) -> Result<Vec<Option<f32>>> {
    let zero = Matrix4::zeros();
    let mut jobs = Vec::new();
    for (group, pose) in groups.iter().zip(poses) {
        let to_fixed = fixed_world_to_index * pose.matrix();
        for plane in group {
            let (h, w) = plane.data.dim();
            jobs.push(SampleJob::new(&(to_fixed * plane.pixel_to_local), &zero, w, h));
        }
    }
    let sampled = sampler.sample(&jobs, &point_psf())?;

    let mut results = sampled.into_iter();
    Ok(groups
        .iter()
        .map(|group| {
            let mut moving = Vec::new();
            let mut fixed = Vec::new();
            for plane in group {
                let Some(values) = results.next() else { break };
                collect_pairs(&plane.data, &values, &mut moving, &mut fixed);
            }
            similarity(metric, &moving, &fixed)
        })
        .collect())
}

fn collect_pairs(data: &ArrayView2<f32>, sampled: &[Sampled], moving: &mut Vec<f32>, fixed: &mut Vec<f32>) {
    for (v, [value, coverage]) in data.iter().zip(sampled) {
        if is_valid(*v) && *coverage > 0.0 {
            moving.push(*v);
            fixed.push(*value);
        }
    }
}

/// Optimises one pose per group in place. Returns how many groups moved.
pub fn register_groups(
    groups: &[PoseGroup<'_>],
    poses: &mut [RigidTransform],
    fixed_world_to_index: &Matrix4<f32>,
    sampler: &dyn VolumeSampler,
    settings: &RegistrationSettings,
) -> Result<usize> {
    let n = groups.len();
    let mut scores = score_poses(groups, poses, fixed_world_to_index, sampler, settings.metric)?;
    let mut scale = vec![1.0f32; n];
    let mut active: Vec<bool> = scores.iter().map(Option::is_some).collect();
    let mut moved = vec![false; n];

    for round in 0..settings.max_rounds {
        let indices: Vec<usize> = (0..n).filter(|&g| active[g]).collect();
        if indices.is_empty() {
            debug!(round, "Registration converged");
            break;
        }
        let mut improved = vec![false; n];
        for param in 0..6 {
            for sign in [1.0f32, -1.0] {
                let candidates: Vec<RigidTransform> = indices
                    .iter()
                    .map(|&g| {
                        let step = if param < 3 {
                            settings.translation_step
                        } else {
                            settings.rotation_step
                        };
                        let mut p = poses[g].params();
                        p[param] += sign * step * scale[g];
                        RigidTransform::from_params(p)
                    })
                    .collect();
                let subset: Vec<PoseGroup<'_>> = indices.iter().map(|&g| groups[g].clone()).collect();
                let candidate_scores = score_poses(
                    &subset,
                    &candidates,
                    fixed_world_to_index,
                    sampler,
                    settings.metric,
                )?;
                for ((&g, candidate), score) in indices.iter().zip(candidates).zip(candidate_scores) {
                    if let (Some(new), Some(old)) = (score, scores[g]) {
                        if new > old {
                            poses[g] = candidate;
                            scores[g] = Some(new);
                            improved[g] = true;
                            moved[g] = true;
                        }
                    }
                }
            }
        }
        for &g in &indices {
            if !improved[g] {
                scale[g] *= 0.5;
                if scale[g] < settings.min_step_fraction {
                    active[g] = false;
                }
            }
        }
    }
    Ok(moved.iter().filter(|m| **m).count())
}

/// Slice indices grouped by package, subdivided by `split`.
///
/// Plane `k` of a stack with `p` packages belongs to package `k mod p`.
/// The odd/even split separates alternate members of each package; each
/// halving splits every group into its first and second half.
pub fn package_groups(slices: &[Slice], packages: &[usize], split: PackageSplit) -> Vec<Vec<usize>> {
    let stacks = slices.iter().map(|s| s.stack + 1).max().unwrap_or(0);
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for stack in 0..stacks {
        let count = packages.get(stack).copied().unwrap_or(1).max(1);
        let mut by_package = vec![Vec::new(); count];
        for (index, slice) in slices.iter().enumerate().filter(|(_, s)| s.stack == stack) {
            by_package[slice.plane % count].push(index);
        }
        for package in by_package {
            let mut planes: Vec<usize> = package.iter().map(|&i| slices[i].plane).collect();
            planes.dedup();
            if split.odd_even {
                let (even, odd): (Vec<usize>, Vec<usize>) = package
                    .iter()
                    .partition(|&&i| planes.iter().position(|&p| p == slices[i].plane).unwrap_or(0) % 2 == 0);
                groups.push(even);
                groups.push(odd);
            } else {
                groups.push(package);
            }
        }
    }
    for _ in 0..split.halvings {
        groups = groups
            .into_iter()
            .flat_map(|g| {
                let mid = g.len().div_ceil(2);
                let (a, b) = g.split_at(mid);
                [a.to_vec(), b.to_vec()]
            })
            .collect();
    }
    groups.retain(|g| !g.is_empty());
    groups
}

/// Registers every group of slices against the fixed volume; members of a
/// group start from, and end with, the pose of their first slice.
pub fn register_slice_groups(
    slices: &mut [Slice],
    groups: &[Vec<usize>],
    fixed: &Volume,
    sampler: &dyn VolumeSampler,
    settings: &RegistrationSettings,
) -> Result<()> {
    let mut poses: Vec<RigidTransform> = groups.iter().map(|g| slices[g[0]].transform).collect();
    {
        let plane_groups: Vec<PoseGroup<'_>> = groups
            .iter()
            .map(|g| g.iter().map(|&i| Plane::from(&slices[i])).collect())
            .collect();
        let moved = register_groups(&plane_groups, &mut poses, &fixed.world_to_index(), sampler, settings)?;
        debug!(groups = groups.len(), moved, "Registered pose groups");
    }
    for (group, pose) in groups.iter().zip(poses) {
        for &i in group {
            slices[i].transform = pose;
        }
    }
    Ok(())
}

/// Registers every stack to the template stack, updating
/// `stack_to_template` in place. The template keeps its pose.
pub fn register_stacks_to_template(
    stacks: &[Volume],
    stack_to_template: &mut [RigidTransform],
    template: usize,
    sampler: &dyn VolumeSampler,
    settings: &RegistrationSettings,
) -> Result<()> {
    let fixed = &stacks[template];
    let fixed_world_to_index = fixed.world_to_index() * stack_to_template[template].inverse().matrix();
    for (i, stack) in stacks.iter().enumerate() {
        if i == template {
            continue;
        }
        let depth = stack.dim().0;
        let stride = (depth / 16).max(1);
        let to_world = stack.index_to_world();
        let group: PoseGroup<'_> = (0..depth)
            .step_by(stride)
            .map(|plane| Plane {
                data: stack.data.slice(s![plane, .., ..]),
                pixel_to_local: to_world * Matrix4::new_translation(&Vector3::new(0.0, 0.0, plane as f32)),
            })
            .collect();
        let mut pose = [stack_to_template[i]];
        register_groups(&[group], &mut pose, &fixed_world_to_index, sampler, settings)?;
        stack_to_template[i] = pose[0];
        info!(stack = i, pose = %pose[0], "Registered stack to template");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::HostSampler;
    use ndarray::Array3;

    fn blob() -> Volume {
        let data = Array3::from_shape_fn((16, 24, 24), |(z, y, x)| {
            let d = ((x as f32 - 11.0).powi(2) / 16.0
                + (y as f32 - 12.0).powi(2) / 36.0
                + (z as f32 - 8.0).powi(2) / 9.0)
                .sqrt();
            100.0 * (-d * d).exp() + (x as f32) * 0.5
        });
        Volume::new(data, (1.0, 1.0, 1.0))
    }

    #[test]
    fn ncc_is_one_for_affine_copies() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let b: Vec<f32> = a.iter().map(|v| 3.0 * v + 1.0).collect();
        assert!((similarity(SimilarityMetric::Ncc, &a, &b).unwrap() - 1.0).abs() < 1e-6);
        assert!(similarity(SimilarityMetric::Ncc, &a[..4], &b[..4]).is_none());
        assert!(similarity(SimilarityMetric::Ncc, &a, &[1.0; 8]).is_none());
    }

    #[test]
    fn nmi_prefers_dependent_signals() {
        let a: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let same = similarity(SimilarityMetric::Nmi, &a, &a).unwrap();
        let shuffled: Vec<f32> = (0..64).map(|i| ((i * 37) % 64) as f32).collect();
        let other = similarity(SimilarityMetric::Nmi, &a, &shuffled).unwrap();
        assert!((same - 2.0).abs() < 1e-4);
        assert!(same >= other);
    }

    #[test]
    fn recovers_a_translated_stack() {
        let template = blob();
        let moved = template.clone().with_origin((2.0, -1.0, 0.0));
        let stacks = vec![template.clone(), moved];
        let mut poses = vec![RigidTransform::IDENTITY; 2];
        let sampler = HostSampler::new(&template);
        register_stacks_to_template(&stacks, &mut poses, 0, &sampler, &RegistrationSettings::default())
            .unwrap();
        let t = poses[1].translation;
        assert!((t[0] + 2.0).abs() < 0.3, "{t:?}");
        assert!((t[1] - 1.0).abs() < 0.3, "{t:?}");
        assert_eq!(poses[0], RigidTransform::IDENTITY);
    }

    fn slice_at(stack: usize, plane: usize) -> Slice {
        Slice::new(
            stack,
            plane,
            ndarray::Array2::zeros((1, 1)),
            Matrix4::identity(),
            (1.0, 1.0),
            2.0,
            RigidTransform::IDENTITY,
        )
    }

    #[test]
    fn packages_interleave_planes() {
        let slices: Vec<Slice> = (0..6).map(|p| slice_at(0, p)).chain((0..3).map(|p| slice_at(1, p))).collect();
        let whole = package_groups(&slices, &[2, 1], PackageSplit::WHOLE);
        assert_eq!(whole, vec![vec![0, 2, 4], vec![1, 3, 5], vec![6, 7, 8]]);

        let odd_even = package_groups(&slices, &[2, 1], PackageSplit { odd_even: true, halvings: 0 });
        assert_eq!(odd_even, vec![vec![0, 4], vec![2], vec![1, 5], vec![3], vec![6, 8], vec![7]]);

        let halved = package_groups(&slices, &[2, 1], PackageSplit { odd_even: false, halvings: 1 });
        assert_eq!(halved, vec![vec![0, 2], vec![4], vec![1, 3], vec![5], vec![6, 7], vec![8]]);
    }
}
