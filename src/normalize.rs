//! Stack intensity matching.

use nalgebra::Vector4;
use rayon::prelude::*;
use tracing::info;

use crate::interpolator::Interpolator;
use crate::transform::RigidTransform;
use crate::volume::{Mask, Volume};

/// Rescales every stack so its masked mean becomes `target`.
///
/// Only positive voxels whose template position lies inside `mask` count
/// towards the mean; without a mask every positive voxel counts. With
/// `common` one factor, derived from the pooled mean of all stacks, is
/// applied to all of them. Returns the factor applied to each stack.
pub fn match_stack_intensities(
    stacks: &mut [Volume],
    stack_to_template: &[RigidTransform],
    mask: Option<&Mask>,
    target: f32,
    common: bool,
) -> Vec<f32> {
    let sums: Vec<(f64, usize)> = stacks
        .par_iter()
        .enumerate()
        .map(|(i, stack)| {
            let pose = stack_to_template.get(i).copied().unwrap_or_default();
            masked_sum(stack, &pose, mask)
        })
        .collect();

    let factors: Vec<f32> = if common {
        let (sum, n) = sums
            .iter()
            .fold((0.0, 0), |(s, c), (si, ci)| (s + si, c + ci));
        let factor = factor_for(sum, n, target);
        vec![factor; stacks.len()]
    } else {
        sums.iter().map(|&(s, n)| factor_for(s, n, target)).collect()
    };

    stacks
        .par_iter_mut()
        .zip(&factors)
        .for_each(|(stack, &f)| stack.data.mapv_inplace(|v| if v > 0.0 { v * f } else { v }));
    info!(?factors, target, common, "Matched stack intensities");
    factors
}

fn factor_for(sum: f64, n: usize, target: f32) -> f32 {
    if n == 0 || sum <= 0.0 {
        return 1.0;
    }
    (target as f64 / (sum / n as f64)) as f32
}

fn masked_sum(stack: &Volume, pose: &RigidTransform, mask: Option<&Mask>) -> (f64, usize) {
    let into_mask = mask.map(|m| m.world_to_index() * pose.matrix() * stack.index_to_world());
    let mut sum = 0.0f64;
    let mut n = 0usize;
    for ((z, y, x), &v) in stack.data.indexed_iter() {
        if v <= 0.0 {
            continue;
        }
        if let (Some(mask), Some(into)) = (mask, into_mask.as_ref()) {
            let q = into * Vector4::new(x as f32, y as f32, z as f32, 1.0);
            if Interpolator::nearest(&mask.data, q.x, q.y, q.z).unwrap_or(0) == 0 {
                continue;
            }
        }
        sum += v as f64;
        n += 1;
    }
    (sum, n)
}
