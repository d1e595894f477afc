//! Region of interest handling and the template/average volumes.
//!
//! The mask is defined once in template space. Each stack gets its own copy
//! through [`transform_mask`], and is then cut down with [`crop_to_mask`].

use nalgebra::{Matrix4, Vector4};
use ndarray::{Array3, Zip};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::filter::gaussian_smooth;
use crate::interpolator::Interpolator;
use crate::transform::RigidTransform;
use crate::volume::{Mask, Volume};

/// Mask of every voxel with positive intensity.
pub fn create_mask(stack: &Volume) -> Mask {
    stack.with_data(stack.data.mapv(|v| u8::from(v > 0.0)))
}

/// Mask on the template stack grid of the region covered by every stack.
pub fn create_mask_from_overlap(
    stacks: &[Volume],
    stack_to_template: &[RigidTransform],
    template: usize,
) -> Mask {
    let grid = &stacks[template];
    let to_world = grid.index_to_world();
    let into_stacks: Vec<Matrix4<f32>> = stacks
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let t = stack_to_template.get(i).copied().unwrap_or_default();
            s.world_to_index() * t.inverse().matrix() * to_world
        })
        .collect();

    let mut data = Array3::<u8>::zeros(grid.dim());
    Zip::indexed(&mut data).par_for_each(|(z, y, x), m| {
        let p = Vector4::new(x as f32, y as f32, z as f32, 1.0);
        let covered = stacks.iter().zip(&into_stacks).all(|(s, into)| {
            let q = into * p;
            Interpolator::nearest(&s.data, q.x, q.y, q.z).is_some_and(|v| v > 0.0)
        });
        *m = u8::from(covered);
    });
    grid.with_data(data)
}

/// Resamples the template-space `mask` onto the grid of `stack`.
///
/// `stack_to_template` is the stack's current pose. Nearest neighbour
/// lookup keeps the mask binary.
pub fn transform_mask<T>(stack: &Volume<T>, mask: &Mask, stack_to_template: &RigidTransform) -> Mask {
    let into_mask = mask.world_to_index() * stack_to_template.matrix() * stack.index_to_world();
    let mut data = Array3::<u8>::zeros(stack.dim());
    Zip::indexed(&mut data).par_for_each(|(z, y, x), m| {
        let q = into_mask * Vector4::new(x as f32, y as f32, z as f32, 1.0);
        *m = Interpolator::nearest(&mask.data, q.x, q.y, q.z).unwrap_or(0);
    });
    stack.with_data(data)
}

/// Bounding box `(z, y, x)` index ranges of the non-zero voxels.
pub fn mask_bounds(
    mask: &Mask,
) -> Option<(std::ops::Range<usize>, std::ops::Range<usize>, std::ops::Range<usize>)> {
    let mut lo = [usize::MAX; 3];
    let mut hi = [0usize; 3];
    let mut any = false;
    for ((z, y, x), &m) in mask.data.indexed_iter() {
        if m == 0 {
            continue;
        }
        any = true;
        for (axis, v) in [z, y, x].into_iter().enumerate() {
            lo[axis] = lo[axis].min(v);
            hi[axis] = hi[axis].max(v + 1);
        }
    }
    any.then(|| (lo[0]..hi[0], lo[1]..hi[1], lo[2]..hi[2]))
}

/// Crops `stack` to the bounding box of `mask`, which must share its grid.
/// An empty or mismatched mask leaves the stack unchanged.
pub fn crop_to_mask<T: Clone>(stack: &Volume<T>, mask: &Mask) -> Volume<T> {
    if stack.dim() != mask.dim() {
        warn!(stack = ?stack.dim(), mask = ?mask.dim(), "Mask grid differs from stack, not cropping");
        return stack.clone();
    }
    match mask_bounds(mask) {
        Some((z, y, x)) => {
            debug!(?z, ?y, ?x, "Cropping to mask");
            stack.crop(z, y, x)
        }
        None => {
            warn!("Mask is empty, not cropping");
            stack.clone()
        }
    }
}

/// Isotropic reconstruction grid covering the template stack.
///
/// A non-positive `resolution` uses the finest in-plane spacing. Returns the
/// grid, holding the resampled template, and the resolution actually used.
pub fn create_template(template: &Volume, resolution: f32) -> (Volume, f32) {
    let resolution = if resolution > 0.0 {
        resolution
    } else {
        template.spacing.0.min(template.spacing.1)
    };
    let (d, h, w) = Interpolator::get_dimensions_at(template.spacing, template.dim(), resolution);
    let grid = Volume::new(
        Array3::<f32>::zeros((d as usize, h as usize, w as usize)),
        (resolution, resolution, resolution),
    )
    .with_origin(template.origin);

    let into_template = template.world_to_index() * grid.index_to_world();
    let mut data = grid.data.clone();
    Zip::indexed(&mut data).par_for_each(|(z, y, x), v| {
        let q = into_template * Vector4::new(x as f32, y as f32, z as f32, 1.0);
        *v = Interpolator::trilinear_interpolate(&template.data, q.x, q.y, q.z).unwrap_or(0.0);
    });
    debug!(dim = ?(d, h, w), resolution, "Created reconstruction template");
    (grid.with_data(data), resolution)
}

/// Average of all stacks resampled onto `grid`, ignoring non-positive
/// samples.
pub fn create_average(stacks: &[Volume], stack_to_template: &[RigidTransform], grid: &Volume) -> Volume {
    let to_world = grid.index_to_world();
    let into_stacks: Vec<Matrix4<f32>> = stacks
        .iter()
        .zip(stack_to_template)
        .map(|(s, t)| s.world_to_index() * t.inverse().matrix() * to_world)
        .collect();
    let mut data = Array3::<f32>::zeros(grid.dim());
    Zip::indexed(&mut data).par_for_each(|(z, y, x), v| {
        let p = Vector4::new(x as f32, y as f32, z as f32, 1.0);
        let (sum, n) = stacks
            .iter()
            .zip(&into_stacks)
            .filter_map(|(s, into)| {
                let q = into * p;
                Interpolator::trilinear_interpolate(&s.data, q.x, q.y, q.z).filter(|v| *v > 0.0)
            })
            .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
        *v = if n > 0 { sum / n as f32 } else { 0.0 };
    });
    grid.with_data(data)
}

/// Brings the canonical mask onto the reconstruction grid, optionally
/// smoothing it by `smooth_mm` and re-thresholding at one half.
pub fn mask_on_grid(mask: &Mask, grid: &Volume, smooth_mm: f32) -> Mask {
    let into_mask = mask.world_to_index() * grid.index_to_world();
    let soft = mask.data.mapv(f32::from);
    let mut data = Array3::<f32>::zeros(grid.dim());
    Zip::indexed(&mut data).par_for_each(|(z, y, x), v| {
        let q = into_mask * Vector4::new(x as f32, y as f32, z as f32, 1.0);
        *v = Interpolator::trilinear_interpolate(&soft, q.x, q.y, q.z)
            .or_else(|| Interpolator::nearest(&mask.data, q.x, q.y, q.z).map(f32::from))
            .unwrap_or(0.0);
    });
    if smooth_mm > 0.0 {
        let (sx, sy, sz) = grid.spacing;
        // Array axes are (z, y, x).
        gaussian_smooth(&mut data, &[smooth_mm / sz, smooth_mm / sy, smooth_mm / sx]);
    }
    grid.with_data(data.mapv(|v| u8::from(v >= 0.5)))
}

/// Number of non-zero voxels.
pub fn masked_voxels(mask: &Mask) -> usize {
    mask.data.par_iter().filter(|m| **m > 0).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_mask() -> Mask {
        let data = Array3::from_shape_fn((12, 12, 12), |(z, y, x)| {
            u8::from((3..9).contains(&z) && (4..8).contains(&y) && (2..10).contains(&x))
        });
        Volume::new(data, (1.0, 1.0, 1.0))
    }

    #[test]
    fn round_trip_restores_support() {
        let mask = cube_mask();
        let pose = RigidTransform::new([1.0, -2.0, 0.0], [0.0; 3]);
        let stack = Volume::new(Array3::<f32>::zeros((12, 12, 12)), (1.0, 1.0, 1.0));
        let local = transform_mask(&stack, &mask, &pose);
        assert_eq!(masked_voxels(&local), masked_voxels(&mask));
        let back = transform_mask(&mask, &local, &pose.inverse());
        assert_eq!(back.data, mask.data);
    }

    #[test]
    fn rotated_round_trip_keeps_most_of_support() {
        let mask = cube_mask();
        let pose = RigidTransform::new([0.0; 3], [0.0, 0.0, 10.0]);
        let stack = Volume::new(Array3::<f32>::zeros((12, 12, 12)), (1.0, 1.0, 1.0));
        let local = transform_mask(&stack, &mask, &pose);
        let back = transform_mask(&mask, &local, &pose.inverse());
        let agree = Zip::from(&back.data)
            .and(&mask.data)
            .fold(0usize, |n, a, b| n + usize::from(a == b));
        // One nearest-neighbour resampling step in each direction.
        assert!(agree as f32 / back.data.len() as f32 > 0.9);
        assert_eq!(back.data[[6, 6, 6]], 1);
    }

    #[test]
    fn crop_uses_bounding_box() {
        let mask = cube_mask();
        let stack = mask.with_data(mask.data.mapv(f32::from));
        let cropped = crop_to_mask(&stack, &mask);
        assert_eq!(cropped.dim(), (6, 4, 8));
        assert_eq!(cropped.origin, (2.0, 4.0, 3.0));
        let empty = mask.with_data(Array3::zeros(mask.dim()));
        assert_eq!(crop_to_mask(&stack, &empty).dim(), stack.dim());
    }

    #[test]
    fn template_grid_is_isotropic() {
        let stack = Volume::new(Array3::from_elem((5, 8, 8), 2.0f32), (0.5, 0.5, 2.0));
        let (grid, resolution) = create_template(&stack, 0.0);
        assert_eq!(resolution, 0.5);
        assert_eq!(grid.dim(), (20, 8, 8));
        assert_eq!(grid.data[[0, 0, 0]], 2.0);
    }

    #[test]
    fn average_of_overlapping_stacks() {
        let a = Volume::new(Array3::from_elem((4, 4, 4), 2.0f32), (1.0, 1.0, 1.0));
        let b = Volume::new(Array3::from_elem((4, 4, 4), 4.0f32), (1.0, 1.0, 1.0));
        let identity = [RigidTransform::IDENTITY; 2];
        let avg = create_average(&[a.clone(), b], &identity, &a);
        assert!(avg.data.iter().all(|v| (*v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn overlap_mask_excludes_uncovered_region() {
        let a = Volume::new(Array3::from_elem((4, 4, 4), 1.0f32), (1.0, 1.0, 1.0));
        let b = Volume::new(Array3::from_elem((4, 4, 2), 1.0f32), (1.0, 1.0, 1.0));
        let identity = [RigidTransform::IDENTITY; 2];
        let mask = create_mask_from_overlap(&[a, b], &identity, 0);
        assert_eq!(masked_voxels(&mask), 4 * 4 * 2);
    }

    #[test]
    fn smoothing_keeps_large_regions() {
        let mask = cube_mask();
        let grid = Volume::new(Array3::<f32>::zeros((12, 12, 12)), (1.0, 1.0, 1.0));
        let on_grid = mask_on_grid(&mask, &grid, 1.0);
        assert_eq!(on_grid.data[[6, 6, 6]], 1);
        assert_eq!(on_grid.data[[0, 0, 0]], 0);
    }
}
