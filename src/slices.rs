//! Slices: the units that get registered and reconstructed.

use nalgebra::{Matrix4, Vector3};
use ndarray::{Array2, s};
use tracing::{debug, warn};

use crate::enums::PartitionStrategy;
use crate::error::{ReconstructionError, Result};
use crate::interpolator::Interpolator;
use crate::partition::{LabelStack, label_bounds, tile_patches};
use crate::transform::RigidTransform;
use crate::volume::{Mask, Volume};

/// Pixel value marking "no data".
pub const PADDING: f32 = -1.0;

/// Full width at half maximum of a unit Gaussian.
const FWHM: f32 = 2.3548;

#[inline]
pub fn is_valid(value: f32) -> bool {
    value > PADDING
}

/// A 2D unit cut from a stack, together with the per-slice state the
/// reconstruction updates.
#[derive(Clone, Debug)]
pub struct Slice {
    pub stack: usize,
    pub plane: usize,
    /// `(height, width)`; pixels equal to [`PADDING`] are ignored.
    pub data: Array2<f32>,
    /// Pixel `(i, j, 0, 1)` to stack world millimetres.
    pub pixel_to_stack: Matrix4<f32>,
    /// In-plane pixel size `(x, y)`.
    pub spacing: (f32, f32),
    pub thickness: f32,
    /// Stack world to template world.
    pub transform: RigidTransform,

    pub bias: Array2<f32>,
    pub scale: f32,
    pub weights: Array2<f32>,
    pub slice_weight: f32,
    pub simulated: Array2<f32>,
    pub coverage: Array2<f32>,
    pub inside: bool,
}

impl Slice {
    pub fn new(
        stack: usize,
        plane: usize,
        data: Array2<f32>,
        pixel_to_stack: Matrix4<f32>,
        spacing: (f32, f32),
        thickness: f32,
        transform: RigidTransform,
    ) -> Self {
        let dim = data.dim();
        Self {
            stack,
            plane,
            data,
            pixel_to_stack,
            spacing,
            thickness,
            transform,
            bias: Array2::zeros(dim),
            scale: 1.0,
            weights: Array2::ones(dim),
            slice_weight: 1.0,
            simulated: Array2::zeros(dim),
            coverage: Array2::zeros(dim),
            inside: false,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Pixel to template world.
    pub fn pixel_to_world(&self) -> Matrix4<f32> {
        self.transform.matrix() * self.pixel_to_stack
    }

    /// Template world position of pixel `(i, j)`.
    pub fn world_position(&self, i: usize, j: usize) -> Vector3<f32> {
        let p = self.pixel_to_world() * nalgebra::Vector4::new(i as f32, j as f32, 0.0, 1.0);
        Vector3::new(p.x, p.y, p.z)
    }

    /// Standard deviations of the slice PSF, `(x, y, z)` in millimetres.
    pub fn psf_sigma(&self) -> (f32, f32, f32) {
        (
            1.2 * self.spacing.0 / FWHM,
            1.2 * self.spacing.1 / FWHM,
            self.thickness / FWHM,
        )
    }

    /// PSF axes in template world millimetres, scaled by the PSF sigma.
    pub fn psf_axes(&self) -> Matrix4<f32> {
        let (sx, sy, sz) = self.psf_sigma();
        let mut linear = self.pixel_to_world();
        for c in 0..3 {
            let norm = linear.fixed_view::<3, 1>(0, c).norm().max(f32::EPSILON);
            let sigma = [sx, sy, sz][c];
            for r in 0..3 {
                linear[(r, c)] *= sigma / norm;
            }
        }
        for r in 0..4 {
            linear[(r, 3)] = 0.0;
        }
        linear[(3, 3)] = 0.0;
        linear
    }

    pub fn valid_pixels(&self) -> usize {
        self.data.iter().filter(|v| is_valid(**v)).count()
    }
}

/// Builds the slice set for all stacks under the given partition strategy.
///
/// Each slice inherits its stack's transform; `thickness` must be parallel
/// to `stacks`.
pub fn create_slices(
    stacks: &[Volume],
    transforms: &[RigidTransform],
    thickness: &[f32],
    partition: PartitionStrategy,
    labels: Option<&[LabelStack]>,
) -> Result<Vec<Slice>> {
    if transforms.len() != stacks.len() || thickness.len() != stacks.len() {
        return Err(ReconstructionError::invalid(format!(
            "{} stacks, {} transforms, {} thickness values",
            stacks.len(),
            transforms.len(),
            thickness.len()
        )));
    }

    let mut slices = Vec::new();
    for (s, stack) in stacks.iter().enumerate() {
        let to_world = stack.index_to_world();
        let spacing = (stack.spacing.0, stack.spacing.1);
        let unit = |plane: usize, y: usize, x: usize, data: Array2<f32>| {
            let offset = Matrix4::new_translation(&Vector3::new(x as f32, y as f32, plane as f32));
            Slice::new(s, plane, data, to_world * offset, spacing, thickness[s], transforms[s])
        };

        match partition {
            PartitionStrategy::Slices => {
                for plane in 0..stack.dim().0 {
                    let data = stack.data.slice(s![plane, .., ..]).to_owned();
                    slices.push(unit(plane, 0, 0, data));
                }
            }
            PartitionStrategy::Patches { size, stride } => {
                for patch in tile_patches(stack.dim(), size, stride) {
                    let data = stack
                        .data
                        .slice(s![
                            patch.plane,
                            patch.y..patch.y + patch.height,
                            patch.x..patch.x + patch.width
                        ])
                        .to_owned();
                    slices.push(unit(patch.plane, patch.y, patch.x, data));
                }
            }
            PartitionStrategy::Superpixels { .. } => {
                let Some(labels) = labels.and_then(|l| l.get(s)) else {
                    return Err(ReconstructionError::invalid(
                        "superpixel partition without label stacks",
                    ));
                };
                for plane in 0..stack.dim().0 {
                    let plane_labels = labels.data.slice(s![plane, .., ..]);
                    let max_label = plane_labels.iter().copied().max().unwrap_or(0);
                    for label in 1..=max_label {
                        let Some((y0, y1, x0, x1)) = label_bounds(plane_labels, label) else {
                            continue;
                        };
                        let mut data = stack.data.slice(s![plane, y0..y1, x0..x1]).to_owned();
                        let region = plane_labels.slice(s![y0..y1, x0..x1]);
                        data.zip_mut_with(&region, |v, &l| {
                            if l != label {
                                *v = PADDING;
                            }
                        });
                        slices.push(unit(plane, y0, x0, data));
                    }
                }
            }
        }
    }
    debug!(slices = slices.len(), ?partition, "Created slices");
    Ok(slices)
}

/// Sets every slice pixel whose template position falls outside `mask` to
/// [`PADDING`].
pub fn mask_slices(slices: &mut [Slice], mask: &Mask) {
    let to_index = mask.world_to_index();
    for slice in slices.iter_mut() {
        let to_mask = to_index * slice.pixel_to_world();
        for ((j, i), value) in slice.data.indexed_iter_mut() {
            let p = to_mask * nalgebra::Vector4::new(i as f32, j as f32, 0.0, 1.0);
            let inside = Interpolator::nearest(&mask.data, p.x, p.y, p.z).is_some_and(|m| m > 0);
            if !inside {
                *value = PADDING;
            }
        }
    }
}

/// Replaces slice pixel data with externally registered slices; the count
/// and shapes must match.
pub fn replace_slices(slices: &mut [Slice], replacements: Vec<Array2<f32>>) -> Result<()> {
    if replacements.len() != slices.len() {
        return Err(ReconstructionError::ShapeMismatch {
            expected: vec![slices.len()],
            actual: vec![replacements.len()],
        });
    }
    for (slice, data) in slices.iter_mut().zip(replacements) {
        if data.dim() != slice.dim() {
            let (h, w) = slice.dim();
            let (rh, rw) = data.dim();
            return Err(ReconstructionError::ShapeMismatch {
                expected: vec![h, w],
                actual: vec![rh, rw],
            });
        }
        slice.data = data;
    }
    Ok(())
}

/// Initialises slice transforms from externally estimated ones. Missing
/// entries keep the stack transform.
pub fn replace_transforms(slices: &mut [Slice], transforms: &[RigidTransform]) {
    if transforms.len() != slices.len() {
        warn!(
            slices = slices.len(),
            transforms = transforms.len(),
            "Slice transformation count does not match the slice count"
        );
    }
    for (slice, transform) in slices.iter_mut().zip(transforms) {
        slice.transform = *transform;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn stack() -> Volume {
        let data = Array3::from_shape_fn((3, 4, 6), |(z, y, x)| (100 * z + 10 * y + x) as f32);
        Volume::new(data, (1.0, 1.0, 2.0)).with_origin((5.0, 0.0, 0.0))
    }

    #[test]
    fn one_slice_per_plane() {
        let slices = create_slices(
            &[stack()],
            &[RigidTransform::IDENTITY],
            &[4.0],
            PartitionStrategy::Slices,
            None,
        )
        .unwrap();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[2].data[[1, 3]], 213.0);
        let p = slices[2].world_position(3, 1);
        assert_eq!((p.x, p.y, p.z), (8.0, 1.0, 4.0));
        assert_eq!(slices[0].thickness, 4.0);
    }

    #[test]
    fn patches_carry_their_offset() {
        let slices = create_slices(
            &[stack()],
            &[RigidTransform::IDENTITY],
            &[4.0],
            PartitionStrategy::Patches { size: 4, stride: 2 },
            None,
        )
        .unwrap();
        // x starts 0, 2; y is a single tile.
        assert_eq!(slices.len(), 3 * 2);
        let second = &slices[1];
        assert_eq!(second.data[[0, 0]], 2.0);
        assert_eq!(second.world_position(0, 0).x, 7.0);
    }

    #[test]
    fn superpixels_pad_other_labels() {
        let stack = stack();
        let labels = stack.with_data(Array3::from_shape_fn((3, 4, 6), |(_, _, x)| {
            if x < 3 { 1 } else { 2 }
        }));
        let slices = create_slices(
            &[stack],
            &[RigidTransform::IDENTITY],
            &[4.0],
            PartitionStrategy::Superpixels { count: 2 },
            Some(&[labels]),
        )
        .unwrap();
        assert_eq!(slices.len(), 6);
        assert_eq!(slices[1].dim(), (4, 3));
        assert_eq!(slices[1].data[[0, 0]], 3.0);
        assert!(slices.iter().all(|s| s.valid_pixels() == 12));
    }

    #[test]
    fn masking_pads_outside_pixels() {
        let stack = stack();
        let mut slices = create_slices(
            &[stack.clone()],
            &[RigidTransform::IDENTITY],
            &[4.0],
            PartitionStrategy::Slices,
            None,
        )
        .unwrap();
        let mask = stack.with_data(Array3::from_shape_fn(stack.dim(), |(_, _, x)| u8::from(x < 2)));
        mask_slices(&mut slices, &mask);
        assert!(slices.iter().all(|s| s.valid_pixels() == 8));
        assert_eq!(slices[0].data[[0, 4]], PADDING);
    }

    #[test]
    fn replacement_count_must_match() {
        let mut slices = create_slices(
            &[stack()],
            &[RigidTransform::IDENTITY],
            &[4.0],
            PartitionStrategy::Slices,
            None,
        )
        .unwrap();
        assert!(replace_slices(&mut slices, vec![Array2::zeros((4, 6))]).is_err());
        let ok = vec![Array2::from_elem((4, 6), 7.0); 3];
        replace_slices(&mut slices, ok).unwrap();
        assert_eq!(slices[1].data[[0, 0]], 7.0);
    }
}
