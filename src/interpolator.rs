use ndarray::{Array3, ArrayView2};

pub(crate) struct Interpolator;

impl Interpolator {
    pub(crate) fn get_isotropic_dimensions(
        spacing: (f32, f32, f32),
        original_dim: (usize, usize, usize),
    ) -> (u32, u32, u32) {
        let (x_spacing, y_spacing, z_spacing) = spacing;
        let min_spacing = x_spacing.min(y_spacing).min(z_spacing);
        Self::get_dimensions_at(spacing, original_dim, min_spacing)
    }

    /// Grid size covering the same extent at an isotropic `resolution`.
    pub(crate) fn get_dimensions_at(
        spacing: (f32, f32, f32),
        original_dim: (usize, usize, usize),
        resolution: f32,
    ) -> (u32, u32, u32) {
        let (x_spacing, y_spacing, z_spacing) = spacing;
        let inv_resolution = 1.0 / resolution;

        // original_dim is (depth, height, width) corresponding to (z, y, x)
        let new_x = (original_dim.2 as f32 * x_spacing * inv_resolution) as u32;
        let new_y = (original_dim.1 as f32 * y_spacing * inv_resolution) as u32;
        let new_z = (original_dim.0 as f32 * z_spacing * inv_resolution) as u32;

        (new_z.max(1), new_y.max(1), new_x.max(1))
    }

    #[inline]
    pub(crate) fn bilinear_interpolate(slice: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
        let (height, width) = slice.dim();

        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dy = y - y0 as f32;
        let dx = x - x0 as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let v00 = slice[[y0, x0]];
        let v01 = slice[[y0, x1]];
        let v10 = slice[[y1, x0]];
        let v11 = slice[[y1, x1]];

        let v0 = v00.mul_add(one_minus_dx, v01 * dx);
        let v1 = v10.mul_add(one_minus_dx, v11 * dx);

        v0.mul_add(one_minus_dy, v1 * dy)
    }

    /// Trilinear sample at continuous index `(x, y, z)`.
    ///
    /// Returns `None` outside `[0, n-1]` on any axis. The WGSL sampler in
    /// `shaders/sample_slices.wgsl` mirrors this exactly.
    #[inline]
    pub(crate) fn trilinear_interpolate(volume: &Array3<f32>, x: f32, y: f32, z: f32) -> Option<f32> {
        let (depth, height, width) = volume.dim();
        if !Self::inside(volume.dim(), x, y, z) {
            return None;
        }

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let z0 = z.floor() as usize;
        let x1 = (x0 + 1).min(width - 1);
        let y1 = (y0 + 1).min(height - 1);
        let z1 = (z0 + 1).min(depth - 1);

        let dx = x - x0 as f32;
        let dy = y - y0 as f32;
        let dz = z - z0 as f32;

        let c00 = volume[[z0, y0, x0]] * (1.0 - dx) + volume[[z0, y0, x1]] * dx;
        let c01 = volume[[z0, y1, x0]] * (1.0 - dx) + volume[[z0, y1, x1]] * dx;
        let c10 = volume[[z1, y0, x0]] * (1.0 - dx) + volume[[z1, y0, x1]] * dx;
        let c11 = volume[[z1, y1, x0]] * (1.0 - dx) + volume[[z1, y1, x1]] * dx;

        let c0 = c00 * (1.0 - dy) + c01 * dy;
        let c1 = c10 * (1.0 - dy) + c11 * dy;

        Some(c0 * (1.0 - dz) + c1 * dz)
    }

    /// Eight corner indices and weights of a trilinear sample, used to
    /// scatter values back into a grid.
    #[inline]
    pub(crate) fn trilinear_corners(
        dim: (usize, usize, usize),
        x: f32,
        y: f32,
        z: f32,
    ) -> Option<[((usize, usize, usize), f32); 8]> {
        if !Self::inside(dim, x, y, z) {
            return None;
        }
        let (depth, height, width) = dim;
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let z0 = z.floor() as usize;
        let x1 = (x0 + 1).min(width - 1);
        let y1 = (y0 + 1).min(height - 1);
        let z1 = (z0 + 1).min(depth - 1);
        let dx = x - x0 as f32;
        let dy = y - y0 as f32;
        let dz = z - z0 as f32;

        Some([
            ((z0, y0, x0), (1.0 - dx) * (1.0 - dy) * (1.0 - dz)),
            ((z0, y0, x1), dx * (1.0 - dy) * (1.0 - dz)),
            ((z0, y1, x0), (1.0 - dx) * dy * (1.0 - dz)),
            ((z0, y1, x1), dx * dy * (1.0 - dz)),
            ((z1, y0, x0), (1.0 - dx) * (1.0 - dy) * dz),
            ((z1, y0, x1), dx * (1.0 - dy) * dz),
            ((z1, y1, x0), (1.0 - dx) * dy * dz),
            ((z1, y1, x1), dx * dy * dz),
        ])
    }

    #[inline]
    fn inside(dim: (usize, usize, usize), x: f32, y: f32, z: f32) -> bool {
        let (depth, height, width) = dim;
        x >= 0.0
            && y >= 0.0
            && z >= 0.0
            && x <= (width - 1) as f32
            && y <= (height - 1) as f32
            && z <= (depth - 1) as f32
    }

    /// Nearest-neighbour lookup, `None` outside the grid.
    #[inline]
    pub(crate) fn nearest<T: Copy>(volume: &Array3<T>, x: f32, y: f32, z: f32) -> Option<T> {
        let (depth, height, width) = volume.dim();
        let (xi, yi, zi) = (x.round(), y.round(), z.round());
        if xi < 0.0 || yi < 0.0 || zi < 0.0 {
            return None;
        }
        let (xi, yi, zi) = (xi as usize, yi as usize, zi as usize);
        if xi >= width || yi >= height || zi >= depth {
            return None;
        }
        Some(volume[[zi, yi, xi]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trilinear_matches_linear_ramp() {
        let volume = Array3::from_shape_fn((3, 3, 3), |(z, y, x)| (x + 10 * y + 100 * z) as f32);
        let v = Interpolator::trilinear_interpolate(&volume, 0.5, 1.25, 1.5).unwrap();
        assert!((v - (0.5 + 12.5 + 150.0)).abs() < 1e-4);
        assert!(Interpolator::trilinear_interpolate(&volume, 2.5, 0.0, 0.0).is_none());
    }

    #[test]
    fn corner_weights_sum_to_one() {
        let corners = Interpolator::trilinear_corners((4, 4, 4), 1.3, 2.7, 0.2).unwrap();
        let total: f32 = corners.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn isotropic_dimensions_follow_finest_spacing() {
        let dims = Interpolator::get_isotropic_dimensions((0.5, 0.5, 2.0), (10, 64, 64));
        assert_eq!(dims, (40, 64, 64));
    }
}
