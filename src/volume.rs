use crate::enums::Interpolation;
use crate::enums::Orientation;
use crate::interpolator::Interpolator;

use image::ImageBuffer;
use image::Luma;
use nalgebra::Matrix4;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;

pub type GrayImage = ImageBuffer<Luma<u8>, Vec<u8>>;

/// Binary region of interest, 0 outside and 1 inside.
pub type Mask = Volume<u8>;

/// A 3D image with its physical geometry.
///
/// Data is stored as `(z, y, x)`. `spacing` and `origin` are given as
/// `(x, y, z)` in millimetres, `origin` being the world position of voxel
/// `(0, 0, 0)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Volume<T = f32> {
    pub data: Array3<T>,
    pub spacing: (f32, f32, f32),
    pub origin: (f32, f32, f32),
}

impl<T> Volume<T> {
    pub fn new(data: Array3<T>, spacing: (f32, f32, f32)) -> Self {
        Self {
            data,
            spacing,
            origin: (0.0, 0.0, 0.0),
        }
    }

    pub fn with_origin(mut self, origin: (f32, f32, f32)) -> Self {
        self.origin = origin;
        self
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<T> {
        &self.data
    }

    /// Same geometry, different voxels.
    pub fn with_data<U>(&self, data: Array3<U>) -> Volume<U> {
        Volume {
            data,
            spacing: self.spacing,
            origin: self.origin,
        }
    }

    pub fn same_grid<U>(&self, other: &Volume<U>) -> bool {
        self.dim() == other.dim() && self.spacing == other.spacing && self.origin == other.origin
    }

    /// Matrix taking homogeneous voxel indices `(x, y, z, 1)` to world millimetres.
    pub fn index_to_world(&self) -> Matrix4<f32> {
        let (sx, sy, sz) = self.spacing;
        let (ox, oy, oz) = self.origin;
        Matrix4::new(
            sx, 0.0, 0.0, ox, //
            0.0, sy, 0.0, oy, //
            0.0, 0.0, sz, oz, //
            0.0, 0.0, 0.0, 1.0,
        )
    }

    pub fn world_to_index(&self) -> Matrix4<f32> {
        let (sx, sy, sz) = self.spacing;
        let (ox, oy, oz) = self.origin;
        Matrix4::new(
            1.0 / sx,
            0.0,
            0.0,
            -ox / sx,
            0.0,
            1.0 / sy,
            0.0,
            -oy / sy,
            0.0,
            0.0,
            1.0 / sz,
            -oz / sz,
            0.0,
            0.0,
            0.0,
            1.0,
        )
    }
}

impl<T: Clone> Volume<T> {
    /// Sub-volume covering `z`, `y` and `x` index ranges, with the origin
    /// moved so world positions are unchanged.
    pub fn crop(
        &self,
        z: std::ops::Range<usize>,
        y: std::ops::Range<usize>,
        x: std::ops::Range<usize>,
    ) -> Self {
        let (sx, sy, sz) = self.spacing;
        let (ox, oy, oz) = self.origin;
        let origin = (
            ox + x.start as f32 * sx,
            oy + y.start as f32 * sy,
            oz + z.start as f32 * sz,
        );
        Self {
            data: self.data.slice(s![z, y, x]).to_owned(),
            spacing: self.spacing,
            origin,
        }
    }
}

impl Volume<f32> {
    pub fn zeros_like<U>(grid: &Volume<U>) -> Self {
        grid.with_data(Array3::zeros(grid.dim()))
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(0.0, f32::max)
    }

    #[inline]
    fn normalize_to_u8(value: f32, max: f32) -> u8 {
        if max <= 0.0 {
            return 0;
        }
        ((value / max) * 255.0).clamp(0.0, 255.0) as u8
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        let slice_result = match orientation {
            Orientation::Axial => self.data().slice(s![index, .., ..]),
            Orientation::Coronal => self.data().slice(s![.., index, ..]),
            Orientation::Sagittal => self.data().slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    fn get_output_dimensions(&self, orientation: &Orientation) -> (u32, u32) {
        let interpolated_dim = Interpolator::get_isotropic_dimensions(self.spacing, self.dim());
        // Always return (width, height) - standard image convention
        match orientation {
            Orientation::Axial => (interpolated_dim.2, interpolated_dim.1),
            Orientation::Coronal => (interpolated_dim.2, interpolated_dim.0),
            Orientation::Sagittal => (interpolated_dim.1, interpolated_dim.0),
        }
    }

    fn slice_to_image(slice: &ArrayView2<'_, f32>, max: f32) -> Option<GrayImage> {
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice
            .into_par_iter()
            .map(|&v| Self::normalize_to_u8(v, max))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    /// Grey-value preview of one plane, scaled to the volume maximum.
    pub fn preview(
        &self,
        index: usize,
        orientation: Orientation,
        interpolation: Interpolation,
    ) -> Option<GrayImage> {
        if !self.is_valid_index(index, &orientation) {
            return None;
        }
        let slice = self.get_slice_from_axis(index, &orientation)?;
        let max = self.max_value();

        match interpolation {
            Interpolation::None => Self::slice_to_image(&slice, max),
            Interpolation::Linear => {
                if matches!(orientation, Orientation::Axial) {
                    return Self::slice_to_image(&slice, max);
                }
                let (width, height) = self.get_output_dimensions(&orientation);
                Self::interpolate_slice(&slice, width, height, max)
            }
        }
    }

    fn interpolate_slice(
        slice: &ArrayView2<'_, f32>,
        width: u32,
        height: u32,
        max: f32,
    ) -> Option<GrayImage> {
        let (slice_height, slice_width) = slice.dim();
        if slice_height == 0 || slice_width == 0 {
            return None;
        }

        let pixel_data: Vec<u8> = (0..height)
            .into_par_iter()
            .flat_map(|y| {
                (0..width)
                    .map(|x| {
                        let norm_x = (x as f32 + 0.5) / width as f32;
                        let norm_y = (y as f32 + 0.5) / height as f32;

                        let src_x = norm_x * slice_width as f32 - 0.5;
                        let src_y = norm_y * slice_height as f32 - 0.5;

                        let src_x = src_x.max(0.0).min((slice_width - 1) as f32);
                        let src_y = src_y.max(0.0).min((slice_height - 1) as f32);

                        let value = Interpolator::bilinear_interpolate(slice, src_y, src_x);
                        Self::normalize_to_u8(value, max)
                    })
                    .collect::<Vec<u8>>()
            })
            .collect();

        ImageBuffer::from_raw(width, height, pixel_data)
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        let dim = self.data.dim();
        let max_index = match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        };
        index < max_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector4;

    #[test]
    fn index_world_round_trip() {
        let volume = Volume::new(Array3::<f32>::zeros((4, 5, 6)), (0.5, 0.75, 3.0))
            .with_origin((10.0, -2.0, 4.0));
        let world = volume.index_to_world() * Vector4::new(2.0, 3.0, 1.0, 1.0);
        assert!((world.x - 11.0).abs() < 1e-6);
        assert!((world.y - 0.25).abs() < 1e-6);
        assert!((world.z - 7.0).abs() < 1e-6);
        let back = volume.world_to_index() * world;
        assert!((back.x - 2.0).abs() < 1e-5);
        assert!((back.y - 3.0).abs() < 1e-5);
        assert!((back.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn crop_keeps_world_positions() {
        let data = Array3::from_shape_fn((4, 4, 4), |(z, y, x)| (z * 16 + y * 4 + x) as f32);
        let volume = Volume::new(data, (1.0, 2.0, 3.0));
        let cropped = volume.crop(1..3, 2..4, 1..2);
        assert_eq!(cropped.dim(), (2, 2, 1));
        assert_eq!(cropped.origin, (1.0, 4.0, 3.0));
        assert_eq!(cropped.data[[0, 0, 0]], volume.data[[1, 2, 1]]);
    }

    #[test]
    fn preview_rejects_out_of_range_plane() {
        let volume = Volume::new(Array3::<f32>::ones((2, 3, 3)), (1.0, 1.0, 1.0));
        assert!(
            volume
                .preview(2, Orientation::Axial, Interpolation::None)
                .is_none()
        );
        let image = volume
            .preview(1, Orientation::Axial, Interpolation::None)
            .expect("plane 1 exists");
        assert_eq!(image.dimensions(), (3, 3));
        assert!(image.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn coronal_preview_is_stretched_to_isotropic_height() {
        let volume = Volume::new(Array3::<f32>::ones((2, 4, 4)), (1.0, 1.0, 2.0));
        let image = volume
            .preview(0, Orientation::Coronal, Interpolation::Linear)
            .expect("plane 0 exists");
        assert_eq!(image.dimensions(), (4, 4));
    }
}
