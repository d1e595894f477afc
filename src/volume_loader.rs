use crate::{decompose::RawStack, enums::SortBy, volume::Volume};

use dicom::{
    core::Tag,
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array4, Axis, Ix3, Ix4, s};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use rayon::prelude::*;
use std::{
    cmp::Ordering,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("Unsupported image dimensionality: {0}")]
    UnsupportedDimensions(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),
}

/// One decoded image of a DICOM series with the geometry it carries.
#[derive(Debug)]
struct DicomPlane {
    key: Option<f32>,
    position: Option<[f32; 3]>,
    /// `(column, row)` spacing.
    pixel_spacing: Option<(f32, f32)>,
    slice_spacing: Option<f32>,
    pixels: Array2<f32>,
}

impl DicomPlane {
    fn read(object: &FileDicomObject<InMemDicomObject>, sort_by: SortBy) -> Option<Self> {
        let floats = |tag: Tag| object.element(tag).ok()?.to_multi_float32().ok();
        let position = floats(tags::IMAGE_POSITION_PATIENT).and_then(|p| Some([*p.first()?, *p.get(1)?, *p.get(2)?]));
        let key = match sort_by {
            SortBy::ImagePositionPatient => Some(position?[2]),
            SortBy::TablePosition => object.element(tags::TABLE_POSITION).ok()?.to_float32().ok(),
            SortBy::InstanceNumber => object
                .element(tags::INSTANCE_NUMBER)
                .ok()?
                .to_int::<i32>()
                .ok()
                .map(|n| n as f32),
            SortBy::None => None,
        };
        // PixelSpacing holds the row spacing first.
        let pixel_spacing = floats(tags::PIXEL_SPACING).and_then(|p| Some((*p.get(1)?, *p.first()?)));
        let slice_spacing = object
            .element(tags::SPACING_BETWEEN_SLICES)
            .or_else(|_| object.element(tags::SLICE_THICKNESS))
            .ok()
            .and_then(|e| e.to_float32().ok());

        // First frame, modality rescale applied, no windowing.
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        let pixels = object
            .decode_pixel_data()
            .ok()?
            .to_ndarray_with_options::<f32>(&options)
            .ok()?
            .slice_move(s![0, .., .., 0]);

        Some(Self {
            key,
            position,
            pixel_spacing,
            slice_spacing,
            pixels,
        })
    }
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a stack from DICOM objects of one series.
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found or dimensions are inconsistent
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let planes = dicom_objects
            .iter()
            .filter_map(|object| DicomPlane::read(object, sort_by))
            .collect();
        Self::assemble(planes, sort_by)
    }

    /// Files are opened and decoded in parallel.
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let opened: Vec<Option<DicomPlane>> = paths
            .par_iter()
            .map(|path| -> Result<_, VolumeLoaderError> {
                Ok(DicomPlane::read(&open_file(path.as_ref())?, sort_by))
            })
            .collect::<Result<_, _>>()?;
        Self::assemble(opened.into_iter().flatten().collect(), sort_by)
    }

    /// Load a stack from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let paths: Vec<PathBuf> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::load_from_file_paths(&paths, sort_by)
    }

    /// Orders the planes and stacks them into `(z, y, x)`.
    ///
    /// The slice spacing comes from the distance between the first two
    /// positioned planes, falling back to the spacing attributes.
    fn assemble(mut planes: Vec<DicomPlane>, sort_by: SortBy) -> Result<Volume, VolumeLoaderError> {
        if planes.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        if sort_by != SortBy::None {
            planes.sort_by(|a, b| a.key.partial_cmp(&b.key).unwrap_or(Ordering::Equal));
        }

        let views: Vec<_> = planes.iter().map(|p| p.pixels.view()).collect();
        let data = ndarray::stack(Axis(0), &views).map_err(|_| VolumeLoaderError::InconsistentDimensions)?;

        let positions: Vec<[f32; 3]> = planes.iter().filter_map(|p| p.position).collect();
        let measured = match positions.as_slice() {
            [a, b, ..] => {
                let d = ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2) + (b[2] - a[2]).powi(2)).sqrt();
                (d > 0.0).then_some(d)
            }
            _ => None,
        };
        let slice_spacing = measured
            .or_else(|| planes.iter().find_map(|p| p.slice_spacing))
            .ok_or(VolumeLoaderError::MissingSpacing)?;
        let (column, row) = planes
            .iter()
            .find_map(|p| p.pixel_spacing)
            .ok_or(VolumeLoaderError::MissingSpacing)?;
        let origin = positions
            .iter()
            .min_by(|a, b| a[2].partial_cmp(&b[2]).unwrap_or(Ordering::Equal))
            .map_or((0.0, 0.0, 0.0), |p| (p[0], p[1], p[2]));

        Ok(Volume::new(data, (column, row, slice_spacing)).with_origin(origin))
    }

    /// Load a 3D or 4D NIfTI image as a raw stack.
    ///
    /// NIfTI stores `(x, y, z[, t])` with x fastest; the axes are reversed
    /// into `(t, z, y, x)`.
    pub fn load_nifti(path: impl AsRef<Path>) -> Result<RawStack, VolumeLoaderError> {
        let object = ReaderOptions::new().read_file(path.as_ref())?;
        let (spacing, origin) = Self::header_geometry(object.header());
        let data = object.into_volume().into_ndarray::<f32>()?.reversed_axes();
        let frames: Array4<f32> = match data.ndim() {
            3 => data
                .into_dimensionality::<Ix3>()
                .map_err(|_| VolumeLoaderError::InconsistentDimensions)?
                .insert_axis(Axis(0)),
            4 => data
                .into_dimensionality::<Ix4>()
                .map_err(|_| VolumeLoaderError::InconsistentDimensions)?,
            n => return Err(VolumeLoaderError::UnsupportedDimensions(n)),
        };
        Ok(RawStack {
            frames: frames.as_standard_layout().to_owned(),
            spacing,
            origin,
        })
    }

    /// Load a 3D NIfTI image, keeping only the first frame of 4D inputs.
    pub fn load_nifti_volume(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let raw = Self::load_nifti(path)?;
        let frame = raw.frames.index_axis(Axis(0), 0).to_owned();
        Ok(Volume::new(frame, raw.spacing).with_origin(raw.origin))
    }

    fn header_geometry(header: &NiftiHeader) -> ((f32, f32, f32), (f32, f32, f32)) {
        let [_, sx, sy, sz, ..] = header.pixdim;
        let positive = |v: f32| if v > 0.0 { v } else { 1.0 };
        let spacing = (positive(sx), positive(sy), positive(sz));
        let origin = if header.sform_code > 0 {
            (header.srow_x[3], header.srow_y[3], header.srow_z[3])
        } else {
            (header.quatern_x, header.quatern_y, header.quatern_z)
        };
        (spacing, origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(z: f32, shape: (usize, usize)) -> DicomPlane {
        DicomPlane {
            key: Some(z),
            position: Some([-10.0, 5.0, z]),
            pixel_spacing: Some((0.8, 0.9)),
            slice_spacing: Some(3.0),
            pixels: Array2::from_elem(shape, z),
        }
    }

    #[test]
    fn planes_sort_by_position() {
        let planes = vec![plane(7.0, (2, 3)), plane(1.0, (2, 3)), plane(4.0, (2, 3))];
        let volume = VolumeLoader::assemble(planes, SortBy::ImagePositionPatient).unwrap();
        assert_eq!(volume.dim(), (3, 2, 3));
        assert_eq!(volume.data[[0, 1, 2]], 1.0);
        assert_eq!(volume.data[[2, 0, 0]], 7.0);
        assert_eq!(volume.spacing, (0.8, 0.9, 3.0));
        assert_eq!(volume.origin, (-10.0, 5.0, 1.0));
    }

    #[test]
    fn measured_spacing_wins_over_attributes() {
        let planes = vec![plane(0.0, (2, 2)), plane(2.5, (2, 2))];
        let volume = VolumeLoader::assemble(planes, SortBy::ImagePositionPatient).unwrap();
        assert_eq!(volume.spacing.2, 2.5);
    }

    #[test]
    fn mismatched_planes_are_rejected() {
        let planes = vec![plane(0.0, (2, 2)), plane(1.0, (3, 2))];
        assert!(matches!(
            VolumeLoader::assemble(planes, SortBy::ImagePositionPatient),
            Err(VolumeLoaderError::InconsistentDimensions)
        ));
    }

    #[test]
    fn missing_pixel_spacing_is_an_error() {
        let mut only = plane(0.0, (2, 2));
        only.pixel_spacing = None;
        assert!(matches!(
            VolumeLoader::assemble(vec![only], SortBy::None),
            Err(VolumeLoaderError::MissingSpacing)
        ));
    }

    #[test]
    fn empty_directory_has_no_images() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            VolumeLoader::load_from_directory(dir.path(), SortBy::InstanceNumber),
            Err(VolumeLoaderError::NoValidImages)
        ));
    }
}
