//! Gather-type sampling of a volume along slice geometries.
//!
//! Every simulation and registration step reduces to "for each pixel of a 2D
//! grid, average the volume over a few PSF positions". The job layout is
//! `#[repr(C)]` so the host and the wgpu sampler read the same bytes.

use nalgebra::Matrix4;
use rayon::prelude::*;

use crate::error::Result;
use crate::interpolator::Interpolator;
use crate::volume::Volume;

/// One 2D grid to sample.
///
/// A pixel `(i, j)` with PSF offset `(u, v, w)` lands at volume index
/// `affine * (i, j, 0, 1) + psf_axes * (u, v, w, 0)`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SampleJob {
    pub affine: [[f32; 4]; 3],
    pub psf_axes: [[f32; 4]; 3],
    pub width: u32,
    pub height: u32,
    pub offset: u32,
    pub _padding: u32,
}

const _: () = assert!(core::mem::size_of::<SampleJob>() == 112);

impl SampleJob {
    pub fn new(affine: &Matrix4<f32>, psf_axes: &Matrix4<f32>, width: usize, height: usize) -> Self {
        Self {
            affine: rows(affine),
            psf_axes: rows(psf_axes),
            width: width as u32,
            height: height as u32,
            offset: 0,
            _padding: 0,
        }
    }

    pub fn len(&self) -> usize {
        (self.width * self.height) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn position(&self, i: f32, j: f32, psf: &PsfSample) -> (f32, f32, f32) {
        let a = &self.affine;
        let p = &self.psf_axes;
        let [u, v, w, _] = psf.offset;
        let coord = |r: usize| {
            a[r][0] * i + a[r][1] * j + a[r][3] + p[r][0] * u + p[r][1] * v + p[r][2] * w
        };
        (coord(0), coord(1), coord(2))
    }
}

fn rows(m: &Matrix4<f32>) -> [[f32; 4]; 3] {
    let mut out = [[0.0; 4]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = m[(r, c)];
        }
    }
    out
}

/// Point-spread-function sample in units of the PSF standard deviation.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PsfSample {
    /// `(u, v, w, weight)`.
    pub offset: [f32; 4],
}

/// Gaussian PSF sampling pattern. The fast pattern is used for the
/// intermediate outer iterations.
pub fn gaussian_psf(speedup: bool) -> Vec<PsfSample> {
    let in_plane: &[f32] = if speedup { &[0.0] } else { &[-1.0, 0.0, 1.0] };
    let through_plane: &[f32] = if speedup {
        &[-1.0, 0.0, 1.0]
    } else {
        &[-1.5, -0.75, 0.0, 0.75, 1.5]
    };
    let mut samples = Vec::with_capacity(in_plane.len() * in_plane.len() * through_plane.len());
    for &w in through_plane {
        for &v in in_plane {
            for &u in in_plane {
                let weight = (-(u * u + v * v + w * w) / 2.0).exp();
                samples.push(PsfSample {
                    offset: [u, v, w, weight],
                });
            }
        }
    }
    samples
}

/// Single central sample, used by registration.
pub fn point_psf() -> Vec<PsfSample> {
    vec![PsfSample {
        offset: [0.0, 0.0, 0.0, 1.0],
    }]
}

/// Sampled pixel: `[value, coverage]`. Coverage is the PSF weight fraction
/// that landed inside the volume.
pub type Sampled = [f32; 2];

/// Evaluates sample jobs against a volume.
pub trait VolumeSampler {
    /// Returns one `Vec` per job, in job order.
    fn sample(&self, jobs: &[SampleJob], psf: &[PsfSample]) -> Result<Vec<Vec<Sampled>>>;
}

/// Rayon-parallel sampler over a host volume.
pub struct HostSampler<'a> {
    volume: &'a Volume,
}

impl<'a> HostSampler<'a> {
    pub fn new(volume: &'a Volume) -> Self {
        Self { volume }
    }

    /// Samples one pixel. Public to the crate so scatter operations can
    /// walk the same positions.
    #[inline]
    pub(crate) fn sample_pixel(
        volume: &Volume,
        job: &SampleJob,
        i: usize,
        j: usize,
        psf: &[PsfSample],
    ) -> Sampled {
        let mut value = 0.0;
        let mut inside = 0.0;
        let mut total = 0.0;
        for sample in psf {
            let weight = sample.offset[3];
            total += weight;
            let (x, y, z) = job.position(i as f32, j as f32, sample);
            if let Some(v) = Interpolator::trilinear_interpolate(&volume.data, x, y, z) {
                value += weight * v;
                inside += weight;
            }
        }
        if inside > 0.0 {
            [value / inside, inside / total]
        } else {
            [0.0, 0.0]
        }
    }
}

impl VolumeSampler for HostSampler<'_> {
    fn sample(&self, jobs: &[SampleJob], psf: &[PsfSample]) -> Result<Vec<Vec<Sampled>>> {
        Ok(jobs
            .par_iter()
            .map(|job| {
                let width = job.width as usize;
                (0..job.len())
                    .map(|p| Self::sample_pixel(self.volume, job, p % width, p / width, psf))
                    .collect()
            })
            .collect())
    }
}

/// Visits every PSF position of a pixel that lands inside a grid of `dim`,
/// with its combined trilinear and PSF weight. Used for back-projection.
#[inline]
pub(crate) fn for_each_footprint(
    dim: (usize, usize, usize),
    job: &SampleJob,
    i: usize,
    j: usize,
    psf: &[PsfSample],
    mut visit: impl FnMut((usize, usize, usize), f32),
) {
    for sample in psf {
        let (x, y, z) = job.position(i as f32, j as f32, sample);
        if let Some(corners) = Interpolator::trilinear_corners(dim, x, y, z) {
            for (index, weight) in corners {
                if weight > 0.0 {
                    visit(index, weight * sample.offset[3]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn identity_job_reads_back_plane() {
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (100 * z + 10 * y + x) as f32);
        let volume = Volume::new(data, (1.0, 1.0, 1.0));
        let plane = Matrix4::new_translation(&nalgebra::Vector3::new(0.0, 0.0, 2.0));
        let job = SampleJob::new(&plane, &Matrix4::zeros(), 5, 4);
        let out = HostSampler::new(&volume).sample(&[job], &point_psf()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 20);
        assert_eq!(out[0][0], [200.0, 1.0]);
        assert_eq!(out[0][19], [234.0, 1.0]);
    }

    #[test]
    fn samples_outside_have_no_coverage() {
        let volume = Volume::new(Array3::<f32>::ones((2, 2, 2)), (1.0, 1.0, 1.0));
        let shifted = Matrix4::new_translation(&nalgebra::Vector3::new(5.0, 0.0, 0.0));
        let job = SampleJob::new(&shifted, &Matrix4::zeros(), 2, 2);
        let out = HostSampler::new(&volume).sample(&[job], &gaussian_psf(false)).unwrap();
        assert!(out[0].iter().all(|s| *s == [0.0, 0.0]));
    }

    #[test]
    fn partial_psf_coverage_is_reported() {
        let volume = Volume::new(Array3::<f32>::ones((3, 3, 3)), (1.0, 1.0, 1.0));
        let mut axes = Matrix4::zeros();
        axes[(2, 2)] = 1.0;
        let job = SampleJob::new(&Matrix4::identity(), &axes, 1, 1);
        let out = HostSampler::new(&volume).sample(&[job], &gaussian_psf(true)).unwrap();
        let [value, coverage] = out[0][0];
        assert!((value - 1.0).abs() < 1e-6);
        assert!(coverage > 0.0 && coverage < 1.0);
    }

    #[test]
    fn fast_psf_is_smaller() {
        assert_eq!(gaussian_psf(true).len(), 3);
        assert_eq!(gaussian_psf(false).len(), 45);
    }
}
