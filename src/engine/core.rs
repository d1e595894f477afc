use std::f32::consts::PI;

use nalgebra::Vector4;
use ndarray::{Array2, Array3, Zip};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::{EngineSetup, Evaluation};
use crate::anneal::Smoothing;
use crate::error::{ReconstructionError, Result};
use crate::filter::normalized_smooth;
use crate::interpolator::Interpolator;
use crate::registration::{RegistrationSettings, package_groups, register_slice_groups};
use crate::sampling::{
    HostSampler, PsfSample, SampleJob, Sampled, VolumeSampler, for_each_footprint, gaussian_psf,
};
use crate::schedule::PackageSplit;
use crate::slices::{Slice, is_valid};
use crate::transform::RigidTransform;
use crate::volume::{Mask, Volume};

/// Pixels whose PSF lies at least this much inside the volume take part in
/// the statistics.
const INSIDE: f32 = 0.99;
/// Lower bound of the voxel residual variance.
const MIN_SIGMA: f32 = 1e-4;
const MIN_SLICE_SIGMA: f32 = 1e-4;

#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Bias field smoothing in millimetres; non-positive disables bias
    /// estimation.
    pub sigma_bias: f32,
    /// Pixels below this fraction of the maximum intensity do not drive the
    /// bias field.
    pub low_intensity_cutoff: f32,
    pub global_bias_correction: bool,
    /// Slices that always get zero weight.
    pub force_excluded: Vec<usize>,
    pub registration: RegistrationSettings,
    /// Registration samples the volume on the host in accelerator mode.
    pub host_registration: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sigma_bias: 12.0,
            low_intensity_cutoff: 0.01,
            global_bias_correction: false,
            force_excluded: Vec::new(),
            registration: RegistrationSettings::default(),
            host_registration: true,
        }
    }
}

/// Voxel and slice level mixture parameters.
#[derive(Clone, Copy, Debug)]
struct Statistics {
    /// Variance of inlier voxel residuals.
    sigma: f32,
    mix: f32,
    /// Density of the uniform outlier class.
    m: f32,
    mean_s: f32,
    sigma_s: f32,
    mean_s2: f32,
    sigma_s2: f32,
    mix_s: f32,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            mix: 0.9,
            m: 1.0,
            mean_s: 0.0,
            sigma_s: 0.025,
            mean_s2: 0.0,
            sigma_s2: 0.025,
            mix_s: 0.9,
        }
    }
}

/// Gaussian density with variance `variance`.
#[inline]
fn gaussian(x: f32, variance: f32) -> f32 {
    (-x * x / (2.0 * variance)).exp() / (2.0 * PI * variance).sqrt()
}

/// Host-side state and arithmetic of the reconstruction.
pub struct ReconstructionCore {
    slices: Vec<Slice>,
    reconstructed: Volume,
    mask: Mask,
    volume_weights: Volume,
    jobs: Vec<SampleJob>,
    psf: Vec<PsfSample>,
    stack_factors: Vec<f32>,
    settings: EngineSettings,
    smoothing: Smoothing,
    stats: Statistics,
    potentials: Vec<f32>,
    min_intensity: f32,
    max_intensity: f32,
    average_volume_weight: f32,
}

impl ReconstructionCore {
    pub fn new(setup: EngineSetup) -> Result<Self> {
        let EngineSetup {
            slices,
            reconstruction,
            mask,
            stack_factors,
            settings,
        } = setup;
        if !reconstruction.same_grid(&mask) {
            return Err(ReconstructionError::ShapeMismatch {
                expected: reconstruction.data.shape().to_vec(),
                actual: mask.data.shape().to_vec(),
            });
        }
        let potentials = vec![-1.0; slices.len()];
        Ok(Self {
            volume_weights: Volume::zeros_like(&reconstruction),
            slices,
            reconstructed: reconstruction,
            mask,
            jobs: Vec::new(),
            psf: gaussian_psf(true),
            stack_factors,
            settings,
            smoothing: Smoothing {
                delta: 150.0,
                lambda: 0.02,
            },
            stats: Statistics::default(),
            potentials,
            min_intensity: 0.0,
            max_intensity: 0.0,
            average_volume_weight: 1.0,
        })
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn reconstructed(&self) -> &Volume {
        &self.reconstructed
    }

    pub(crate) fn reconstructed_mut(&mut self) -> &mut Volume {
        &mut self.reconstructed
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub fn volume_weights(&self) -> &Volume {
        &self.volume_weights
    }

    pub fn jobs(&self) -> &[SampleJob] {
        &self.jobs
    }

    pub fn psf(&self) -> &[PsfSample] {
        &self.psf
    }

    pub fn slice_transformations(&self) -> Vec<RigidTransform> {
        self.slices.iter().map(|s| s.transform).collect()
    }

    pub fn set_smoothing(&mut self, smoothing: Smoothing) {
        debug!(delta = smoothing.delta, lambda = smoothing.lambda, "Smoothing parameters");
        self.smoothing = smoothing;
    }

    pub fn set_speedup(&mut self, speedup: bool) {
        self.psf = gaussian_psf(speedup);
    }

    #[inline]
    fn corrected(slice: &Slice, j: usize, i: usize) -> f32 {
        slice.data[[j, i]] * (-slice.bias[[j, i]]).exp() * slice.scale
    }

    #[inline]
    fn counts(slice: &Slice, j: usize, i: usize) -> bool {
        is_valid(slice.data[[j, i]]) && slice.coverage[[j, i]] > INSIDE
    }

    /// Back-projects one value per slice pixel. `contribution` returns the
    /// value and its weight; the PSF weight multiplies both. Returns the
    /// weighted sum and the weight sum on the reconstruction grid.
    fn scatter<F>(&self, include: impl Fn(&Slice) -> bool + Sync, contribution: F) -> (Array3<f32>, Array3<f32>)
    where
        F: Fn(&Slice, usize, usize) -> Option<(f32, f32)> + Sync,
    {
        let dim = self.reconstructed.dim();
        let psf = &self.psf;
        self.slices
            .par_iter()
            .zip(&self.jobs)
            .filter(|(slice, _)| include(slice))
            .fold(
                || (Array3::<f32>::zeros(dim), Array3::<f32>::zeros(dim)),
                |(mut num, mut den), (slice, job)| {
                    let (height, width) = slice.dim();
                    for j in 0..height {
                        for i in 0..width {
                            let Some((value, weight)) = contribution(slice, j, i) else {
                                continue;
                            };
                            for_each_footprint(dim, job, i, j, psf, |index, w| {
                                num[index] += w * weight * value;
                                den[index] += w * weight;
                            });
                        }
                    }
                    (num, den)
                },
            )
            .reduce(
                || (Array3::<f32>::zeros(dim), Array3::<f32>::zeros(dim)),
                |(mut a, mut b), (c, d)| {
                    a += &c;
                    b += &d;
                    (a, b)
                },
            )
    }

    pub fn initialize_em(&mut self) {
        let (min, max) = self
            .slices
            .par_iter()
            .flat_map_iter(|s| s.data.iter().copied().filter(|v| is_valid(*v)))
            .fold(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |(lo, hi), v| (lo.min(v), hi.max(v)),
            )
            .reduce(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |(a, b), (c, d)| (a.min(c), b.max(d)),
            );
        if min.is_finite() && max.is_finite() {
            self.min_intensity = min;
            self.max_intensity = max;
        }
        self.initialize_em_values();
        info!(min = self.min_intensity, max = self.max_intensity, "Initialised EM");
    }

    pub fn initialize_em_values(&mut self) {
        let excluded = &self.settings.force_excluded;
        self.slices.par_iter_mut().enumerate().for_each(|(index, slice)| {
            slice.weights.fill(1.0);
            slice.bias.fill(0.0);
            slice.scale = 1.0;
            slice.slice_weight = if excluded.contains(&index) { 0.0 } else { 1.0 };
        });
    }

    /// Builds the sampling job of every slice and the volume weights.
    pub fn compute_coefficients(&mut self) {
        let world_to_index = self.reconstructed.world_to_index();
        self.jobs = self
            .slices
            .iter()
            .map(|slice| {
                let (height, width) = slice.dim();
                SampleJob::new(
                    &(world_to_index * slice.pixel_to_world()),
                    &(world_to_index * slice.psf_axes()),
                    width,
                    height,
                )
            })
            .collect();

        let (_, weights) = self.scatter(|_| true, |slice, j, i| is_valid(slice.data[[j, i]]).then_some((1.0, 1.0)));
        self.volume_weights = self.reconstructed.with_data(weights);

        let (sum, n) = Zip::from(&self.volume_weights.data)
            .and(&self.mask.data)
            .fold((0.0f64, 0usize), |(s, n), &w, &m| {
                if m > 0 && w > 0.0 { (s + w as f64, n + 1) } else { (s, n) }
            });
        self.average_volume_weight = if n > 0 { (sum / n as f64) as f32 } else { 1.0 };
        debug!(average = self.average_volume_weight, "Computed volume weights");
    }

    pub fn gaussian_reconstruct(&mut self) {
        let (num, den) = self.scatter(
            |slice| slice.slice_weight > 0.0,
            |slice, j, i| is_valid(slice.data[[j, i]]).then(|| (Self::corrected(slice, j, i), 1.0)),
        );
        let mut data = num;
        Zip::from(&mut data)
            .and(&den)
            .for_each(|v, &d| *v = if d > 0.0 { *v / d } else { 0.0 });
        self.reconstructed.data = data;
    }

    /// Stores the result of sampling `jobs()` with `psf()`.
    pub fn apply_simulation(&mut self, sampled: Vec<Vec<Sampled>>) -> Result<()> {
        if sampled.len() != self.slices.len() {
            return Err(ReconstructionError::ShapeMismatch {
                expected: vec![self.slices.len()],
                actual: vec![sampled.len()],
            });
        }
        self.slices
            .par_iter_mut()
            .zip(sampled)
            .try_for_each(|(slice, values)| {
                let dim = slice.dim();
                if values.len() != dim.0 * dim.1 {
                    return Err(ReconstructionError::ShapeMismatch {
                        expected: vec![dim.0 * dim.1],
                        actual: vec![values.len()],
                    });
                }
                slice.simulated = Array2::from_shape_fn(dim, |(j, i)| values[j * dim.1 + i][0]);
                slice.coverage = Array2::from_shape_fn(dim, |(j, i)| values[j * dim.1 + i][1]);
                slice.inside = Zip::from(&slice.data)
                    .and(&slice.coverage)
                    .fold(false, |any, &v, &c| any || (is_valid(v) && c > 0.0));
                Ok(())
            })
    }

    pub fn simulate_slices(&mut self) -> Result<()> {
        let sampled = HostSampler::new(&self.reconstructed).sample(&self.jobs, &self.psf)?;
        self.apply_simulation(sampled)
    }

    pub fn initialize_robust_statistics(&mut self) {
        let (sum, n) = self
            .slices
            .par_iter()
            .filter(|s| s.slice_weight > 0.0)
            .map(|slice| {
                let mut sum = 0.0f64;
                let mut n = 0usize;
                for ((j, i), _) in slice.data.indexed_iter() {
                    if Self::counts(slice, j, i) {
                        let e = slice.data[[j, i]] - slice.simulated[[j, i]];
                        sum += (e * e) as f64;
                        n += 1;
                    }
                }
                (sum, n)
            })
            .reduce(|| (0.0, 0), |(a, b), (c, d)| (a + c, b + d));

        let range = 2.1 * self.max_intensity - 1.9 * self.min_intensity;
        self.stats = Statistics {
            sigma: if n > 0 { ((sum / n as f64) as f32).max(MIN_SIGMA) } else { 1.0 },
            m: if range > 0.0 { 1.0 / range } else { 1.0 },
            ..Statistics::default()
        };
        debug!(sigma = self.stats.sigma, m = self.stats.m, "Initialised robust statistics");
    }

    pub fn expectation_step(&mut self) {
        let stats = self.stats;
        let excluded = &self.settings.force_excluded;
        let potentials: Vec<f32> = self
            .slices
            .par_iter_mut()
            .enumerate()
            .map(|(index, slice)| {
                let mut residual = 0.0f32;
                let mut n = 0usize;
                let (height, width) = slice.dim();
                for j in 0..height {
                    for i in 0..width {
                        if !Self::counts(slice, j, i) {
                            slice.weights[[j, i]] = 0.0;
                            continue;
                        }
                        let e = Self::corrected(slice, j, i) - slice.simulated[[j, i]];
                        let g = gaussian(e, stats.sigma) * stats.mix;
                        let outlier = stats.m * (1.0 - stats.mix);
                        let w = if g + outlier > 0.0 { g / (g + outlier) } else { 0.0 };
                        slice.weights[[j, i]] = w;
                        residual += (1.0 - w) * (1.0 - w);
                        n += 1;
                    }
                }
                if n == 0 || excluded.contains(&index) {
                    -1.0
                } else {
                    (residual / n as f32).sqrt()
                }
            })
            .collect();
        self.potentials = potentials;
        self.update_slice_weights();
    }

    /// Two-class mixture over slice potentials.
    fn update_slice_weights(&mut self) {
        let valid: Vec<(usize, f32)> = self
            .potentials
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, p)| *p >= 0.0)
            .collect();
        let stats = &mut self.stats;

        let (mut sum, mut den, mut sum2, mut den2) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
        let (mut max_p, mut min_p) = (0.0f32, 1.0f32);
        for &(index, p) in &valid {
            let sw = self.slices[index].slice_weight;
            sum += p * sw;
            den += sw;
            sum2 += p * (1.0 - sw);
            den2 += 1.0 - sw;
            max_p = max_p.max(p);
            min_p = min_p.min(p);
        }
        stats.mean_s = if den > 0.0 { sum / den } else { min_p };
        stats.mean_s2 = if den2 > 0.0 { sum2 / den2 } else { (max_p + stats.mean_s) / 2.0 };

        let (mut var, mut den, mut var2, mut den2) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
        for &(index, p) in &valid {
            let sw = self.slices[index].slice_weight;
            var += (p - stats.mean_s).powi(2) * sw;
            den += sw;
            var2 += (p - stats.mean_s2).powi(2) * (1.0 - sw);
            den2 += 1.0 - sw;
        }
        stats.sigma_s = if var > 0.0 && den > 0.0 {
            (var / den).max(MIN_SLICE_SIGMA)
        } else {
            0.025
        };
        stats.sigma_s2 = if var2 > 0.0 && den2 > 0.0 {
            (var2 / den2).max(MIN_SLICE_SIGMA)
        } else {
            ((stats.mean_s2 - stats.mean_s).powi(2) / 4.0).max(MIN_SLICE_SIGMA)
        };

        let stats = *stats;
        let no_outliers = stats.mean_s2 <= stats.mean_s;
        for (slice, &p) in self.slices.iter_mut().zip(&self.potentials) {
            slice.slice_weight = if p < 0.0 {
                0.0
            } else if no_outliers || p <= stats.mean_s {
                1.0
            } else if p >= stats.mean_s2 {
                0.0
            } else {
                let g1 = gaussian(p - stats.mean_s, stats.sigma_s) * stats.mix_s;
                let g2 = gaussian(p - stats.mean_s2, stats.sigma_s2) * (1.0 - stats.mix_s);
                if g1 + g2 > 0.0 { g1 / (g1 + g2) } else { 0.0 }
            };
        }

        if !valid.is_empty() {
            let total: f32 = valid.iter().map(|&(i, _)| self.slices[i].slice_weight).sum();
            self.stats.mix_s = total / valid.len() as f32;
        }
    }

    pub fn estimate_scale(&mut self) {
        self.slices.par_iter_mut().for_each(|slice| {
            let (mut num, mut den) = (0.0f32, 0.0f32);
            for ((j, i), &v) in slice.data.indexed_iter() {
                if !is_valid(v) || slice.coverage[[j, i]] <= INSIDE {
                    continue;
                }
                let eb = v * (-slice.bias[[j, i]]).exp();
                let w = slice.weights[[j, i]];
                num += w * eb * slice.simulated[[j, i]];
                den += w * eb * eb;
            }
            slice.scale = if den > 0.0 { num / den } else { 1.0 };
        });
    }

    pub fn estimate_bias_field(&mut self) {
        let sigma_mm = self.settings.sigma_bias;
        if sigma_mm <= 0.0 {
            return;
        }
        let cutoff = self.settings.low_intensity_cutoff * self.max_intensity;
        let global = self.settings.global_bias_correction;
        self.slices.par_iter_mut().for_each(|slice| {
            let dim = slice.dim();
            let mut residual = Array2::<f32>::zeros(dim);
            let mut weight = Array2::<f32>::zeros(dim);
            for ((j, i), &v) in slice.data.indexed_iter() {
                let sim = slice.simulated[[j, i]];
                if !is_valid(v) || slice.coverage[[j, i]] <= INSIDE || v <= cutoff || sim <= 0.0 {
                    continue;
                }
                let eb = v * (-slice.bias[[j, i]]).exp() * slice.scale;
                if eb <= 0.0 {
                    continue;
                }
                residual[[j, i]] = (eb / sim).ln();
                weight[[j, i]] = slice.weights[[j, i]] * slice.slice_weight;
            }
            let sigma = [sigma_mm / slice.spacing.1, sigma_mm / slice.spacing.0];
            let smoothed = normalized_smooth(&residual, &weight, &sigma);

            let mut total = 0.0f32;
            let mut n = 0usize;
            Zip::from(&mut slice.bias)
                .and(&smoothed)
                .and(&slice.data)
                .for_each(|b, &s, &v| {
                    if is_valid(v) {
                        *b += s;
                        total += *b;
                        n += 1;
                    }
                });
            if !global && n > 0 {
                let mean = total / n as f32;
                slice.bias.mapv_inplace(|b| b - mean);
            }
        });
    }

    pub fn superresolve(&mut self, pass: usize) {
        let original = self.reconstructed.data.clone();
        let (addon, confidence) = self.scatter(
            |slice| slice.slice_weight > 0.0,
            |slice, j, i| {
                Self::counts(slice, j, i).then(|| {
                    (
                        Self::corrected(slice, j, i) - slice.simulated[[j, i]],
                        slice.weights[[j, i]] * slice.slice_weight,
                    )
                })
            },
        );
        let alpha = (0.05 / self.smoothing.lambda).min(1.0);
        let norm = self.average_volume_weight.max(f32::EPSILON);
        let (lo, hi) = (0.9 * self.min_intensity, 1.1 * self.max_intensity);
        Zip::from(&mut self.reconstructed.data)
            .and(&addon)
            .and(&confidence)
            .for_each(|v, &a, &c| {
                if c > 0.0 {
                    *v += alpha * a / norm;
                }
                *v = v.clamp(lo.min(hi), hi.max(lo));
            });

        self.regularize(&original, alpha);
        if self.settings.global_bias_correction {
            self.bias_correct_volume(&original);
        }
        debug!(pass, alpha, "Superresolution step");
    }

    /// Edge-preserving smoothing over the 26-neighbourhood; edges are judged
    /// on the volume before the current update.
    fn regularize(&mut self, original: &Array3<f32>, alpha: f32) {
        let k = alpha * self.smoothing.lambda;
        let delta = self.smoothing.delta.max(f32::EPSILON);
        let current = self.reconstructed.data.clone();
        let (depth, height, width) = current.dim();
        let mask = &self.mask.data;
        Zip::indexed(&mut self.reconstructed.data).par_for_each(|(z, y, x), v| {
            if mask[[z, y, x]] == 0 {
                return;
            }
            let mut acc = 0.0f32;
            let mut sum_b = 0.0f32;
            for dz in -1isize..=1 {
                for dy in -1isize..=1 {
                    for dx in -1isize..=1 {
                        if dz == 0 && dy == 0 && dx == 0 {
                            continue;
                        }
                        let (nz, ny, nx) = (z as isize + dz, y as isize + dy, x as isize + dx);
                        if nz < 0
                            || ny < 0
                            || nx < 0
                            || nz >= depth as isize
                            || ny >= height as isize
                            || nx >= width as isize
                        {
                            continue;
                        }
                        let n = [nz as usize, ny as usize, nx as usize];
                        let distance = ((dz * dz + dy * dy + dx * dx) as f32).sqrt();
                        let diff = (original[[z, y, x]] - original[n]) / delta;
                        let b = 1.0 / (distance * (1.0 + diff * diff).sqrt());
                        acc += b * current[n];
                        sum_b += b;
                    }
                }
            }
            *v = (current[[z, y, x]] + k * acc) / (1.0 + k * sum_b);
        });
    }

    /// Removes low-frequency intensity drift introduced by the last update.
    fn bias_correct_volume(&mut self, original: &Array3<f32>) {
        let mut log_ratio = Array3::<f32>::zeros(original.dim());
        let mut weight = Array3::<f32>::zeros(original.dim());
        Zip::from(&mut log_ratio)
            .and(&mut weight)
            .and(&self.reconstructed.data)
            .and(original)
            .and(&self.mask.data)
            .for_each(|r, w, &v, &o, &m| {
                if m > 0 && v > 0.0 && o > 0.0 {
                    *r = (v / o).ln();
                    *w = 1.0;
                }
            });
        let sigma = self.voxel_sigma(self.settings.sigma_bias.max(1.0));
        let smoothed = normalized_smooth(&log_ratio, &weight, &sigma);
        Zip::from(&mut self.reconstructed.data)
            .and(&smoothed)
            .for_each(|v, &b| {
                if *v > 0.0 {
                    *v /= b.exp();
                }
            });
    }

    fn voxel_sigma(&self, mm: f32) -> [f32; 3] {
        let (sx, sy, sz) = self.reconstructed.spacing;
        [mm / sz, mm / sy, mm / sx]
    }

    pub fn normalize_bias(&mut self, pass: usize) {
        let (num, den) = self.scatter(
            |slice| slice.slice_weight > 0.0,
            |slice, j, i| {
                Self::counts(slice, j, i)
                    .then(|| (slice.bias[[j, i]], slice.weights[[j, i]] * slice.slice_weight))
            },
        );
        let mut bias = num;
        Zip::from(&mut bias)
            .and(&den)
            .for_each(|b, &d| *b = if d > 0.0 { *b / d } else { 0.0 });
        let support = den.mapv(|d| f32::from(d > 0.0));
        let sigma = self.voxel_sigma(self.settings.sigma_bias);
        let smoothed = normalized_smooth(&bias, &support, &sigma);
        Zip::from(&mut self.reconstructed.data)
            .and(&smoothed)
            .and(&self.mask.data)
            .for_each(|v, &b, &m| {
                if m > 0 && *v > 0.0 {
                    *v *= b.exp();
                }
            });
        debug!(pass, "Normalised bias");
    }

    pub fn maximization_step(&mut self, pass: usize) {
        let (sigma, mix, n, min_e, max_e) = self
            .slices
            .par_iter()
            .map(|slice| {
                let mut acc = (0.0f64, 0.0f64, 0usize, f32::INFINITY, f32::NEG_INFINITY);
                for ((j, i), _) in slice.data.indexed_iter() {
                    if !Self::counts(slice, j, i) {
                        continue;
                    }
                    let e = Self::corrected(slice, j, i) - slice.simulated[[j, i]];
                    let w = slice.weights[[j, i]] as f64;
                    acc.0 += (e * e) as f64 * w;
                    acc.1 += w;
                    acc.2 += 1;
                    acc.3 = acc.3.min(e);
                    acc.4 = acc.4.max(e);
                }
                acc
            })
            .reduce(
                || (0.0, 0.0, 0, f32::INFINITY, f32::NEG_INFINITY),
                |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2, a.3.min(b.3), a.4.max(b.4)),
            );
        if mix > 0.0 {
            self.stats.sigma = ((sigma / mix) as f32).max(MIN_SIGMA);
        }
        if n > 0 {
            self.stats.mix = (mix / n as f64) as f32;
        }
        if max_e > min_e {
            self.stats.m = 1.0 / (max_e - min_e);
        }
        debug!(pass, sigma = self.stats.sigma, mix = self.stats.mix, "M-step");
    }

    pub fn mask_volume(&mut self) {
        Zip::from(&mut self.reconstructed.data)
            .and(&self.mask.data)
            .for_each(|v, &m| {
                if m == 0 {
                    *v = 0.0;
                }
            });
    }

    pub fn evaluate(&self, iteration: usize) -> Evaluation {
        let mut evaluation = Evaluation {
            iteration,
            ..Evaluation::default()
        };
        for slice in &self.slices {
            if !slice.inside {
                evaluation.outside += 1;
            } else if slice.slice_weight <= 0.0 {
                evaluation.zero_weight += 1;
            } else if slice.slice_weight < 0.5 {
                evaluation.excluded += 1;
            } else {
                evaluation.included += 1;
            }
        }
        info!(%evaluation, "Evaluation");
        evaluation
    }

    pub fn restore_slice_intensities(&mut self) {
        let factors = &self.stack_factors;
        self.slices.par_iter_mut().for_each(|slice| {
            let factor = factors.get(slice.stack).copied().unwrap_or(1.0);
            if factor > 0.0 {
                slice.data.mapv_inplace(|v| if is_valid(v) { v / factor } else { v });
            }
        });
    }

    pub fn scale_volume(&mut self) {
        let (num, den) = self
            .slices
            .par_iter()
            .map(|slice| {
                let (mut num, mut den) = (0.0f64, 0.0f64);
                for ((j, i), &v) in slice.data.indexed_iter() {
                    if !Self::counts(slice, j, i) {
                        continue;
                    }
                    let w = (slice.weights[[j, i]] * slice.slice_weight) as f64;
                    let sim = slice.simulated[[j, i]] as f64;
                    num += w * v as f64 * sim;
                    den += w * sim * sim;
                }
                (num, den)
            })
            .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));
        if den <= 0.0 {
            warn!("No slice overlaps the volume, keeping the volume scale");
            return;
        }
        let scale = (num / den) as f32;
        self.reconstructed.data.mapv_inplace(|v| v * scale);
        info!(scale, "Scaled reconstructed volume");
    }

    pub fn psf_transform(&self, stack: usize, values: &Volume) -> Volume {
        let into_values = values.world_to_index();
        let (num, den) = self.scatter(
            |slice| slice.stack == stack,
            |slice, j, i| {
                let p = into_values * slice.pixel_to_stack * Vector4::new(i as f32, j as f32, 0.0, 1.0);
                Interpolator::nearest(&values.data, p.x, p.y, p.z).map(|v| (v, 1.0))
            },
        );
        let mut data = num;
        Zip::from(&mut data)
            .and(&den)
            .for_each(|v, &d| *v = if d > 0.0 { *v / d } else { 0.0 });
        self.reconstructed.with_data(data)
    }

    pub fn register_slices(&mut self, sampler: Option<&dyn VolumeSampler>) -> Result<()> {
        let groups: Vec<Vec<usize>> = (0..self.slices.len())
            .filter(|&i| self.slices[i].valid_pixels() > 0)
            .map(|i| vec![i])
            .collect();
        self.register_groups(&groups, sampler)
    }

    pub fn register_packages(
        &mut self,
        packages: &[usize],
        split: PackageSplit,
        sampler: Option<&dyn VolumeSampler>,
    ) -> Result<()> {
        let groups = package_groups(&self.slices, packages, split);
        info!(groups = groups.len(), ?split, "Package to volume registration");
        self.register_groups(&groups, sampler)
    }

    fn register_groups(&mut self, groups: &[Vec<usize>], sampler: Option<&dyn VolumeSampler>) -> Result<()> {
        let host = HostSampler::new(&self.reconstructed);
        let sampler = sampler.unwrap_or(&host);
        register_slice_groups(
            &mut self.slices,
            groups,
            &self.reconstructed,
            sampler,
            &self.settings.registration,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::PartitionStrategy;
    use crate::slices::create_slices;

    /// Three orthogonal-ish stacks of a smooth phantom on an 8 mm cube.
    fn phantom_setup() -> EngineSetup {
        let phantom = |x: f32, y: f32, z: f32| {
            let d = ((x - 4.0).powi(2) + (y - 4.0).powi(2) + (z - 4.0).powi(2)).sqrt();
            if d < 3.5 { 500.0 + 40.0 * x } else { 100.0 }
        };
        let stack = Volume::new(
            Array3::from_shape_fn((4, 8, 8), |(z, y, x)| phantom(x as f32, y as f32, 2.0 * z as f32)),
            (1.0, 1.0, 2.0),
        );
        let slices = create_slices(
            &[stack.clone()],
            &[RigidTransform::IDENTITY],
            &[2.0],
            PartitionStrategy::Slices,
            None,
        )
        .unwrap();
        let grid = Volume::new(Array3::from_elem((8, 8, 8), 300.0f32), (1.0, 1.0, 1.0));
        let mask = grid.with_data(Array3::from_elem((8, 8, 8), 1u8));
        EngineSetup {
            slices,
            reconstruction: grid,
            mask,
            stack_factors: vec![2.0],
            settings: EngineSettings::default(),
        }
    }

    fn prepared() -> ReconstructionCore {
        let mut core = ReconstructionCore::new(phantom_setup()).unwrap();
        core.initialize_em();
        core.compute_coefficients();
        core.gaussian_reconstruct();
        core.simulate_slices().unwrap();
        core
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let mut setup = phantom_setup();
        setup.mask = Volume::new(Array3::from_elem((2, 2, 2), 1u8), (1.0, 1.0, 1.0));
        assert!(ReconstructionCore::new(setup).is_err());
    }

    #[test]
    fn gaussian_reconstruction_covers_slice_planes() {
        let core = prepared();
        assert_eq!(core.jobs().len(), 4);
        let weights = core.volume_weights();
        assert!(weights.data[[0, 4, 4]] > 0.0);
        // Plane 2 of the stack sits at z = 4 mm.
        let centre = core.reconstructed().data[[4, 4, 4]];
        assert!(centre > 400.0, "{centre}");
        assert!(core.slices().iter().all(|s| s.inside));
    }

    #[test]
    fn em_keeps_consistent_slices() {
        let mut core = prepared();
        core.initialize_robust_statistics();
        core.expectation_step();
        for pass in 1..=2 {
            core.estimate_bias_field();
            core.estimate_scale();
            core.superresolve(pass);
            core.normalize_bias(pass);
            core.simulate_slices().unwrap();
            core.maximization_step(pass);
            core.expectation_step();
        }
        core.mask_volume();
        let evaluation = core.evaluate(0);
        assert_eq!(evaluation.total(), 4);
        assert_eq!(evaluation.outside, 0);
        assert!(core.reconstructed().data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn force_excluded_slices_get_zero_weight() {
        let mut setup = phantom_setup();
        setup.settings.force_excluded = vec![1];
        let mut core = ReconstructionCore::new(setup).unwrap();
        core.initialize_em();
        core.compute_coefficients();
        core.gaussian_reconstruct();
        core.simulate_slices().unwrap();
        core.initialize_robust_statistics();
        core.expectation_step();
        assert_eq!(core.slices()[1].slice_weight, 0.0);
        assert!(core.evaluate(0).zero_weight >= 1);
    }

    #[test]
    fn restoring_intensities_divides_by_stack_factor() {
        let mut core = prepared();
        let before = core.slices()[0].data[[0, 0]];
        core.restore_slice_intensities();
        assert_eq!(core.slices()[0].data[[0, 0]], before / 2.0);
    }

    #[test]
    fn masking_zeroes_outside_voxels() {
        let mut setup = phantom_setup();
        setup.mask.data[[0, 0, 0]] = 0;
        let mut core = ReconstructionCore::new(setup).unwrap();
        core.mask_volume();
        assert_eq!(core.reconstructed().data[[0, 0, 0]], 0.0);
        assert_eq!(core.reconstructed().data[[1, 0, 0]], 300.0);
    }

    #[test]
    fn psf_transform_of_a_constant_is_constant() {
        let core = prepared();
        let stack_grid = Volume::new(Array3::from_elem((4, 8, 8), 1.0f32), (1.0, 1.0, 2.0));
        let projected = core.psf_transform(0, &stack_grid);
        assert!(
            projected
                .data
                .iter()
                .all(|v| *v == 0.0 || (*v - 1.0).abs() < 1e-5)
        );
        assert!((projected.data[[4, 4, 4]] - 1.0).abs() < 1e-5);
    }
}
