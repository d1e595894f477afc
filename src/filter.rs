use ndarray::{Array, Axis, Dimension, Zip};
use rayon::prelude::*;

/// Normalised Gaussian kernel truncated at three standard deviations.
pub(crate) fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let radius = (3.0 * sigma).ceil() as isize;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// Separable Gaussian smoothing with a per-axis sigma in voxels. Border
/// samples are renormalised over the part of the kernel inside the array.
pub(crate) fn gaussian_smooth<D: Dimension>(array: &mut Array<f32, D>, sigma: &[f32]) {
    for (axis, &s) in sigma.iter().enumerate().take(array.ndim()) {
        if s <= 0.0 {
            continue;
        }
        let kernel = gaussian_kernel(s);
        let radius = (kernel.len() / 2) as isize;
        array
            .lanes_mut(Axis(axis))
            .into_iter()
            .collect::<Vec<_>>()
            .into_par_iter()
            .for_each(|mut lane| {
                let input = lane.to_vec();
                let n = input.len() as isize;
                for (i, out) in lane.iter_mut().enumerate() {
                    let mut acc = 0.0;
                    let mut norm = 0.0;
                    for (k, w) in kernel.iter().enumerate() {
                        let j = i as isize + k as isize - radius;
                        if (0..n).contains(&j) {
                            acc += w * input[j as usize];
                            norm += w;
                        }
                    }
                    *out = if norm > 0.0 { acc / norm } else { 0.0 };
                }
            });
    }
}

/// Weighted smoothing: `smooth(values * weights) / smooth(weights)`, zero
/// where no weight reaches.
pub(crate) fn normalized_smooth<D: Dimension>(
    values: &Array<f32, D>,
    weights: &Array<f32, D>,
    sigma: &[f32],
) -> Array<f32, D> {
    let mut numerator = values * weights;
    let mut denominator = weights.clone();
    gaussian_smooth(&mut numerator, sigma);
    gaussian_smooth(&mut denominator, sigma);
    Zip::from(&mut numerator)
        .and(&denominator)
        .for_each(|n, &d| *n = if d > 1e-6 { *n / d } else { 0.0 });
    numerator
}
