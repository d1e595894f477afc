//! In-plane partitions of a stack: fixed-size patches and superpixels.

use ndarray::{Array2, Array3, ArrayView2, Axis, s};
use rayon::prelude::*;

use crate::volume::Volume;

/// Label volume parallel to a stack; `0` marks background.
pub type LabelStack = Volume<u32>;

/// Start offsets of patches of `size` along an axis of length `len`.
///
/// Tiles advance by `stride`; when the last tile stops short of the far edge
/// an extra tile aligned to that edge is added. An axis no longer than `size`
/// yields a single tile.
pub fn patch_starts(len: usize, size: usize, stride: usize) -> Vec<usize> {
    if len <= size || size == 0 {
        return vec![0];
    }
    let stride = stride.max(1);
    let mut starts: Vec<usize> = (0..=len - size).step_by(stride).collect();
    if let Some(&last) = starts.last() {
        if last + size < len {
            starts.push(len - size);
        }
    }
    starts
}

/// A rectangular tile of one plane, in stack voxel indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Patch {
    pub plane: usize,
    pub y: usize,
    pub x: usize,
    pub height: usize,
    pub width: usize,
}

/// Fixed size and stride tiling of every plane of a stack.
pub fn tile_patches(dim: (usize, usize, usize), size: usize, stride: usize) -> Vec<Patch> {
    let (depth, height, width) = dim;
    let ys = patch_starts(height, size, stride);
    let xs = patch_starts(width, size, stride);
    let mut patches = Vec::with_capacity(depth * ys.len() * xs.len());
    for plane in 0..depth {
        for &y in &ys {
            for &x in &xs {
                patches.push(Patch {
                    plane,
                    y,
                    x,
                    height: size.min(height),
                    width: size.min(width),
                });
            }
        }
    }
    patches
}

/// Label-driven oversegmentation of a stack, plane by plane.
pub trait Oversegmenter: Sync {
    /// Labels for one plane. Labels start at 1.
    fn segment_plane(&self, plane: ArrayView2<f32>) -> Array2<u32>;

    fn segment(&self, stack: &Volume) -> LabelStack {
        let planes: Vec<Array2<u32>> = stack
            .data
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|plane| self.segment_plane(plane))
            .collect();
        let (depth, height, width) = stack.dim();
        let mut labels = Array3::<u32>::zeros((depth, height, width));
        for (k, plane) in planes.into_iter().enumerate() {
            labels.slice_mut(s![k, .., ..]).assign(&plane);
        }
        stack.with_data(labels)
    }
}

/// Simple linear iterative clustering on intensity and position.
pub struct Slic {
    pub superpixels: usize,
    pub compactness: f32,
    pub iterations: usize,
}

impl Slic {
    pub fn new(superpixels: usize) -> Self {
        Self {
            superpixels: superpixels.max(1),
            compactness: 1.0,
            iterations: 5,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Center {
    y: f32,
    x: f32,
    intensity: f32,
}

impl Oversegmenter for Slic {
    fn segment_plane(&self, plane: ArrayView2<f32>) -> Array2<u32> {
        let (height, width) = plane.dim();
        let mut labels = Array2::<u32>::zeros((height, width));
        if height == 0 || width == 0 {
            return labels;
        }
        let step = ((height * width) as f32 / self.superpixels as f32).sqrt().max(1.0);
        let max_intensity = plane.iter().copied().fold(0.0f32, f32::max).max(1e-6);

        let mut centers = Vec::new();
        let mut y = step / 2.0;
        while y < height as f32 {
            let mut x = step / 2.0;
            while x < width as f32 {
                let (yi, xi) = (y as usize, x as usize);
                centers.push(Center {
                    y,
                    x,
                    intensity: plane[[yi, xi]] / max_intensity,
                });
                x += step;
            }
            y += step;
        }

        let window = (2.0 * step).ceil() as isize;
        let spatial = self.compactness / step;
        for _ in 0..self.iterations {
            let mut distance = Array2::<f32>::from_elem((height, width), f32::INFINITY);
            for (label, c) in centers.iter().enumerate() {
                let y0 = (c.y as isize - window).max(0) as usize;
                let y1 = ((c.y as isize + window) as usize).min(height - 1);
                let x0 = (c.x as isize - window).max(0) as usize;
                let x1 = ((c.x as isize + window) as usize).min(width - 1);
                for yy in y0..=y1 {
                    for xx in x0..=x1 {
                        let dc = plane[[yy, xx]] / max_intensity - c.intensity;
                        let dy = (yy as f32 - c.y) * spatial;
                        let dx = (xx as f32 - c.x) * spatial;
                        let d = dc * dc + dy * dy + dx * dx;
                        if d < distance[[yy, xx]] {
                            distance[[yy, xx]] = d;
                            labels[[yy, xx]] = label as u32 + 1;
                        }
                    }
                }
            }

            let mut sums = vec![(0.0f32, 0.0f32, 0.0f32, 0usize); centers.len()];
            for ((yy, xx), &label) in labels.indexed_iter() {
                if label == 0 {
                    continue;
                }
                let entry = &mut sums[label as usize - 1];
                entry.0 += yy as f32;
                entry.1 += xx as f32;
                entry.2 += plane[[yy, xx]] / max_intensity;
                entry.3 += 1;
            }
            for (c, (sy, sx, si, n)) in centers.iter_mut().zip(sums) {
                if n > 0 {
                    let n = n as f32;
                    *c = Center {
                        y: sy / n,
                        x: sx / n,
                        intensity: si / n,
                    };
                }
            }
        }
        labels
    }
}

/// Bounding box `(y0, y1, x0, x1)` (exclusive ends) of `label` in a plane.
pub fn label_bounds(labels: ArrayView2<u32>, label: u32) -> Option<(usize, usize, usize, usize)> {
    let mut bounds: Option<(usize, usize, usize, usize)> = None;
    for ((y, x), &l) in labels.indexed_iter() {
        if l != label {
            continue;
        }
        bounds = Some(match bounds {
            None => (y, y + 1, x, x + 1),
            Some((y0, y1, x0, x1)) => (y0.min(y), y1.max(y + 1), x0.min(x), x1.max(x + 1)),
        });
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patches_cover_far_edge() {
        assert_eq!(patch_starts(100, 64, 32), vec![0, 32, 36]);
        assert_eq!(patch_starts(96, 64, 32), vec![0, 32]);
        assert_eq!(patch_starts(40, 64, 32), vec![0]);
    }

    #[test]
    fn tiling_counts_every_plane() {
        let patches = tile_patches((3, 100, 40), 64, 32);
        assert_eq!(patches.len(), 3 * 3);
        assert!(patches.iter().all(|p| p.width == 40 && p.height == 64));
        assert_eq!(patches.last().unwrap().plane, 2);
    }

    #[test]
    fn slic_labels_every_pixel() {
        let plane = Array2::from_shape_fn((16, 16), |(y, x)| if x < 8 { 10.0 } else { 100.0 + y as f32 });
        let labels = Slic::new(4).segment_plane(plane.view());
        assert!(labels.iter().all(|&l| l >= 1 && l <= 4));
        // The intensity edge at x = 8 separates clusters.
        assert_ne!(labels[[8, 2]], labels[[8, 13]]);
    }

    #[test]
    fn bounds_of_missing_label_is_none() {
        let labels = Array2::from_shape_fn((4, 4), |(y, _)| if y < 2 { 1 } else { 2 });
        assert_eq!(label_bounds(labels.view(), 2), Some((2, 4, 0, 4)));
        assert_eq!(label_bounds(labels.view(), 7), None);
    }
}
