//! Normalises raw inputs into an ordered list of 3D stacks.

use ndarray::{Array4, Axis, s};
use tracing::{debug, info};

use crate::enums::PartitionStrategy;
use crate::error::{ReconstructionError, Result};
use crate::partition::{LabelStack, Oversegmenter, Slic};
use crate::volume::Volume;

/// One acquired input, possibly with several temporal frames.
#[derive(Clone, Debug)]
pub struct RawStack {
    /// `(t, z, y, x)`.
    pub frames: Array4<f32>,
    pub spacing: (f32, f32, f32),
    pub origin: (f32, f32, f32),
}

impl RawStack {
    pub fn frames(&self) -> usize {
        self.frames.dim().0
    }
}

impl From<Volume> for RawStack {
    fn from(volume: Volume) -> Self {
        Self {
            frames: volume.data.insert_axis(Axis(0)),
            spacing: volume.spacing,
            origin: volume.origin,
        }
    }
}

/// Ordered stacks plus their parallel per-stack metadata.
#[derive(Clone, Debug, Default)]
pub struct StackSet {
    pub stacks: Vec<Volume>,
    /// Slice thickness per stack in mm.
    pub thickness: Vec<f32>,
    /// Acquisition package count per stack; empty when none were declared.
    pub packages: Vec<usize>,
    /// Superpixel label stacks, parallel to `stacks`.
    pub labels: Option<Vec<LabelStack>>,
    /// Index of the input each stack came from.
    pub source: Vec<usize>,
}

impl StackSet {
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Keeps only the first `count` stacks.
    pub fn truncate(&mut self, count: usize) {
        self.stacks.truncate(count);
        self.source.truncate(count);
        if !self.thickness.is_empty() {
            self.thickness.truncate(count);
        }
        if !self.packages.is_empty() {
            self.packages.truncate(count);
        }
        if let Some(labels) = self.labels.as_mut() {
            labels.truncate(count);
        }
    }

    /// Fills missing thickness values with twice the out-of-plane spacing.
    pub fn default_thickness(&mut self) {
        if self.thickness.len() == self.stacks.len() {
            return;
        }
        self.thickness = self.stacks.iter().map(|s| 2.0 * s.spacing.2).collect();
        info!(thickness = ?self.thickness, "Slice thickness defaulted to twice the z spacing");
    }
}

pub struct StackDecomposer<'a> {
    thickness: &'a [f32],
    packages: &'a [usize],
    partition: PartitionStrategy,
    segmenter: Option<&'a dyn Oversegmenter>,
}

impl<'a> StackDecomposer<'a> {
    pub fn new(thickness: &'a [f32], packages: &'a [usize], partition: PartitionStrategy) -> Self {
        Self {
            thickness,
            packages,
            partition,
            segmenter: None,
        }
    }

    /// Replaces the default SLIC oversegmentation.
    pub fn with_segmenter(mut self, segmenter: &'a dyn Oversegmenter) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    /// Splits 4D inputs into one stack per frame, in place, duplicating the
    /// per-input metadata, then computes the partition layout.
    pub fn decompose(&self, raw: &[RawStack]) -> Result<StackSet> {
        if raw.is_empty() {
            return Err(ReconstructionError::NoInputStacks);
        }
        for (name, len) in [("thickness", self.thickness.len()), ("packages", self.packages.len())] {
            if len != 0 && len != raw.len() {
                return Err(ReconstructionError::invalid(format!(
                    "{name} has {len} entries for {} stacks",
                    raw.len()
                )));
            }
        }

        let mut set = StackSet::default();
        for (i, input) in raw.iter().enumerate() {
            let frames = input.frames();
            if frames > 1 {
                debug!(input = i, frames, "Splitting 4D stack");
            }
            for t in 0..frames {
                let data = input.frames.slice(s![t, .., .., ..]).to_owned();
                set.stacks
                    .push(Volume::new(data, input.spacing).with_origin(input.origin));
                set.source.push(i);
                if let Some(&th) = self.thickness.get(i) {
                    set.thickness.push(th);
                }
                if let Some(&p) = self.packages.get(i) {
                    set.packages.push(p);
                }
            }
        }

        if let PartitionStrategy::Superpixels { count } = self.partition {
            let fallback = Slic::new(count);
            let segmenter: &dyn Oversegmenter = self.segmenter.unwrap_or(&fallback);
            set.labels = Some(set.stacks.iter().map(|s| segmenter.segment(s)).collect());
        }

        info!(inputs = raw.len(), stacks = set.len(), "Decomposed input stacks");
        Ok(set)
    }
}

/// Splits a stack into `packages` interleaved sub-stacks; plane `k` goes to
/// package `k % packages`.
pub fn split_into_packages(stack: &Volume, packages: usize) -> Vec<Volume> {
    let packages = packages.max(1);
    let depth = stack.dim().0;
    let (sx, sy, sz) = stack.spacing;
    let (ox, oy, oz) = stack.origin;
    (0..packages.min(depth))
        .map(|p| {
            let data = stack.data.slice(s![p..;packages, .., ..]).to_owned();
            Volume::new(data, (sx, sy, sz * packages as f32))
                .with_origin((ox, oy, oz + p as f32 * sz))
        })
        .collect()
}
