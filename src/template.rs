//! Choice of the stack that defines the reference frame.

use nalgebra::{DMatrix, SymmetricEigen};
use tracing::{info, warn};

use crate::error::{ReconstructionError, Result};
use crate::mask::{crop_to_mask, transform_mask};
use crate::transform::{RigidTransform, StackTransform};
use crate::volume::{Mask, Volume};

/// Scores how much a stack is corrupted by motion; lower is better.
pub trait MotionEstimator: Send + Sync {
    fn motion_score(&self, stack: &Volume) -> Result<f32>;
}

/// Treats the planes of a stack as vectors and measures how much of the
/// plane Gram matrix energy falls outside its leading eigenvalues. Planes of a
/// still acquisition vary smoothly and are well described by a few
/// components.
#[derive(Clone, Copy, Debug, Default)]
pub struct RankMotionEstimator;

impl MotionEstimator for RankMotionEstimator {
    fn motion_score(&self, stack: &Volume) -> Result<f32> {
        let (depth, height, width) = stack.dim();
        if depth == 0 || height * width == 0 {
            return Err(ReconstructionError::invalid("cannot score an empty stack"));
        }
        let planes = stack
            .data
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((depth, height * width))
            .map_err(|e| ReconstructionError::invalid(e.to_string()))?;
        let gram = planes.dot(&planes.t());
        let gram = DMatrix::from_fn(depth, depth, |r, c| gram[[r, c]] as f64);
        let mut eigenvalues: Vec<f64> = SymmetricEigen::new(gram)
            .eigenvalues
            .iter()
            .map(|v| v.max(0.0))
            .collect();
        eigenvalues.sort_by(|a, b| b.total_cmp(a));

        let total: f64 = eigenvalues.iter().sum();
        if total <= 0.0 {
            return Ok(0.0);
        }
        let keep = (depth / 10).max(1);
        let residual: f64 = eigenvalues.iter().skip(keep).sum();
        Ok((residual / total) as f32)
    }
}

/// First stack carrying the identity marker; stack 0 when no transforms
/// were supplied.
pub fn marker_template(transforms: Option<&[StackTransform]>) -> Option<usize> {
    match transforms {
        None => Some(0),
        Some(transforms) => transforms.iter().position(StackTransform::is_identity_marker),
    }
}

/// Index of the first minimum in scan order.
pub fn first_minimizer(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        if best.is_none_or(|(_, b)| score < b) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

pub struct TemplateSelector<'a> {
    estimator: Option<&'a dyn MotionEstimator>,
}

impl<'a> TemplateSelector<'a> {
    /// `estimator` is the backend's motion-estimation capability, if any.
    pub fn new(estimator: Option<&'a dyn MotionEstimator>) -> Self {
        Self { estimator }
    }

    /// Picks the template stack.
    ///
    /// With `auto` and a motion estimator, every stack is masked and cropped
    /// on a working copy and the first stack with the lowest score wins.
    /// Otherwise the identity marker decides.
    pub fn select(
        &self,
        stacks: &[Volume],
        transforms: Option<&[StackTransform]>,
        stack_to_template: &[RigidTransform],
        mask: Option<&Mask>,
        auto: bool,
    ) -> Result<usize> {
        let marked = marker_template(transforms).filter(|&i| i < stacks.len());

        match (auto, self.estimator, mask) {
            (true, Some(estimator), Some(mask)) => {
                let mut scores = Vec::with_capacity(stacks.len());
                for (i, stack) in stacks.iter().enumerate() {
                    let transform = stack_to_template.get(i).copied().unwrap_or_default();
                    let local = transform_mask(stack, mask, &transform);
                    let working = crop_to_mask(stack, &local);
                    let score = estimator.motion_score(&working)?;
                    info!(stack = i, score, "Estimated stack motion");
                    scores.push(score);
                }
                let chosen = first_minimizer(&scores).ok_or(ReconstructionError::NoTemplate)?;
                info!(template = chosen, "Template chosen by motion estimation");
                Ok(chosen)
            }
            (true, None, _) => {
                warn!("Automatic template selection needs motion estimation, using the marked stack");
                marked.ok_or(ReconstructionError::NoTemplate)
            }
            _ => marked.ok_or(ReconstructionError::NoTemplate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    struct Scores(Vec<f32>);

    impl MotionEstimator for Scores {
        fn motion_score(&self, stack: &Volume) -> Result<f32> {
            // Stacks are tagged by their first voxel.
            Ok(self.0[stack.data[[0, 0, 0]] as usize])
        }
    }

    fn stacks(n: usize) -> Vec<Volume> {
        (0..n)
            .map(|i| Volume::new(Array3::from_elem((2, 3, 3), i as f32), (1.0, 1.0, 1.0)))
            .collect()
    }

    #[test]
    fn first_marker_wins() {
        let loaded = StackTransform::Loaded(RigidTransform::new([1.0, 0.0, 0.0], [0.0; 3]));
        let transforms = [loaded, StackTransform::Identity, StackTransform::Identity];
        assert_eq!(marker_template(Some(&transforms)), Some(1));
        assert_eq!(marker_template(None), Some(0));
        assert_eq!(marker_template(Some(&[loaded])), None);
    }

    #[test]
    fn first_minimizer_is_stable() {
        assert_eq!(first_minimizer(&[3.0, 1.0, 2.0, 1.0]), Some(1));
        assert_eq!(first_minimizer(&[]), None);
        for _ in 0..10 {
            assert_eq!(first_minimizer(&[0.5, 0.5, 0.5]), Some(0));
        }
    }

    #[test]
    fn missing_marker_is_fatal() {
        let loaded = StackTransform::Loaded(RigidTransform::IDENTITY);
        let err = TemplateSelector::new(None)
            .select(&stacks(2), Some(&[loaded, loaded]), &[], None, false)
            .unwrap_err();
        assert!(matches!(err, ReconstructionError::NoTemplate));
    }

    #[test]
    fn motion_scores_override_marker() {
        let s = stacks(3);
        let mask = s[0].with_data(Array3::from_elem((2, 3, 3), 1u8));
        let estimator = Scores(vec![0.7, 0.2, 0.2]);
        let identity = [RigidTransform::IDENTITY; 3];
        let chosen = TemplateSelector::new(Some(&estimator))
            .select(&s, None, &identity, Some(&mask), true)
            .unwrap();
        assert_eq!(chosen, 1);
        let without = TemplateSelector::new(None)
            .select(&s, None, &identity, Some(&mask), true)
            .unwrap();
        assert_eq!(without, 0);
    }

    #[test]
    fn rank_score_prefers_consistent_planes() {
        let smooth = Volume::new(
            Array3::from_shape_fn((10, 4, 4), |(_, y, x)| (y * 4 + x) as f32),
            (1.0, 1.0, 1.0),
        );
        let jumpy = Volume::new(
            Array3::from_shape_fn((10, 4, 4), |(z, y, x)| ((y * 4 + x + 5 * z) % 16) as f32),
            (1.0, 1.0, 1.0),
        );
        let still = RankMotionEstimator.motion_score(&smooth).unwrap();
        let moving = RankMotionEstimator.motion_score(&jumpy).unwrap();
        assert!(still < 1e-4, "{still}");
        assert!(moving > still);
    }
}
