//! The registration/reconstruction engine behind the scheduler.
//!
//! Every numerical step the scheduler sequences is one method of [`Engine`].
//! [`HostEngine`] runs them with rayon; [`AcceleratorEngine`] moves the
//! gather-type steps onto one or more wgpu devices. Both share
//! [`ReconstructionCore`] for the arithmetic, so the observable results
//! only differ by floating point rounding.

mod accelerator;
mod core;
mod host;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use self::accelerator::AcceleratorEngine;
pub use self::core::{EngineSettings, ReconstructionCore};
pub use self::host::HostEngine;

use crate::anneal::Smoothing;
use crate::enums::Processor;
use crate::error::Result;
use crate::schedule::PackageSplit;
use crate::slices::Slice;
use crate::transform::RigidTransform;
use crate::volume::{Mask, Volume};

/// Everything an engine needs to start: the slice set, the initial
/// reconstruction grid and the mask on that grid.
#[derive(Clone, Debug)]
pub struct EngineSetup {
    pub slices: Vec<Slice>,
    pub reconstruction: Volume,
    pub mask: Mask,
    /// Cumulative intensity factor applied to each stack.
    pub stack_factors: Vec<f32>,
    pub settings: EngineSettings,
}

/// Per outer iteration slice accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub iteration: usize,
    pub included: usize,
    pub excluded: usize,
    pub outside: usize,
    pub zero_weight: usize,
}

impl Evaluation {
    pub fn total(&self) -> usize {
        self.included + self.excluded + self.outside + self.zero_weight
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iteration {}: included {} excluded {} outside {} zero weight {} total {}",
            self.iteration,
            self.included,
            self.excluded,
            self.outside,
            self.zero_weight,
            self.total()
        )
    }
}

/// Uniform call surface over the execution backends.
///
/// Every method blocks until its full effect is visible to the next call.
pub trait Engine {
    fn processor(&self) -> Processor;

    /// Makes the device copy of the engine state current. No-op on the host.
    fn sync_device(&mut self) -> Result<()> {
        Ok(())
    }

    /// Makes the host copy of the engine state current. No-op on the host.
    fn sync_host(&mut self) -> Result<()> {
        Ok(())
    }

    fn register_slices_to_volume(&mut self) -> Result<()>;
    fn register_packages_to_volume(&mut self, packages: &[usize], split: PackageSplit) -> Result<()>;

    fn set_smoothing(&mut self, smoothing: Smoothing);
    fn set_speedup(&mut self, speedup: bool);

    fn initialize_em(&mut self) -> Result<()>;
    fn initialize_em_values(&mut self) -> Result<()>;
    fn compute_coefficients(&mut self) -> Result<()>;
    fn gaussian_reconstruct(&mut self) -> Result<()>;
    fn simulate_slices(&mut self) -> Result<()>;
    fn initialize_robust_statistics(&mut self) -> Result<()>;
    fn expectation_step(&mut self) -> Result<()>;
    fn estimate_bias_field(&mut self) -> Result<()>;
    fn estimate_scale(&mut self) -> Result<()>;
    fn superresolve(&mut self, pass: usize) -> Result<()>;
    fn normalize_bias(&mut self, pass: usize) -> Result<()>;
    fn maximization_step(&mut self, pass: usize) -> Result<()>;
    fn mask_volume(&mut self) -> Result<()>;
    fn evaluate(&mut self, iteration: usize) -> Result<Evaluation>;
    fn restore_slice_intensities(&mut self) -> Result<()>;
    fn scale_volume(&mut self) -> Result<()>;

    /// Projects a volume defined on the grid of stack `stack` into
    /// reconstruction space through the slice PSFs.
    fn psf_transform(&self, stack: usize, values: &Volume) -> Result<Volume>;

    fn reconstructed(&self) -> Result<&Volume>;
    fn volume_weights(&self) -> Result<&Volume>;
    fn slice_transformations(&self) -> Result<Vec<RigidTransform>>;
}
