use super::{Engine, EngineSetup, Evaluation, ReconstructionCore};
use crate::anneal::Smoothing;
use crate::enums::Processor;
use crate::error::Result;
use crate::schedule::PackageSplit;
use crate::transform::RigidTransform;
use crate::volume::Volume;

/// Runs every step on the host with rayon.
pub struct HostEngine {
    core: ReconstructionCore,
}

impl HostEngine {
    pub fn new(setup: EngineSetup) -> Result<Self> {
        Ok(Self {
            core: ReconstructionCore::new(setup)?,
        })
    }
}

impl Engine for HostEngine {
    fn processor(&self) -> Processor {
        Processor::Host
    }

    fn register_slices_to_volume(&mut self) -> Result<()> {
        self.core.register_slices(None)
    }

    fn register_packages_to_volume(&mut self, packages: &[usize], split: PackageSplit) -> Result<()> {
        self.core.register_packages(packages, split, None)
    }

    fn set_smoothing(&mut self, smoothing: Smoothing) {
        self.core.set_smoothing(smoothing);
    }

    fn set_speedup(&mut self, speedup: bool) {
        self.core.set_speedup(speedup);
    }

    fn initialize_em(&mut self) -> Result<()> {
        self.core.initialize_em();
        Ok(())
    }

    fn initialize_em_values(&mut self) -> Result<()> {
        self.core.initialize_em_values();
        Ok(())
    }

    fn compute_coefficients(&mut self) -> Result<()> {
        self.core.compute_coefficients();
        Ok(())
    }

    fn gaussian_reconstruct(&mut self) -> Result<()> {
        self.core.gaussian_reconstruct();
        Ok(())
    }

    fn simulate_slices(&mut self) -> Result<()> {
        self.core.simulate_slices()
    }

    fn initialize_robust_statistics(&mut self) -> Result<()> {
        self.core.initialize_robust_statistics();
        Ok(())
    }

    fn expectation_step(&mut self) -> Result<()> {
        self.core.expectation_step();
        Ok(())
    }

    fn estimate_bias_field(&mut self) -> Result<()> {
        self.core.estimate_bias_field();
        Ok(())
    }

    fn estimate_scale(&mut self) -> Result<()> {
        self.core.estimate_scale();
        Ok(())
    }

    fn superresolve(&mut self, pass: usize) -> Result<()> {
        self.core.superresolve(pass);
        Ok(())
    }

    fn normalize_bias(&mut self, pass: usize) -> Result<()> {
        self.core.normalize_bias(pass);
        Ok(())
    }

    fn maximization_step(&mut self, pass: usize) -> Result<()> {
        self.core.maximization_step(pass);
        Ok(())
    }

    fn mask_volume(&mut self) -> Result<()> {
        self.core.mask_volume();
        Ok(())
    }

    fn evaluate(&mut self, iteration: usize) -> Result<Evaluation> {
        Ok(self.core.evaluate(iteration))
    }

    fn restore_slice_intensities(&mut self) -> Result<()> {
        self.core.restore_slice_intensities();
        Ok(())
    }

    fn scale_volume(&mut self) -> Result<()> {
        self.core.scale_volume();
        Ok(())
    }

    fn psf_transform(&self, stack: usize, values: &Volume) -> Result<Volume> {
        Ok(self.core.psf_transform(stack, values))
    }

    fn reconstructed(&self) -> Result<&Volume> {
        Ok(self.core.reconstructed())
    }

    fn volume_weights(&self) -> Result<&Volume> {
        Ok(self.core.volume_weights())
    }

    fn slice_transformations(&self) -> Result<Vec<RigidTransform>> {
        Ok(self.core.slice_transformations())
    }
}
