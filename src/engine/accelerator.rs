use tracing::debug;

use super::{Engine, EngineSetup, Evaluation, ReconstructionCore};
use crate::anneal::Smoothing;
use crate::enums::Processor;
use crate::error::{ReconstructionError, Result};
use crate::gpu_sampler::DevicePool;
use crate::sampling::VolumeSampler;
use crate::schedule::PackageSplit;
use crate::transform::RigidTransform;
use crate::volume::Volume;

/// Which copy of the reconstruction is current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Residency {
    /// Nothing has been uploaded yet.
    HostOnly,
    Synchronized,
    /// The host changed the volume since the last upload.
    HostNewer,
    /// A device kernel changed the volume since the last download.
    DeviceNewer,
}

/// Runs slice simulation, registration sampling and volume masking on a
/// [`DevicePool`]; every other step runs on the host copy.
pub struct AcceleratorEngine {
    core: ReconstructionCore,
    pool: DevicePool,
    residency: Residency,
    /// Sample registration on the host even though devices are available.
    host_registration: bool,
}

impl AcceleratorEngine {
    pub fn new(setup: EngineSetup, pool: DevicePool) -> Result<Self> {
        let host_registration = setup.settings.host_registration;
        Ok(Self {
            core: ReconstructionCore::new(setup)?,
            pool,
            residency: Residency::HostOnly,
            host_registration,
        })
    }

    fn ensure_materialized(&self) -> Result<()> {
        if self.residency == Residency::HostOnly {
            return Err(ReconstructionError::StateNotMaterialized);
        }
        Ok(())
    }

    fn ensure_host_current(&self) -> Result<()> {
        if self.residency == Residency::DeviceNewer {
            return Err(ReconstructionError::StateNotSynchronized);
        }
        Ok(())
    }

    /// Uploads the host volume if the device copy is stale.
    fn push(&mut self) -> Result<()> {
        if matches!(self.residency, Residency::HostOnly | Residency::HostNewer) {
            self.pool.upload_volume(self.core.reconstructed())?;
            self.residency = Residency::Synchronized;
        }
        Ok(())
    }

    /// Runs a host-side step that modifies the volume.
    fn on_host(&mut self, step: impl FnOnce(&mut ReconstructionCore)) -> Result<()> {
        self.sync_host()?;
        step(&mut self.core);
        if self.residency != Residency::HostOnly {
            self.residency = Residency::HostNewer;
        }
        Ok(())
    }
}

impl Engine for AcceleratorEngine {
    fn processor(&self) -> Processor {
        Processor::Accelerator
    }

    fn sync_device(&mut self) -> Result<()> {
        if self.residency == Residency::DeviceNewer {
            return Ok(());
        }
        self.pool.upload_volume(self.core.reconstructed())?;
        self.pool.upload_mask(self.core.mask())?;
        self.residency = Residency::Synchronized;
        debug!(devices = self.pool.len(), "Device state materialised");
        Ok(())
    }

    fn sync_host(&mut self) -> Result<()> {
        if self.residency == Residency::DeviceNewer {
            let data = self.pool.download_volume()?;
            self.core.reconstructed_mut().data = data;
            self.residency = Residency::Synchronized;
            debug!("Host state synchronised");
        }
        Ok(())
    }

    fn register_slices_to_volume(&mut self) -> Result<()> {
        let host_registration = self.host_registration;
        self.ensure_host_current()?;
        if !host_registration {
            self.push()?;
        }
        let Self { core, pool, .. } = self;
        core.register_slices((!host_registration).then_some(&*pool as &dyn VolumeSampler))
    }

    fn register_packages_to_volume(&mut self, packages: &[usize], split: PackageSplit) -> Result<()> {
        let host_registration = self.host_registration;
        self.ensure_host_current()?;
        if !host_registration {
            self.push()?;
        }
        let Self { core, pool, .. } = self;
        core.register_packages(packages, split, (!host_registration).then_some(&*pool as &dyn VolumeSampler))
    }

    fn set_smoothing(&mut self, smoothing: Smoothing) {
        self.core.set_smoothing(smoothing);
    }

    fn set_speedup(&mut self, speedup: bool) {
        self.core.set_speedup(speedup);
    }

    fn initialize_em(&mut self) -> Result<()> {
        self.ensure_materialized()?;
        self.core.initialize_em();
        Ok(())
    }

    fn initialize_em_values(&mut self) -> Result<()> {
        self.ensure_materialized()?;
        self.core.initialize_em_values();
        Ok(())
    }

    fn compute_coefficients(&mut self) -> Result<()> {
        self.core.compute_coefficients();
        Ok(())
    }

    fn gaussian_reconstruct(&mut self) -> Result<()> {
        self.on_host(ReconstructionCore::gaussian_reconstruct)
    }

    fn simulate_slices(&mut self) -> Result<()> {
        self.ensure_materialized()?;
        self.push()?;
        let sampled = self.pool.sample(self.core.jobs(), self.core.psf())?;
        self.core.apply_simulation(sampled)
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
        self.on_host(|core| core.superresolve(pass))
    }

    fn normalize_bias(&mut self, pass: usize) -> Result<()> {
        self.on_host(|core| core.normalize_bias(pass))
    }

    fn maximization_step(&mut self, pass: usize) -> Result<()> {
        self.core.maximization_step(pass);
        Ok(())
    }

    fn mask_volume(&mut self) -> Result<()> {
        self.ensure_materialized()?;
        self.push()?;
        self.pool.apply_mask()?;
        self.residency = Residency::DeviceNewer;
        Ok(())
    }

    fn evaluate(&mut self, iteration: usize) -> Result<Evaluation> {
        self.ensure_host_current()?;
        Ok(self.core.evaluate(iteration))
    }

    fn restore_slice_intensities(&mut self) -> Result<()> {
        self.core.restore_slice_intensities();
        Ok(())
    }

    fn scale_volume(&mut self) -> Result<()> {
        self.on_host(ReconstructionCore::scale_volume)
    }

    fn psf_transform(&self, stack: usize, values: &Volume) -> Result<Volume> {
        Ok(self.core.psf_transform(stack, values))
    }

    fn reconstructed(&self) -> Result<&Volume> {
        self.ensure_host_current()?;
        Ok(self.core.reconstructed())
    }

    fn volume_weights(&self) -> Result<&Volume> {
        self.ensure_host_current()?;
        Ok(self.core.volume_weights())
    }

    fn slice_transformations(&self) -> Result<Vec<RigidTransform>> {
        self.ensure_host_current()?;
        Ok(self.core.slice_transformations())
    }
}
