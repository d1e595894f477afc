//! Run configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::EngineSettings;
use crate::enums::{PartitionStrategy, Processor, SimilarityMetric};
use crate::error::{ReconstructionError, Result};
use crate::registration::RegistrationSettings;
use crate::schedule::ScheduleParams;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Final reconstructed volume.
    pub output: Option<PathBuf>,
    /// Directory receiving intermediate volumes, logs and reports.
    pub work_dir: PathBuf,
    /// Slice thickness per input; missing entries default to twice the
    /// stack's z spacing.
    pub thickness: Vec<f32>,
    /// Acquisition packages per input.
    pub packages: Vec<usize>,
    pub iterations: usize,
    pub levels: usize,
    pub rec_iterations_first: usize,
    pub rec_iterations_last: usize,
    pub sigma_bias: f32,
    /// Isotropic reconstruction resolution in mm; non-positive picks the
    /// finest in-plane spacing of the template.
    pub resolution: f32,
    /// Target average intensity of the normalised stacks.
    pub average: f32,
    pub delta: f32,
    pub lambda: f32,
    pub last_lambda: f32,
    /// Mask smoothing in mm; zero disables.
    pub smooth_mask: f32,
    pub low_intensity_cutoff: f32,
    pub intensity_matching: bool,
    pub bias_correction: bool,
    pub global_bias_correction: bool,
    pub force_excluded: Vec<usize>,
    pub partition: PartitionStrategy,
    /// Keep only this many stacks after 4D splitting; zero keeps all.
    pub num_stacks_tuner: usize,
    /// Split every stack into this many interleaved packages registered
    /// against the reference volume; zero disables.
    pub t1_package_size: usize,
    pub auto_template: bool,
    pub processor: Processor,
    /// Accelerator device indices; empty selects every capable device.
    pub devices: Vec<usize>,
    pub host_registration: bool,
    pub metric: SimilarityMetric,
    pub save_slice_transformations: bool,
    pub debug: bool,
    pub no_log: bool,
    pub log_prefix: String,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            output: None,
            work_dir: PathBuf::from("."),
            thickness: Vec::new(),
            packages: Vec::new(),
            iterations: 4,
            levels: 3,
            rec_iterations_first: 4,
            rec_iterations_last: 13,
            sigma_bias: 12.0,
            resolution: 0.75,
            average: 700.0,
            delta: 150.0,
            lambda: 0.02,
            last_lambda: 0.01,
            smooth_mask: 4.0,
            low_intensity_cutoff: 0.01,
            intensity_matching: true,
            bias_correction: false,
            global_bias_correction: false,
            force_excluded: Vec::new(),
            partition: PartitionStrategy::Slices,
            num_stacks_tuner: 0,
            t1_package_size: 0,
            auto_template: false,
            processor: Processor::Host,
            devices: Vec::new(),
            host_registration: true,
            metric: SimilarityMetric::Ncc,
            save_slice_transformations: false,
            debug: false,
            no_log: false,
            log_prefix: String::new(),
        }
    }
}

impl ReconstructionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&json)?;
        info!(path = %path.as_ref().display(), "Configuration loaded");
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.output.is_none() {
            return Err(ReconstructionError::MissingOutput);
        }
        if self.iterations == 0 {
            return Err(ReconstructionError::invalid("at least one outer iteration is required"));
        }
        if self.levels == 0 {
            return Err(ReconstructionError::invalid("at least one resolution level is required"));
        }
        if self.rec_iterations_first == 0 || self.rec_iterations_last == 0 {
            return Err(ReconstructionError::invalid("inner iteration counts must be positive"));
        }
        if let PartitionStrategy::Patches { size, stride } = self.partition {
            if size == 0 || stride == 0 {
                return Err(ReconstructionError::invalid("patch size and stride must be positive"));
            }
        }
        if let PartitionStrategy::Superpixels { count } = self.partition {
            if count == 0 {
                return Err(ReconstructionError::invalid("superpixel count must be positive"));
            }
        }
        Ok(())
    }

    /// Bias field smoothing actually used; non-positive values fall back
    /// to 20 mm.
    pub fn effective_sigma_bias(&self) -> f32 {
        if self.sigma_bias > 0.0 { self.sigma_bias } else { 20.0 }
    }

    pub fn schedule(&self, reference_volume: bool) -> ScheduleParams {
        ScheduleParams {
            iterations: self.iterations,
            levels: self.levels,
            delta: self.delta,
            lambda: self.lambda,
            last_lambda: self.last_lambda,
            rec_iterations_first: self.rec_iterations_first,
            rec_iterations_last: self.rec_iterations_last,
            packages: self.packages.clone(),
            reference_volume,
        }
    }

    pub fn registration(&self) -> RegistrationSettings {
        RegistrationSettings {
            metric: self.metric,
            ..RegistrationSettings::default()
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            sigma_bias: self.effective_sigma_bias(),
            low_intensity_cutoff: self.low_intensity_cutoff,
            global_bias_correction: self.global_bias_correction,
            force_excluded: self.force_excluded.clone(),
            registration: self.registration(),
            host_registration: self.host_registration,
        }
    }

    /// Bias estimation runs this iteration.
    pub fn estimates_bias(&self) -> bool {
        self.intensity_matching && self.bias_correction && self.sigma_bias > 0.0
    }
}
