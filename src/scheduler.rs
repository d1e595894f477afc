//! The outer registration/reconstruction loop and the run entry point.

use std::fs;

use chrono::Local;
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::{BackendDispatcher, DeviceProbe};
use crate::config::ReconstructionConfig;
use crate::engine::{Engine, Evaluation};
use crate::enums::{Interpolation, Orientation, PartitionStrategy, Processor};
use crate::error::Result;
use crate::logging::{LogSinks, Phase};
use crate::output::OutputSink;
use crate::perf::PerfStats;
use crate::schedule::{RegistrationStep, ScheduleParams};
use crate::setup::{ManualMask, ReconstructionInputs, prepare};
use crate::volume::Volume;

/// Summary of a finished run.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub processor: Processor,
    pub template: usize,
    pub stacks: usize,
    pub slices: usize,
    /// One record per outer iteration.
    pub evaluations: Vec<Evaluation>,
}

/// Drives an [`Engine`] through the outer iterations.
///
/// Every engine call completes before the next one is issued. Host-visible
/// reads are always preceded by [`Engine::sync_host`].
pub struct IterationScheduler<'a> {
    engine: &'a mut dyn Engine,
    schedule: ScheduleParams,
    config: &'a ReconstructionConfig,
    sink: &'a mut dyn OutputSink,
    logs: &'a LogSinks,
    perf: PerfStats,
}

impl<'a> IterationScheduler<'a> {
    pub fn new(
        engine: &'a mut dyn Engine,
        schedule: ScheduleParams,
        config: &'a ReconstructionConfig,
        sink: &'a mut dyn OutputSink,
        logs: &'a LogSinks,
        perf: PerfStats,
    ) -> Self {
        Self {
            engine,
            schedule,
            config,
            sink,
            logs,
            perf,
        }
    }

    pub fn perf(&self) -> &PerfStats {
        &self.perf
    }

    fn step(&mut self, name: &str, f: impl FnOnce(&mut dyn Engine) -> Result<()>) -> Result<()> {
        let engine = &mut *self.engine;
        self.perf.time(name, || f(engine))
    }

    /// Runs every outer iteration and returns the evaluation records.
    pub fn run(&mut self) -> Result<Vec<Evaluation>> {
        let mut evaluations = Vec::with_capacity(self.schedule.iterations);
        for iteration in 0..self.schedule.iterations {
            info!(iteration, of = self.schedule.iterations, "Outer iteration");
            self.register(iteration)?;
            self.reconstruct(iteration)?;
            self.persist(iteration)?;
            evaluations.push(self.evaluate(iteration)?);
        }
        Ok(evaluations)
    }

    fn register(&mut self, iteration: usize) -> Result<()> {
        let _phase = self.logs.enter(Phase::Registration);
        let step = self.schedule.registration(iteration);
        info!(iteration, %step, "Registration");
        let packages = self.schedule.packages.clone();
        match step {
            RegistrationStep::Skip => Ok(()),
            RegistrationStep::SliceToVolume => {
                self.step("SliceToVolumeRegistration", |e| e.register_slices_to_volume())
            }
            RegistrationStep::Packages(split) => self.step("PackageToVolumeRegistration", |e| {
                e.register_packages_to_volume(&packages, split)
            }),
            RegistrationStep::PackagesThenSlices(split) => {
                self.step("PackageToVolumeRegistration", |e| {
                    e.register_packages_to_volume(&packages, split)
                })?;
                self.step("SliceToVolumeRegistration", |e| e.register_slices_to_volume())
            }
        }
    }

    fn reconstruct(&mut self, iteration: usize) -> Result<()> {
        let _phase = self.logs.enter(Phase::Reconstruction);
        let smoothing = self.schedule.smoothing(iteration);
        let speedup = self.schedule.speedup(iteration);
        debug!(iteration, ?smoothing, speedup, "Reconstruction parameters");
        self.engine.set_smoothing(smoothing);
        self.engine.set_speedup(speedup);

        if iteration == 0 {
            self.step("SyncDevice", |e| e.sync_device())?;
            self.step("InitializeEM", |e| e.initialize_em())?;
        } else {
            self.step("InitializeEMValues", |e| e.initialize_em_values())?;
        }
        self.step("CoeffInit", |e| e.compute_coefficients())?;
        self.step("GaussianReconstruction", |e| e.gaussian_reconstruct())?;
        if self.config.debug {
            self.write_current(&format!("init{iteration}"))?;
        }
        self.step("SimulateSlices", |e| e.simulate_slices())?;
        self.step("InitializeRobustStatistics", |e| e.initialize_robust_statistics())?;
        self.step("EStep", |e| e.expectation_step())?;

        let inner = self.schedule.inner_iterations(iteration);
        let matching = self.config.intensity_matching;
        let bias = self.config.estimates_bias();
        let normalise_bias = bias && !self.config.global_bias_correction;
        for pass in 0..inner {
            debug!(iteration, pass, of = inner, "Inner iteration");
            if matching {
                if bias {
                    self.step("Bias", |e| e.estimate_bias_field())?;
                }
                self.step("Scale", |e| e.estimate_scale())?;
            }
            self.step("Superresolution", |e| e.superresolve(pass + 1))?;
            if normalise_bias {
                self.step("NormaliseBias", |e| e.normalize_bias(pass))?;
            }
            self.step("SimulateSlices", |e| e.simulate_slices())?;
            self.step("MStep", |e| e.maximization_step(pass + 1))?;
            self.step("EStep", |e| e.expectation_step())?;
            if self.config.debug {
                self.write_current(&format!("super{iteration}_{pass}"))?;
            }
        }
        self.step("MaskVolume", |e| e.mask_volume())
    }

    fn write_current(&mut self, name: &str) -> Result<()> {
        self.engine.sync_host()?;
        self.sink.write_volume(name, self.engine.reconstructed()?)
    }

    fn persist(&mut self, iteration: usize) -> Result<()> {
        self.step("SyncHost", |e| e.sync_host())?;
        let name = format!("image{iteration}");
        self.sink.write_volume(&name, self.engine.reconstructed()?)?;
        if self.config.debug {
            self.write_previews(&name)?;
        }
        if self.config.partition != PartitionStrategy::Slices {
            self.sink
                .write_volume(&format!("volWeights{iteration}"), self.engine.volume_weights()?)?;
        }
        if self.config.save_slice_transformations {
            for (n, transform) in self.engine.slice_transformations()?.iter().enumerate() {
                self.sink
                    .write_transform(&format!("transformations/slice{n}"), transform)?;
            }
        }
        Ok(())
    }

    /// Central planes of the current volume in all three orientations.
    fn write_previews(&mut self, name: &str) -> Result<()> {
        let volume: &Volume = self.engine.reconstructed()?;
        let (d, h, w) = volume.dim();
        for (orientation, index) in [
            (Orientation::Axial, d / 2),
            (Orientation::Coronal, h / 2),
            (Orientation::Sagittal, w / 2),
        ] {
            if let Some(image) = volume.preview(index, orientation, Interpolation::Linear) {
                let label = format!("{orientation:?}").to_lowercase();
                self.sink.write_preview(&format!("{name}_{label}"), &image)?;
            }
        }
        Ok(())
    }

    fn evaluate(&mut self, iteration: usize) -> Result<Evaluation> {
        let _phase = self.logs.enter(Phase::Evaluation);
        self.engine.sync_host()?;
        let engine = &mut *self.engine;
        self.perf.time("Evaluation", || engine.evaluate(iteration))
    }

    /// Undoes the intensity normalisation, rescales the volume and writes
    /// the final volume together with the performance report.
    pub fn finalize(&mut self, manual_mask: Option<(usize, &ManualMask)>) -> Result<()> {
        let _phase = self.logs.enter(Phase::Reconstruction);
        if let Some((template, manual)) = manual_mask {
            self.engine.sync_host()?;
            let transformed = self.engine.psf_transform(template, &manual.volume)?;
            self.sink
                .write_volume(&format!("PSFTransformed_{}", manual.name), &transformed)?;
        }
        self.step("RestoreSliceIntensities", |e| e.restore_slice_intensities())?;
        self.step("ScaleVolume", |e| e.scale_volume())?;
        self.step("SyncHost", |e| e.sync_host())?;

        let report_name = format!(
            "performance_{}_{}.txt",
            self.engine.processor().label(),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        self.sink.write_text(&report_name, &self.perf.report())?;
        self.sink.write_output(self.engine.reconstructed()?)?;
        info!(total = self.perf.total().as_secs_f64(), "Reconstruction finished");
        Ok(())
    }
}

/// Runs a whole reconstruction.
///
/// Configuration and devices are validated before any input is touched, so
/// a fatal precondition leaves `sink` untouched.
pub fn reconstruct(
    inputs: ReconstructionInputs,
    config: &ReconstructionConfig,
    probe: &dyn DeviceProbe,
    sink: &mut dyn OutputSink,
) -> Result<RunReport> {
    config.validate()?;
    let dispatcher = BackendDispatcher::new(config.processor, &config.devices, probe)?;

    let logs = if config.no_log {
        LogSinks::disabled()
    } else {
        fs::create_dir_all(&config.work_dir)?;
        LogSinks::open(&config.work_dir, &config.log_prefix)?
    };
    sink.write_text("config.json", &serde_json::to_string_pretty(config)?)?;

    let mut perf = PerfStats::new();
    let prepared = prepare(inputs, config, &dispatcher, sink, &logs, &mut perf)?;
    let slices = prepared.setup.slices.len();
    info!(
        stacks = prepared.stacks,
        slices,
        template = prepared.template,
        processor = dispatcher.processor().label(),
        "Setup finished"
    );

    let schedule = ScheduleParams {
        packages: prepared.packages.clone(),
        ..config.schedule(prepared.reference_volume)
    };
    let mut engine = dispatcher.create_engine(prepared.setup, probe)?;
    let mut scheduler = IterationScheduler::new(engine.as_mut(), schedule, config, sink, &logs, perf);
    let evaluations = scheduler.run()?;
    scheduler.finalize(
        prepared
            .manual_mask
            .as_ref()
            .map(|manual| (prepared.template, manual)),
    )?;

    sink.write_text("evaluation.json", &serde_json::to_string_pretty(&evaluations)?)?;

    Ok(RunReport {
        processor: dispatcher.processor(),
        template: prepared.template,
        stacks: prepared.stacks,
        slices,
        evaluations,
    })
}
