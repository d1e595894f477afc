use std::cell::RefCell;
use std::rc::Rc;

use ndarray::Array3;

use svr_volume::anneal::Smoothing;
use svr_volume::enums::Processor;
use svr_volume::logging::LogSinks;
use svr_volume::perf::PerfStats;
use svr_volume::schedule::{PackageSplit, ScheduleParams};
use svr_volume::setup::ManualMask;
use svr_volume::transform::RigidTransform;
use svr_volume::{
    Engine, Evaluation, IterationScheduler, MemorySink, ReconstructionConfig, ReconstructionError, Result,
    Volume,
};

type Log = Rc<RefCell<Vec<String>>>;

/// Records every call and models device residency like the accelerator
/// engine does.
struct Recorder {
    log: Log,
    volume: Volume,
    materialized: bool,
    device_newer: bool,
}

impl Recorder {
    fn new(log: Log) -> Self {
        Self {
            log,
            volume: Volume::new(Array3::ones((2, 2, 2)), (1.0, 1.0, 1.0)),
            materialized: false,
            device_newer: false,
        }
    }

    fn push(&self, op: impl Into<String>) {
        self.log.borrow_mut().push(op.into());
    }

    fn host_read(&self) -> Result<()> {
        if self.device_newer {
            return Err(ReconstructionError::StateNotSynchronized);
        }
        Ok(())
    }
}

impl Engine for Recorder {
    fn processor(&self) -> Processor {
        Processor::Accelerator
    }

    fn sync_device(&mut self) -> Result<()> {
        self.materialized = true;
        self.push("sync_device");
        Ok(())
    }

    fn sync_host(&mut self) -> Result<()> {
        self.device_newer = false;
        self.push("sync_host");
        Ok(())
    }

    fn register_slices_to_volume(&mut self) -> Result<()> {
        self.push("register_slices");
        Ok(())
    }

    fn register_packages_to_volume(&mut self, _: &[usize], split: PackageSplit) -> Result<()> {
        self.push(format!("register_packages {} {}", split.odd_even, split.halvings));
        Ok(())
    }

    fn set_smoothing(&mut self, smoothing: Smoothing) {
        self.push(format!("smoothing {}", smoothing.lambda));
    }

    fn set_speedup(&mut self, speedup: bool) {
        self.push(format!("speedup {speedup}"));
    }

    fn initialize_em(&mut self) -> Result<()> {
        if !self.materialized {
            return Err(ReconstructionError::StateNotMaterialized);
        }
        self.push("initialize_em");
        Ok(())
    }

    fn initialize_em_values(&mut self) -> Result<()> {
        self.push("initialize_em_values");
        Ok(())
    }

    fn compute_coefficients(&mut self) -> Result<()> {
        self.push("compute_coefficients");
        Ok(())
    }

    fn gaussian_reconstruct(&mut self) -> Result<()> {
        self.push("gaussian_reconstruct");
        Ok(())
    }

    fn simulate_slices(&mut self) -> Result<()> {
        self.push("simulate_slices");
        Ok(())
    }

    fn initialize_robust_statistics(&mut self) -> Result<()> {
        self.push("initialize_robust_statistics");
        Ok(())
    }

    fn expectation_step(&mut self) -> Result<()> {
        self.push("estep");
        Ok(())
    }

    fn estimate_bias_field(&mut self) -> Result<()> {
        self.push("bias");
        Ok(())
    }

    fn estimate_scale(&mut self) -> Result<()> {
        self.push("scale");
        Ok(())
    }

    fn superresolve(&mut self, pass: usize) -> Result<()> {
        self.push(format!("superresolve {pass}"));
        Ok(())
    }

    fn normalize_bias(&mut self, pass: usize) -> Result<()> {
        self.push(format!("normalize_bias {pass}"));
        Ok(())
    }

    fn maximization_step(&mut self, pass: usize) -> Result<()> {
        self.push(format!("mstep {pass}"));
        Ok(())
    }

    fn mask_volume(&mut self) -> Result<()> {
        self.device_newer = true;
        self.push("mask_volume");
        Ok(())
    }

    fn evaluate(&mut self, iteration: usize) -> Result<Evaluation> {
        self.host_read()?;
        self.push(format!("evaluate {iteration}"));
        Ok(Evaluation {
            iteration,
            included: 1,
            ..Default::default()
        })
    }

    fn restore_slice_intensities(&mut self) -> Result<()> {
        self.push("restore");
        Ok(())
    }

    fn scale_volume(&mut self) -> Result<()> {
        self.push("scale_volume");
        Ok(())
    }

    fn psf_transform(&self, stack: usize, values: &Volume) -> Result<Volume> {
        self.host_read()?;
        self.push(format!("psf_transform {stack}"));
        Ok(values.clone())
    }

    fn reconstructed(&self) -> Result<&Volume> {
        self.host_read()?;
        Ok(&self.volume)
    }

    fn volume_weights(&self) -> Result<&Volume> {
        self.host_read()?;
        Ok(&self.volume)
    }

    fn slice_transformations(&self) -> Result<Vec<RigidTransform>> {
        self.host_read()?;
        Ok(vec![RigidTransform::IDENTITY; 3])
    }
}

fn schedule(iterations: usize, levels: usize, packages: Vec<usize>) -> ScheduleParams {
    ScheduleParams {
        iterations,
        levels,
        delta: 150.0,
        lambda: 0.02,
        last_lambda: 0.01,
        rec_iterations_first: 2,
        rec_iterations_last: 3,
        packages,
        reference_volume: false,
    }
}

fn run(schedule: ScheduleParams, config: &ReconstructionConfig) -> (Vec<String>, Vec<Evaluation>, MemorySink) {
    let log: Log = Rc::default();
    let mut engine = Recorder::new(log.clone());
    let mut sink = MemorySink::new();
    let logs = LogSinks::disabled();
    let evaluations = {
        let mut scheduler = IterationScheduler::new(&mut engine, schedule, config, &mut sink, &logs, PerfStats::new());
        let evaluations = scheduler.run().unwrap();
        scheduler.finalize(None).unwrap();
        evaluations
    };
    let ops = log.borrow().clone();
    (ops, evaluations, sink)
}

fn position(ops: &[String], op: &str) -> usize {
    ops.iter()
        .position(|o| o == op)
        .unwrap_or_else(|| panic!("{op} was never called"))
}

#[test]
fn first_iteration_materializes_before_em_and_skips_registration() {
    let config = ReconstructionConfig::default();
    let (ops, evaluations, _) = run(schedule(2, 1, vec![]), &config);

    assert!(position(&ops, "sync_device") < position(&ops, "initialize_em"));
    assert_eq!(ops.iter().filter(|o| *o == "sync_device").count(), 1);
    assert!(position(&ops, "initialize_em") < position(&ops, "register_slices"));
    assert_eq!(ops.iter().filter(|o| *o == "register_slices").count(), 1);
    assert!(position(&ops, "register_slices") < position(&ops, "initialize_em_values"));
    assert_eq!(evaluations.len(), 2);
}

#[test]
fn every_host_read_follows_a_sync() {
    let config = ReconstructionConfig::default();
    let (ops, _, sink) = run(schedule(3, 2, vec![]), &config);
    for (i, op) in ops.iter().enumerate() {
        if op.starts_with("evaluate") {
            let mask = ops[..i].iter().rposition(|o| o == "mask_volume").unwrap();
            assert!(ops[mask..i].iter().any(|o| o == "sync_host"), "{op} without sync");
        }
    }
    assert_eq!(sink.names().filter(|n| n.starts_with("image")).count(), 3);
    assert!(sink.output.is_some());
}

#[test]
fn inner_loop_runs_the_full_em_cycle() {
    let config = ReconstructionConfig {
        bias_correction: true,
        ..Default::default()
    };
    let (ops, _, _) = run(schedule(2, 1, vec![]), &config);
    let first = position(&ops, "superresolve 1");
    let cycle: Vec<&str> = ops[first - 2..first + 5].iter().map(String::as_str).collect();
    assert_eq!(
        cycle,
        [
            "bias",
            "scale",
            "superresolve 1",
            "normalize_bias 0",
            "simulate_slices",
            "mstep 1",
            "estep"
        ]
    );
    // Two inner passes, then three on the last iteration.
    assert_eq!(ops.iter().filter(|o| o.starts_with("superresolve")).count(), 5);
    assert_eq!(ops.iter().filter(|o| *o == "speedup true").count(), 1);
    assert_eq!(ops.iter().filter(|o| *o == "speedup false").count(), 1);
}

#[test]
fn bias_correction_is_opt_in() {
    let config = ReconstructionConfig::default();
    let (ops, _, _) = run(schedule(2, 1, vec![]), &config);
    assert!(ops.iter().any(|o| o == "scale"));
    assert!(!ops.iter().any(|o| o == "bias" || o.starts_with("normalize_bias")));
}

#[test]
fn intensity_matching_off_skips_bias_and_scale() {
    let config = ReconstructionConfig {
        intensity_matching: false,
        bias_correction: true,
        ..Default::default()
    };
    let (ops, _, _) = run(schedule(2, 1, vec![]), &config);
    assert!(!ops.iter().any(|o| o == "bias" || o == "scale" || o.starts_with("normalize_bias")));
}

#[test]
fn global_bias_correction_skips_normalisation() {
    let config = ReconstructionConfig {
        bias_correction: true,
        global_bias_correction: true,
        ..Default::default()
    };
    let (ops, _, _) = run(schedule(2, 1, vec![]), &config);
    assert!(ops.iter().any(|o| o == "bias"));
    assert!(!ops.iter().any(|o| o.starts_with("normalize_bias")));
}

#[test]
fn packages_drive_progressive_registration() {
    let config = ReconstructionConfig::default();
    let (ops, _, _) = run(schedule(9, 3, vec![2, 2]), &config);
    let registrations: Vec<&str> = ops
        .iter()
        .filter(|o| o.starts_with("register"))
        .map(String::as_str)
        .collect();
    assert_eq!(
        registrations,
        [
            "register_packages false 0",
            "register_packages true 0",
            "register_packages true 1",
            "register_packages true 2",
            "register_slices",
            "register_packages true 3",
            "register_slices",
            "register_packages true 4",
            "register_slices",
            "register_slices",
            "register_slices",
        ]
    );
}

#[test]
fn smoothing_follows_the_annealing_schedule() {
    let config = ReconstructionConfig::default();
    let (ops, _, _) = run(schedule(4, 2, vec![]), &config);
    let lambdas: Vec<&str> = ops
        .iter()
        .filter_map(|o| o.strip_prefix("smoothing "))
        .collect();
    // Level 1 lands at 0 with 0.04, level 0 at 2 with 0.02, last iteration 0.01.
    assert_eq!(lambdas, ["0.04", "0.04", "0.02", "0.01"]);
}

#[test]
fn finalize_restores_then_scales_and_reports() {
    let config = ReconstructionConfig::default();
    let log: Log = Rc::default();
    let mut engine = Recorder::new(log.clone());
    let mut sink = MemorySink::new();
    let logs = LogSinks::disabled();
    let manual = ManualMask {
        name: "brain.nii.gz".into(),
        volume: Volume::new(Array3::zeros((2, 2, 2)), (1.0, 1.0, 1.0)),
    };
    {
        let mut scheduler =
            IterationScheduler::new(&mut engine, schedule(1, 1, vec![]), &config, &mut sink, &logs, PerfStats::new());
        scheduler.run().unwrap();
        scheduler.finalize(Some((2, &manual))).unwrap();
    }
    let ops = log.borrow().clone();
    let tail: Vec<&str> = ops[ops.len() - 5..].iter().map(String::as_str).collect();
    assert_eq!(tail, ["sync_host", "psf_transform 2", "restore", "scale_volume", "sync_host"]);
    assert!(sink.names().any(|n| n == "PSFTransformed_brain.nii.gz"));
    let report = sink
        .names()
        .find(|n| n.starts_with("performance_accelerator_"))
        .expect("performance report");
    assert!(sink.text(report).unwrap().contains("Total:"));
}
