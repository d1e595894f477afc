use ndarray::{Array3, Axis};

use svr_volume::decompose::RawStack;
use svr_volume::enums::Processor;
use svr_volume::gpu_sampler::DevicePool;
use svr_volume::transform::StackTransform;
use svr_volume::{
    DeviceInfo, DeviceProbe, MemorySink, ReconstructionConfig, ReconstructionError, ReconstructionInputs,
    reconstruct,
};

/// Smooth ellipsoid in world millimetres, zero outside.
fn phantom(x: f32, y: f32, z: f32) -> f32 {
    let r2 = ((x - 16.0) / 11.0).powi(2) + ((y - 16.0) / 9.0).powi(2) + ((z - 12.0) / 8.0).powi(2);
    if r2 < 1.0 { 400.0 + 300.0 * (1.0 - r2) } else { 0.0 }
}

fn stack(z_offset: f32) -> RawStack {
    let spacing = (2.0, 2.0, 4.0);
    let origin = (0.0, 0.0, z_offset);
    let data = Array3::from_shape_fn((6, 16, 16), |(z, y, x)| {
        phantom(
            origin.0 + x as f32 * spacing.0,
            origin.1 + y as f32 * spacing.1,
            origin.2 + z as f32 * spacing.2,
        )
    });
    RawStack {
        frames: data.insert_axis(Axis(0)),
        spacing,
        origin,
    }
}

fn inputs() -> ReconstructionInputs {
    ReconstructionInputs {
        stacks: vec![stack(0.0), stack(1.3), stack(2.6)],
        transforms: Some(vec![
            StackTransform::Identity,
            StackTransform::Identity,
            StackTransform::Identity,
        ]),
        ..Default::default()
    }
}

fn config() -> ReconstructionConfig {
    ReconstructionConfig {
        output: Some("reconstruction.nii.gz".into()),
        iterations: 4,
        rec_iterations_first: 4,
        rec_iterations_last: 13,
        resolution: 2.0,
        smooth_mask: 0.0,
        no_log: true,
        ..Default::default()
    }
}

struct TwoDevices;

impl DeviceProbe for TwoDevices {
    fn devices(&self) -> Vec<DeviceInfo> {
        (0..2)
            .map(|index| DeviceInfo {
                index,
                name: format!("device{index}"),
                backend: "Test".into(),
                compute: true,
                max_storage_binding: 1 << 30,
            })
            .collect()
    }

    fn open(&self, _: &[DeviceInfo]) -> svr_volume::Result<DevicePool> {
        Err(ReconstructionError::Gpu("test devices cannot be opened".into()))
    }
}

#[test]
fn three_stacks_four_iterations() {
    let mut sink = MemorySink::new();
    let report = reconstruct(inputs(), &config(), &TwoDevices, &mut sink).unwrap();

    let images: Vec<&str> = sink
        .names()
        .filter(|n| n.strip_prefix("image").is_some_and(|i| i.parse::<usize>().is_ok()))
        .collect();
    assert_eq!(images, ["image0", "image1", "image2", "image3"]);
    assert!(sink.output.is_some());

    assert_eq!(report.processor, Processor::Host);
    assert_eq!(report.template, 0);
    assert_eq!(report.stacks, 3);
    assert_eq!(report.evaluations.len(), 4);
    assert_eq!(
        report.evaluations.iter().map(|e| e.iteration).collect::<Vec<_>>(),
        [0, 1, 2, 3]
    );
    assert!(report.evaluations.iter().all(|e| e.total() == report.slices));

    let json = sink.text("evaluation.json").unwrap();
    let records: Vec<serde_json::Value> = serde_json::from_str(json).unwrap();
    assert_eq!(records.len(), 4);
    assert!(sink.names().any(|n| n.starts_with("performance_host_")));
    assert!(sink.names().any(|n| n == "generatedMask"));
    assert!(sink.names().any(|n| n == "config.json"));

    let output = sink.output.as_ref().unwrap();
    assert!(output.data.iter().all(|v| v.is_finite()));
    assert!(output.max_value() > 0.0);
}

#[test]
fn too_many_devices_abort_before_any_output() {
    let config = ReconstructionConfig {
        processor: Processor::Accelerator,
        devices: vec![0, 1, 2, 3, 4],
        ..config()
    };
    let mut sink = MemorySink::new();
    let err = reconstruct(inputs(), &config, &TwoDevices, &mut sink).unwrap_err();
    assert!(matches!(
        err,
        ReconstructionError::TooManyDevices {
            requested: 5,
            available: 2
        }
    ));
    assert!(sink.writes.is_empty());
    assert!(sink.output.is_none());
}

#[test]
fn missing_output_is_fatal() {
    let config = ReconstructionConfig {
        output: None,
        ..config()
    };
    let mut sink = MemorySink::new();
    let err = reconstruct(inputs(), &config, &TwoDevices, &mut sink).unwrap_err();
    assert!(matches!(err, ReconstructionError::MissingOutput));
    assert!(sink.writes.is_empty());
}

#[test]
fn empty_input_is_fatal() {
    let mut sink = MemorySink::new();
    let err = reconstruct(ReconstructionInputs::default(), &config(), &TwoDevices, &mut sink).unwrap_err();
    assert!(matches!(err, ReconstructionError::NoInputStacks));
}

#[test]
fn patch_runs_write_volume_weights() {
    let config = ReconstructionConfig {
        iterations: 2,
        rec_iterations_first: 1,
        rec_iterations_last: 2,
        partition: svr_volume::enums::PartitionStrategy::Patches { size: 8, stride: 8 },
        save_slice_transformations: true,
        ..config()
    };
    let mut sink = MemorySink::new();
    let report = reconstruct(inputs(), &config, &TwoDevices, &mut sink).unwrap();
    assert!(sink.names().any(|n| n == "volWeights0"));
    assert!(sink.names().any(|n| n == "volWeights1"));
    let dofs = sink.names().filter(|n| n.starts_with("transformations/slice")).count();
    assert_eq!(dofs, 2 * report.slices);
}
