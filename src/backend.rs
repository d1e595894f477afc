//! Backend selection: device discovery, validation and engine construction.

use std::fmt;

use futures::executor::block_on;
use tracing::{info, warn};

use crate::engine::{AcceleratorEngine, Engine, EngineSetup, HostEngine};
use crate::enums::Processor;
use crate::error::{ReconstructionError, Result};
use crate::gpu_sampler::{DeviceContext, DevicePool};
use crate::template::{MotionEstimator, RankMotionEstimator};

/// Minimum storage binding a device must support to hold a reconstruction.
pub const MIN_STORAGE_BINDING: u64 = 128 << 20;

/// An enumerated accelerator device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub backend: String,
    /// Whether the device can run compute shaders.
    pub compute: bool,
    pub max_storage_binding: u64,
}

impl DeviceInfo {
    pub fn is_capable(&self) -> bool {
        self.compute && self.max_storage_binding >= MIN_STORAGE_BINDING
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} ({})", self.index, self.name, self.backend)
    }
}

/// Source of accelerator devices.
pub trait DeviceProbe {
    /// All devices present, capable or not, in a stable order.
    fn devices(&self) -> Vec<DeviceInfo>;

    /// Opens the given devices for use by the accelerator engine.
    fn open(&self, devices: &[DeviceInfo]) -> Result<DevicePool>;
}

/// Probes the adapters wgpu can see.
#[derive(Default)]
pub struct WgpuProbe {
    instance: wgpu::Instance,
}

impl WgpuProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn adapters(&self) -> Vec<wgpu::Adapter> {
        self.instance.enumerate_adapters(wgpu::Backends::all())
    }
}

impl DeviceProbe for WgpuProbe {
    fn devices(&self) -> Vec<DeviceInfo> {
        self.adapters()
            .iter()
            .enumerate()
            .map(|(index, adapter)| {
                let info = adapter.get_info();
                let downlevel = adapter.get_downlevel_capabilities();
                DeviceInfo {
                    index,
                    name: info.name,
                    backend: format!("{:?}", info.backend),
                    compute: downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
                    max_storage_binding: u64::from(adapter.limits().max_storage_buffer_binding_size),
                }
            })
            .collect()
    }

    fn open(&self, devices: &[DeviceInfo]) -> Result<DevicePool> {
        let adapters = self.adapters();
        let contexts = devices
            .iter()
            .map(|device| {
                let adapter = adapters
                    .get(device.index)
                    .ok_or(ReconstructionError::UnknownDevice(device.index))?;
                block_on(DeviceContext::open(device.clone(), adapter))
            })
            .collect::<Result<Vec<_>>>()?;
        DevicePool::new(contexts)
    }
}

/// Resolves which devices the accelerator engine runs on.
///
/// Validation happens before any input is read so a bad device request
/// never produces partial output.
pub struct BackendDispatcher {
    processor: Processor,
    devices: Vec<DeviceInfo>,
}

impl BackendDispatcher {
    /// `requested` holds device indices; empty means every capable device.
    pub fn new(processor: Processor, requested: &[usize], probe: &dyn DeviceProbe) -> Result<Self> {
        if processor == Processor::Host {
            return Ok(Self {
                processor,
                devices: Vec::new(),
            });
        }

        let available = probe.devices();
        if requested.len() > available.len() {
            return Err(ReconstructionError::TooManyDevices {
                requested: requested.len(),
                available: available.len(),
            });
        }
        let requested: Vec<usize> = if requested.is_empty() {
            available.iter().map(|d| d.index).collect()
        } else {
            requested.to_vec()
        };

        let mut devices = Vec::with_capacity(requested.len());
        for index in requested {
            let Some(device) = available.iter().find(|d| d.index == index) else {
                return Err(ReconstructionError::UnknownDevice(index));
            };
            if device.is_capable() {
                info!(%device, "Using accelerator device");
                devices.push(device.clone());
            } else {
                warn!(%device, "Device lacks compute support or memory, skipping");
            }
        }
        if devices.is_empty() {
            return Err(ReconstructionError::NoCapableDevices);
        }
        Ok(Self { processor, devices })
    }

    pub fn processor(&self) -> Processor {
        self.processor
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Motion scoring for automatic template selection; only offered by
    /// the accelerator backend.
    pub fn motion_estimator(&self) -> Option<&'static dyn MotionEstimator> {
        match self.processor {
            Processor::Host => None,
            Processor::Accelerator => Some(&RankMotionEstimator),
        }
    }

    /// Builds the engine for the selected backend.
    pub fn create_engine(&self, setup: EngineSetup, probe: &dyn DeviceProbe) -> Result<Box<dyn Engine>> {
        Ok(match self.processor {
            Processor::Host => Box::new(HostEngine::new(setup)?),
            Processor::Accelerator => {
                let pool = probe.open(&self.devices)?;
                Box::new(AcceleratorEngine::new(setup, pool)?)
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Probe with fixed devices that cannot be opened.
    pub(crate) struct FakeProbe(pub Vec<DeviceInfo>);

    impl FakeProbe {
        pub(crate) fn capable(count: usize) -> Self {
            Self(
                (0..count)
                    .map(|index| DeviceInfo {
                        index,
                        name: format!("fake{index}"),
                        backend: "Fake".into(),
                        compute: true,
                        max_storage_binding: MIN_STORAGE_BINDING,
                    })
                    .collect(),
            )
        }
    }

    impl DeviceProbe for FakeProbe {
        fn devices(&self) -> Vec<DeviceInfo> {
            self.0.clone()
        }

        fn open(&self, _: &[DeviceInfo]) -> Result<DevicePool> {
            Err(ReconstructionError::gpu("fake devices cannot be opened"))
        }
    }

    #[test]
    fn host_ignores_devices() {
        let dispatcher = BackendDispatcher::new(Processor::Host, &[0, 1, 2], &FakeProbe(vec![])).unwrap();
        assert!(dispatcher.devices().is_empty());
    }

    #[test]
    fn too_many_devices_is_fatal() {
        let probe = FakeProbe::capable(2);
        let err = BackendDispatcher::new(Processor::Accelerator, &[0, 1, 2, 3, 4], &probe).err();
        assert!(matches!(
            err,
            Some(ReconstructionError::TooManyDevices {
                requested: 5,
                available: 2
            })
        ));
    }

    #[test]
    fn unknown_index_is_rejected() {
        let probe = FakeProbe::capable(2);
        let err = BackendDispatcher::new(Processor::Accelerator, &[3], &probe).err();
        assert!(matches!(err, Some(ReconstructionError::UnknownDevice(3))));
    }

    #[test]
    fn incapable_devices_are_filtered() {
        let mut probe = FakeProbe::capable(2);
        probe.0[0].compute = false;
        let dispatcher = BackendDispatcher::new(Processor::Accelerator, &[0, 1], &probe).unwrap();
        assert_eq!(dispatcher.devices().len(), 1);
        assert_eq!(dispatcher.devices()[0].index, 1);

        probe.0[1].max_storage_binding = 1 << 20;
        let err = BackendDispatcher::new(Processor::Accelerator, &[0, 1], &probe).err();
        assert!(matches!(err, Some(ReconstructionError::NoCapableDevices)));
    }

    #[test]
    fn motion_estimation_is_an_accelerator_capability() {
        let host = BackendDispatcher::new(Processor::Host, &[], &FakeProbe(vec![])).unwrap();
        assert!(host.motion_estimator().is_none());
        let accelerator = BackendDispatcher::new(Processor::Accelerator, &[1], &FakeProbe::capable(2)).unwrap();
        assert!(accelerator.motion_estimator().is_some());
    }

    #[test]
    fn empty_request_uses_every_capable_device() {
        let probe = FakeProbe::capable(3);
        let dispatcher = BackendDispatcher::new(Processor::Accelerator, &[], &probe).unwrap();
        let indices: Vec<usize> = dispatcher.devices().iter().map(|d| d.index).collect();
        assert_eq!(indices, [0, 1, 2]);

        let mut probe = FakeProbe::capable(3);
        probe.0[0].compute = false;
        let dispatcher = BackendDispatcher::new(Processor::Accelerator, &[], &probe).unwrap();
        let indices: Vec<usize> = dispatcher.devices().iter().map(|d| d.index).collect();
        assert_eq!(indices, [1, 2]);
    }
}
