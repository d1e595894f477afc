//! wgpu implementation of [`VolumeSampler`] spread over one or more devices.
//!
//! Every device holds its own copy of the reconstruction in a storage
//! buffer. Sample jobs are split into contiguous runs, one per device, and
//! the per-device results are concatenated back in job order.

use std::borrow::Cow;

use futures::executor::block_on;
use ndarray::Array3;
use rayon::prelude::*;
use tracing::debug;
use wgpu::{PollType, util::DeviceExt};

use crate::backend::DeviceInfo;
use crate::error::{ReconstructionError, Result};
use crate::sampling::{PsfSample, SampleJob, Sampled, VolumeSampler};
use crate::volume::{Mask, Volume};

const WORKGROUP_SIZE: u32 = 64;
const MAX_GROUPS: u32 = 65_535;

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    dim: [u32; 4],
    counts: [u32; 4],
}

struct Resident {
    volume: wgpu::Buffer,
    mask: Option<wgpu::Buffer>,
    dim: (usize, usize, usize),
}

impl Resident {
    fn params(&self, jobs: u32, psf: u32) -> Params {
        let (depth, height, width) = self.dim;
        Params {
            dim: [width as u32, height as u32, depth as u32, (depth * height * width) as u32],
            counts: [jobs, psf, 0, 0],
        }
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// One opened device with its pipelines and resident volume.
pub struct DeviceContext {
    info: DeviceInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    sample_pipeline: wgpu::ComputePipeline,
    sample_layout: wgpu::BindGroupLayout,
    mask_pipeline: wgpu::ComputePipeline,
    mask_layout: wgpu::BindGroupLayout,
    resident: Option<Resident>,
}

impl DeviceContext {
    pub async fn open(info: DeviceInfo, adapter: &wgpu::Adapter) -> Result<Self> {
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Reconstruction Device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await
            .map_err(ReconstructionError::gpu)?;

        let sample_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Slice Sampling Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/sample_slices.wgsl"))),
        });
        let mask_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Volume Mask Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/mask_volume.wgsl"))),
        });

        let sample_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Slice Sampling Bind Group Layout"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                uniform_entry(4),
            ],
        });
        let mask_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Volume Mask Bind Group Layout"),
            entries: &[storage_entry(0, false), storage_entry(1, true), uniform_entry(2)],
        });

        let pipeline = |label, layout: &wgpu::BindGroupLayout, module: &wgpu::ShaderModule, entry| {
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[layout],
                push_constant_ranges: &[],
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let sample_pipeline = pipeline("Slice Sampling Pipeline", &sample_layout, &sample_shader, "sample");
        let mask_pipeline = pipeline("Volume Mask Pipeline", &mask_layout, &mask_shader, "apply_mask");

        debug!(device = %info, "Opened accelerator device");
        Ok(Self {
            info,
            device,
            queue,
            sample_pipeline,
            sample_layout,
            mask_pipeline,
            mask_layout,
            resident: None,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn resident(&self) -> Result<&Resident> {
        self.resident
            .as_ref()
            .ok_or_else(|| ReconstructionError::gpu(format!("no volume resident on {}", self.info)))
    }

    fn check_binding(&self, bytes: u64, what: &str) -> Result<()> {
        if bytes > self.info.max_storage_binding {
            return Err(ReconstructionError::gpu(format!(
                "{what} needs {bytes} bytes, {} allows {}",
                self.info.name, self.info.max_storage_binding
            )));
        }
        Ok(())
    }

    fn upload_volume(&mut self, volume: &Volume) -> Result<()> {
        let data = volume.data.as_standard_layout();
        let values = data
            .as_slice()
            .ok_or_else(|| ReconstructionError::gpu("volume is not contiguous"))?;
        self.check_binding(std::mem::size_of_val(values) as u64, "volume")?;

        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Reconstruction Buffer"),
            contents: bytemuck::cast_slice(values),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        });
        let mask = match self.resident.take() {
            Some(previous) if previous.dim == volume.dim() => previous.mask,
            _ => None,
        };
        self.resident = Some(Resident {
            volume: buffer,
            mask,
            dim: volume.dim(),
        });
        Ok(())
    }

    fn upload_mask(&mut self, mask: &Mask) -> Result<()> {
        let values: Vec<u32> = mask.data.iter().map(|&m| u32::from(m)).collect();
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Mask Buffer"),
            contents: bytemuck::cast_slice(&values),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let Some(resident) = self.resident.as_mut() else {
            return Err(ReconstructionError::gpu("mask uploaded before the volume"));
        };
        if resident.dim != mask.dim() {
            return Err(ReconstructionError::ShapeMismatch {
                expected: vec![resident.dim.0, resident.dim.1, resident.dim.2],
                actual: mask.data.shape().to_vec(),
            });
        }
        resident.mask = Some(buffer);
        Ok(())
    }

    fn apply_mask(&self) -> Result<()> {
        let resident = self.resident()?;
        let Some(mask) = resident.mask.as_ref() else {
            return Err(ReconstructionError::gpu("no mask resident on device"));
        };
        let params = resident.params(0, 0);
        let uniform_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Mask Uniform Buffer"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Volume Mask Bind Group"),
            layout: &self.mask_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: resident.volume.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: mask.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let voxels = params.dim[3];
        let groups = voxels.div_ceil(WORKGROUP_SIZE);
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Volume Mask Encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Volume Mask Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.mask_pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups.min(MAX_GROUPS), groups.div_ceil(MAX_GROUPS), 1);
        }
        self.queue.submit(Some(encoder.finish()));
        self.wait()
    }

    fn download_volume(&self) -> Result<Array3<f32>> {
        let resident = self.resident()?;
        let (depth, height, width) = resident.dim;
        let size = (depth * height * width * std::mem::size_of::<f32>()) as u64;
        let encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Volume Download Encoder"),
        });
        let values: Vec<f32> = self.read_back(encoder, &resident.volume, size)?;
        Array3::from_shape_vec(resident.dim, values).map_err(ReconstructionError::gpu)
    }

    fn wait(&self) -> Result<()> {
        self.device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(ReconstructionError::gpu)?;
        Ok(())
    }

    /// Submits `encoder` followed by a copy of `source` into a staging buffer
    /// and returns its contents.
    fn read_back<T: bytemuck::Pod>(
        &self,
        mut encoder: wgpu::CommandEncoder,
        source: &wgpu::Buffer,
        size: u64,
    ) -> Result<Vec<T>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(source, 0, &staging_buffer, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait()?;
        block_on(receiver)
            .map_err(ReconstructionError::gpu)?
            .map_err(ReconstructionError::gpu)?;

        let data = buffer_slice.get_mapped_range();
        let values = bytemuck::cast_slice::<u8, T>(&data).to_vec();
        drop(data);
        staging_buffer.unmap();
        Ok(values)
    }

    fn sample(&self, jobs: &[SampleJob], psf: &[PsfSample]) -> Result<Vec<Vec<Sampled>>> {
        let mut results = Vec::with_capacity(jobs.len());
        let mut start = 0;
        while start < jobs.len() {
            let end = self.batch_end(jobs, start)?;
            results.extend(self.sample_batch(&jobs[start..end], psf)?);
            start = end;
        }
        Ok(results)
    }

    /// End of the largest batch starting at `start` that fits one dispatch
    /// and one output binding.
    fn batch_end(&self, jobs: &[SampleJob], start: usize) -> Result<usize> {
        let limit = self.info.max_storage_binding / std::mem::size_of::<Sampled>() as u64;
        let mut pixels = 0u64;
        let mut end = start;
        while end < jobs.len() && end - start < MAX_GROUPS as usize {
            let next = pixels + jobs[end].len() as u64;
            if next > limit {
                break;
            }
            pixels = next;
            end += 1;
        }
        if end == start {
            return Err(ReconstructionError::gpu(format!(
                "slice of {} pixels exceeds the output limit of {}",
                jobs[start].len(),
                self.info.name
            )));
        }
        Ok(end)
    }

    fn sample_batch(&self, jobs: &[SampleJob], psf: &[PsfSample]) -> Result<Vec<Vec<Sampled>>> {
        let resident = self.resident()?;
        let mut batch = jobs.to_vec();
        let mut offset = 0u32;
        let mut widest = 0u32;
        for job in &mut batch {
            job.offset = offset;
            offset += job.width * job.height;
            widest = widest.max(job.width * job.height);
        }
        let pixels = offset as usize;
        if pixels == 0 || psf.is_empty() {
            return Ok(jobs.iter().map(|job| vec![[0.0, 0.0]; job.len()]).collect());
        }

        let params = resident.params(batch.len() as u32, psf.len() as u32);
        let job_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sample Job Buffer"),
            contents: bytemuck::cast_slice(&batch),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let psf_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("PSF Buffer"),
            contents: bytemuck::cast_slice(psf),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let output_size = (pixels * std::mem::size_of::<Sampled>()) as u64;
        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sample Output Buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let uniform_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sample Uniform Buffer"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Slice Sampling Bind Group"),
            layout: &self.sample_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: resident.volume.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: job_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: psf_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Slice Sampling Encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Slice Sampling Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.sample_pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(widest.div_ceil(WORKGROUP_SIZE), batch.len() as u32, 1);
        }
        let flat: Vec<Sampled> = self.read_back(encoder, &output_buffer, output_size)?;

        Ok(batch
            .iter()
            .map(|job| {
                let start = job.offset as usize;
                flat[start..start + job.len()].to_vec()
            })
            .collect())
    }
}

/// The set of devices the accelerator backend runs on.
pub struct DevicePool {
    contexts: Vec<DeviceContext>,
}

impl DevicePool {
    pub fn new(contexts: Vec<DeviceContext>) -> Result<Self> {
        if contexts.is_empty() {
            return Err(ReconstructionError::NoCapableDevices);
        }
        Ok(Self { contexts })
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.contexts.iter().map(DeviceContext::info)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Replaces the resident reconstruction on every device.
    pub fn upload_volume(&mut self, volume: &Volume) -> Result<()> {
        self.contexts
            .par_iter_mut()
            .try_for_each(|context| context.upload_volume(volume))
    }

    pub fn upload_mask(&mut self, mask: &Mask) -> Result<()> {
        self.contexts
            .par_iter_mut()
            .try_for_each(|context| context.upload_mask(mask))
    }

    /// Zeroes voxels outside the mask on every device copy.
    pub fn apply_mask(&self) -> Result<()> {
        self.contexts.par_iter().try_for_each(DeviceContext::apply_mask)
    }

    /// Reads the reconstruction back from the first device; all copies are
    /// kept identical.
    pub fn download_volume(&self) -> Result<Array3<f32>> {
        self.contexts
            .first()
            .ok_or(ReconstructionError::NoCapableDevices)?
            .download_volume()
    }
}

impl VolumeSampler for DevicePool {
    fn sample(&self, jobs: &[SampleJob], psf: &[PsfSample]) -> Result<Vec<Vec<Sampled>>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let chunk = jobs.len().div_ceil(self.contexts.len());
        let parts: Vec<Vec<Vec<Sampled>>> = self
            .contexts
            .par_iter()
            .zip(jobs.par_chunks(chunk))
            .map(|(context, part)| context.sample(part, psf))
            .collect::<Result<_>>()?;
        Ok(parts.into_iter().flatten().collect())
    }
}
