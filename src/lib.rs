//! # SVR-volume library
//!
//! This crate reconstructs one isotropic high-resolution volume from several
//! stacks of thick 2D slices that were acquired while the subject moved,
//! as in fetal MRI. Every slice gets its own rigid pose, and the volume is
//! estimated with a robust super-resolution EM scheme that down-weights
//! slices and voxels which do not agree with the current estimate.
//!
//! The interesting part is the scheduler that sequences the expensive steps:
//!  - the input stacks are split into 3D stacks, slices, patches or
//!    superpixels
//!  - a template stack defines the reference frame
//!  - a region of interest mask is derived once and propagated into every
//!    stack
//!  - registration and reconstruction alternate over the outer iterations
//!    with annealed smoothing
//!
//! The numerical steps run either on the host (rayon) or partially on one
//! or more GPUs through WGPU compute shaders. Both backends implement the
//! same [`Engine`] trait, so the scheduler never branches on the backend.
//!
//! Stacks are read from NIfTI files (3D or 4D) or from a directory of DICOM
//! files of one series. DICOM files are assumed to have the following
//! attributes:
//!   - Axial data set
//!   - No multiframe (always the first frame is used)
//!   - Images from the same series (Series Instance UID)
//!
//! # Examples
//!
//! ## Reconstructing from three stacks
//!
//! ```no_run
//! # use svr_volume::{ReconstructionConfig, ReconstructionInputs, NiftiDirectory, WgpuProbe, VolumeLoader, reconstruct};
//! # use svr_volume::transform::StackTransform;
//! let stacks = ["axial.nii.gz", "coronal.nii.gz", "sagittal.nii.gz"]
//!     .iter()
//!     .map(VolumeLoader::load_nifti)
//!     .collect::<Result<Vec<_>, _>>()
//!     .expect("should have loaded the stacks");
//! let inputs = ReconstructionInputs {
//!     stacks,
//!     transforms: Some(vec![StackTransform::Identity; 3]),
//!     ..Default::default()
//! };
//! let config = ReconstructionConfig {
//!     output: Some("reconstruction.nii.gz".into()),
//!     ..Default::default()
//! };
//! let mut sink = NiftiDirectory::new(".", "reconstruction.nii.gz").expect("should have created the work directory");
//! let report = reconstruct(inputs, &config, &WgpuProbe::new(), &mut sink)
//!     .expect("should have reconstructed the volume");
//! println!("{} slices", report.slices);
//! ```

pub mod anneal;
pub mod backend;
pub mod config;
pub mod decompose;
pub mod engine;
pub mod enums;
pub mod error;
mod filter;
pub mod gpu_sampler;
mod interpolator;
pub mod logging;
pub mod mask;
pub mod normalize;
pub mod output;
pub mod partition;
pub mod perf;
pub mod registration;
pub mod sampling;
pub mod schedule;
pub mod scheduler;
pub mod setup;
pub mod slices;
pub mod template;
pub mod transform;
pub mod volume;
pub mod volume_loader;

pub use backend::{BackendDispatcher, DeviceInfo, DeviceProbe, WgpuProbe};
pub use config::ReconstructionConfig;
pub use engine::{Engine, Evaluation};
pub use error::{ReconstructionError, Result};
pub use output::{MemorySink, NiftiDirectory, OutputSink};
pub use scheduler::{IterationScheduler, RunReport, reconstruct};
pub use setup::{ManualMask, ReconstructionInputs};
pub use volume::Volume;
pub use volume_loader::{VolumeLoader, VolumeLoaderError};
