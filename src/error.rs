//! Error types shared by the reconstruction pipeline.

use thiserror::Error;

use crate::volume_loader::VolumeLoaderError;

#[derive(Debug, Error)]
pub enum ReconstructionError {
    #[error("No input stacks were given")]
    NoInputStacks,

    #[error("No template stack could be identified, assign an `id` transformation to one stack")]
    NoTemplate,

    #[error("Requested {requested} accelerator devices but only {available} are present")]
    TooManyDevices { requested: usize, available: usize },

    #[error("Accelerator device {0} does not exist")]
    UnknownDevice(usize),

    #[error("No accelerator device meets the minimum capability")]
    NoCapableDevices,

    #[error("No output path for the reconstructed volume was given")]
    MissingOutput,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Device state must be materialized before EM initialisation")]
    StateNotMaterialized,

    #[error("Device state is newer than the host copy, synchronize before reading")]
    StateNotSynchronized,

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Configuration file error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Loader(#[from] VolumeLoaderError),
}

impl ReconstructionError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn gpu(msg: impl std::fmt::Display) -> Self {
        Self::Gpu(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReconstructionError>;
