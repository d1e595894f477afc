use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

#[derive(Default, Clone, Copy, Debug)]
pub enum Interpolation {
    Linear,
    #[default]
    None,
}

/// Execution target for the numerical operations.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Processor {
    #[default]
    Host,
    Accelerator,
}

impl Processor {
    pub fn label(&self) -> &'static str {
        match self {
            Processor::Host => "host",
            Processor::Accelerator => "accelerator",
        }
    }
}

/// How stacks are cut into the units that get registered and reconstructed.
#[derive(Default, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum PartitionStrategy {
    #[default]
    Slices,
    Patches {
        size: usize,
        stride: usize,
    },
    Superpixels {
        count: usize,
    },
}

impl PartitionStrategy {
    /// Patch and superpixel runs derive their mask from the stack overlap.
    pub fn uses_overlap_mask(&self) -> bool {
        !matches!(self, PartitionStrategy::Slices)
    }
}

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    #[default]
    Ncc,
    Nmi,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}
