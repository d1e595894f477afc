use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::future::join_all;
use ndarray::Axis;
use tracing::info;

use svr_volume::{
    BackendDispatcher, NiftiDirectory, ReconstructionConfig, ReconstructionInputs, VolumeLoader, WgpuProbe,
    decompose::RawStack,
    enums::{PartitionStrategy, Processor, SimilarityMetric, SortBy},
    reconstruct,
    setup::ManualMask,
    transform::{RigidTransform, StackTransform},
};

#[derive(Parser, Debug)]
#[command(name = "svr-volume")]
#[command(about = "Slice-to-volume reconstruction of motion-corrupted stacks")]
struct Cli {
    /// Reconstructed volume
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Input stacks: NIfTI files (3D or 4D) or DICOM series directories
    #[arg(short, long, num_args = 1.., required = true)]
    input: Vec<PathBuf>,

    /// One per input stack: `id` or a .dof file
    #[arg(short, long, num_args = 1..)]
    transformations: Vec<String>,

    /// Mask in template space
    #[arg(short, long)]
    mask: Option<PathBuf>,

    /// Mask drawn on the template stack, transformed through the PSF at the end
    #[arg(long)]
    manual_mask: Option<PathBuf>,

    /// JSON configuration; command line options override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for intermediate volumes, logs and reports
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Slice thickness per input stack
    #[arg(long, num_args = 1..)]
    thickness: Vec<f32>,

    /// Acquisition packages per input stack
    #[arg(short, long, num_args = 1..)]
    packages: Vec<usize>,

    #[arg(long)]
    iterations: Option<usize>,

    /// Resolution levels of the smoothing schedule
    #[arg(long)]
    levels: Option<usize>,

    #[arg(long)]
    rec_iterations: Option<usize>,

    #[arg(long)]
    rec_iterations_last: Option<usize>,

    #[arg(long)]
    sigma: Option<f32>,

    /// Isotropic resolution in mm
    #[arg(long)]
    resolution: Option<f32>,

    #[arg(long)]
    average: Option<f32>,

    #[arg(long)]
    delta: Option<f32>,

    #[arg(long)]
    lambda: Option<f32>,

    #[arg(long)]
    lastlambda: Option<f32>,

    #[arg(long)]
    smooth_mask: Option<f32>,

    #[arg(long)]
    low_intensity_cutoff: Option<f32>,

    #[arg(long)]
    no_intensity_matching: bool,

    /// Estimate a smooth bias field per slice
    #[arg(long)]
    bias_correction: bool,

    #[arg(long)]
    global_bias_correction: bool,

    /// Slices excluded from reconstruction
    #[arg(long, num_args = 1..)]
    force_exclude: Vec<usize>,

    /// Patch size and stride
    #[arg(long, num_args = 2, value_names = ["SIZE", "STRIDE"])]
    patches: Option<Vec<usize>>,

    /// Superpixels per plane
    #[arg(long)]
    superpixels: Option<usize>,

    /// Keep only this many stacks after splitting 4D inputs
    #[arg(long)]
    tuner: Option<usize>,

    /// Split stacks into this many packages registered to the reference
    #[arg(long)]
    t1_packages: Option<usize>,

    /// Volume defining the reconstruction grid and first registration target
    #[arg(long)]
    reference: Option<PathBuf>,

    /// Directory of registered slices `slice{n}.nii.gz`
    #[arg(long)]
    slices: Option<PathBuf>,

    /// Directory of slice transformations `slice{n}.dof`
    #[arg(long)]
    slice_transformations: Option<PathBuf>,

    /// Pick the template by motion estimation
    #[arg(long)]
    template_auto: bool,

    /// Run on GPU devices
    #[arg(long)]
    accelerator: bool,

    /// GPU device indices
    #[arg(long, num_args = 1..)]
    devices: Vec<usize>,

    /// Sample registration on the GPU as well
    #[arg(long)]
    device_registration: bool,

    #[arg(long)]
    nmi: bool,

    #[arg(long)]
    save_slice_transformations: bool,

    #[arg(long)]
    debug: bool,

    #[arg(long)]
    no_log: bool,

    #[arg(long)]
    log_prefix: Option<String>,
}

impl Cli {
    fn to_config(&self) -> Result<ReconstructionConfig> {
        let mut config = match &self.config {
            Some(path) => ReconstructionConfig::load(path)?,
            None => ReconstructionConfig::default(),
        };
        macro_rules! set {
            ($($field:ident <- $value:expr),* $(,)?) => {
                $(if let Some(v) = $value { config.$field = v; })*
            };
        }
        set!(
            output <- self.output.clone().map(Some),
            work_dir <- self.work_dir.clone(),
            iterations <- self.iterations,
            levels <- self.levels,
            rec_iterations_first <- self.rec_iterations,
            rec_iterations_last <- self.rec_iterations_last,
            sigma_bias <- self.sigma,
            resolution <- self.resolution,
            average <- self.average,
            delta <- self.delta,
            lambda <- self.lambda,
            last_lambda <- self.lastlambda,
            smooth_mask <- self.smooth_mask,
            low_intensity_cutoff <- self.low_intensity_cutoff,
            num_stacks_tuner <- self.tuner,
            t1_package_size <- self.t1_packages,
            log_prefix <- self.log_prefix.clone(),
        );
        if !self.thickness.is_empty() {
            config.thickness = self.thickness.clone();
        }
        if !self.packages.is_empty() {
            config.packages = self.packages.clone();
        }
        if !self.force_exclude.is_empty() {
            config.force_excluded = self.force_exclude.clone();
        }
        if !self.devices.is_empty() {
            config.devices = self.devices.clone();
        }
        if let Some(p) = &self.patches {
            config.partition = PartitionStrategy::Patches {
                size: p[0],
                stride: p[1],
            };
        }
        if let Some(count) = self.superpixels {
            config.partition = PartitionStrategy::Superpixels { count };
        }
        config.intensity_matching &= !self.no_intensity_matching;
        config.bias_correction |= self.bias_correction;
        config.global_bias_correction |= self.global_bias_correction;
        config.auto_template |= self.template_auto;
        if self.accelerator {
            config.processor = Processor::Accelerator;
        }
        config.host_registration &= !self.device_registration;
        if self.nmi {
            config.metric = SimilarityMetric::Nmi;
        }
        config.save_slice_transformations |= self.save_slice_transformations;
        config.debug |= self.debug;
        config.no_log |= self.no_log;
        Ok(config)
    }
}

fn load_stack(path: &Path) -> Result<RawStack> {
    let stack = if path.is_dir() {
        RawStack::from(VolumeLoader::load_from_directory(path, SortBy::ImagePositionPatient)?)
    } else {
        VolumeLoader::load_nifti(path)?
    };
    info!(path = %path.display(), frames = stack.frames(), "Loaded stack");
    Ok(stack)
}

fn load_transform(token: &str) -> Result<StackTransform> {
    if token == "id" {
        return Ok(StackTransform::Identity);
    }
    let transform = RigidTransform::read_dof(token).with_context(|| format!("reading {token}"))?;
    Ok(StackTransform::Loaded(transform))
}

/// `slice0`, `slice1`, ... with the given extension, up to the first gap.
fn numbered_files(dir: &Path, extension: &str) -> Vec<PathBuf> {
    (0..)
        .map(|n| dir.join(format!("slice{n}{extension}")))
        .take_while(|p| p.exists())
        .collect()
}

async fn load_inputs(cli: &Cli) -> Result<ReconstructionInputs> {
    let handles = cli.input.iter().cloned().map(|path| {
        tokio::task::spawn_blocking(move || load_stack(&path).with_context(|| format!("loading {}", path.display())))
    });
    let stacks = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined?)
        .collect::<Result<Vec<_>>>()?;

    let transforms = if cli.transformations.is_empty() {
        None
    } else {
        if cli.transformations.len() != stacks.len() {
            bail!(
                "{} transformations given for {} stacks",
                cli.transformations.len(),
                stacks.len()
            );
        }
        Some(
            cli.transformations
                .iter()
                .map(|t| load_transform(t))
                .collect::<Result<Vec<_>>>()?,
        )
    };

    let mask = match &cli.mask {
        Some(path) => {
            let volume = VolumeLoader::load_nifti_volume(path)?;
            Some(volume.with_data(volume.data.mapv(|v| u8::from(v > 0.0))))
        }
        None => None,
    };
    let manual_mask = match &cli.manual_mask {
        Some(path) => Some(ManualMask {
            name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("manual_mask.nii.gz")
                .to_string(),
            volume: VolumeLoader::load_nifti_volume(path)?,
        }),
        None => None,
    };
    let reference_volume = cli
        .reference
        .as_ref()
        .map(VolumeLoader::load_nifti_volume)
        .transpose()?;

    let slices = match &cli.slices {
        Some(dir) => Some(
            numbered_files(dir, ".nii.gz")
                .iter()
                .map(|p| Ok(VolumeLoader::load_nifti_volume(p)?.data.index_axis_move(Axis(0), 0)))
                .collect::<Result<Vec<_>>>()?,
        ),
        None => None,
    };
    let slice_transforms = match &cli.slice_transformations {
        Some(dir) => Some(
            numbered_files(dir, ".dof")
                .iter()
                .map(|p| Ok(RigidTransform::read_dof(p)?))
                .collect::<Result<Vec<_>>>()?,
        ),
        None => None,
    };

    Ok(ReconstructionInputs {
        stacks,
        transforms,
        mask,
        manual_mask,
        reference_volume,
        slices,
        slice_transforms,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.to_config()?;
    config.validate()?;
    BackendDispatcher::new(config.processor, &config.devices, &WgpuProbe::new())?;
    let inputs = load_inputs(&cli).await?;

    let report = tokio::task::spawn_blocking(move || -> Result<_> {
        let output = config.output.clone().unwrap_or_default();
        let mut sink = NiftiDirectory::new(&config.work_dir, output)?;
        Ok(reconstruct(inputs, &config, &WgpuProbe::new(), &mut sink)?)
    })
    .await??;

    info!(
        processor = report.processor.label(),
        stacks = report.stacks,
        slices = report.slices,
        "Done"
    );
    Ok(())
}
