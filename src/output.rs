//! Where a run persists its volumes, transforms and reports.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use nifti::writer::WriterOptions;
use nifti::NiftiHeader;
use tracing::debug;

use crate::error::Result;
use crate::transform::RigidTransform;
use crate::volume::{GrayImage, Mask, Volume};

/// Destination of everything a reconstruction run writes.
///
/// Names are relative and carry no extension; each implementation picks
/// its own layout.
pub trait OutputSink {
    fn write_volume(&mut self, name: &str, volume: &Volume) -> Result<()>;
    fn write_mask(&mut self, name: &str, mask: &Mask) -> Result<()>;
    fn write_transform(&mut self, name: &str, transform: &RigidTransform) -> Result<()>;
    /// `name` includes its extension.
    fn write_text(&mut self, name: &str, text: &str) -> Result<()>;
    fn write_preview(&mut self, name: &str, image: &GrayImage) -> Result<()>;
    /// The final reconstruction.
    fn write_output(&mut self, volume: &Volume) -> Result<()>;
}

/// Writes `.nii.gz` volumes, `.dof` transforms and `.png` previews into a
/// work directory; the final volume goes to its own path.
pub struct NiftiDirectory {
    dir: PathBuf,
    output: PathBuf,
}

impl NiftiDirectory {
    pub fn new(dir: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            output: output.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str, extension: &str) -> Result<PathBuf> {
        let path = self.dir.join(format!("{name}{extension}"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }
}

impl OutputSink for NiftiDirectory {
    fn write_volume(&mut self, name: &str, volume: &Volume) -> Result<()> {
        write_nifti(self.path(name, ".nii.gz")?, volume)
    }

    fn write_mask(&mut self, name: &str, mask: &Mask) -> Result<()> {
        write_mask_nifti(self.path(name, ".nii.gz")?, mask)
    }

    fn write_transform(&mut self, name: &str, transform: &RigidTransform) -> Result<()> {
        transform.write_dof(self.path(name, ".dof")?)
    }

    fn write_text(&mut self, name: &str, text: &str) -> Result<()> {
        fs::write(self.path(name, "")?, text)?;
        Ok(())
    }

    fn write_preview(&mut self, name: &str, image: &GrayImage) -> Result<()> {
        image.save(self.path(name, ".png")?)?;
        Ok(())
    }

    fn write_output(&mut self, volume: &Volume) -> Result<()> {
        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        write_nifti(&self.output, volume)
    }
}

/// Writes a volume as NIfTI-1 with an axis-aligned sform.
pub fn write_nifti(path: impl AsRef<Path>, volume: &Volume) -> Result<()> {
    let path = path.as_ref();
    // NIfTI expects x fastest; reversing the axes of a (z, y, x) array
    // gives the (x, y, z) view the writer serialises.
    WriterOptions::new(path)
        .reference_header(&header_for(volume))
        .write_nifti(&volume.data.t())?;
    debug!(path = %path.display(), dim = ?volume.dim(), "Wrote volume");
    Ok(())
}

pub fn write_mask_nifti(path: impl AsRef<Path>, mask: &Mask) -> Result<()> {
    let path = path.as_ref();
    WriterOptions::new(path)
        .reference_header(&header_for(mask))
        .write_nifti(&mask.data.t())?;
    debug!(path = %path.display(), dim = ?mask.dim(), "Wrote mask");
    Ok(())
}

fn header_for<T>(volume: &Volume<T>) -> NiftiHeader {
    let (sx, sy, sz) = volume.spacing;
    let (ox, oy, oz) = volume.origin;
    let mut header = NiftiHeader::default();
    header.pixdim[1] = sx;
    header.pixdim[2] = sy;
    header.pixdim[3] = sz;
    header.xyzt_units = 2;
    header.sform_code = 1;
    header.srow_x = [sx, 0.0, 0.0, ox];
    header.srow_y = [0.0, sy, 0.0, oy];
    header.srow_z = [0.0, 0.0, sz, oz];
    header
}

/// One recorded write of a [`MemorySink`].
#[derive(Clone, Debug)]
pub enum Record {
    Volume(Volume),
    Mask(Mask),
    Transform(RigidTransform),
    Text(String),
    Preview { width: u32, height: u32 },
}

/// Keeps every write in memory, in write order.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub writes: Vec<(String, Record)>,
    pub output: Option<Volume>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.writes.iter().map(|(name, _)| name.as_str())
    }

    /// Latest write per name.
    pub fn latest(&self) -> BTreeMap<&str, &Record> {
        self.writes.iter().map(|(n, r)| (n.as_str(), r)).collect()
    }

    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.writes.iter().rev().find_map(|(n, r)| match r {
            Record::Volume(v) if n == name => Some(v),
            _ => None,
        })
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.writes.iter().rev().find_map(|(n, r)| match r {
            Record::Text(t) if n == name => Some(t.as_str()),
            _ => None,
        })
    }
}

impl OutputSink for MemorySink {
    fn write_volume(&mut self, name: &str, volume: &Volume) -> Result<()> {
        self.writes.push((name.to_string(), Record::Volume(volume.clone())));
        Ok(())
    }

    fn write_mask(&mut self, name: &str, mask: &Mask) -> Result<()> {
        self.writes.push((name.to_string(), Record::Mask(mask.clone())));
        Ok(())
    }

    fn write_transform(&mut self, name: &str, transform: &RigidTransform) -> Result<()> {
        self.writes.push((name.to_string(), Record::Transform(*transform)));
        Ok(())
    }

    fn write_text(&mut self, name: &str, text: &str) -> Result<()> {
        self.writes.push((name.to_string(), Record::Text(text.to_string())));
        Ok(())
    }

    fn write_preview(&mut self, name: &str, image: &GrayImage) -> Result<()> {
        let (width, height) = image.dimensions();
        self.writes.push((name.to_string(), Record::Preview { width, height }));
        Ok(())
    }

    fn write_output(&mut self, volume: &Volume) -> Result<()> {
        self.output = Some(volume.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume_loader::VolumeLoader;
    use ndarray::Array3;

    #[test]
    fn nifti_round_trip_keeps_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (100 * z + 10 * y + x) as f32);
        let volume = Volume::new(data, (0.5, 0.75, 2.0)).with_origin((1.0, -2.0, 3.0));
        let mut sink = NiftiDirectory::new(dir.path(), dir.path().join("out.nii.gz")).unwrap();
        sink.write_volume("image0", &volume).unwrap();

        let back = VolumeLoader::load_nifti_volume(dir.path().join("image0.nii.gz")).unwrap();
        assert_eq!(back.dim(), (3, 4, 5));
        assert_eq!(back.data[[2, 1, 4]], 214.0);
        assert_eq!(back.spacing, (0.5, 0.75, 2.0));
        assert_eq!(back.origin, (1.0, -2.0, 3.0));
    }

    #[test]
    fn transforms_land_in_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = NiftiDirectory::new(dir.path(), dir.path().join("out.nii.gz")).unwrap();
        let t = RigidTransform::new([1.0, 2.0, 3.0], [0.0, 0.0, 10.0]);
        sink.write_transform("transformations/slice7", &t).unwrap();
        let back = RigidTransform::read_dof(dir.path().join("transformations/slice7.dof")).unwrap();
        assert_eq!(back.params(), t.params());
    }

    #[test]
    fn memory_sink_keeps_write_order() {
        let mut sink = MemorySink::new();
        let volume = Volume::new(Array3::<f32>::ones((1, 1, 1)), (1.0, 1.0, 1.0));
        sink.write_volume("image0", &volume).unwrap();
        sink.write_text("report.txt", "done").unwrap();
        sink.write_volume("image0", &Volume::zeros_like(&volume)).unwrap();
        assert_eq!(sink.names().collect::<Vec<_>>(), ["image0", "report.txt", "image0"]);
        assert_eq!(sink.volume("image0").unwrap().data[[0, 0, 0]], 0.0);
        assert_eq!(sink.text("report.txt"), Some("done"));
        assert_eq!(sink.latest().len(), 2);
    }
}
