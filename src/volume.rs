//! NIfTI volume IO and the binary ROI/mask volumes consumed by the extraction core.
//!
//! Everything is read through `nifti` into `ndarray` arrays indexed as
//! `[i, j, k]` (x fastest on disk), with the voxel-to-world affine taken from
//! the header's sform/qform.

use ndarray::{Array3, Ix3, Zip};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::common::VoxelGrid;
use crate::error::{Error, Result};

/// Voxel values this close to 0 or 1 are accepted as binary.
const BINARY_TOLERANCE: f64 = 1e-6;

/// A scalar 3D volume, e.g. a GMWMI probability map or an FA image.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f64>,
    pub grid: VoxelGrid,
    pub header: NiftiHeader,
}

impl Volume {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingInput {
                what: "Volume",
                path: path.to_path_buf(),
            });
        }
        let obj = ReaderOptions::new().read_file(path)?;
        let header = obj.header().clone();
        let mut img = obj.into_volume().into_ndarray::<f64>()?;
        // drop trailing singleton dimensions (e.g. 4D files with one frame)
        while img.ndim() > 3 && img.shape()[img.ndim() - 1] == 1 {
            let last = img.ndim() - 1;
            img = img.index_axis_move(ndarray::Axis(last), 0);
        }
        let ndim = img.ndim();
        let data = img
            .into_dimensionality::<Ix3>()
            .map_err(|_| Error::NotThreeDimensional {
                path: path.to_path_buf(),
                ndim,
            })?;
        let shape = data.shape();
        let grid = VoxelGrid::new([shape[0], shape[1], shape[2]], header.affine::<f64>())?;
        debug!(path = %path.display(), grid = %grid, "loaded volume");
        Ok(Self { data, grid, header })
    }

    /// Builds a volume on a grid with a fresh header.
    pub fn from_array(data: Array3<f64>, grid: VoxelGrid) -> Self {
        let header = header_for_grid(&grid);
        Self { data, grid, header }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        WriterOptions::new(path)
            .reference_header(&unscaled(&self.header))
            .write_nifti(&self.data)?;
        debug!(path = %path.display(), "wrote volume");
        Ok(())
    }
}

/// A binary (0/1) volume: an ROI, the GMWMI, or an editing mask.
#[derive(Debug, Clone)]
pub struct RoiVolume {
    pub data: Array3<u8>,
    pub grid: VoxelGrid,
    pub header: NiftiHeader,
    /// Where the volume was read from, for error messages.
    pub source: Option<PathBuf>,
}

/// Mask volumes for streamline editing have the same shape as ROIs.
pub type MaskVolume = RoiVolume;

impl RoiVolume {
    /// Loads a volume that must already be binary.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let volume = Volume::load(path)?;
        let mut roi = Self::from_binary(volume, path)?;
        roi.source = Some(path.to_path_buf());
        Ok(roi)
    }

    /// Loads a volume and binarizes it with `value > threshold`.
    pub fn load_thresholded<P: AsRef<Path>>(path: P, threshold: f64) -> Result<Self> {
        let path = path.as_ref();
        let mut roi = Self::threshold(&Volume::load(path)?, threshold);
        roi.source = Some(path.to_path_buf());
        Ok(roi)
    }

    /// Converts a volume whose values are all 0 or 1.
    pub fn from_binary(volume: Volume, path: &Path) -> Result<Self> {
        if let Some(bad) = volume
            .data
            .iter()
            .find(|v| v.abs() > BINARY_TOLERANCE && (*v - 1.0).abs() > BINARY_TOLERANCE)
        {
            return Err(Error::NotBinary {
                path: path.to_path_buf(),
                value: *bad,
            });
        }
        Ok(Self {
            data: volume.data.mapv(|v| u8::from(v > 0.5)),
            grid: volume.grid,
            header: volume.header,
            source: None,
        })
    }

    pub fn threshold(volume: &Volume, threshold: f64) -> Self {
        Self {
            data: volume.data.mapv(|v| u8::from(v > threshold)),
            grid: volume.grid.clone(),
            header: volume.header.clone(),
            source: None,
        }
    }

    pub fn from_array(data: Array3<u8>, grid: VoxelGrid) -> Self {
        let header = header_for_grid(&grid);
        Self {
            data: data.mapv(|v| u8::from(v > 0)),
            grid,
            header,
            source: None,
        }
    }

    pub fn name(&self) -> String {
        self.source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<in-memory volume>".to_string())
    }

    pub fn contains_voxel(&self, idx: [usize; 3]) -> bool {
        self.data.get(idx).map_or(false, |&v| v > 0)
    }

    pub fn contains_point(&self, p: &nalgebra::Point3<f64>) -> bool {
        self.grid
            .voxel_index(p)
            .map_or(false, |idx| self.contains_voxel(idx))
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v > 0).count()
    }

    /// Voxelwise product with another binary volume on the same grid.
    pub fn intersect(&self, other: &RoiVolume) -> Result<RoiVolume> {
        self.grid
            .ensure_same_space(&other.grid, format!("intersecting {} with {}", self.name(), other.name()))?;
        let mut data = Array3::<u8>::zeros(self.data.raw_dim());
        Zip::from(&mut data)
            .and(&self.data)
            .and(&other.data)
            .for_each(|out, &a, &b| *out = a * b);
        Ok(RoiVolume {
            data,
            grid: self.grid.clone(),
            header: self.header.clone(),
            source: None,
        })
    }

    /// Regrids onto `target` with nearest-neighbour lookup; label values are never blended.
    pub fn resample_nearest(&self, target: &VoxelGrid, target_header: &NiftiHeader) -> RoiVolume {
        let [nx, ny, nz] = target.dims;
        let mut data = Array3::<u8>::zeros((nx, ny, nz));
        for ((i, j, k), out) in data.indexed_iter_mut() {
            let world = target.index_to_world([i, j, k]);
            if let Some(src) = self.grid.voxel_index(&world) {
                *out = self.data[src];
            }
        }
        debug!(from = %self.grid, to = %target, "regridded binary volume");
        RoiVolume {
            data,
            grid: target.clone(),
            header: target_header.clone(),
            source: self.source.clone(),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        WriterOptions::new(path)
            .reference_header(&unscaled(&self.header))
            .write_nifti(&self.data)?;
        debug!(path = %path.display(), voxels = self.count(), "wrote binary volume");
        Ok(())
    }
}

/// A header carrying only the grid's affine, for volumes created in memory.
pub fn header_for_grid(grid: &VoxelGrid) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    let [nx, ny, nz] = grid.dims;
    header.dim = [3, nx as u16, ny as u16, nz as u16, 1, 1, 1, 1];
    let vs = grid.voxel_sizes();
    header.pixdim = [1.0, vs.x as f32, vs.y as f32, vs.z as f32, 1.0, 1.0, 1.0, 1.0];
    header.set_affine(&grid.affine);
    header.sform_code = 1;
    header
}

/// Stored values are written as-is, so any intensity scaling is reset.
pub(crate) fn unscaled(header: &NiftiHeader) -> NiftiHeader {
    let mut header = header.clone();
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    header
}
