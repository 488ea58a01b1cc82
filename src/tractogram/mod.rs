//! In-memory tractograms and the two streamline container formats.
//!
//! Streamlines are always held in world (scanner, mm) coordinates, the way
//! MRtrix `.tck` files store them. TrackVis `.trk` files are converted on read
//! and converted back on write.

pub mod tck;
pub mod trk;

use nalgebra::Point3;
use std::path::Path;
use tracing::info;

use crate::common::VoxelGrid;
use crate::error::{Error, Result};

pub use tck::TckHeader;
pub use trk::TrkHeader;

/// One fibre trajectory: an ordered list of world-space points.
pub type Streamline = Vec<Point3<f32>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TractFormat {
    Tck,
    Trk,
}

impl TractFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("tck") => Ok(TractFormat::Tck),
            Some("trk") => Ok(TractFormat::Trk),
            _ => Err(Error::UnsupportedFileType {
                what: "Tract file",
                path: path.to_path_buf(),
                expected: ".tck or .trk",
            }),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            TractFormat::Tck => "tck",
            TractFormat::Trk => "trk",
        }
    }
}

/// Format-specific header kept so outputs can be written the way inputs were read.
#[derive(Debug, Clone)]
pub enum TractHeader {
    Tck(TckHeader),
    Trk(TrkHeader),
}

#[derive(Debug, Clone)]
pub struct Tractogram {
    pub streamlines: Vec<Streamline>,
    /// Voxel grid the streamlines were defined against, when known.
    pub reference: Option<VoxelGrid>,
    pub header: TractHeader,
}

impl Tractogram {
    pub fn new(streamlines: Vec<Streamline>) -> Self {
        Self {
            streamlines,
            reference: None,
            header: TractHeader::Tck(TckHeader::default()),
        }
    }

    /// Reads a `.tck` or `.trk` file.
    ///
    /// `reference` is the image the tractogram was generated against. It is
    /// required for `.trk` files whose header has no voxel-to-RAS affine and is
    /// recorded as the tractogram's reference grid for `.tck` files.
    pub fn load<P: AsRef<Path>>(path: P, reference: Option<&VoxelGrid>) -> Result<Self> {
        let path = path.as_ref();
        let format = TractFormat::from_path(path)?;
        if !path.exists() {
            return Err(Error::MissingInput {
                what: "Tract file",
                path: path.to_path_buf(),
            });
        }
        let tractogram = match format {
            TractFormat::Tck => {
                let (header, streamlines) = tck::read(path)?;
                Tractogram {
                    streamlines,
                    reference: reference.cloned(),
                    header: TractHeader::Tck(header),
                }
            }
            TractFormat::Trk => {
                let (header, grid, streamlines) = trk::read(path, reference)?;
                Tractogram {
                    streamlines,
                    reference: Some(grid),
                    header: TractHeader::Trk(header),
                }
            }
        };
        info!(
            path = %path.display(),
            streamlines = tractogram.len(),
            "loaded tractogram"
        );
        Ok(tractogram)
    }

    /// Writes the tractogram in the format named by the path's extension.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        match TractFormat::from_path(path)? {
            TractFormat::Tck => {
                let header = match &self.header {
                    TractHeader::Tck(h) => h.clone(),
                    TractHeader::Trk(_) => TckHeader::default(),
                };
                tck::write(path, &header, &self.streamlines)
            }
            TractFormat::Trk => {
                let grid = self
                    .reference
                    .as_ref()
                    .ok_or_else(|| Error::MissingReference {
                        path: path.to_path_buf(),
                    })?;
                let header = match &self.header {
                    TractHeader::Trk(h) => h.clone(),
                    TractHeader::Tck(_) => TrkHeader::from_grid(grid),
                };
                trk::write(path, &header, grid, &self.streamlines)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.streamlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streamlines.is_empty()
    }

    pub fn with_reference(mut self, grid: &VoxelGrid) -> Self {
        if self.reference.is_none() {
            self.reference = Some(grid.clone());
        }
        self
    }

    /// A new tractogram with the same header and reference but other streamlines.
    pub fn with_streamlines(&self, streamlines: Vec<Streamline>) -> Self {
        Self {
            streamlines,
            reference: self.reference.clone(),
            header: self.header.clone(),
        }
    }

    /// The streamlines at `indices`, in the order given.
    pub fn subset(&self, indices: &[usize]) -> Self {
        self.with_streamlines(indices.iter().map(|&i| self.streamlines[i].clone()).collect())
    }

    /// Errors when the tractogram's reference grid is known and differs from `grid`.
    /// Passes when there is no reference; callers that need one check `reference`.
    pub fn ensure_space(&self, grid: &VoxelGrid, what: &str) -> Result<()> {
        match &self.reference {
            Some(reference) => reference.ensure_same_space(grid, what),
            None => Ok(()),
        }
    }
}

pub(crate) fn to_f64(p: &Point3<f32>) -> Point3<f64> {
    Point3::new(p.x as f64, p.y as f64, p.z as f64)
}

/// Points strictly after `a` up to and including `b`, spaced no more than `step` apart.
pub fn segment_samples(
    a: &Point3<f64>,
    b: &Point3<f64>,
    step: f64,
) -> impl Iterator<Item = Point3<f64>> {
    let delta = b - a;
    let n = ((delta.norm() / step).ceil() as usize).max(1);
    let a = *a;
    (1..=n).map(move |i| a + delta * (i as f64 / n as f64))
}

/// Every point of a streamline plus intermediate samples, so consecutive
/// samples are at most `step` apart.
pub fn dense_path(streamline: &[Point3<f32>], step: f64) -> Vec<Point3<f64>> {
    let mut out = Vec::with_capacity(streamline.len());
    let mut points = streamline.iter().map(to_f64);
    if let Some(first) = points.next() {
        out.push(first);
        let mut prev = first;
        for p in points {
            out.extend(segment_samples(&prev, &p, step));
            prev = p;
        }
    }
    out
}
