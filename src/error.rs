//! Error type shared by every module of the crate.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::pipeline::Stage;

/// Error type for all error variants originated by this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::error::NiftiError),

    #[error("could not read tabular file: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid tool configuration: {0}")]
    ToolConfig(#[from] toml::de::Error),

    /// An input file that the run depends on does not exist.
    #[error("{what} {} is not found on the system", path.display())]
    MissingInput { what: &'static str, path: PathBuf },

    #[error("{what} {} is not of a supported file type (expected {expected})", path.display())]
    UnsupportedFileType {
        what: &'static str,
        path: PathBuf,
        expected: &'static str,
    },

    #[error("{} must be binary (0 or 1), found value {value}", path.display())]
    NotBinary { path: PathBuf, value: f64 },

    #[error("expected a 3D volume in {}, got {ndim}D", path.display())]
    NotThreeDimensional { path: PathBuf, ndim: usize },

    /// Two volumes (or a volume and a tractogram) do not share a voxel grid.
    #[error("{what}: voxel grids differ ({left} vs {right})")]
    GridMismatch {
        what: String,
        left: String,
        right: String,
    },

    #[error("search distance must be a positive number of millimetres for '{policy}' search, got {distance:?}")]
    InvalidSearchDistance {
        policy: &'static str,
        distance: Option<f64>,
    },

    #[error("unsupported search type '{0}' (expected forward, reverse, radial, end or all)")]
    UnknownSearchType(String),

    /// Per-streamline data does not line up with the tractogram.
    #[error("{what} has {found} entries but the tractogram has {expected} streamlines")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid weight at row {row}: {value} (weights must be finite and non-negative)")]
    InvalidWeight { row: usize, value: String },

    #[error("malformed tractogram {}: {reason}", path.display())]
    MalformedTractogram { path: PathBuf, reason: String },

    #[error("{} has no usable voxel-to-RAS affine; a reference image is required", path.display())]
    MissingReference { path: PathBuf },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("command {0} could not be found in PATH")]
    ToolNotFound(String),

    #[error("command {tool} exited with {status}")]
    ToolFailed { tool: String, status: ExitStatus },

    #[error("command {tool} did not produce its output {}", path.display())]
    MissingOutput { tool: String, path: PathBuf },

    #[error("output file {} already exists and overwriting is disabled", .0.display())]
    OutputExists(PathBuf),

    #[error("the final sub-bundle is empty")]
    EmptyBundle,

    /// Wraps any failure with the pipeline stage it happened in.
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            Error::Stage { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }
}

/// Alias type for results originated from this crate.
pub type Result<T> = std::result::Result<T, Error>;
