//! Functional sub-bundle extraction.
//!
//! Given a whole-brain tractogram and one or two gray-matter regions of
//! interest, keep only the streamlines that terminate in (or, with the `all`
//! policy, traverse) those regions. Optional masks then edit the bundle, and
//! per-streamline weights travel along with every selection.
//!
//! The core stages are plain functions over in-memory types:
//! [`merge::merge`] builds a labelled atlas, [`assign::assign`] labels each
//! streamline, [`extract::extract`] selects the sub-bundle and
//! [`edit::apply_masks`] filters and truncates it. [`pipeline::run`] chains
//! them with the anatomical preprocessing in [`anat`] and writes every
//! artifact under a BIDS-like layout.

pub mod anat;
pub mod assign;
pub mod common;
pub mod density;
pub mod edit;
pub mod error;
pub mod extract;
pub mod layout;
pub mod merge;
pub mod pipeline;
pub mod stats;
pub mod tools;
pub mod tractogram;
pub mod volume;
pub mod weights;

pub use assign::{assign, AssignmentTable, Connectome, SearchKind, SearchPolicy};
pub use common::{NodeSet, VoxelGrid};
pub use edit::{apply_masks, Masks};
pub use error::{Error, Result};
pub use extract::{extract, Bundle, RegionMode};
pub use merge::{merge, LabeledAtlas};
pub use pipeline::{run, ExtractionReport, ExtractorOptions, Stage};
pub use tractogram::Tractogram;
pub use volume::{RoiVolume, Volume};
pub use weights::Weights;
