//! Selects the sub-bundle from an assignment table.

use tracing::{info, warn};

use crate::assign::AssignmentTable;
use crate::error::{Error, Result};
use crate::tractogram::Tractogram;
use crate::weights::Weights;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMode {
    /// Keep streamlines assigned to node 1, wherever their other end lies.
    Single,
    /// Keep streamlines assigned to both node 1 and node 2.
    Pair,
}

impl RegionMode {
    pub fn from_two_regions(two_regions: bool) -> Self {
        if two_regions {
            RegionMode::Pair
        } else {
            RegionMode::Single
        }
    }
}

/// Streamlines retained by a filtering stage, with their weights when given.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub tractogram: Tractogram,
    pub weights: Option<Weights>,
    /// Index of every retained streamline in the stage's input.
    pub kept: Vec<usize>,
}

impl Bundle {
    pub fn len(&self) -> usize {
        self.tractogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tractogram.is_empty()
    }

    /// Summed weight, or the streamline count without weights.
    pub fn total_weight(&self) -> f64 {
        self.weights
            .as_ref()
            .map_or(self.len() as f64, Weights::sum)
    }
}

pub fn extract(
    tractogram: &Tractogram,
    assignment: &AssignmentTable,
    mode: RegionMode,
    weights: Option<&Weights>,
) -> Result<Bundle> {
    if assignment.len() != tractogram.len() {
        return Err(Error::LengthMismatch {
            what: "assignment table",
            expected: tractogram.len(),
            found: assignment.len(),
        });
    }
    if let Some(w) = weights {
        w.ensure_len(tractogram.len())?;
    }

    let kept: Vec<usize> = assignment
        .assignments
        .iter()
        .enumerate()
        .filter(|(_, a)| {
            let nodes = a.nodes();
            match mode {
                RegionMode::Single => nodes.contains(1),
                RegionMode::Pair => nodes.contains(1) && nodes.contains(2),
            }
        })
        .map(|(i, _)| i)
        .collect();

    if kept.is_empty() {
        warn!(?mode, "no streamline matches the region criterion; the bundle is empty");
    } else {
        info!(?mode, kept = kept.len(), of = tractogram.len(), "extracted sub-bundle");
    }
    Ok(Bundle {
        tractogram: tractogram.subset(&kept),
        weights: weights.map(|w| w.subset(&kept)),
        kept,
    })
}
