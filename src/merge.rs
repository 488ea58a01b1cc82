//! Merges one or two binary ROIs into a labelled atlas with disjoint node codes.

use ndarray::{Array3, Zip};
use nifti::NiftiHeader;
use std::path::Path;
use tracing::{info, warn};

use crate::common::{NodeSet, VoxelGrid};
use crate::error::Result;
use crate::volume::RoiVolume;

/// Integer-labelled volume: 0 background, 1 ROI A, 2 ROI B, 3 both.
#[derive(Debug, Clone)]
pub struct LabeledAtlas {
    pub labels: Array3<u8>,
    pub grid: VoxelGrid,
    pub header: NiftiHeader,
    /// Whether a second ROI contributed label 2.
    pub two_regions: bool,
}

impl LabeledAtlas {
    /// Node set of the voxel holding a world point; empty outside the grid.
    pub fn nodes_at_point(&self, p: &nalgebra::Point3<f64>) -> NodeSet {
        self.grid
            .voxel_index(p)
            .map_or(NodeSet::EMPTY, |idx| self.nodes_at(idx))
    }

    pub fn nodes_at(&self, idx: [usize; 3]) -> NodeSet {
        self.labels
            .get(idx)
            .map_or(NodeSet::EMPTY, |&v| NodeSet::from_label(v))
    }

    /// Number of voxels carrying each atlas value 0..=3.
    pub fn histogram(&self) -> [usize; 4] {
        let mut counts = [0usize; 4];
        for &v in self.labels.iter() {
            counts[(v & 0b11) as usize] += 1;
        }
        counts
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        nifti::writer::WriterOptions::new(path.as_ref())
            .reference_header(&crate::volume::unscaled(&self.header))
            .write_nifti(&self.labels)?;
        Ok(())
    }
}

/// Combines `roi_a` and an optional `roi_b` as `a + 2 * b`.
///
/// With a single ROI the atlas is that ROI unchanged. Both ROIs must already
/// be on the same grid; regrid with [`RoiVolume::resample_nearest`] first.
pub fn merge(roi_a: &RoiVolume, roi_b: Option<&RoiVolume>) -> Result<LabeledAtlas> {
    let Some(roi_b) = roi_b else {
        info!(voxels = roi_a.count(), "single ROI; atlas is the ROI itself");
        return Ok(LabeledAtlas {
            labels: roi_a.data.mapv(|v| u8::from(v > 0)),
            grid: roi_a.grid.clone(),
            header: roi_a.header.clone(),
            two_regions: false,
        });
    };

    roi_a.grid.ensure_same_space(
        &roi_b.grid,
        format!("merging {} with {}", roi_a.name(), roi_b.name()),
    )?;
    let mut labels = Array3::<u8>::zeros(roi_a.data.raw_dim());
    Zip::from(&mut labels)
        .and(&roi_a.data)
        .and(&roi_b.data)
        .for_each(|out, &a, &b| *out = u8::from(a > 0) + 2 * u8::from(b > 0));

    let atlas = LabeledAtlas {
        labels,
        grid: roi_a.grid.clone(),
        header: roi_a.header.clone(),
        two_regions: true,
    };
    let [_, only_a, only_b, overlap] = atlas.histogram();
    if only_a + overlap == 0 || only_b + overlap == 0 {
        warn!(only_a, only_b, "one of the merged ROIs is empty");
    }
    if overlap > 0 {
        warn!(
            overlap,
            "ROIs overlap; overlapping voxels are labelled 3 and count as both regions"
        );
    }
    info!(only_a, only_b, overlap, "merged ROIs into a labelled atlas");
    Ok(atlas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn grid() -> VoxelGrid {
        VoxelGrid::scaled([8, 8, 8], 1.0).unwrap()
    }

    fn roi(voxels: &[[usize; 3]]) -> RoiVolume {
        let mut data = Array3::<u8>::zeros((8, 8, 8));
        for &v in voxels {
            data[v] = 1;
        }
        RoiVolume::from_array(data, grid())
    }

    #[test]
    fn labels_are_disjoint_codes() {
        let a = roi(&[[1, 1, 1], [2, 2, 2]]);
        let b = roi(&[[5, 5, 5], [2, 2, 2]]);
        let atlas = merge(&a, Some(&b)).unwrap();
        assert_eq!(atlas.labels[[0, 0, 0]], 0);
        assert_eq!(atlas.labels[[1, 1, 1]], 1);
        assert_eq!(atlas.labels[[5, 5, 5]], 2);
        assert_eq!(atlas.labels[[2, 2, 2]], 3);
        assert!(atlas.two_regions);
        assert_eq!(atlas.histogram(), [509, 1, 1, 1]);
    }

    #[test]
    fn overlap_voxel_is_both_nodes() {
        let atlas = merge(&roi(&[[2, 2, 2]]), Some(&roi(&[[2, 2, 2]]))).unwrap();
        let nodes = atlas.nodes_at([2, 2, 2]);
        assert!(nodes.contains(1) && nodes.contains(2));
    }

    #[test]
    fn single_roi_passes_through() {
        let a = roi(&[[3, 4, 5]]);
        let atlas = merge(&a, None).unwrap();
        assert!(!atlas.two_regions);
        assert_eq!(atlas.labels, a.data);
    }

    #[test]
    fn different_grids_are_rejected() {
        let a = roi(&[[1, 1, 1]]);
        let b = RoiVolume::from_array(Array3::zeros((8, 8, 8)), VoxelGrid::scaled([8, 8, 8], 2.0).unwrap());
        assert!(matches!(merge(&a, Some(&b)), Err(Error::GridMismatch { .. })));
    }
}
