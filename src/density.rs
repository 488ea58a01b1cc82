//! Track-density maps and the Dice overlap of two bundles.

use ndarray::{Array3, Zip};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::common::VoxelGrid;
use crate::error::{Error, Result};
use crate::tractogram::{dense_path, Tractogram};
use crate::volume::Volume;

/// Number of streamlines passing through each voxel of `grid`.
/// A streamline is counted once per voxel however often it revisits it.
pub fn density_map(tractogram: &Tractogram, grid: &VoxelGrid) -> Array3<f64> {
    let [nx, ny, nz] = grid.dims;
    let mut map = Array3::<f64>::zeros((nx, ny, nz));
    let step = grid.min_voxel_size() / 2.0;
    let mut visited = HashSet::new();
    for streamline in &tractogram.streamlines {
        visited.clear();
        visited.extend(
            dense_path(streamline, step)
                .iter()
                .filter_map(|p| grid.voxel_index(p)),
        );
        for &idx in &visited {
            map[idx] += 1.0;
        }
    }
    map
}

/// `2 |A n B| / (|A| + |B|)` over the non-zero voxels of two maps.
pub fn dice(a: &Array3<f64>, b: &Array3<f64>) -> Result<f64> {
    if a.shape() != b.shape() {
        return Err(Error::InvalidArgument(format!(
            "density maps differ in shape: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let (mut both, mut in_a, mut in_b) = (0usize, 0usize, 0usize);
    Zip::from(a).and(b).for_each(|&x, &y| {
        let (x, y) = (x > 0.0, y > 0.0);
        in_a += usize::from(x);
        in_b += usize::from(y);
        both += usize::from(x && y);
    });
    if in_a + in_b == 0 {
        warn!("both density maps are empty; Dice coefficient set to 0");
        return Ok(0.0);
    }
    Ok(2.0 * both as f64 / (in_a + in_b) as f64)
}

#[derive(Debug, Clone)]
pub struct DiceReport {
    pub dice: f64,
    pub csv: PathBuf,
    /// Density maps written next to the CSV, when requested.
    pub maps: Option<[PathBuf; 2]>,
}

/// Maps both bundles onto `template`'s grid and writes `{out_dir}/{prefix}_dice.csv`.
pub fn tract_dice(
    first: &Tractogram,
    second: &Tractogram,
    template: &Volume,
    out_dir: &Path,
    prefix: &str,
    save_maps: bool,
) -> Result<DiceReport> {
    for t in [first, second] {
        t.ensure_space(&template.grid, "mapping a bundle onto the template")?;
    }
    let map_a = density_map(first, &template.grid);
    let map_b = density_map(second, &template.grid);
    let dice = dice(&map_a, &map_b)?;

    std::fs::create_dir_all(out_dir)?;
    let csv = out_dir.join(format!("{prefix}_dice.csv"));
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(&csv)?;
    writer.write_record([dice.to_string()])?;
    writer.flush()?;

    let maps = if save_maps {
        let paths = [
            out_dir.join(format!("{prefix}_desc-tract1_tdi.nii.gz")),
            out_dir.join(format!("{prefix}_desc-tract2_tdi.nii.gz")),
        ];
        for (map, path) in [map_a, map_b].into_iter().zip(&paths) {
            Volume {
                data: map,
                grid: template.grid.clone(),
                header: template.header.clone(),
            }
            .save(path)?;
        }
        Some(paths)
    } else {
        None
    };
    info!(dice, csv = %csv.display(), "computed bundle overlap");
    Ok(DiceReport { dice, csv, maps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn grid() -> VoxelGrid {
        VoxelGrid::scaled([10, 10, 10], 1.0).unwrap()
    }

    fn along_x(y: f32, from: f32, to: f32) -> Vec<Point3<f32>> {
        vec![Point3::new(from, y, 5.0), Point3::new(to, y, 5.0)]
    }

    #[test]
    fn revisits_count_once() {
        let t = Tractogram::new(vec![vec![
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(3.0, 1.0, 1.0),
            Point3::new(1.0, 1.0, 1.0),
        ]]);
        let map = density_map(&t, &grid());
        assert_eq!(map[[2, 1, 1]], 1.0);
        assert_eq!(map.sum(), 3.0);
    }

    #[test]
    fn dice_of_partial_overlap() {
        let a = Tractogram::new(vec![along_x(5.0, 0.0, 3.0)]);
        let b = Tractogram::new(vec![along_x(5.0, 2.0, 5.0)]);
        let d = dice(&density_map(&a, &grid()), &density_map(&b, &grid())).unwrap();
        // voxels 0..=3 and 2..=5 share 2 of 4 + 4
        assert_relative_eq!(d, 0.5);
    }

    #[test]
    fn identical_bundles_have_unit_dice() {
        let a = Tractogram::new(vec![along_x(2.0, 0.0, 9.0), along_x(3.0, 1.0, 4.0)]);
        let map = density_map(&a, &grid());
        assert_relative_eq!(dice(&map, &map).unwrap(), 1.0);
    }

    #[test]
    fn writes_prefixed_csv() {
        let dir = tempfile::tempdir().unwrap();
        let template = Volume::from_array(Array3::zeros((10, 10, 10)), grid());
        let a = Tractogram::new(vec![along_x(5.0, 0.0, 3.0)]);
        let report = tract_dice(&a, &a, &template, dir.path(), "sub-01", false).unwrap();
        assert_eq!(report.csv, dir.path().join("sub-01_dice.csv"));
        assert_eq!(std::fs::read_to_string(&report.csv).unwrap().trim(), "1");
        assert!(report.maps.is_none());
    }
}
