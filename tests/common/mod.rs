//! Synthetic subjects for the integration tests: a 10 mm cube of 1 mm voxels
//! with identity orientation, two ROI slabs at either end of the x axis, and
//! a handful of straight streamlines between them.
#![allow(dead_code)]

use nalgebra::Point3;
use ndarray::{s, Array3};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use fsub_extractor::tractogram::Streamline;
use fsub_extractor::{RoiVolume, Tractogram, Volume, VoxelGrid};

pub const DIM: usize = 10;

pub fn grid() -> VoxelGrid {
    VoxelGrid::scaled([DIM; 3], 1.0).unwrap()
}

pub fn line(from: [f32; 3], to: [f32; 3]) -> Streamline {
    vec![Point3::from(from), Point3::from(to)]
}

/// Four streamlines: `0` joins ROI A to ROI B, `1` leaves ROI A and stops
/// short, `2` touches neither, `3` runs from ROI B back to ROI A.
pub fn streamlines() -> Vec<Streamline> {
    vec![
        line([1.0, 5.0, 5.0], [8.0, 5.0, 5.0]),
        line([1.0, 5.0, 5.0], [4.0, 5.0, 5.0]),
        line([4.0, 2.0, 2.0], [5.0, 2.0, 2.0]),
        line([8.0, 4.0, 4.0], [0.0, 4.0, 4.0]),
    ]
}

/// Binary slab covering `xs` along x and voxels 4..=6 along y and z.
pub fn write_slab(dir: &Path, name: &str, xs: RangeInclusive<usize>) -> PathBuf {
    let mut data = Array3::<u8>::zeros((DIM, DIM, DIM));
    data.slice_mut(s![*xs.start()..=*xs.end(), 4..=6, 4..=6]).fill(1);
    write_mask(dir, name, data)
}

/// Binary volume set at the given voxels only.
pub fn write_voxels(dir: &Path, name: &str, voxels: &[[usize; 3]]) -> PathBuf {
    let mut data = Array3::<u8>::zeros((DIM, DIM, DIM));
    for &idx in voxels {
        data[idx] = 1;
    }
    write_mask(dir, name, data)
}

/// Binary volume covering `xs` along x over the full y and z extent.
pub fn write_block(dir: &Path, name: &str, xs: RangeInclusive<usize>) -> PathBuf {
    let mut data = Array3::<u8>::zeros((DIM, DIM, DIM));
    data.slice_mut(s![*xs.start()..=*xs.end(), .., ..]).fill(1);
    write_mask(dir, name, data)
}

pub fn write_mask(dir: &Path, name: &str, data: Array3<u8>) -> PathBuf {
    let path = dir.join(name);
    RoiVolume::from_array(data, grid()).save(&path).unwrap();
    path
}

/// A full mask on a 2 mm grid covering the same field of view.
pub fn write_coarse_mask(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let grid = VoxelGrid::scaled([DIM / 2; 3], 2.0).unwrap();
    RoiVolume::from_array(Array3::<u8>::ones((DIM / 2, DIM / 2, DIM / 2)), grid)
        .save(&path)
        .unwrap();
    path
}

pub fn write_scalar(dir: &Path, name: &str, value: f64) -> PathBuf {
    let path = dir.join(name);
    Volume::from_array(Array3::from_elem((DIM, DIM, DIM), value), grid())
        .save(&path)
        .unwrap();
    path
}

/// Writes the streamlines; `.trk` files get a header affine from [`grid`].
pub fn write_tracks(dir: &Path, name: &str, streamlines: Vec<Streamline>) -> PathBuf {
    let path = dir.join(name);
    Tractogram::new(streamlines)
        .with_reference(&grid())
        .save(&path)
        .unwrap();
    path
}

pub fn write_weights(dir: &Path, name: &str, weights: &[f64]) -> PathBuf {
    let path = dir.join(name);
    let text: Vec<String> = weights.iter().map(f64::to_string).collect();
    std::fs::write(&path, text.join("\n")).unwrap();
    path
}
