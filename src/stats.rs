//! Scalar statistics along a bundle (e.g. FA or MD).
//!
//! Produces per-streamline means, a bundle summary, and a tract profile:
//! every streamline is resampled to `n_points` nodes, and each node's value
//! is a Gaussian-weighted average across streamlines, where streamlines far
//! from the bundle core (in Mahalanobis distance) count less.

use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::layout::check_overwrite;
use crate::tractogram::{to_f64, Streamline, Tractogram};
use crate::volume::Volume;
use crate::weights::Weights;

/// Trilinear interpolation of `volume` at a world point.
///
/// Returns `None` when the point lies outside the span of voxel centres.
pub fn sample_trilinear(volume: &Volume, p: &Point3<f64>) -> Option<f64> {
    let v = volume.grid.world_to_voxel(p);
    let dims = volume.grid.dims;
    let mut lo = [0usize; 3];
    let mut frac = [0.0f64; 3];
    for axis in 0..3 {
        let x = v[axis];
        let max = (dims[axis] as f64 - 1.0).max(0.0);
        if !x.is_finite() || x < -1e-6 || x > max + 1e-6 {
            return None;
        }
        let x = x.clamp(0.0, max);
        let base = x.floor().min((max - 1.0).max(0.0));
        lo[axis] = base as usize;
        frac[axis] = x - base;
    }

    let mut value = 0.0;
    for corner in 0..8 {
        let mut idx = lo;
        let mut w = 1.0;
        for axis in 0..3 {
            let upper = (corner >> axis) & 1 == 1;
            if upper {
                idx[axis] = (idx[axis] + 1).min(dims[axis] - 1);
                w *= frac[axis];
            } else {
                w *= 1.0 - frac[axis];
            }
        }
        if w != 0.0 {
            value += w * volume.data[idx];
        }
    }
    Some(value)
}

/// Mean of the scalar sampled at each vertex of each streamline; NaN when
/// no vertex of a streamline lies inside the map.
pub fn streamline_means(tractogram: &Tractogram, volume: &Volume) -> Vec<f64> {
    tractogram
        .streamlines
        .iter()
        .map(|s| {
            let samples: Vec<f64> = s
                .iter()
                .filter_map(|p| sample_trilinear(volume, &to_f64(p)))
                .collect();
            if samples.is_empty() {
                f64::NAN
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation.
    pub std: f64,
    pub weighted_mean: Option<f64>,
}

/// Summary over the finite per-streamline means.
pub fn summarize(means: &[f64], weights: Option<&Weights>) -> Summary {
    let finite: Vec<f64> = means.iter().copied().filter(|m| m.is_finite()).collect();
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let std = (finite.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n).sqrt();

    let mut sorted = finite.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = match sorted.len() {
        0 => f64::NAN,
        len if len % 2 == 1 => sorted[len / 2],
        len => (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0,
    };

    let weighted_mean = weights.map(|w| {
        let (num, den) = means
            .iter()
            .zip(&w.0)
            .filter(|(m, _)| m.is_finite())
            .fold((0.0, 0.0), |(num, den), (m, w)| (num + m * w, den + w));
        num / den
    });

    Summary {
        count: means.len(),
        mean,
        median,
        std,
        weighted_mean,
    }
}

/// `n` points equally spaced by arc length from the first to the last vertex.
pub fn resample(streamline: &[Point3<f32>], n: usize) -> Vec<Point3<f64>> {
    let points: Vec<Point3<f64>> = streamline.iter().map(to_f64).collect();
    let Some(&first) = points.first() else {
        return Vec::new();
    };
    let mut cumulative = Vec::with_capacity(points.len());
    cumulative.push(0.0);
    for w in points.windows(2) {
        let last = cumulative[cumulative.len() - 1];
        cumulative.push(last + (w[1] - w[0]).norm());
    }
    let total = cumulative[cumulative.len() - 1];
    if total == 0.0 || n < 2 {
        return vec![first; n];
    }

    let mut out = Vec::with_capacity(n);
    let mut seg = 0;
    for i in 0..n {
        let target = total * i as f64 / (n - 1) as f64;
        while seg + 2 < points.len() && cumulative[seg + 1] < target {
            seg += 1;
        }
        let len = cumulative[seg + 1] - cumulative[seg];
        let t = if len > 0.0 {
            ((target - cumulative[seg]) / len).clamp(0.0, 1.0)
        } else {
            0.0
        };
        out.push(points[seg] + (points[seg + 1] - points[seg]) * t);
    }
    out
}

fn mean_distance(a: &[Point3<f64>], b: &[Point3<f64>]) -> f64 {
    a.iter().zip(b).map(|(p, q)| (p - q).norm()).sum::<f64>() / a.len().max(1) as f64
}

/// Resamples every non-empty streamline and flips the ones running against `reference`.
pub fn oriented_nodes(streamlines: &[Streamline], reference: &[Point3<f64>], n: usize) -> Vec<Vec<Point3<f64>>> {
    streamlines
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| {
            let nodes = resample(s, n);
            let flipped: Vec<Point3<f64>> = nodes.iter().rev().copied().collect();
            if mean_distance(&flipped, reference) < mean_distance(&nodes, reference) {
                flipped
            } else {
                nodes
            }
        })
        .collect()
}

/// Per-node weights (streamlines x nodes), each column summing to one.
pub fn gaussian_weights(nodes: &[Vec<Point3<f64>>], n_points: usize) -> Array2<f64> {
    let n_streamlines = nodes.len();
    let mut weights = Array2::<f64>::zeros((n_streamlines, n_points));
    for node in 0..n_points {
        let coords: Vec<Vector3<f64>> = nodes.iter().map(|s| s[node].coords).collect();
        let mean = coords.iter().sum::<Vector3<f64>>() / n_streamlines as f64;
        let cov = coords
            .iter()
            .map(|c| (c - mean) * (c - mean).transpose())
            .sum::<Matrix3<f64>>()
            / n_streamlines as f64;
        let inverse = cov.pseudo_inverse(1e-10).unwrap_or_else(|_| Matrix3::zeros());

        let mut column_sum = 0.0;
        for (s, c) in coords.iter().enumerate() {
            let d = c - mean;
            let mahalanobis_sq = (d.transpose() * inverse * d)[(0, 0)].max(0.0);
            let w = (-0.5 * mahalanobis_sq).exp();
            weights[[s, node]] = w;
            column_sum += w;
        }
        if column_sum > 0.0 {
            weights.column_mut(node).mapv_inplace(|w| w / column_sum);
        }
    }
    weights
}

/// Weighted scalar value at each of `n_points` nodes along the bundle.
pub fn tract_profile(tractogram: &Tractogram, volume: &Volume, n_points: usize) -> Result<Vec<f64>> {
    if n_points < 2 {
        return Err(Error::InvalidArgument(format!(
            "number of profile points ({n_points}) must be larger than 1"
        )));
    }
    let Some(first) = tractogram.streamlines.iter().find(|s| !s.is_empty()) else {
        return Err(Error::EmptyBundle);
    };
    let reference = resample(first, n_points);
    let nodes = oriented_nodes(&tractogram.streamlines, &reference, n_points);
    let weights = gaussian_weights(&nodes, n_points);

    Ok((0..n_points)
        .map(|node| {
            let (num, den) = nodes.iter().enumerate().fold((0.0, 0.0), |(num, den), (s, sl)| {
                match sample_trilinear(volume, &sl[node]) {
                    Some(v) => (num + weights[[s, node]] * v, den + weights[[s, node]]),
                    None => (num, den),
                }
            });
            if den > 0.0 {
                num / den
            } else {
                f64::NAN
            }
        })
        .collect())
}

/// A scalar map to sample, with the short name used in output file names.
#[derive(Debug, Clone)]
pub struct ScalarInput {
    pub name: String,
    pub path: PathBuf,
}

/// Pairs comma-separated scalar paths with names; without names, file stems are used.
pub fn scalar_inputs(paths: &str, names: Option<&str>) -> Result<Vec<ScalarInput>> {
    let paths: Vec<PathBuf> = paths.split(',').map(|p| PathBuf::from(p.trim())).collect();
    let names: Vec<String> = match names {
        Some(names) => names.split(',').map(|n| n.trim().to_string()).collect(),
        None => paths.iter().map(|p| crate::layout::stem(p)).collect(),
    };
    if names.len() != paths.len() {
        return Err(Error::InvalidArgument(format!(
            "{} scalar images but {} scalar names",
            paths.len(),
            names.len()
        )));
    }
    for path in &paths {
        if !path.exists() {
            return Err(Error::MissingInput {
                what: "Scalar map",
                path: path.clone(),
            });
        }
    }
    Ok(names
        .into_iter()
        .zip(paths)
        .map(|(name, path)| ScalarInput { name, path })
        .collect())
}

#[derive(Debug, Clone)]
pub struct ScalarReport {
    pub name: String,
    pub summary: Summary,
    pub profile: Vec<f64>,
    pub means_csv: PathBuf,
    pub stats_txt: PathBuf,
    pub profile_csv: PathBuf,
}

/// Output paths for one scalar: `{base}{name}_streamline_means.csv` and friends.
pub fn scalar_outputs(base: &str, name: &str) -> [PathBuf; 3] {
    [
        PathBuf::from(format!("{base}{name}_streamline_means.csv")),
        PathBuf::from(format!("{base}{name}_stats.txt")),
        PathBuf::from(format!("{base}{name}_profile.csv")),
    ]
}

/// Samples every scalar along the bundle and writes the three outputs per scalar.
///
/// `base` is an output directory plus file prefix; `tract` is only recorded
/// in the stats file.
pub fn bundle_stats(
    tractogram: &Tractogram,
    tract: &Path,
    scalars: &[ScalarInput],
    weights: Option<&Weights>,
    n_points: usize,
    base: &str,
    overwrite: bool,
) -> Result<Vec<ScalarReport>> {
    if tractogram.is_empty() {
        return Err(Error::EmptyBundle);
    }
    if let Some(w) = weights {
        w.ensure_len(tractogram.len())?;
    }
    for scalar in scalars {
        let outputs = scalar_outputs(base, &scalar.name);
        check_overwrite(&[&outputs[0], &outputs[1], &outputs[2]].map(PathBuf::as_path), overwrite)?;
    }

    let mut reports = Vec::with_capacity(scalars.len());
    for scalar in scalars {
        info!(scalar = %scalar.name, path = %scalar.path.display(), "sampling scalar along bundle");
        let volume = Volume::load(&scalar.path)?;
        let means = streamline_means(tractogram, &volume);
        let outside = means.iter().filter(|m| m.is_nan()).count();
        if outside > 0 {
            warn!(scalar = %scalar.name, outside, "streamlines entirely outside the scalar map");
        }
        let summary = summarize(&means, weights);
        let profile = tract_profile(tractogram, &volume, n_points)?;

        let [means_csv, stats_txt, profile_csv] = scalar_outputs(base, &scalar.name);
        write_means(&means_csv, &means, weights)?;
        write_profile(&profile_csv, &profile)?;
        write_stats(&stats_txt, tract, scalar, &summary, n_points)?;
        info!(
            scalar = %scalar.name,
            mean = summary.mean,
            median = summary.median,
            std = summary.std,
            "bundle statistics written"
        );
        reports.push(ScalarReport {
            name: scalar.name.clone(),
            summary,
            profile,
            means_csv,
            stats_txt,
            profile_csv,
        });
    }
    Ok(reports)
}

fn write_means(path: &Path, means: &[f64], weights: Option<&Weights>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    match weights {
        Some(w) => {
            writer.write_record(["streamline", "mean", "weight"])?;
            for (i, (m, w)) in means.iter().zip(&w.0).enumerate() {
                writer.write_record([i.to_string(), m.to_string(), w.to_string()])?;
            }
        }
        None => {
            writer.write_record(["streamline", "mean"])?;
            for (i, m) in means.iter().enumerate() {
                writer.write_record([i.to_string(), m.to_string()])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_profile(path: &Path, profile: &[f64]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["node", "value"])?;
    for (i, v) in profile.iter().enumerate() {
        writer.write_record([i.to_string(), v.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_stats(path: &Path, tract: &Path, scalar: &ScalarInput, summary: &Summary, n_points: usize) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "Tract: {}", tract.display())?;
    writeln!(out, "Number of Streamlines: {}", summary.count)?;
    writeln!(out, "Scalar: {}", scalar.path.display())?;
    writeln!(out, "Mean: {}", summary.mean)?;
    writeln!(out, "Median: {}", summary.median)?;
    writeln!(out, "Standard Deviation: {}", summary.std)?;
    if let Some(wm) = summary.weighted_mean {
        writeln!(out, "Weighted Mean: {wm}")?;
    }
    writeln!(out, "Profile Length: {n_points}")?;
    out.flush()?;
    Ok(())
}
