//! Exclusion, inclusion and truncation masks applied to an extracted bundle.

use nalgebra::Point3;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::extract::Bundle;
use crate::tractogram::{dense_path, segment_samples, to_f64, Streamline, Tractogram};
use crate::volume::MaskVolume;
use crate::weights::Weights;

/// Optional masks, each with its documented effect when present.
#[derive(Debug, Clone, Copy, Default)]
pub struct Masks<'a> {
    /// Drop streamlines with any point inside.
    pub exclude: Option<&'a MaskVolume>,
    /// Drop streamlines with no point inside.
    pub include: Option<&'a MaskVolume>,
    /// Truncate streamlines where they first leave.
    pub bound: Option<&'a MaskVolume>,
}

impl<'a> Masks<'a> {
    pub fn is_empty(&self) -> bool {
        self.exclude.is_none() && self.include.is_none() && self.bound.is_none()
    }

    fn iter(&self) -> impl Iterator<Item = (&'static str, &'a MaskVolume)> {
        [
            ("exclusion mask", self.exclude),
            ("inclusion mask", self.include),
            ("streamline mask", self.bound),
        ]
        .into_iter()
        .filter_map(|(name, mask)| mask.map(|m| (name, m)))
    }
}

/// Applies the masks in one pass. Exclusion and inclusion look at the whole
/// trajectory; truncation is applied to the streamlines that pass both.
///
/// Masks are only applied to a tractogram with a reference grid, and every
/// mask must lie on that grid.
pub fn apply_masks(
    tractogram: &Tractogram,
    masks: Masks<'_>,
    weights: Option<&Weights>,
) -> Result<Bundle> {
    if let Some(w) = weights {
        w.ensure_len(tractogram.len())?;
    }
    if masks.is_empty() {
        debug!("no masks given; bundle passes through unchanged");
        return Ok(Bundle {
            tractogram: tractogram.clone(),
            weights: weights.cloned(),
            kept: (0..tractogram.len()).collect(),
        });
    }
    if tractogram.reference.is_none() {
        return Err(Error::InvalidArgument(
            "masks need a tractogram with a reference grid to compare against".into(),
        ));
    }
    for (name, mask) in masks.iter() {
        tractogram.ensure_space(&mask.grid, format!("applying {name} {}", mask.name()).as_str())?;
    }
    let step = masks
        .iter()
        .map(|(_, m)| m.grid.min_voxel_size())
        .fold(f64::INFINITY, f64::min)
        / 2.0;

    let mut kept = Vec::new();
    let mut streamlines = Vec::new();
    let (mut excluded, mut missed, mut outside) = (0usize, 0usize, 0usize);
    for (i, streamline) in tractogram.streamlines.iter().enumerate() {
        if masks.exclude.is_some() || masks.include.is_some() {
            let path = dense_path(streamline, step);
            if let Some(exclude) = masks.exclude {
                if path.iter().any(|p| exclude.contains_point(p)) {
                    excluded += 1;
                    continue;
                }
            }
            if let Some(include) = masks.include {
                if !path.iter().any(|p| include.contains_point(p)) {
                    missed += 1;
                    continue;
                }
            }
        }
        let edited = match masks.bound {
            Some(bound) => truncate(streamline, bound, step),
            None => streamline.clone(),
        };
        if edited.is_empty() {
            outside += 1;
            continue;
        }
        kept.push(i);
        streamlines.push(edited);
    }

    info!(
        kept = kept.len(),
        of = tractogram.len(),
        excluded,
        missed_include = missed,
        outside_bound = outside,
        "applied streamline masks"
    );
    Ok(Bundle {
        tractogram: tractogram.with_streamlines(streamlines),
        weights: weights.map(|w| w.subset(&kept)),
        kept,
    })
}

/// Leading part of `streamline` that stays inside `bound`, ending at the
/// last original point before the first exit.
fn truncate(streamline: &[Point3<f32>], bound: &MaskVolume, step: f64) -> Streamline {
    let Some(first) = streamline.first() else {
        return Vec::new();
    };
    if !bound.contains_point(&to_f64(first)) {
        return Vec::new();
    }
    let mut end = 1;
    for w in streamline.windows(2) {
        let (a, b) = (to_f64(&w[0]), to_f64(&w[1]));
        if segment_samples(&a, &b, step).all(|p| bound.contains_point(&p)) {
            end += 1;
        } else {
            break;
        }
    }
    streamline[..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::VoxelGrid;
    use crate::volume::RoiVolume;
    use ndarray::{s, Array3};

    fn grid() -> VoxelGrid {
        VoxelGrid::scaled([20, 20, 20], 1.0).unwrap()
    }

    fn mask(fill: impl Fn(&mut Array3<u8>)) -> MaskVolume {
        let mut data = Array3::<u8>::zeros((20, 20, 20));
        fill(&mut data);
        RoiVolume::from_array(data, grid())
    }

    fn line(points: &[[f32; 3]]) -> Streamline {
        points.iter().map(|p| Point3::new(p[0], p[1], p[2])).collect()
    }

    fn bundle() -> Tractogram {
        Tractogram::new(vec![
            line(&[[2.0, 5.0, 5.0], [10.0, 5.0, 5.0], [18.0, 5.0, 5.0]]),
            line(&[[2.0, 12.0, 5.0], [18.0, 12.0, 5.0]]),
            line(&[[2.0, 15.0, 5.0], [6.0, 15.0, 5.0]]),
        ])
        .with_reference(&grid())
    }

    #[test]
    fn no_masks_is_passthrough() {
        let t = bundle();
        let w = Weights(vec![1.0, 2.0, 3.0]);
        let out = apply_masks(&t, Masks::default(), Some(&w)).unwrap();
        assert_eq!(out.tractogram.streamlines, t.streamlines);
        assert_eq!(out.weights, Some(w));
        assert_eq!(out.kept, vec![0, 1, 2]);
    }

    #[test]
    fn exclusion_at_midpoint_drops_streamline() {
        let exclude = mask(|d| d[[10, 5, 5]] = 1);
        let w = Weights(vec![1.0, 2.0, 3.0]);
        let masks = Masks {
            exclude: Some(&exclude),
            ..Masks::default()
        };
        let out = apply_masks(&bundle(), masks, Some(&w)).unwrap();
        assert_eq!(out.kept, vec![1, 2]);
        assert_eq!(out.weights, Some(Weights(vec![2.0, 3.0])));
    }

    #[test]
    fn exclusion_between_sample_points_is_caught() {
        // streamline 1 has no vertex near x = 9 but passes through it
        let exclude = mask(|d| d[[9, 12, 5]] = 1);
        let masks = Masks {
            exclude: Some(&exclude),
            ..Masks::default()
        };
        let out = apply_masks(&bundle(), masks, None).unwrap();
        assert_eq!(out.kept, vec![0, 2]);
    }

    #[test]
    fn inclusion_requires_a_waypoint() {
        let include = mask(|d| d.slice_mut(s![14..16, .., ..]).fill(1));
        let masks = Masks {
            include: Some(&include),
            ..Masks::default()
        };
        let out = apply_masks(&bundle(), masks, None).unwrap();
        assert_eq!(out.kept, vec![0, 1]);
    }

    #[test]
    fn bound_truncates_at_last_point_inside() {
        let bound = mask(|d| d.slice_mut(s![0..13, .., ..]).fill(1));
        let masks = Masks {
            bound: Some(&bound),
            ..Masks::default()
        };
        let out = apply_masks(&bundle(), masks, None).unwrap();
        assert_eq!(out.kept, vec![0, 1, 2]);
        assert_eq!(out.tractogram.streamlines[0], line(&[[2.0, 5.0, 5.0], [10.0, 5.0, 5.0]]));
        assert_eq!(out.tractogram.streamlines[1], line(&[[2.0, 12.0, 5.0]]));
        assert_eq!(out.tractogram.streamlines[2], bundle().streamlines[2]);
    }

    #[test]
    fn streamline_starting_outside_bound_is_dropped() {
        let bound = mask(|d| d.slice_mut(s![4..20, .., ..]).fill(1));
        let masks = Masks {
            bound: Some(&bound),
            ..Masks::default()
        };
        let out = apply_masks(&bundle(), masks, Some(&Weights(vec![1.0, 2.0, 3.0]))).unwrap();
        assert!(out.is_empty());
        assert_eq!(out.weights, Some(Weights(vec![])));
    }

    #[test]
    fn all_masks_combine() {
        let exclude = mask(|d| d[[4, 15, 5]] = 1);
        let include = mask(|d| d.slice_mut(s![.., 10..20, ..]).fill(1));
        let bound = mask(|d| d.slice_mut(s![0..13, .., ..]).fill(1));
        let masks = Masks {
            exclude: Some(&exclude),
            include: Some(&include),
            bound: Some(&bound),
        };
        let out = apply_masks(&bundle(), masks, Some(&Weights(vec![1.0, 2.0, 3.0]))).unwrap();
        assert_eq!(out.kept, vec![1]);
        assert_eq!(out.weights, Some(Weights(vec![2.0])));
        assert_eq!(out.tractogram.streamlines[0].len(), 1);
    }

    #[test]
    fn mask_on_another_grid_is_rejected() {
        let t = bundle();
        let other = RoiVolume::from_array(
            Array3::zeros((10, 10, 10)),
            VoxelGrid::scaled([10, 10, 10], 2.0).unwrap(),
        );
        let masks = Masks {
            exclude: Some(&other),
            ..Masks::default()
        };
        assert!(matches!(apply_masks(&t, masks, None), Err(Error::GridMismatch { .. })));
    }

    #[test]
    fn masks_without_a_reference_grid_are_refused() {
        let mut t = bundle();
        t.reference = None;
        let exclude = mask(|d| d[[10, 5, 5]] = 1);
        let masks = Masks {
            exclude: Some(&exclude),
            ..Masks::default()
        };
        assert!(matches!(apply_masks(&t, masks, None), Err(Error::InvalidArgument(_))));
        // nothing to compare without masks
        assert!(apply_masks(&t, Masks::default(), None).is_ok());
    }
}
