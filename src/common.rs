use nalgebra::{Matrix4, Point3, Vector3, Vector4};
use std::fmt;

use crate::error::{Error, Result};

/// Affine entries closer than this (in mm) are treated as equal.
const AFFINE_TOLERANCE: f64 = 1e-4;

/// Shape and voxel-to-world placement of a 3D volume.
///
/// Voxel centres sit on integer voxel indices, as in NIfTI. A world point
/// belongs to the voxel whose centre is nearest.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelGrid {
    pub dims: [usize; 3],
    pub affine: Matrix4<f64>,
    inverse: Matrix4<f64>,
}

impl VoxelGrid {
    pub fn new(dims: [usize; 3], affine: Matrix4<f64>) -> Result<Self> {
        let inverse = affine.try_inverse().ok_or_else(|| {
            Error::InvalidArgument(format!("voxel-to-world affine is singular: {affine}"))
        })?;
        Ok(Self {
            dims,
            affine,
            inverse,
        })
    }

    /// An axis-aligned grid with the given voxel size and origin at voxel (0, 0, 0).
    pub fn scaled(dims: [usize; 3], voxel_size: f64) -> Result<Self> {
        let mut affine = Matrix4::identity() * voxel_size;
        affine[(3, 3)] = 1.0;
        Self::new(dims, affine)
    }

    pub fn len(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Continuous voxel coordinates of a world point.
    pub fn world_to_voxel(&self, p: &Point3<f64>) -> Point3<f64> {
        let v = self.inverse * Vector4::new(p.x, p.y, p.z, 1.0);
        Point3::new(v.x, v.y, v.z)
    }

    pub fn voxel_to_world(&self, v: &Point3<f64>) -> Point3<f64> {
        let w = self.affine * Vector4::new(v.x, v.y, v.z, 1.0);
        Point3::new(w.x, w.y, w.z)
    }

    pub fn index_to_world(&self, idx: [usize; 3]) -> Point3<f64> {
        self.voxel_to_world(&Point3::new(idx[0] as f64, idx[1] as f64, idx[2] as f64))
    }

    /// Index of the voxel holding a world point, or `None` outside the grid.
    pub fn voxel_index(&self, p: &Point3<f64>) -> Option<[usize; 3]> {
        let v = self.world_to_voxel(p);
        self.round_index(&v)
    }

    pub(crate) fn round_index(&self, v: &Point3<f64>) -> Option<[usize; 3]> {
        let mut idx = [0usize; 3];
        for axis in 0..3 {
            let r = v[axis].round();
            if !r.is_finite() || r < 0.0 || r >= self.dims[axis] as f64 {
                return None;
            }
            idx[axis] = r as usize;
        }
        Some(idx)
    }

    /// Edge lengths of a voxel in mm.
    pub fn voxel_sizes(&self) -> Vector3<f64> {
        let column = |c: usize| {
            Vector3::new(self.affine[(0, c)], self.affine[(1, c)], self.affine[(2, c)]).norm()
        };
        Vector3::new(column(0), column(1), column(2))
    }

    pub fn min_voxel_size(&self) -> f64 {
        self.voxel_sizes().min()
    }

    pub fn same_space(&self, other: &VoxelGrid) -> bool {
        self.dims == other.dims
            && self
                .affine
                .iter()
                .zip(other.affine.iter())
                .all(|(a, b)| (a - b).abs() <= AFFINE_TOLERANCE)
    }

    pub fn ensure_same_space(&self, other: &VoxelGrid, what: impl Into<String>) -> Result<()> {
        if self.same_space(other) {
            Ok(())
        } else {
            Err(Error::GridMismatch {
                what: what.into(),
                left: self.to_string(),
                right: other.to_string(),
            })
        }
    }
}

impl fmt::Display for VoxelGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vs = self.voxel_sizes();
        write!(
            f,
            "{}x{}x{} @ {:.2}x{:.2}x{:.2} mm, origin ({:.2}, {:.2}, {:.2})",
            self.dims[0],
            self.dims[1],
            self.dims[2],
            vs.x,
            vs.y,
            vs.z,
            self.affine[(0, 3)],
            self.affine[(1, 3)],
            self.affine[(2, 3)]
        )
    }
}

/// Set of connectivity nodes a voxel, endpoint or streamline belongs to.
///
/// Stored as the 2-bit mask produced by the label merge: bit 0 is node 1,
/// bit 1 is node 2. An atlas value of 3 (ROI overlap) is therefore both nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeSet(u8);

impl NodeSet {
    pub const EMPTY: NodeSet = NodeSet(0);
    pub const MAX_NODE: u8 = 2;

    /// Node set of an atlas voxel value (0..=3).
    pub fn from_label(label: u8) -> Self {
        NodeSet(label & 0b11)
    }

    pub fn single(node: u8) -> Self {
        match node {
            1 | 2 => NodeSet(1 << (node - 1)),
            _ => NodeSet::EMPTY,
        }
    }

    pub fn contains(self, node: u8) -> bool {
        matches!(node, 1 | 2) && self.0 & (1 << (node - 1)) != 0
    }

    pub fn union(self, other: NodeSet) -> NodeSet {
        NodeSet(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Member nodes in ascending order.
    pub fn nodes(self) -> impl Iterator<Item = u8> {
        (1..=Self::MAX_NODE).filter(move |&n| self.contains(n))
    }
}

impl fmt::Display for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
