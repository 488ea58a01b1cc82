//! Streamline-to-node assignment.
//!
//! Every streamline is matched against the labelled atlas under one search
//! policy. The endpoint policies (`forward`, `reverse`, `radial`, `end`)
//! produce one node set per endpoint; `all` produces the union of every node
//! the trajectory passes through. The per-streamline table drives extraction
//! and a 3x3 node-by-node matrix is kept for diagnostics.

use nalgebra::Point3;
use ndarray::Array2;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::common::NodeSet;
use crate::error::{Error, Result};
use crate::merge::LabeledAtlas;
use crate::tractogram::{segment_samples, to_f64, Tractogram};
use crate::weights::Weights;

/// Name of a search policy, as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SearchKind {
    Forward,
    Reverse,
    Radial,
    End,
    All,
}

impl SearchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchKind::Forward => "forward",
            SearchKind::Reverse => "reverse",
            SearchKind::Radial => "radial",
            SearchKind::End => "end",
            SearchKind::All => "all",
        }
    }

    pub fn needs_distance(self) -> bool {
        matches!(self, SearchKind::Forward | SearchKind::Reverse | SearchKind::Radial)
    }
}

impl FromStr for SearchKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(SearchKind::Forward),
            "reverse" => Ok(SearchKind::Reverse),
            "radial" => Ok(SearchKind::Radial),
            "end" => Ok(SearchKind::End),
            "all" => Ok(SearchKind::All),
            _ => Err(Error::UnknownSearchType(s.to_string())),
        }
    }
}

impl fmt::Display for SearchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated search policy. Distances are in millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchPolicy {
    /// Extrapolate outward past each endpoint along its terminal segment.
    Forward { distance: f64 },
    /// Walk back into the streamline from each endpoint.
    Reverse { distance: f64 },
    /// Nearest labelled voxel within a sphere around each endpoint.
    Radial { distance: f64 },
    /// The voxel holding each endpoint only.
    End,
    /// Every voxel along the trajectory.
    All,
}

impl SearchPolicy {
    /// Builds a policy, rejecting a missing or non-positive distance for the
    /// policies that search a neighbourhood.
    pub fn new(kind: SearchKind, distance: Option<f64>) -> Result<Self> {
        if !kind.needs_distance() {
            if let Some(d) = distance {
                debug!(search = %kind, distance = d, "search distance ignored");
            }
            return Ok(match kind {
                SearchKind::End => SearchPolicy::End,
                _ => SearchPolicy::All,
            });
        }
        let distance = match distance {
            Some(d) if d.is_finite() && d > 0.0 => d,
            _ => {
                return Err(Error::InvalidSearchDistance {
                    policy: kind.as_str(),
                    distance,
                })
            }
        };
        Ok(match kind {
            SearchKind::Forward => SearchPolicy::Forward { distance },
            SearchKind::Reverse => SearchPolicy::Reverse { distance },
            _ => SearchPolicy::Radial { distance },
        })
    }

    pub fn kind(&self) -> SearchKind {
        match self {
            SearchPolicy::Forward { .. } => SearchKind::Forward,
            SearchPolicy::Reverse { .. } => SearchKind::Reverse,
            SearchPolicy::Radial { .. } => SearchKind::Radial,
            SearchPolicy::End => SearchKind::End,
            SearchPolicy::All => SearchKind::All,
        }
    }

    pub fn distance(&self) -> Option<f64> {
        match *self {
            SearchPolicy::Forward { distance }
            | SearchPolicy::Reverse { distance }
            | SearchPolicy::Radial { distance } => Some(distance),
            SearchPolicy::End | SearchPolicy::All => None,
        }
    }
}

impl fmt::Display for SearchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.distance() {
            Some(d) => write!(f, "{} ({d} mm)", self.kind()),
            None => write!(f, "{}", self.kind()),
        }
    }
}

/// Nodes matched by one streamline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Start and end node sets, for the endpoint policies.
    Endpoints([NodeSet; 2]),
    /// Nodes met anywhere along the trajectory.
    Traversal(NodeSet),
}

impl Assignment {
    /// Every node the streamline was assigned to.
    pub fn nodes(&self) -> NodeSet {
        match *self {
            Assignment::Endpoints([start, end]) => start.union(end),
            Assignment::Traversal(set) => set,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentTable {
    pub policy: SearchPolicy,
    /// One entry per streamline, in tractogram order.
    pub assignments: Vec<Assignment>,
}

impl AssignmentTable {
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Streamlines assigned to at least one node.
    pub fn assigned(&self) -> usize {
        self.assignments
            .iter()
            .filter(|a| !a.nodes().is_empty())
            .count()
    }

    /// Writes one line per streamline: the start and end node codes for the
    /// endpoint policies, a single code for `all`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        for assignment in &self.assignments {
            match assignment {
                Assignment::Endpoints([start, end]) => writeln!(out, "{start} {end}")?,
                Assignment::Traversal(set) => writeln!(out, "{set}")?,
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// Streamline counts (or summed weights) between nodes 0 (background), 1 and 2.
/// Only the upper triangle is populated.
#[derive(Debug, Clone, PartialEq)]
pub struct Connectome {
    pub matrix: Array2<f64>,
}

impl Default for Connectome {
    fn default() -> Self {
        Self {
            matrix: Array2::zeros((3, 3)),
        }
    }
}

impl Connectome {
    fn add(&mut self, a: u8, b: u8, weight: f64) {
        let (i, j) = if a <= b { (a, b) } else { (b, a) };
        self.matrix[[i as usize, j as usize]] += weight;
    }

    fn record(&mut self, assignment: &Assignment, weight: f64) {
        match *assignment {
            Assignment::Endpoints([start, end]) => {
                for a in nodes_or_background(start) {
                    for b in nodes_or_background(end) {
                        self.add(a, b, weight);
                    }
                }
            }
            Assignment::Traversal(set) => {
                let nodes: Vec<u8> = set.nodes().collect();
                match nodes.as_slice() {
                    [] => self.add(0, 0, weight),
                    [n] => self.add(0, *n, weight),
                    _ => {
                        for (x, &a) in nodes.iter().enumerate() {
                            for &b in &nodes[x + 1..] {
                                self.add(a, b, weight);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn get(&self, a: u8, b: u8) -> f64 {
        let (i, j) = if a <= b { (a, b) } else { (b, a) };
        self.matrix[[i as usize, j as usize]]
    }

    /// Comma-separated rows, one per node.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path.as_ref())?;
        for row in self.matrix.rows() {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn nodes_or_background(set: NodeSet) -> Vec<u8> {
    if set.is_empty() {
        vec![0]
    } else {
        set.nodes().collect()
    }
}

/// Assigns every streamline of `tractogram` to atlas nodes.
///
/// Weights are only used to weight the connectome; they are never filtered here.
pub fn assign(
    tractogram: &Tractogram,
    atlas: &LabeledAtlas,
    policy: SearchPolicy,
    weights: Option<&Weights>,
) -> Result<(AssignmentTable, Connectome)> {
    if let Some(w) = weights {
        w.ensure_len(tractogram.len())?;
    }
    tractogram.ensure_space(&atlas.grid, "assigning streamlines to the labelled atlas")?;

    let search = Search::new(atlas, policy);
    let mut assignments = Vec::with_capacity(tractogram.len());
    let mut connectome = Connectome::default();
    let mut degenerate = 0usize;
    for (i, streamline) in tractogram.streamlines.iter().enumerate() {
        if streamline.is_empty() {
            degenerate += 1;
        }
        let points: Vec<Point3<f64>> = streamline.iter().map(to_f64).collect();
        let assignment = search.streamline(&points);
        connectome.record(&assignment, weights.map_or(1.0, |w| w.0[i]));
        assignments.push(assignment);
    }
    if degenerate > 0 {
        warn!(degenerate, "tractogram holds streamlines without points; they are left unassigned");
    }

    let table = AssignmentTable {
        policy,
        assignments,
    };
    info!(
        search = %policy,
        streamlines = table.len(),
        assigned = table.assigned(),
        "assigned streamlines to nodes"
    );
    Ok((table, connectome))
}

struct Search<'a> {
    atlas: &'a LabeledAtlas,
    policy: SearchPolicy,
    step: f64,
}

impl<'a> Search<'a> {
    fn new(atlas: &'a LabeledAtlas, policy: SearchPolicy) -> Self {
        Self {
            atlas,
            policy,
            step: atlas.grid.min_voxel_size() / 2.0,
        }
    }

    fn streamline(&self, points: &[Point3<f64>]) -> Assignment {
        if let SearchPolicy::All = self.policy {
            return Assignment::Traversal(self.traversal(points));
        }
        if points.is_empty() {
            return Assignment::Endpoints([NodeSet::EMPTY; 2]);
        }
        let reversed: Vec<Point3<f64>> = points.iter().rev().copied().collect();
        Assignment::Endpoints([self.endpoint(points), self.endpoint(&reversed)])
    }

    /// Node set for the endpoint `points[0]`; the rest of the slice runs inward.
    fn endpoint(&self, points: &[Point3<f64>]) -> NodeSet {
        match self.policy {
            SearchPolicy::End => self.atlas.nodes_at_point(&points[0]),
            SearchPolicy::Reverse { distance } => self.reverse(points, distance),
            SearchPolicy::Forward { distance } => self.forward(points, distance),
            SearchPolicy::Radial { distance } => self.radial(&points[0], distance),
            SearchPolicy::All => self.traversal(points),
        }
    }

    fn traversal(&self, points: &[Point3<f64>]) -> NodeSet {
        let Some(first) = points.first() else {
            return NodeSet::EMPTY;
        };
        let mut nodes = self.atlas.nodes_at_point(first);
        for w in points.windows(2) {
            for p in segment_samples(&w[0], &w[1], self.step) {
                nodes = nodes.union(self.atlas.nodes_at_point(&p));
            }
        }
        nodes
    }

    fn reverse(&self, points: &[Point3<f64>], distance: f64) -> NodeSet {
        let here = self.atlas.nodes_at_point(&points[0]);
        if !here.is_empty() {
            return here;
        }
        let mut travelled = 0.0;
        for w in points.windows(2) {
            for p in segment_samples(&w[0], &w[1], self.step) {
                if travelled + (p - w[0]).norm() > distance {
                    return NodeSet::EMPTY;
                }
                let nodes = self.atlas.nodes_at_point(&p);
                if !nodes.is_empty() {
                    return nodes;
                }
            }
            travelled += (w[1] - w[0]).norm();
        }
        NodeSet::EMPTY
    }

    fn forward(&self, points: &[Point3<f64>], distance: f64) -> NodeSet {
        let end = points[0];
        let here = self.atlas.nodes_at_point(&end);
        if !here.is_empty() {
            return here;
        }
        // outward tangent of the terminal segment; coincident points are skipped
        let Some(direction) = points[1..]
            .iter()
            .map(|p| end - p)
            .find(|d| d.norm() > f64::EPSILON)
            .map(|d| d.normalize())
        else {
            return NodeSet::EMPTY;
        };
        let target = end + direction * distance;
        segment_samples(&end, &target, self.step)
            .map(|p| self.atlas.nodes_at_point(&p))
            .find(|nodes| !nodes.is_empty())
            .unwrap_or(NodeSet::EMPTY)
    }

    /// Nearest labelled voxel centre within `distance`; ties go to the lowest index.
    fn radial(&self, end: &Point3<f64>, distance: f64) -> NodeSet {
        let here = self.atlas.nodes_at_point(end);
        if !here.is_empty() {
            return here;
        }
        let grid = &self.atlas.grid;
        let centre = grid.world_to_voxel(end);
        let reach = distance / grid.min_voxel_size();
        let mut range = [(0usize, 0usize); 3];
        for axis in 0..3 {
            let lo = (centre[axis] - reach).floor().max(0.0);
            let hi = (centre[axis] + reach).ceil().min(grid.dims[axis] as f64 - 1.0);
            if hi < lo {
                return NodeSet::EMPTY;
            }
            range[axis] = (lo as usize, hi as usize);
        }

        let mut best: Option<(f64, NodeSet)> = None;
        for i in range[0].0..=range[0].1 {
            for j in range[1].0..=range[1].1 {
                for k in range[2].0..=range[2].1 {
                    let nodes = self.atlas.nodes_at([i, j, k]);
                    if nodes.is_empty() {
                        continue;
                    }
                    let d = (grid.index_to_world([i, j, k]) - end).norm();
                    if d <= distance && best.map_or(true, |(b, _)| d < b) {
                        best = Some((d, nodes));
                    }
                }
            }
        }
        best.map_or(NodeSet::EMPTY, |(_, nodes)| nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::VoxelGrid;
    use crate::merge::merge;
    use crate::tractogram::Streamline;
    use crate::volume::RoiVolume;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    /// 32^3 1mm grid with a 5x5x5 cube of node 1 at voxels 10..=14.
    fn cube_atlas() -> LabeledAtlas {
        let grid = VoxelGrid::scaled([32, 32, 32], 1.0).unwrap();
        let mut data = Array3::<u8>::zeros((32, 32, 32));
        for i in 10..=14 {
            for j in 10..=14 {
                for k in 10..=14 {
                    data[[i, j, k]] = 1;
                }
            }
        }
        merge(&RoiVolume::from_array(data, grid), None).unwrap()
    }

    fn line(points: &[[f32; 3]]) -> Streamline {
        points.iter().map(|p| Point3::new(p[0], p[1], p[2])).collect()
    }

    fn run(streamlines: Vec<Streamline>, policy: SearchPolicy) -> AssignmentTable {
        assign(&Tractogram::new(streamlines), &cube_atlas(), policy, None)
            .unwrap()
            .0
    }

    #[test]
    fn passing_streamline_needs_all_not_end() {
        let through = line(&[[12.0, 12.0, 2.0], [12.0, 12.0, 25.0]]);
        let outside = line(&[[2.0, 2.0, 2.0], [5.0, 2.0, 2.0]]);
        let ending = line(&[[12.0, 12.0, 2.0], [12.0, 12.0, 12.0]]);
        let streamlines = vec![through, outside, ending];

        let end = run(streamlines.clone(), SearchPolicy::End);
        assert!(end.assignments[0].nodes().is_empty());
        assert!(end.assignments[1].nodes().is_empty());
        assert_eq!(
            end.assignments[2],
            Assignment::Endpoints([NodeSet::EMPTY, NodeSet::single(1)])
        );

        let all = run(streamlines, SearchPolicy::All);
        assert_eq!(all.assignments[0], Assignment::Traversal(NodeSet::single(1)));
        assert!(all.assignments[1].nodes().is_empty());
        assert!(all.assignments[2].nodes().contains(1));
    }

    #[test]
    fn assignment_is_deterministic() {
        let streamlines = vec![
            line(&[[12.0, 12.0, 17.0], [12.0, 12.0, 5.0]]),
            line(&[[12.0, 16.3, 12.0], [12.0, 25.0, 12.0]]),
            line(&[[12.0, 12.0, 5.0], [12.0, 12.0, 8.0]]),
        ];
        for kind in [SearchKind::Forward, SearchKind::Reverse, SearchKind::Radial, SearchKind::End, SearchKind::All] {
            let policy = SearchPolicy::new(kind, Some(3.0)).unwrap();
            assert_eq!(run(streamlines.clone(), policy), run(streamlines.clone(), policy));
        }
    }

    #[test]
    fn reverse_walks_into_the_streamline() {
        // start endpoint 3mm beyond the cube face, end endpoint 4.5mm below it
        let s = line(&[[12.0, 12.0, 17.0], [12.0, 12.0, 5.0]]);
        let hit = run(vec![s.clone()], SearchPolicy::Reverse { distance: 3.5 });
        assert_eq!(
            hit.assignments[0],
            Assignment::Endpoints([NodeSet::single(1), NodeSet::EMPTY])
        );
        let miss = run(vec![s], SearchPolicy::Reverse { distance: 2.0 });
        assert!(miss.assignments[0].nodes().is_empty());
    }

    #[test]
    fn forward_extrapolates_past_the_endpoint() {
        let s = line(&[[12.0, 12.0, 5.0], [12.0, 12.0, 8.0]]);
        let hit = run(vec![s.clone()], SearchPolicy::Forward { distance: 3.0 });
        assert_eq!(
            hit.assignments[0],
            Assignment::Endpoints([NodeSet::EMPTY, NodeSet::single(1)])
        );
        let miss = run(vec![s], SearchPolicy::Forward { distance: 1.0 });
        assert!(miss.assignments[0].nodes().is_empty());
    }

    #[test]
    fn single_point_forward_tests_its_own_voxel() {
        let inside = run(vec![line(&[[12.0, 12.0, 12.0]])], SearchPolicy::Forward { distance: 5.0 });
        assert!(inside.assignments[0].nodes().contains(1));
        let outside = run(vec![line(&[[12.0, 12.0, 16.0]])], SearchPolicy::Forward { distance: 5.0 });
        assert!(outside.assignments[0].nodes().is_empty());
    }

    #[test]
    fn radial_searches_a_sphere() {
        // nearest labelled centre is (12, 12, 14), 2.4mm away
        let s = line(&[[12.0, 12.0, 16.4], [12.0, 12.0, 25.0]]);
        let hit = run(vec![s.clone()], SearchPolicy::Radial { distance: 3.0 });
        assert!(hit.assignments[0].nodes().contains(1));
        let miss = run(vec![s], SearchPolicy::Radial { distance: 2.0 });
        assert!(miss.assignments[0].nodes().is_empty());
    }

    #[test]
    fn bad_distances_are_rejected_up_front() {
        for kind in [SearchKind::Forward, SearchKind::Reverse, SearchKind::Radial] {
            assert!(SearchPolicy::new(kind, None).is_err());
            assert!(SearchPolicy::new(kind, Some(0.0)).is_err());
            assert!(SearchPolicy::new(kind, Some(-1.0)).is_err());
            assert!(SearchPolicy::new(kind, Some(f64::NAN)).is_err());
        }
        assert_eq!(SearchPolicy::new(SearchKind::End, None).unwrap(), SearchPolicy::End);
        assert_eq!(SearchPolicy::new(SearchKind::All, Some(-4.0)).unwrap(), SearchPolicy::All);
    }

    #[test]
    fn search_names_parse() {
        assert_eq!("Radial".parse::<SearchKind>().unwrap(), SearchKind::Radial);
        assert!(matches!("sideways".parse::<SearchKind>(), Err(Error::UnknownSearchType(_))));
    }

    #[test]
    fn connectome_sums_weights() {
        let streamlines = vec![
            line(&[[12.0, 12.0, 12.0], [12.0, 12.0, 25.0]]),
            line(&[[2.0, 2.0, 2.0], [5.0, 2.0, 2.0]]),
        ];
        let weights = Weights(vec![2.0, 0.5]);
        let (_, connectome) = assign(
            &Tractogram::new(streamlines),
            &cube_atlas(),
            SearchPolicy::End,
            Some(&weights),
        )
        .unwrap();
        assert_relative_eq!(connectome.get(1, 0), 2.0);
        assert_relative_eq!(connectome.get(0, 0), 0.5);
        assert_relative_eq!(connectome.matrix[[1, 0]], 0.0);
    }

    #[test]
    fn weight_length_must_match() {
        let result = assign(
            &Tractogram::new(vec![line(&[[0.0, 0.0, 0.0]])]),
            &cube_atlas(),
            SearchPolicy::End,
            Some(&Weights(vec![1.0, 1.0])),
        );
        assert!(matches!(result, Err(Error::LengthMismatch { .. })));
    }

    #[test]
    fn assignment_file_has_one_line_per_streamline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.txt");
        let table = AssignmentTable {
            policy: SearchPolicy::End,
            assignments: vec![
                Assignment::Endpoints([NodeSet::single(1), NodeSet::single(2)]),
                Assignment::Endpoints([NodeSet::EMPTY, NodeSet::from_label(3)]),
            ],
        };
        table.save(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1 2\n0 3\n");
    }
}
