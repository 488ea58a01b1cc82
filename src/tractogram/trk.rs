//! TrackVis `.trk` streamline files.
//!
//! Points are stored in "voxmm" coordinates (voxel index times voxel size,
//! origin at the corner of the first voxel). They are mapped to world space
//! with `world = vox_to_ras * (p / voxel_size - 0.5)`.

use byteordered::{ByteOrdered, Endianness};
use nalgebra::{Matrix4, Point3};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::warn;

use super::Streamline;
use crate::common::VoxelGrid;
use crate::error::{Error, Result};

pub const TRK_HEADER_SIZE: usize = 1000;

const OFFSET_DIM: u64 = 6;
const OFFSET_VOXEL_SIZE: u64 = 12;
const OFFSET_N_SCALARS: u64 = 36;
const OFFSET_N_PROPERTIES: u64 = 238;
const OFFSET_VOX_TO_RAS: u64 = 440;
const OFFSET_VOXEL_ORDER: u64 = 948;
const OFFSET_N_COUNT: u64 = 988;
const OFFSET_VERSION: u64 = 992;
const OFFSET_HDR_SIZE: u64 = 996;

#[derive(Debug, Clone, PartialEq)]
pub struct TrkHeader {
    /// The original header bytes; fields not modelled here are written back unchanged.
    raw: Vec<u8>,
    pub endianness: Endianness,
    pub dim: [i16; 3],
    pub voxel_size: [f32; 3],
    pub n_scalars: i16,
    pub n_properties: i16,
    pub vox_to_ras: Matrix4<f64>,
    /// Axis codes such as "LAS"; empty when the file leaves it blank.
    pub voxel_order: String,
    pub n_count: i32,
    pub version: i32,
}

impl TrkHeader {
    /// A version 2 header describing `grid`.
    pub fn from_grid(grid: &VoxelGrid) -> Self {
        let mut raw = vec![0u8; TRK_HEADER_SIZE];
        raw[..6].copy_from_slice(b"TRACK\0");
        let vs = grid.voxel_sizes();
        Self {
            raw,
            endianness: Endianness::Little,
            dim: [grid.dims[0] as i16, grid.dims[1] as i16, grid.dims[2] as i16],
            voxel_size: [vs.x as f32, vs.y as f32, vs.z as f32],
            n_scalars: 0,
            n_properties: 0,
            vox_to_ras: grid.affine,
            voxel_order: orientation_code(&grid.affine),
            n_count: 0,
            version: 2,
        }
    }

    fn parse(raw: Vec<u8>, path: &Path) -> Result<Self> {
        if &raw[..5] != b"TRACK" {
            return Err(malformed(path, "missing TRACK magic"));
        }
        let hdr_size = |e: Endianness| -> Result<i32> {
            let mut c = Cursor::new(&raw);
            c.seek(SeekFrom::Start(OFFSET_HDR_SIZE))?;
            Ok(ByteOrdered::runtime(c, e).read_i32()?)
        };
        let endianness = if hdr_size(Endianness::Little)? == TRK_HEADER_SIZE as i32 {
            Endianness::Little
        } else if hdr_size(Endianness::Big)? == TRK_HEADER_SIZE as i32 {
            Endianness::Big
        } else {
            return Err(malformed(path, "hdr_size is not 1000 in either byte order"));
        };

        let mut input = ByteOrdered::runtime(Cursor::new(&raw), endianness);
        input.inner_mut().seek(SeekFrom::Start(OFFSET_DIM))?;
        let mut dim = [0i16; 3];
        for d in dim.iter_mut() {
            *d = input.read_i16()?;
        }
        input.inner_mut().seek(SeekFrom::Start(OFFSET_VOXEL_SIZE))?;
        let mut voxel_size = [0f32; 3];
        for v in voxel_size.iter_mut() {
            *v = input.read_f32()?;
        }
        input.inner_mut().seek(SeekFrom::Start(OFFSET_N_SCALARS))?;
        let n_scalars = input.read_i16()?;
        input.inner_mut().seek(SeekFrom::Start(OFFSET_N_PROPERTIES))?;
        let n_properties = input.read_i16()?;
        input.inner_mut().seek(SeekFrom::Start(OFFSET_VOX_TO_RAS))?;
        let mut vox_to_ras = Matrix4::zeros();
        for row in 0..4 {
            for col in 0..4 {
                vox_to_ras[(row, col)] = input.read_f32()? as f64;
            }
        }
        let mut order = [0u8; 4];
        input.inner_mut().seek(SeekFrom::Start(OFFSET_VOXEL_ORDER))?;
        input.inner_mut().read_exact(&mut order)?;
        let voxel_order = String::from_utf8_lossy(&order)
            .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_uppercase();
        input.inner_mut().seek(SeekFrom::Start(OFFSET_N_COUNT))?;
        let n_count = input.read_i32()?;
        let version = input.read_i32()?;
        if n_scalars < 0 || n_properties < 0 {
            return Err(malformed(path, "negative scalar or property count"));
        }
        drop(input);

        Ok(Self {
            raw,
            endianness,
            dim,
            voxel_size,
            n_scalars,
            n_properties,
            vox_to_ras,
            voxel_order,
            n_count,
            version,
        })
    }

    /// Whether the header carries a voxel-to-RAS affine (version 2 headers do).
    pub fn has_affine(&self) -> bool {
        self.vox_to_ras[(3, 3)] != 0.0
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = ByteOrdered::runtime(Cursor::new(self.raw.clone()), self.endianness);
        out.inner_mut().seek(SeekFrom::Start(OFFSET_DIM))?;
        for d in self.dim {
            out.write_i16(d)?;
        }
        out.inner_mut().seek(SeekFrom::Start(OFFSET_VOXEL_SIZE))?;
        for v in self.voxel_size {
            out.write_f32(v)?;
        }
        out.inner_mut().seek(SeekFrom::Start(OFFSET_N_SCALARS))?;
        out.write_i16(self.n_scalars)?;
        out.inner_mut().seek(SeekFrom::Start(OFFSET_N_PROPERTIES))?;
        out.write_i16(self.n_properties)?;
        out.inner_mut().seek(SeekFrom::Start(OFFSET_VOX_TO_RAS))?;
        for row in 0..4 {
            for col in 0..4 {
                out.write_f32(self.vox_to_ras[(row, col)] as f32)?;
            }
        }
        let mut order = [0u8; 4];
        for (dst, src) in order.iter_mut().zip(self.voxel_order.bytes().take(3)) {
            *dst = src;
        }
        out.inner_mut().seek(SeekFrom::Start(OFFSET_VOXEL_ORDER))?;
        out.inner_mut().write_all(&order)?;
        out.inner_mut().seek(SeekFrom::Start(OFFSET_N_COUNT))?;
        out.write_i32(self.n_count)?;
        out.write_i32(self.version)?;
        out.write_i32(TRK_HEADER_SIZE as i32)?;
        Ok(out.into_inner().into_inner())
    }

    fn voxel_sizes_or(&self, grid: &VoxelGrid) -> [f64; 3] {
        if self.voxel_size.iter().all(|&v| v > 0.0) {
            [self.voxel_size[0] as f64, self.voxel_size[1] as f64, self.voxel_size[2] as f64]
        } else {
            let vs = grid.voxel_sizes();
            [vs.x, vs.y, vs.z]
        }
    }
}

/// The three axis codes implied by an affine: for each voxel axis, the world
/// axis it mostly runs along and its direction.
pub fn orientation_code(affine: &Matrix4<f64>) -> String {
    (0..3)
        .map(|col| {
            let row = (0..3)
                .max_by(|&a, &b| affine[(a, col)].abs().total_cmp(&affine[(b, col)].abs()))
                .unwrap_or(col);
            let (pos, neg) = [('R', 'L'), ('A', 'P'), ('S', 'I')][row];
            if affine[(row, col)] < 0.0 {
                neg
            } else {
                pos
            }
        })
        .collect()
}

fn malformed(path: &Path, reason: impl Into<String>) -> Error {
    Error::MalformedTractogram {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_raw_header<R: Read>(input: &mut R, path: &Path) -> Result<TrkHeader> {
    let mut raw = vec![0u8; TRK_HEADER_SIZE];
    input
        .read_exact(&mut raw)
        .map_err(|_| malformed(path, "file is shorter than the 1000-byte header"))?;
    TrkHeader::parse(raw, path)
}

/// Reads only the header, e.g. to check for an affine before loading.
pub fn read_header(path: &Path) -> Result<TrkHeader> {
    read_raw_header(&mut File::open(path)?, path)
}

/// Reads a `.trk` file, returning its header, the grid its points were
/// mapped through, and the streamlines in world coordinates.
pub fn read(path: &Path, reference: Option<&VoxelGrid>) -> Result<(TrkHeader, VoxelGrid, Vec<Streamline>)> {
    let mut file = BufReader::new(File::open(path)?);
    let header = read_raw_header(&mut file, path)?;

    let grid = match reference {
        Some(grid) => {
            let dims = header.dim.map(|d| d as usize);
            if header.has_affine() && dims != grid.dims {
                warn!(
                    path = %path.display(),
                    header_dims = ?dims,
                    reference_dims = ?grid.dims,
                    "trk header dimensions differ from the reference image"
                );
            }
            grid.clone()
        }
        None if header.has_affine() => {
            VoxelGrid::new(header.dim.map(|d| d.max(0) as usize), header.vox_to_ras)?
        }
        None => {
            return Err(Error::MissingReference {
                path: path.to_path_buf(),
            })
        }
    };
    if header.has_affine() && !header.voxel_order.is_empty() {
        let implied = orientation_code(&header.vox_to_ras);
        if header.voxel_order != implied {
            warn!(
                path = %path.display(),
                voxel_order = %header.voxel_order,
                affine_order = %implied,
                "trk voxel_order disagrees with its vox_to_ras; using vox_to_ras"
            );
        }
    }
    let vs = header.voxel_sizes_or(&grid);

    let file_len = file.get_ref().metadata()?.len();
    let mut input = ByteOrdered::runtime(file, header.endianness);
    let extra_per_point = header.n_scalars as usize;
    let point_bytes = 4 * (3 + extra_per_point) as u64;
    let mut streamlines = Vec::new();
    loop {
        let n_points = match input.read_i32() {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if n_points < 0 {
            return Err(malformed(path, format!("negative point count {n_points}")));
        }
        if n_points as u64 * point_bytes > file_len {
            return Err(malformed(path, format!("point count {n_points} does not fit in the file")));
        }
        let mut streamline = Vec::with_capacity(n_points as usize);
        for _ in 0..n_points {
            let x = input.read_f32()? as f64;
            let y = input.read_f32()? as f64;
            let z = input.read_f32()? as f64;
            for _ in 0..extra_per_point {
                input.read_f32()?;
            }
            let vox = Point3::new(x / vs[0] - 0.5, y / vs[1] - 0.5, z / vs[2] - 0.5);
            let world = grid.voxel_to_world(&vox);
            streamline.push(Point3::new(world.x as f32, world.y as f32, world.z as f32));
        }
        for _ in 0..header.n_properties {
            input.read_f32()?;
        }
        streamlines.push(streamline);
    }
    if header.n_count > 0 && header.n_count as usize != streamlines.len() {
        warn!(
            path = %path.display(),
            declared = header.n_count,
            found = streamlines.len(),
            "trk streamline count disagrees with its header"
        );
    }
    Ok((header, grid, streamlines))
}

/// Writes streamlines through `grid`; per-point scalars and properties are not kept.
pub fn write(path: &Path, header: &TrkHeader, grid: &VoxelGrid, streamlines: &[Streamline]) -> Result<()> {
    let mut header = header.clone();
    header.n_scalars = 0;
    header.n_properties = 0;
    header.n_count = streamlines.len() as i32;
    header.dim = [grid.dims[0] as i16, grid.dims[1] as i16, grid.dims[2] as i16];
    header.vox_to_ras = grid.affine;
    header.voxel_order = orientation_code(&grid.affine);
    if header.version < 2 {
        header.version = 2;
    }
    let vs = header.voxel_sizes_or(grid);
    header.voxel_size = [vs[0] as f32, vs[1] as f32, vs[2] as f32];

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&header.encode()?)?;
    let mut out = ByteOrdered::runtime(out, header.endianness);
    for streamline in streamlines {
        out.write_i32(streamline.len() as i32)?;
        for p in streamline {
            let vox = grid.world_to_voxel(&super::to_f64(p));
            out.write_f32(((vox.x + 0.5) * vs[0]) as f32)?;
            out.write_f32(((vox.y + 0.5) * vs[1]) as f32)?;
            out.write_f32(((vox.z + 0.5) * vs[2]) as f32)?;
        }
    }
    out.into_inner().flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn shifted_grid() -> VoxelGrid {
        let mut affine = Matrix4::identity() * 2.0;
        affine[(3, 3)] = 1.0;
        affine[(0, 3)] = -10.0;
        affine[(1, 3)] = 4.0;
        VoxelGrid::new([20, 20, 20], affine).unwrap()
    }

    #[test]
    fn header_encoding_round_trips() {
        let header = TrkHeader::from_grid(&shifted_grid());
        let parsed = TrkHeader::parse(header.encode().unwrap(), Path::new("x.trk")).unwrap();
        assert_eq!(parsed.dim, [20, 20, 20]);
        assert_eq!(parsed.voxel_size, [2.0, 2.0, 2.0]);
        assert!(parsed.has_affine());
        assert_eq!(parsed.vox_to_ras, shifted_grid().affine);
        assert_eq!(parsed.voxel_order, "RAS");
        assert_eq!(parsed.endianness, Endianness::Little);
    }

    #[test]
    fn orientation_follows_the_dominant_axis() {
        let mut affine = Matrix4::identity();
        affine[(0, 0)] = -1.0;
        assert_eq!(orientation_code(&affine), "LAS");

        // voxel i runs along -y, j along +x
        let mut swapped = Matrix4::zeros();
        swapped[(1, 0)] = -2.0;
        swapped[(0, 1)] = 2.0;
        swapped[(2, 2)] = 2.0;
        swapped[(3, 3)] = 1.0;
        assert_eq!(orientation_code(&swapped), "PRS");
    }

    #[test]
    fn contradicting_voxel_order_still_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lps.trk");
        let grid = VoxelGrid::scaled([4, 4, 4], 1.0).unwrap();
        let mut header = TrkHeader::from_grid(&grid);
        header.voxel_order = "LPS".to_string();
        write(&path, &header, &grid, &[]).unwrap();
        // write re-derives the order from the grid
        assert_eq!(read_header(&path).unwrap().voxel_order, "RAS");

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[OFFSET_VOXEL_ORDER as usize..OFFSET_VOXEL_ORDER as usize + 3].copy_from_slice(b"LPS");
        std::fs::write(&path, &bytes).unwrap();
        let (parsed, read_grid, streamlines) = read(&path, None).unwrap();
        assert_eq!(parsed.voxel_order, "LPS");
        assert_eq!(read_grid.affine, grid.affine);
        assert!(streamlines.is_empty());
    }

    #[test]
    fn oversized_point_count_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("truncated.trk");
        let mut bytes = TrkHeader::from_grid(&shifted_grid()).encode().unwrap();
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(read(&path, None), Err(Error::MalformedTractogram { .. })));
    }

    #[test]
    fn voxmm_points_map_to_world() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.trk");
        let grid = shifted_grid();
        let world = vec![vec![Point3::new(-10.0f32, 4.0, 0.0), Point3::new(-6.0, 8.0, 2.0)]];
        write(&path, &TrkHeader::from_grid(&grid), &grid, &world).unwrap();

        // voxel (0,0,0) centre is stored at voxmm (1,1,1)
        let bytes = std::fs::read(&path).unwrap();
        let first_x = f32::from_le_bytes(bytes[1004..1008].try_into().unwrap());
        assert_abs_diff_eq!(first_x, 1.0, epsilon = 1e-5);

        let (_, read_grid, streamlines) = read(&path, None).unwrap();
        assert_eq!(read_grid.dims, grid.dims);
        for (a, b) in streamlines[0].iter().zip(world[0].iter()) {
            assert_abs_diff_eq!((a - b).norm(), 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn version_one_header_needs_reference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.trk");
        let mut header = TrkHeader::from_grid(&shifted_grid());
        header.vox_to_ras = Matrix4::zeros();
        header.version = 1;
        let mut bytes = header.encode().unwrap();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        for v in [1.0f32, 1.0, 1.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(read(&path, None), Err(Error::MissingReference { .. })));
        let (_, _, streamlines) = read(&path, Some(&shifted_grid())).unwrap();
        assert_abs_diff_eq!(streamlines[0][0].x, -10.0, epsilon = 1e-5);
    }

    #[test]
    fn scalars_and_properties_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scalars.trk");
        let grid = VoxelGrid::scaled([4, 4, 4], 1.0).unwrap();
        let mut header = TrkHeader::from_grid(&grid);
        header.n_scalars = 1;
        header.n_properties = 2;
        let mut bytes = header.encode().unwrap();
        bytes.extend_from_slice(&2i32.to_le_bytes());
        for v in [0.5f32, 0.5, 0.5, 9.0, 1.5, 0.5, 0.5, 9.0, 7.0, 7.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, bytes).unwrap();
        let (_, _, streamlines) = read(&path, None).unwrap();
        assert_eq!(streamlines.len(), 1);
        assert_eq!(streamlines[0], vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)]);
    }
}
