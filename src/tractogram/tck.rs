//! MRtrix `.tck` streamline files.
//!
//! A text header (`mrtrix tracks`, `key: value` lines, `END`) followed at the
//! offset named by `file: . <offset>` by xyz float triplets. A NaN triplet
//! closes a streamline and an Inf triplet marks the end of the data.

use byteordered::{ByteOrdered, Endianness};
use nalgebra::Point3;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::warn;

use super::Streamline;
use crate::error::{Error, Result};

pub const TCK_MAGIC: &str = "mrtrix tracks";

/// Keys the writer regenerates; everything else is carried over verbatim.
const GENERATED_KEYS: [&str; 4] = ["file", "datatype", "count", "total_count"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TckDatatype {
    Float32(Endianness),
    Float64(Endianness),
}

impl TckDatatype {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Float32LE" => Some(TckDatatype::Float32(Endianness::Little)),
            "Float32BE" => Some(TckDatatype::Float32(Endianness::Big)),
            "Float64LE" => Some(TckDatatype::Float64(Endianness::Little)),
            "Float64BE" => Some(TckDatatype::Float64(Endianness::Big)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TckHeader {
    /// Header properties in file order, minus the ones the writer generates.
    pub properties: Vec<(String, String)>,
    pub datatype: TckDatatype,
}

impl Default for TckHeader {
    fn default() -> Self {
        Self {
            properties: Vec::new(),
            datatype: TckDatatype::Float32(Endianness::Little),
        }
    }
}

fn malformed(path: &Path, reason: impl Into<String>) -> Error {
    Error::MalformedTractogram {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

pub fn read(path: &Path) -> Result<(TckHeader, Vec<Streamline>)> {
    let mut file = BufReader::new(File::open(path)?);

    let mut line = String::new();
    file.read_line(&mut line)?;
    if line.trim_end() != TCK_MAGIC {
        return Err(malformed(path, "missing 'mrtrix tracks' magic line"));
    }

    let mut header = TckHeader::default();
    let mut data_offset = None;
    let mut datatype = None;
    loop {
        line.clear();
        if file.read_line(&mut line)? == 0 {
            return Err(malformed(path, "header is not terminated by END"));
        }
        let entry = line.trim_end();
        if entry == "END" {
            break;
        }
        let Some((key, value)) = entry.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "file" => {
                let offset = value
                    .strip_prefix('.')
                    .map(str::trim)
                    .and_then(|o| o.parse::<u64>().ok())
                    .ok_or_else(|| malformed(path, format!("unsupported file entry '{value}'")))?;
                data_offset = Some(offset);
            }
            "datatype" => {
                datatype = Some(
                    TckDatatype::parse(value)
                        .ok_or_else(|| malformed(path, format!("unsupported datatype '{value}'")))?,
                );
            }
            k if GENERATED_KEYS.contains(&k) => {}
            _ => header.properties.push((key.to_string(), value.to_string())),
        }
    }
    header.datatype = datatype.ok_or_else(|| malformed(path, "header has no datatype"))?;
    let offset = data_offset.ok_or_else(|| malformed(path, "header has no file entry"))?;

    file.seek(SeekFrom::Start(offset))?;
    let streamlines = read_body(file, header.datatype, path)?;
    Ok((header, streamlines))
}

fn read_body<R: Read>(input: R, datatype: TckDatatype, path: &Path) -> Result<Vec<Streamline>> {
    let (endianness, wide) = match datatype {
        TckDatatype::Float32(e) => (e, false),
        TckDatatype::Float64(e) => (e, true),
    };
    let mut input = ByteOrdered::runtime(input, endianness);
    let read_value = move |input: &mut ByteOrdered<R, Endianness>| -> std::io::Result<f32> {
        if wide {
            input.read_f64().map(|v| v as f32)
        } else {
            input.read_f32()
        }
    };

    let mut streamlines = Vec::new();
    let mut current: Streamline = Vec::new();
    loop {
        let x = match read_value(&mut input) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if !current.is_empty() {
                    warn!(path = %path.display(), "tck data ends inside a streamline; dropping it");
                }
                warn!(path = %path.display(), "tck data has no end-of-file marker");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        let y = read_value(&mut input)?;
        let z = read_value(&mut input)?;
        if x.is_infinite() && y.is_infinite() && z.is_infinite() {
            if !current.is_empty() {
                warn!(path = %path.display(), "tck data ends inside a streamline; dropping it");
            }
            break;
        }
        if x.is_nan() && y.is_nan() && z.is_nan() {
            streamlines.push(std::mem::take(&mut current));
            continue;
        }
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return Err(malformed(path, "non-finite coordinate inside a streamline"));
        }
        current.push(Point3::new(x, y, z));
    }
    Ok(streamlines)
}

/// Header text up to and including `END`, with the data offset it names.
fn header_text(header: &TckHeader, count: usize) -> (String, u64) {
    let mut body = format!("{TCK_MAGIC}\n");
    for (key, value) in &header.properties {
        body.push_str(&format!("{key}: {value}\n"));
    }
    body.push_str("datatype: Float32LE\n");
    body.push_str(&format!("count: {count}\n"));
    body.push_str(&format!("total_count: {count}\n"));

    // the offset is part of the text it measures; iterate until it is stable
    let mut offset = body.len() as u64;
    loop {
        let text = format!("{body}file: . {offset}\nEND\n");
        if text.len() as u64 == offset {
            return (text, offset);
        }
        offset = text.len() as u64;
    }
}

pub fn write(path: &Path, header: &TckHeader, streamlines: &[Streamline]) -> Result<()> {
    let (text, _) = header_text(header, streamlines.len());
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(text.as_bytes())?;
    let mut out = ByteOrdered::le(out);
    for streamline in streamlines {
        for p in streamline {
            out.write_f32(p.x)?;
            out.write_f32(p.y)?;
            out.write_f32(p.z)?;
        }
        for _ in 0..3 {
            out.write_f32(f32::NAN)?;
        }
    }
    for _ in 0..3 {
        out.write_f32(f32::INFINITY)?;
    }
    out.into_inner().flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_offset_matches_text_length() {
        let mut header = TckHeader::default();
        header
            .properties
            .push(("step_size".to_string(), "0.5".to_string()));
        let (text, offset) = header_text(&header, 1234);
        assert_eq!(text.len() as u64, offset);
        assert!(text.ends_with(&format!("file: . {offset}\nEND\n")));
    }

    #[test]
    fn write_then_read_keeps_streamlines_and_properties() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.tck");
        let mut header = TckHeader::default();
        header
            .properties
            .push(("algorithm".to_string(), "iFOD2".to_string()));
        let streamlines = vec![
            vec![Point3::new(1.0, 2.0, 3.0), Point3::new(1.5, 2.0, 3.0)],
            vec![Point3::new(-4.0, 0.25, 9.0)],
        ];
        write(&path, &header, &streamlines).unwrap();
        let (read_header, read_streamlines) = read(&path).unwrap();
        assert_eq!(read_streamlines, streamlines);
        assert_eq!(read_header.properties, header.properties);
    }

    #[test]
    fn big_endian_float64_body_is_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.tck");
        let mut bytes = b"mrtrix tracks\ndatatype: Float64BE\nfile: . 64\nEND\n".to_vec();
        bytes.resize(64, b' ');
        for v in [1.0f64, 2.0, 3.0, f64::NAN, f64::NAN, f64::NAN, f64::INFINITY, f64::INFINITY, f64::INFINITY] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        std::fs::write(&path, bytes).unwrap();
        let (_, streamlines) = read(&path).unwrap();
        assert_eq!(streamlines, vec![vec![Point3::new(1.0f32, 2.0, 3.0)]]);
    }

    #[test]
    fn missing_magic_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.tck");
        std::fs::write(&path, b"not a track file\n").unwrap();
        assert!(matches!(read(&path), Err(Error::MalformedTractogram { .. })));
    }
}
