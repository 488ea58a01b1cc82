//! BIDS-like output naming and the overwrite policy.
//!
//! Outputs of one run go to `{out}/{subject}/{anat,func,dwi}` and are named
//! `{subject}_space-{space}[_rec-{rec}]_desc-{desc}.{ext}` so downstream
//! tools can find them without being told every path.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Multi-part extensions are listed before their suffixes.
const KNOWN_EXTENSIONS: [&str; 7] = [".nii.gz", ".nii", ".mgz", ".label", ".mif", ".tck", ".trk"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Anat,
    Func,
    Dwi,
}

impl OutputKind {
    pub const ALL: [OutputKind; 3] = [OutputKind::Anat, OutputKind::Func, OutputKind::Dwi];

    pub fn dir_name(self) -> &'static str {
        match self {
            OutputKind::Anat => "anat",
            OutputKind::Func => "func",
            OutputKind::Dwi => "dwi",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    subject: String,
    space: String,
    overwrite: bool,
}

impl OutputLayout {
    pub fn new(out_dir: &Path, subject: &str, space: &str, overwrite: bool) -> Self {
        Self {
            root: out_dir.join(subject),
            subject: subject.to_string(),
            space: space.to_string(),
            overwrite,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn dir(&self, kind: OutputKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn create_dirs(&self) -> Result<()> {
        for kind in OutputKind::ALL {
            std::fs::create_dir_all(self.dir(kind))?;
        }
        Ok(())
    }

    /// Name of one artifact; `desc` parts are joined in camel case.
    pub fn path(&self, kind: OutputKind, rec: Option<&str>, desc: &[&str], ext: &str) -> PathBuf {
        self.dir(kind).join(bids_name(&self.subject, &self.space, rec, desc, ext))
    }

    /// Errors on the first existing path unless overwriting is allowed.
    pub fn check(&self, paths: &[&Path]) -> Result<()> {
        check_overwrite(paths, self.overwrite)
    }
}

/// `{subject}_space-{space}[_rec-{rec}]_desc-{desc}.{ext}`
pub fn bids_name(subject: &str, space: &str, rec: Option<&str>, desc: &[&str], ext: &str) -> String {
    let mut name = format!("{subject}_space-{space}");
    if let Some(rec) = rec {
        name.push_str(&format!("_rec-{}", sanitize(rec)));
    }
    name.push_str("_desc-");
    for (i, part) in desc.iter().enumerate() {
        let part = sanitize(part);
        if i == 0 {
            name.push_str(&part);
        } else {
            name.push_str(&capitalize(&part));
        }
    }
    name.push('.');
    name.push_str(ext.trim_start_matches('.'));
    name
}

pub fn check_overwrite(paths: &[&Path], overwrite: bool) -> Result<()> {
    if overwrite {
        return Ok(());
    }
    match paths.iter().find(|p| p.exists()) {
        Some(p) => Err(Error::OutputExists(p.to_path_buf())),
        None => Ok(()),
    }
}

/// BIDS entity values are alphanumeric.
fn sanitize(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// The recognised extension of a file name, including its leading dot.
pub fn extension(path: &Path) -> Option<&'static str> {
    let name = path.file_name()?.to_str()?;
    KNOWN_EXTENSIONS.into_iter().find(|ext| name.ends_with(ext))
}

pub fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    extension(path).map_or(false, |ext| allowed.contains(&ext))
}

/// File name with any recognised extension removed.
pub fn stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match extension(path) {
        Some(ext) => name[..name.len() - ext.len()].to_string(),
        None => name,
    }
}
