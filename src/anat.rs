//! Anatomical preparation through MRtrix3 and FreeSurfer: 5TT/GMWMI creation,
//! surface-based ROI projection into white matter, and registration of
//! projected ROIs into diffusion space.
//!
//! Each external call goes through a [`ToolRegistry`] resolved by the caller.
//! The GMWMI intersection itself is done in-process.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::layout::{bids_name, check_overwrite, has_extension, stem};
use crate::tools::ToolRegistry;
use crate::volume::RoiVolume;

/// Projection depths of `mri_vol2surf` when a volumetric ROI is sampled onto the surface.
const VOL2SURF_PROJFRAC: [&str; 3] = ["-.5", "1", ".1"];

/// A FreeSurfer subject inside a subjects directory.
#[derive(Debug, Clone)]
pub struct FreeSurferSubject {
    pub subjects_dir: PathBuf,
    pub subject: String,
}

impl FreeSurferSubject {
    /// Errors unless `{subjects_dir}/{subject}/surf` exists.
    pub fn new(subjects_dir: &Path, subject: &str) -> Result<Self> {
        let fs = Self {
            subjects_dir: subjects_dir.to_path_buf(),
            subject: subject.to_string(),
        };
        if !fs.dir().join("surf").is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} does not appear to be a valid FreeSurfer directory",
                fs.dir().display()
            )));
        }
        Ok(fs)
    }

    pub fn dir(&self) -> PathBuf {
        self.subjects_dir.join(&self.subject)
    }

    pub fn aseg(&self) -> PathBuf {
        self.dir().join("mri").join("aseg.mgz")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hemisphere {
    Lh,
    Rh,
}

impl FromStr for Hemisphere {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "lh" => Ok(Hemisphere::Lh),
            "rh" => Ok(Hemisphere::Rh),
            other => Err(Error::InvalidArgument(format!(
                "hemispheres must be either 'lh' or 'rh', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Hemisphere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Hemisphere::Lh => "lh",
            Hemisphere::Rh => "rh",
        })
    }
}

/// Parses `lh`, `rh` or a two-element list like `lh,rh`.
///
/// The first entry is used for ROI 1, the last for ROI 2, so a single
/// hemisphere applies to both ROIs.
pub fn parse_hemispheres(s: &str) -> Result<Vec<Hemisphere>> {
    let hemis = s
        .split(',')
        .map(str::parse)
        .collect::<Result<Vec<Hemisphere>>>()?;
    if hemis.len() > 2 {
        return Err(Error::InvalidArgument(format!(
            "expected one hemisphere per ROI (or one for both), got '{s}'"
        )));
    }
    Ok(hemis)
}

/// Fractions of cortical thickness to project through: `start,stop,delta`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjFrac {
    pub start: f64,
    pub stop: f64,
    pub delta: f64,
}

impl Default for ProjFrac {
    fn default() -> Self {
        Self {
            start: -2.0,
            stop: 0.0,
            delta: 0.05,
        }
    }
}

impl ProjFrac {
    pub fn new(start: f64, stop: f64, delta: f64) -> Result<Self> {
        if !(start < 0.0) {
            return Err(Error::InvalidArgument(
                "the 'start' parameter of projfrac-params must be negative to project into white matter".into(),
            ));
        }
        if !(delta > 0.0) {
            return Err(Error::InvalidArgument(
                "the 'delta' parameter of projfrac-params must be positive".into(),
            ));
        }
        if !(stop > start) {
            return Err(Error::InvalidArgument(
                "the 'stop' parameter of projfrac-params must be greater than 'start'".into(),
            ));
        }
        Ok(Self { start, stop, delta })
    }

    fn args(&self) -> [String; 3] {
        [self.start.to_string(), self.stop.to_string(), self.delta.to_string()]
    }
}

impl FromStr for ProjFrac {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let values = s
            .split(',')
            .map(|v| {
                v.trim().parse::<f64>().map_err(|_| {
                    Error::InvalidArgument(format!("projfrac-params value '{v}' is not a number"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        match values.as_slice() {
            &[start, stop, delta] => ProjFrac::new(start, stop, delta),
            _ => Err(Error::InvalidArgument(
                "projfrac-params should be provided as start,stop,delta".into(),
            )),
        }
    }
}

/// What a GMWMI is generated from.
#[derive(Debug, Clone, PartialEq)]
pub enum AnatSource {
    /// A FreeSurfer subject directory, handled by `5ttgen hsvs`.
    FreeSurfer(PathBuf),
    /// A T1-weighted image, handled by `5ttgen fsl`.
    T1w(PathBuf),
}

impl AnatSource {
    pub fn detect(path: &Path) -> Result<Self> {
        if path.join("surf").is_dir() {
            info!(path = %path.display(), "FreeSurfer input detected; using 5ttgen hsvs");
            Ok(AnatSource::FreeSurfer(path.to_path_buf()))
        } else if has_extension(path, &[".nii.gz", ".nii", ".mif"]) {
            info!(path = %path.display(), "T1w image detected; using 5ttgen fsl");
            Ok(AnatSource::T1w(path.to_path_buf()))
        } else {
            Err(Error::InvalidArgument(format!(
                "neither a T1w image nor a FreeSurfer directory: {}; unable to create GMWMI",
                path.display()
            )))
        }
    }

    fn algorithm(&self) -> &'static str {
        match self {
            AnatSource::FreeSurfer(_) => "hsvs",
            AnatSource::T1w(_) => "fsl",
        }
    }

    fn path(&self) -> &Path {
        match self {
            AnatSource::FreeSurfer(p) | AnatSource::T1w(p) => p,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GmwmiOptions<'a> {
    pub anat: &'a Path,
    pub out_dir: &'a Path,
    pub subject: &'a str,
    /// GMWMI voxels strictly above this value are kept.
    pub threshold: f64,
    /// Existing 5TT image; skips `5ttgen` when given.
    pub fivett: Option<&'a Path>,
    /// Space label written into output names, e.g. `FS` or `DWI`.
    pub space: &'a str,
    pub overwrite: bool,
}

/// Paths written by [`anat_to_gmwmi`].
#[derive(Debug, Clone, PartialEq)]
pub struct GmwmiOutputs {
    pub fivett: PathBuf,
    pub gmwmi: PathBuf,
    pub gmwmi_bin: PathBuf,
}

impl GmwmiOutputs {
    /// Output paths for a run that generates everything in `out_dir`.
    pub fn planned(out_dir: &Path, subject: &str, space: &str, fivett: Option<&Path>) -> Self {
        Self {
            fivett: fivett.map_or_else(
                || out_dir.join(bids_name(subject, space, None, &["5tt"], "nii.gz")),
                Path::to_path_buf,
            ),
            gmwmi: out_dir.join(bids_name(subject, space, None, &["gmwmi"], "nii.gz")),
            gmwmi_bin: out_dir.join(bids_name(subject, space, Some("binarized"), &["gmwmi"], "nii.gz")),
        }
    }
}

/// Creates a 5TT image (unless one is given), the GMWMI, and its binarized version.
pub fn anat_to_gmwmi(tools: &ToolRegistry, opts: &GmwmiOptions<'_>) -> Result<GmwmiOutputs> {
    let outputs = GmwmiOutputs::planned(opts.out_dir, opts.subject, opts.space, opts.fivett);
    let mut produced = vec![outputs.gmwmi.as_path(), outputs.gmwmi_bin.as_path()];
    if opts.fivett.is_none() {
        produced.push(outputs.fivett.as_path());
    }
    check_overwrite(&produced, opts.overwrite)?;
    std::fs::create_dir_all(opts.out_dir)?;

    match opts.fivett {
        None => {
            let source = AnatSource::detect(opts.anat)?;
            info!("generating 5TT image");
            tools
                .command("5ttgen")?
                .arg(source.algorithm())
                .arg(source.path())
                .arg(&outputs.fivett)
                .args(force_flag(opts.overwrite))
                .output(&outputs.fivett)
                .run()?;
        }
        Some(fivett) => {
            if !fivett.exists() {
                return Err(Error::MissingInput {
                    what: "5TT image",
                    path: fivett.to_path_buf(),
                });
            }
            info!(path = %fivett.display(), "using supplied 5TT image");
        }
    }

    info!("generating GMWMI image");
    tools
        .command("5tt2gmwmi")?
        .arg(&outputs.fivett)
        .arg(&outputs.gmwmi)
        .args(force_flag(opts.overwrite))
        .output(&outputs.gmwmi)
        .run()?;

    info!(threshold = opts.threshold, "binarizing GMWMI");
    let binary = RoiVolume::load_thresholded(&outputs.gmwmi, opts.threshold)?;
    if binary.count() == 0 {
        warn!(threshold = opts.threshold, "binarized GMWMI is empty");
    }
    binary.save(&outputs.gmwmi_bin)?;
    Ok(outputs)
}

fn force_flag(overwrite: bool) -> Option<&'static str> {
    overwrite.then_some("-force")
}

/// Projects a cortical ROI into white matter, writing a volumetric mask to `out`.
///
/// # Arguments
///
/// * `roi` - `.nii.gz` volume (mapped to the surface first), `.label` or `.mgz` surface overlay.
/// * `hemi` - hemisphere the ROI lies in.
/// * `out` - the projected `.nii.gz`; a `.mgz` surface file next to it holds the
///   intermediate overlay for volumetric inputs.
/// * `overwrite` - replace `out` and the intermediate overlay if they exist.
pub fn project_roi(
    tools: &ToolRegistry,
    roi: &Path,
    fs: &FreeSurferSubject,
    hemi: Hemisphere,
    projfrac: ProjFrac,
    out: &Path,
    overwrite: bool,
) -> Result<PathBuf> {
    let surface = if has_extension(roi, &[".nii.gz", ".nii"]) {
        info!(roi = %roi.display(), "mapping volumetric ROI to the surface");
        let surface = out.with_file_name(format!("{}_surf.mgz", stem(out)));
        check_overwrite(&[&surface, out], overwrite)?;
        tools
            .command("mri_vol2surf")?
            .env("SUBJECTS_DIR", &fs.subjects_dir)
            .arg("--src")
            .arg(roi)
            .arg("--out")
            .arg(&surface)
            .args(["--regheader", fs.subject.as_str(), "--hemi"])
            .arg(hemi.to_string())
            .arg("--projfrac-max")
            .args(VOL2SURF_PROJFRAC)
            .output(&surface)
            .run()?;
        surface
    } else {
        check_overwrite(&[out], overwrite)?;
        roi.to_path_buf()
    };

    if has_extension(&surface, &[".label"]) {
        info!(roi = %surface.display(), "projecting FreeSurfer label");
        tools
            .command("mri_label2vol")?
            .env("SUBJECTS_DIR", &fs.subjects_dir)
            .arg("--label")
            .arg(&surface)
            .arg("--o")
            .arg(out)
            .args(["--subject", fs.subject.as_str(), "--hemi"])
            .arg(hemi.to_string())
            .arg("--temp")
            .arg(fs.aseg())
            .args(["--proj", "frac"])
            .args(projfrac.args())
            .arg("--identity")
            .output(out)
            .run()?;
    } else if has_extension(&surface, &[".mgz"]) {
        info!(roi = %surface.display(), "projecting FreeSurfer surface overlay");
        tools
            .command("mri_surf2vol")?
            .env("SUBJECTS_DIR", &fs.subjects_dir)
            .arg("--surfval")
            .arg(&surface)
            .arg("--o")
            .arg(out)
            .args(["--subject", fs.subject.as_str(), "--hemi"])
            .arg(hemi.to_string())
            .arg("--template")
            .arg(fs.aseg())
            .args(["--identity", fs.subject.as_str(), "--fill-projfrac"])
            .args(projfrac.args())
            .output(out)
            .run()?;
    } else {
        return Err(Error::UnsupportedFileType {
            what: "ROI file",
            path: roi.to_path_buf(),
            expected: ".nii.gz, .nii, .mgz or .label",
        });
    }
    Ok(out.to_path_buf())
}

/// Keeps the ROI voxels that lie on the GMWMI, regridding the ROI onto the
/// GMWMI grid with nearest-neighbour lookup when the grids differ.
pub fn intersect_gmwmi(roi: &RoiVolume, gmwmi: &RoiVolume) -> Result<RoiVolume> {
    let roi = if roi.grid.same_space(&gmwmi.grid) {
        roi.clone()
    } else {
        info!(roi = %roi.name(), from = %roi.grid, to = %gmwmi.grid, "regridding ROI onto GMWMI grid");
        roi.resample_nearest(&gmwmi.grid, &gmwmi.header)
    };
    let intersected = roi.intersect(gmwmi)?;
    if intersected.count() == 0 {
        warn!(roi = %roi.name(), "ROI does not touch the GMWMI; the intersection is empty");
    }
    Ok(RoiVolume {
        source: roi.source.clone(),
        ..intersected
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RegistrationFormat {
    /// ANTs/ITK text transform, converted with `transformconvert`.
    Itk,
    /// MRtrix linear transform, used as-is.
    Mrtrix,
}

/// A linear transform from the anatomical (FreeSurfer) space to diffusion space.
#[derive(Debug, Clone)]
pub struct Registration {
    pub path: PathBuf,
    pub format: RegistrationFormat,
    /// Apply the inverse of the transform.
    pub invert: bool,
}

impl Registration {
    /// Path to an MRtrix-readable transform, converting an ITK file into `converted` when needed.
    pub fn to_mrtrix(&self, tools: &ToolRegistry, converted: &Path, overwrite: bool) -> Result<PathBuf> {
        if !self.path.exists() {
            return Err(Error::MissingInput {
                what: "Registration file",
                path: self.path.clone(),
            });
        }
        match self.format {
            RegistrationFormat::Mrtrix => Ok(self.path.clone()),
            RegistrationFormat::Itk => {
                check_overwrite(&[converted], overwrite)?;
                tools
                    .command("transformconvert")?
                    .arg(&self.path)
                    .arg("itk_import")
                    .arg(converted)
                    .args(force_flag(overwrite))
                    .output(converted)
                    .run()?;
                Ok(converted.to_path_buf())
            }
        }
    }
}

/// Moves a label image onto `template`'s grid through a linear transform.
/// Nearest-neighbour interpolation keeps the result binary.
pub fn apply_registration(
    tools: &ToolRegistry,
    image: &Path,
    transform: &Path,
    invert: bool,
    template: &Path,
    out: &Path,
    overwrite: bool,
) -> Result<PathBuf> {
    check_overwrite(&[out], overwrite)?;
    tools
        .command("mrtransform")?
        .arg(image)
        .arg(out)
        .arg("-linear")
        .arg(transform)
        .args(invert.then_some("-inverse"))
        .arg("-template")
        .arg(template)
        .args(["-interp", "nearest"])
        .args(force_flag(overwrite))
        .output(out)
        .run()?;
    Ok(out.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::VoxelGrid;
    use crate::volume::{header_for_grid, Volume};
    use ndarray::Array3;
    use tempfile::tempdir;

    #[test]
    fn projfrac_parses_and_validates() {
        let p: ProjFrac = "-2,0,0.05".parse().unwrap();
        assert_eq!(p, ProjFrac::default());
        assert!("0,1,0.1".parse::<ProjFrac>().is_err());
        assert!("-1,-2,0.1".parse::<ProjFrac>().is_err());
        assert!("-1,0,0".parse::<ProjFrac>().is_err());
        assert!("-1,0".parse::<ProjFrac>().is_err());
        assert!("-1,zero,0.1".parse::<ProjFrac>().is_err());
    }

    #[test]
    fn hemisphere_lists() {
        assert_eq!(parse_hemispheres("lh").unwrap(), vec![Hemisphere::Lh]);
        assert_eq!(parse_hemispheres("lh,rh").unwrap(), vec![Hemisphere::Lh, Hemisphere::Rh]);
        assert!(parse_hemispheres("left").is_err());
        assert!(parse_hemispheres("lh,rh,lh").is_err());
    }

    #[test]
    fn anat_source_detection() {
        let dir = tempdir().unwrap();
        let fs = dir.path().join("sub-01");
        std::fs::create_dir_all(fs.join("surf")).unwrap();
        assert_eq!(AnatSource::detect(&fs).unwrap().algorithm(), "hsvs");
        assert_eq!(AnatSource::detect(Path::new("T1w.nii.gz")).unwrap().algorithm(), "fsl");
        assert!(AnatSource::detect(Path::new("T1w.mgz")).is_err());
        assert!(FreeSurferSubject::new(dir.path(), "sub-01").is_ok());
        assert!(FreeSurferSubject::new(dir.path(), "sub-02").is_err());
    }

    #[test]
    fn gmwmi_intersection_regrids_roi() {
        let gmwmi_grid = VoxelGrid::scaled([6, 6, 6], 1.0).unwrap();
        let mut gmwmi = Array3::<u8>::zeros((6, 6, 6));
        gmwmi[[2, 2, 2]] = 1;
        gmwmi[[4, 4, 4]] = 1;
        let gmwmi = RoiVolume::from_array(gmwmi, gmwmi_grid);

        // a 2mm ROI whose voxel (1,1,1) covers world (2,2,2)
        let mut roi = Array3::<u8>::zeros((3, 3, 3));
        roi[[1, 1, 1]] = 1;
        let roi = RoiVolume::from_array(roi, VoxelGrid::scaled([3, 3, 3], 2.0).unwrap());

        let out = intersect_gmwmi(&roi, &gmwmi).unwrap();
        assert!(out.grid.same_space(&gmwmi.grid));
        assert_eq!(out.count(), 1);
        assert!(out.contains_voxel([2, 2, 2]));
    }

    #[test]
    fn planned_names_use_space_label() {
        let out = GmwmiOutputs::planned(Path::new("/o"), "sub-01", "FS", None);
        assert_eq!(out.fivett, PathBuf::from("/o/sub-01_space-FS_desc-5tt.nii.gz"));
        assert_eq!(out.gmwmi_bin, PathBuf::from("/o/sub-01_space-FS_rec-binarized_desc-gmwmi.nii.gz"));
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn gmwmi_from_supplied_fivett_is_binarized() {
        let dir = tempdir().unwrap();
        let grid = VoxelGrid::scaled([4, 4, 4], 1.0).unwrap();
        let mut data = Array3::<f64>::zeros((4, 4, 4));
        data[[1, 1, 1]] = 0.8;
        data[[2, 2, 2]] = 0.1;
        let fivett = dir.path().join("5tt.nii.gz");
        Volume {
            data,
            header: header_for_grid(&grid),
            grid,
        }
        .save(&fivett)
        .unwrap();

        let mut tools = ToolRegistry::default();
        tools.insert("5tt2gmwmi", fake_tool(dir.path(), "5tt2gmwmi", "cp \"$1\" \"$2\""));
        let out_dir = dir.path().join("anat");
        let outputs = anat_to_gmwmi(
            &tools,
            &GmwmiOptions {
                anat: dir.path(),
                out_dir: &out_dir,
                subject: "sub-01",
                threshold: 0.5,
                fivett: Some(&fivett),
                space: "FS",
                overwrite: true,
            },
        )
        .unwrap();
        assert_eq!(outputs.fivett, fivett);
        let binary = RoiVolume::load(&outputs.gmwmi_bin).unwrap();
        assert_eq!(binary.count(), 1);
        assert!(binary.contains_voxel([1, 1, 1]));
    }

    #[cfg(unix)]
    #[test]
    fn existing_surface_overlay_is_not_replaced() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("ran.txt");
        let mut tools = ToolRegistry::default();
        tools.insert(
            "mri_vol2surf",
            fake_tool(dir.path(), "mri_vol2surf", &format!("touch {}", log.display())),
        );
        let fs = FreeSurferSubject {
            subjects_dir: dir.path().to_path_buf(),
            subject: "bert".to_string(),
        };
        let roi = dir.path().join("roi.nii.gz");
        std::fs::write(&roi, "x").unwrap();
        let out = dir.path().join("roi_projected.nii.gz");
        let surface = dir.path().join("roi_projected_surf.mgz");
        std::fs::write(&surface, "old").unwrap();

        let result = project_roi(&tools, &roi, &fs, Hemisphere::Lh, ProjFrac::default(), &out, false);
        assert!(matches!(result, Err(Error::OutputExists(p)) if p == surface));
        assert!(!log.exists());
        assert_eq!(std::fs::read_to_string(&surface).unwrap(), "old");
    }

    #[cfg(unix)]
    #[test]
    fn registration_uses_nearest_interpolation() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("args.txt");
        let mut tools = ToolRegistry::default();
        tools.insert(
            "mrtransform",
            fake_tool(dir.path(), "mrtransform", &format!("echo \"$@\" > {}\ncp \"$1\" \"$2\"", log.display())),
        );
        let image = dir.path().join("roi.nii.gz");
        std::fs::write(&image, "x").unwrap();
        let out = dir.path().join("roi_dwi.nii.gz");
        apply_registration(&tools, &image, Path::new("xfm.txt"), true, Path::new("gmwmi.nii.gz"), &out, false)
            .unwrap();
        let args = std::fs::read_to_string(&log).unwrap();
        assert!(args.contains("-interp nearest"));
        assert!(args.contains("-inverse"));
        assert!(!args.contains("-force"));
        assert!(out.exists());
    }
}
