//! The extraction pipeline: GMWMI preparation, ROI projection and
//! intersection, label merge, assignment, extraction, masking and statistics.
//!
//! One [`ExtractorOptions`] value describes a run. Every optional field has a
//! fixed effect when absent, so single- and two-ROI runs, `.tck` and `.trk`
//! input, and weighted and unweighted runs all follow the same path. Stages
//! hand each other typed values (volumes, atlases, bundles) rather than file
//! names; files are written for the record and for downstream tools.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::anat::{
    anat_to_gmwmi, apply_registration, intersect_gmwmi, project_roi, FreeSurferSubject, GmwmiOptions,
    GmwmiOutputs, Hemisphere, ProjFrac, Registration, RegistrationFormat,
};
use crate::assign::{assign, SearchKind, SearchPolicy};
use crate::edit::{apply_masks, Masks};
use crate::error::{Error, Result};
use crate::extract::{extract, Bundle, RegionMode};
use crate::layout::{has_extension, stem, OutputKind, OutputLayout};
use crate::merge::{merge, LabeledAtlas};
use crate::stats::{bundle_stats, ScalarInput, ScalarReport};
use crate::tools::ToolRegistry;
use crate::tractogram::{trk, TractFormat, Tractogram};
use crate::volume::{MaskVolume, RoiVolume, Volume};
use crate::weights::Weights;

/// Extensions accepted for ROIs before projection.
const ROI_EXTENSIONS: [&str; 4] = [".nii.gz", ".nii", ".mgz", ".label"];
/// Extensions accepted for ROIs that are used as volumes directly.
const VOLUME_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    PrepareGmwmi,
    ProjectRois,
    IntersectGmwmi,
    MergeLabels,
    LoadTractogram,
    Assign,
    Extract,
    Mask,
    Stats,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Validate => "validate inputs",
            Stage::PrepareGmwmi => "prepare GMWMI",
            Stage::ProjectRois => "project ROIs",
            Stage::IntersectGmwmi => "intersect ROIs with GMWMI",
            Stage::MergeLabels => "merge ROI labels",
            Stage::LoadTractogram => "load tractogram",
            Stage::Assign => "assign streamlines",
            Stage::Extract => "extract sub-bundle",
            Stage::Mask => "apply masks",
            Stage::Stats => "bundle statistics",
        })
    }
}

/// Runs `body` as `stage`, tagging any error with the stage.
fn stage<T>(stage: Stage, body: impl FnOnce() -> Result<T>) -> Result<T> {
    info!(%stage, "starting stage");
    body().map_err(|e| e.in_stage(stage))
}

/// Scalar statistics to compute on the final bundle.
#[derive(Debug, Clone)]
pub struct StatsOptions {
    pub scalars: Vec<ScalarInput>,
    pub n_points: usize,
}

/// Everything one extraction run needs.
#[derive(Debug, Clone)]
pub struct ExtractorOptions {
    pub subject: String,
    /// Whole-brain tractogram, `.tck` or `.trk`.
    pub tract: PathBuf,
    pub roi1: PathBuf,
    /// Second ROI; absent means single-region extraction.
    pub roi2: Option<PathBuf>,
    /// Reference image for `.trk` files without a usable affine.
    pub trk_ref: Option<PathBuf>,
    /// FreeSurfer subjects directory, needed for projection and GMWMI creation.
    pub fs_dir: Option<PathBuf>,
    /// One hemisphere per ROI, or one for both. Needed for projection.
    pub hemis: Vec<Hemisphere>,
    pub projfrac: ProjFrac,
    /// Existing GMWMI; absent (or missing on disk) means one is generated.
    pub gmwmi: Option<PathBuf>,
    pub gmwmi_threshold: f64,
    pub skip_roi_projection: bool,
    pub skip_gmwmi_intersection: bool,
    /// Transform applied to projected ROIs; absent means they are already in tractogram space.
    pub registration: Option<Registration>,
    pub search_kind: SearchKind,
    pub search_dist: Option<f64>,
    /// Per-streamline weights; absent means every streamline weighs 1.
    pub weights: Option<PathBuf>,
    pub exclude_mask: Option<PathBuf>,
    pub include_mask: Option<PathBuf>,
    pub streamline_mask: Option<PathBuf>,
    pub out_dir: PathBuf,
    /// Space label of the outputs.
    pub space: String,
    pub overwrite: bool,
    pub tool_config: Option<PathBuf>,
    pub stats: Option<StatsOptions>,
}

impl ExtractorOptions {
    /// Options with the defaults of the command-line tool: radial search of
    /// 4 mm, projection and GMWMI intersection enabled, overwrite on.
    pub fn new(subject: &str, tract: &Path, roi1: &Path, out_dir: &Path) -> Self {
        Self {
            subject: subject.to_string(),
            tract: tract.to_path_buf(),
            roi1: roi1.to_path_buf(),
            roi2: None,
            trk_ref: None,
            fs_dir: None,
            hemis: Vec::new(),
            projfrac: ProjFrac::default(),
            gmwmi: None,
            gmwmi_threshold: 0.0,
            skip_roi_projection: false,
            skip_gmwmi_intersection: false,
            registration: None,
            search_kind: SearchKind::Radial,
            search_dist: Some(4.0),
            weights: None,
            exclude_mask: None,
            include_mask: None,
            streamline_mask: None,
            out_dir: out_dir.to_path_buf(),
            space: "DWI".to_string(),
            overwrite: true,
            tool_config: None,
            stats: None,
        }
    }

    fn rois(&self) -> Vec<&Path> {
        std::iter::once(self.roi1.as_path())
            .chain(self.roi2.as_deref())
            .collect()
    }

    fn hemi_for(&self, roi_index: usize) -> Option<Hemisphere> {
        match roi_index {
            0 => self.hemis.first().copied(),
            _ => self.hemis.last().copied(),
        }
    }

    fn needs_gmwmi_creation(&self) -> bool {
        !self.skip_gmwmi_intersection && self.gmwmi.as_deref().map_or(true, |g| !g.exists())
    }
}

/// Artifacts and counts of one run.
#[derive(Debug, Clone, Default)]
pub struct ExtractionReport {
    pub gmwmi: Option<PathBuf>,
    pub generated_gmwmi: Option<GmwmiOutputs>,
    /// ROI volumes as they entered the label merge.
    pub rois: Vec<PathBuf>,
    pub atlas: Option<PathBuf>,
    pub assignments: PathBuf,
    pub connectome: PathBuf,
    pub input_streamlines: usize,
    pub assigned_streamlines: usize,
    pub extracted: PathBuf,
    pub extracted_streamlines: usize,
    pub extracted_weights: Option<PathBuf>,
    pub masked: Option<PathBuf>,
    pub masked_streamlines: Option<usize>,
    pub masked_weights: Option<PathBuf>,
    /// The bundle every later consumer should use.
    pub final_bundle: PathBuf,
    pub final_streamlines: usize,
    /// Summed weight of the final bundle, when weights were given.
    pub final_weight: Option<f64>,
    pub stats: Vec<ScalarReport>,
}

impl ExtractionReport {
    pub fn is_empty(&self) -> bool {
        self.final_streamlines == 0
    }
}

/// What validation resolved for the later stages.
struct Plan {
    policy: SearchPolicy,
    fs: Option<FreeSurferSubject>,
    tools: ToolRegistry,
    /// Existing GMWMI to use as-is.
    gmwmi: Option<PathBuf>,
    layout: OutputLayout,
    tract_format: TractFormat,
}

/// Inputs read during validation, handed to the stage that consumes them.
struct Inputs {
    tractogram: Tractogram,
    weights: Option<Weights>,
    /// ROI volumes, when they are used without projection.
    rois: Option<Vec<RoiVolume>>,
    /// The supplied GMWMI, when one exists and intersection is on.
    gmwmi: Option<RoiVolume>,
    exclude: Option<MaskVolume>,
    include: Option<MaskVolume>,
    bound: Option<MaskVolume>,
}

/// Checks every input before anything is computed or written.
fn validate(opts: &ExtractorOptions) -> Result<(Plan, Inputs)> {
    let policy = SearchPolicy::new(opts.search_kind, opts.search_dist)?;

    for (i, roi) in opts.rois().into_iter().enumerate() {
        if !roi.exists() {
            return Err(Error::MissingInput {
                what: "ROI file",
                path: roi.to_path_buf(),
            });
        }
        let allowed: &[&str] = if opts.skip_roi_projection {
            &VOLUME_EXTENSIONS[..]
        } else {
            &ROI_EXTENSIONS[..]
        };
        if !has_extension(roi, allowed) {
            return Err(Error::UnsupportedFileType {
                what: "ROI file",
                path: roi.to_path_buf(),
                expected: if opts.skip_roi_projection {
                    ".nii.gz or .nii when projection is skipped"
                } else {
                    ".nii.gz, .nii, .mgz or .label"
                },
            });
        }
        if !opts.skip_roi_projection && opts.hemi_for(i).is_none() {
            return Err(Error::InvalidArgument(
                "a hemisphere must be given for every ROI unless ROI projection is skipped".into(),
            ));
        }
    }
    if opts.hemis.len() > 2 {
        return Err(Error::InvalidArgument(
            "at most one hemisphere per ROI may be given".into(),
        ));
    }

    if !opts.tract.exists() {
        return Err(Error::MissingInput {
            what: "Tract file",
            path: opts.tract.clone(),
        });
    }
    let tract_format = TractFormat::from_path(&opts.tract)?;
    if tract_format == TractFormat::Trk && opts.trk_ref.is_none() && !trk::read_header(&opts.tract)?.has_affine() {
        return Err(Error::MissingReference {
            path: opts.tract.clone(),
        });
    }

    let mut gmwmi = opts.gmwmi.clone();
    if let Some(path) = &opts.gmwmi {
        if !path.exists() {
            warn!(
                path = %path.display(),
                "GMWMI was given but not found; a new one will be created from the FreeSurfer input"
            );
            gmwmi = None;
        }
    }
    let needs_fs = !opts.skip_roi_projection || opts.needs_gmwmi_creation();
    let fs = if needs_fs {
        let fs_dir = opts.fs_dir.as_deref().ok_or_else(|| {
            Error::InvalidArgument(
                "a FreeSurfer directory is required to project ROIs or create a GMWMI".into(),
            )
        })?;
        Some(FreeSurferSubject::new(fs_dir, &opts.subject)?)
    } else {
        None
    };

    let optional_inputs = [
        ("Reference image", opts.trk_ref.as_deref()),
        ("Weights file", opts.weights.as_deref()),
        ("Exclusion mask", opts.exclude_mask.as_deref()),
        ("Inclusion mask", opts.include_mask.as_deref()),
        ("Streamline mask", opts.streamline_mask.as_deref()),
        ("Registration file", opts.registration.as_ref().map(|r| r.path.as_path())),
    ];
    for (what, path) in optional_inputs {
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::MissingInput {
                    what,
                    path: path.to_path_buf(),
                });
            }
        }
    }
    if opts.registration.is_some() && opts.skip_gmwmi_intersection && opts.trk_ref.is_none() {
        return Err(Error::InvalidArgument(
            "registering ROIs needs a template grid: a GMWMI or a --trk-ref image".into(),
        ));
    }
    if let Some(stats) = &opts.stats {
        if stats.n_points < 2 {
            return Err(Error::InvalidArgument(format!(
                "number of profile points ({}) must be larger than 1",
                stats.n_points
            )));
        }
    }

    let tools = ToolRegistry::discover(opts.tool_config.as_deref())?;
    tools.require(&required_tools(opts))?;

    let inputs = read_inputs(opts, gmwmi.as_deref())?;
    let plan = Plan {
        policy,
        fs,
        tools,
        gmwmi,
        layout: OutputLayout::new(&opts.out_dir, &opts.subject, &opts.space, opts.overwrite),
        tract_format,
    };
    Ok((plan, inputs))
}

/// Reads the tractogram, weights, volumetric ROIs, supplied GMWMI and masks,
/// and checks that they agree with each other.
///
/// The atlas grid is known up front when a supplied GMWMI is intersected
/// (ROIs are regridded onto it) or when the ROIs are used as given (ROI 2 is
/// regridded onto ROI 1). Otherwise it only exists after projection, and the
/// tractogram and masks are checked against it in the later stages.
fn read_inputs(opts: &ExtractorOptions, gmwmi: Option<&Path>) -> Result<Inputs> {
    let reference = opts
        .trk_ref
        .as_deref()
        .map(Volume::load)
        .transpose()?
        .map(|v| v.grid);
    let tractogram = Tractogram::load(&opts.tract, reference.as_ref())?;
    let weights = opts.weights.as_deref().map(Weights::load).transpose()?;
    if let Some(w) = &weights {
        w.ensure_len(tractogram.len())?;
        info!(total = w.sum(), "loaded streamline weights");
    }

    let rois = if opts.skip_roi_projection {
        Some(
            opts.rois()
                .into_iter()
                .map(RoiVolume::load)
                .collect::<Result<Vec<_>>>()?,
        )
    } else {
        None
    };
    let gmwmi = match gmwmi {
        Some(path) if !opts.skip_gmwmi_intersection => {
            Some(RoiVolume::load_thresholded(path, opts.gmwmi_threshold)?)
        }
        _ => None,
    };
    let atlas_grid = gmwmi
        .as_ref()
        .map(|g| (&g.grid, "GMWMI"))
        .or_else(|| rois.as_ref().and_then(|r| r.first()).map(|r| (&r.grid, "ROI 1")));

    if let (Some(tract_grid), Some((grid, name))) = (&tractogram.reference, atlas_grid) {
        tract_grid.ensure_same_space(grid, format!("tractogram {} against {name}", opts.tract.display()))?;
    }

    let load_mask = |path: &Option<PathBuf>| -> Result<Option<MaskVolume>> {
        path.as_deref()
            .map(|p| RoiVolume::load_thresholded(p, 0.0))
            .transpose()
    };
    let exclude = load_mask(&opts.exclude_mask)?;
    let include = load_mask(&opts.include_mask)?;
    let bound = load_mask(&opts.streamline_mask)?;
    let expected = tractogram
        .reference
        .as_ref()
        .map(|g| (g, "tractogram"))
        .or(atlas_grid);
    let masks = [("exclusion mask", &exclude), ("inclusion mask", &include), ("streamline mask", &bound)];
    let mut first_mask: Option<&MaskVolume> = None;
    for (what, mask) in masks {
        let Some(mask) = mask else { continue };
        match (expected, first_mask) {
            (Some((grid, name)), _) => {
                mask.grid
                    .ensure_same_space(grid, format!("{what} {} against {name}", mask.name()))?
            }
            (None, Some(first)) => mask
                .grid
                .ensure_same_space(&first.grid, format!("{what} {} against {}", mask.name(), first.name()))?,
            (None, None) => {}
        }
        first_mask.get_or_insert(mask);
    }

    Ok(Inputs {
        tractogram,
        weights,
        rois,
        gmwmi,
        exclude,
        include,
        bound,
    })
}

/// External tools the run will call, so a missing one fails before any work.
fn required_tools(opts: &ExtractorOptions) -> Vec<&'static str> {
    let mut tools = Vec::new();
    if opts.needs_gmwmi_creation() {
        tools.push("5tt2gmwmi");
        tools.push("5ttgen");
    }
    if !opts.skip_roi_projection {
        for roi in opts.rois() {
            if has_extension(roi, &VOLUME_EXTENSIONS) {
                tools.push("mri_vol2surf");
                tools.push("mri_surf2vol");
            } else if has_extension(roi, &[".label"]) {
                tools.push("mri_label2vol");
            } else {
                tools.push("mri_surf2vol");
            }
        }
        if let Some(reg) = &opts.registration {
            tools.push("mrtransform");
            if reg.format == RegistrationFormat::Itk {
                tools.push("transformconvert");
            }
        }
    }
    tools.sort_unstable();
    tools.dedup();
    tools
}

/// Runs the whole pipeline.
///
/// An empty final bundle is not an error here; check
/// [`ExtractionReport::is_empty`].
pub fn run(opts: &ExtractorOptions) -> Result<ExtractionReport> {
    let (plan, inputs) = stage(Stage::Validate, || validate(opts))?;
    let layout = &plan.layout;
    stage(Stage::Validate, || layout.create_dirs())?;
    let mut report = ExtractionReport::default();
    let Inputs {
        tractogram,
        weights,
        rois: volumetric_rois,
        gmwmi: supplied_gmwmi,
        exclude,
        include,
        bound,
    } = inputs;

    let gmwmi = stage(Stage::PrepareGmwmi, || prepare_gmwmi(opts, &plan, supplied_gmwmi, &mut report))?;
    let projected = stage(Stage::ProjectRois, || {
        project_rois(opts, &plan, volumetric_rois, report.gmwmi.as_deref())
    })?;
    let rois = stage(Stage::IntersectGmwmi, || {
        intersect_rois(opts, layout, projected, gmwmi.as_ref(), &mut report)
    })?;
    let atlas = stage(Stage::MergeLabels, || merge_labels(opts, layout, rois, &mut report))?;
    let tractogram = stage(Stage::LoadTractogram, || attach_atlas(opts, tractogram, &atlas))?;
    report.input_streamlines = tractogram.len();

    let desc = bundle_desc(opts);
    let desc: Vec<&str> = desc.iter().map(String::as_str).collect();
    let ext = plan.tract_format.extension();

    let table = stage(Stage::Assign, || {
        let assignments = layout.path(OutputKind::Dwi, None, &desc_with(&desc, &["assignments"]), "txt");
        let connectome = layout.path(OutputKind::Dwi, None, &desc_with(&desc, &["connectome"]), "csv");
        layout.check(&[&assignments, &connectome])?;
        let (table, connectome_matrix) = assign(&tractogram, &atlas, plan.policy, weights.as_ref())?;
        table.save(&assignments)?;
        connectome_matrix.save(&connectome)?;
        report.assignments = assignments;
        report.connectome = connectome;
        report.assigned_streamlines = table.assigned();
        Ok(table)
    })?;

    let extracted = stage(Stage::Extract, || {
        let out = layout.path(OutputKind::Dwi, None, &desc_with(&desc, &["fsub"]), ext);
        let out_weights = layout.path(OutputKind::Dwi, None, &desc_with(&desc, &["fsub", "weights"]), "csv");
        layout.check(&[&out, &out_weights])?;
        let bundle = extract(
            &tractogram,
            &table,
            RegionMode::from_two_regions(atlas.two_regions),
            weights.as_ref(),
        )?;
        write_bundle(&bundle, &out, &out_weights)?;
        report.extracted = out;
        report.extracted_streamlines = bundle.len();
        report.extracted_weights = bundle.weights.as_ref().map(|_| out_weights);
        Ok(bundle)
    })?;
    report.final_bundle = report.extracted.clone();

    let masks = Masks {
        exclude: exclude.as_ref(),
        include: include.as_ref(),
        bound: bound.as_ref(),
    };
    let final_bundle = stage(Stage::Mask, || mask_bundle(layout, &desc, ext, masks, extracted, &mut report))?;
    report.final_streamlines = final_bundle.len();
    report.final_weight = final_bundle.weights.as_ref().map(Weights::sum);
    if final_bundle.is_empty() {
        warn!("the final sub-bundle is empty");
    }
    if let Some(total) = report.final_weight {
        info!(total_weight = total, "summed weight of the final sub-bundle");
    }

    if let Some(stats) = &opts.stats {
        if final_bundle.is_empty() {
            warn!("skipping bundle statistics for an empty bundle");
        } else {
            report.stats = stage(Stage::Stats, || {
                let named = layout.path(OutputKind::Dwi, None, &desc_with(&desc, &["fsub"]), "txt");
                let base = format!("{}_", named.with_extension("").display());
                bundle_stats(
                    &final_bundle.tractogram,
                    &report.final_bundle,
                    &stats.scalars,
                    final_bundle.weights.as_ref(),
                    stats.n_points,
                    &base,
                    opts.overwrite,
                )
            })?;
        }
    }

    info!(
        bundle = %report.final_bundle.display(),
        streamlines = report.final_streamlines,
        "extraction finished"
    );
    Ok(report)
}

/// `desc` entity parts naming the bundle: tract, then each ROI.
fn bundle_desc(opts: &ExtractorOptions) -> Vec<String> {
    std::iter::once(stem(&opts.tract))
        .chain(opts.rois().into_iter().map(stem))
        .collect()
}

fn desc_with<'a>(desc: &[&'a str], extra: &[&'a str]) -> Vec<&'a str> {
    desc.iter().chain(extra).copied().collect()
}

fn prepare_gmwmi(
    opts: &ExtractorOptions,
    plan: &Plan,
    supplied: Option<RoiVolume>,
    report: &mut ExtractionReport,
) -> Result<Option<RoiVolume>> {
    if opts.skip_gmwmi_intersection {
        info!("skipping GMWMI intersection");
        return Ok(None);
    }
    if let (Some(gmwmi), Some(path)) = (supplied, &plan.gmwmi) {
        info!(path = %path.display(), "using supplied GMWMI");
        report.gmwmi = Some(path.clone());
        return Ok(Some(gmwmi));
    }
    let path = match &plan.fs {
        Some(fs) => {
            let anat_dir = plan.layout.dir(OutputKind::Anat);
            let outputs = anat_to_gmwmi(
                &plan.tools,
                &GmwmiOptions {
                    anat: &fs.dir(),
                    out_dir: &anat_dir,
                    subject: &opts.subject,
                    threshold: opts.gmwmi_threshold,
                    fivett: None,
                    space: &opts.space,
                    overwrite: opts.overwrite,
                },
            )?;
            let binarized = outputs.gmwmi_bin.clone();
            report.generated_gmwmi = Some(outputs);
            binarized
        }
        None => {
            return Err(Error::InvalidArgument(
                "a GMWMI cannot be created without a FreeSurfer directory".into(),
            ))
        }
    };
    let gmwmi = RoiVolume::load_thresholded(&path, opts.gmwmi_threshold)?;
    report.gmwmi = Some(path);
    Ok(Some(gmwmi))
}

/// ROI volumes ready for intersection, one per input ROI.
fn project_rois(
    opts: &ExtractorOptions,
    plan: &Plan,
    volumetric: Option<Vec<RoiVolume>>,
    gmwmi: Option<&Path>,
) -> Result<Vec<RoiVolume>> {
    if let Some(rois) = volumetric {
        info!("skipping ROI projection");
        return Ok(rois);
    }
    let fs = plan.fs.as_ref().ok_or_else(|| {
        Error::InvalidArgument("ROI projection needs a FreeSurfer directory".into())
    })?;
    let layout = &plan.layout;

    let transform = match &opts.registration {
        Some(reg) => {
            let converted = layout.path(OutputKind::Anat, None, &["fs2dwi", "xfm"], "txt");
            Some(reg.to_mrtrix(&plan.tools, &converted, opts.overwrite)?)
        }
        None => None,
    };

    let mut rois = Vec::new();
    for (i, roi) in opts.rois().into_iter().enumerate() {
        let hemi = opts.hemi_for(i).ok_or_else(|| {
            Error::InvalidArgument(format!("no hemisphere given for {}", roi.display()))
        })?;
        let roi_stem = stem(roi);
        let projected = layout.path(OutputKind::Func, None, &[&roi_stem, "projected"], "nii.gz");
        layout.check(&[&projected])?;
        info!(roi = %roi.display(), %hemi, "projecting ROI into white matter");
        let mut path = project_roi(&plan.tools, roi, fs, hemi, opts.projfrac, &projected, opts.overwrite)?;

        if let (Some(reg), Some(transform)) = (&opts.registration, &transform) {
            let template = gmwmi.or(opts.trk_ref.as_deref()).ok_or_else(|| {
                Error::InvalidArgument("registering ROIs needs a GMWMI or reference image".into())
            })?;
            let registered = layout.path(OutputKind::Func, None, &[&roi_stem, "projected", "registered"], "nii.gz");
            path = apply_registration(
                &plan.tools,
                &path,
                transform,
                reg.invert,
                template,
                &registered,
                opts.overwrite,
            )?;
        }
        let mut volume = RoiVolume::load_thresholded(&path, 0.0)?;
        volume.source = Some(path);
        rois.push(volume);
    }
    Ok(rois)
}

fn intersect_rois(
    opts: &ExtractorOptions,
    layout: &OutputLayout,
    rois: Vec<RoiVolume>,
    gmwmi: Option<&RoiVolume>,
    report: &mut ExtractionReport,
) -> Result<Vec<RoiVolume>> {
    let Some(gmwmi) = gmwmi else {
        report.rois = rois.iter().filter_map(|r| r.source.clone()).collect();
        return Ok(rois);
    };
    let names: Vec<String> = opts.rois().into_iter().map(stem).collect();
    let outputs: Vec<PathBuf> = names
        .iter()
        .map(|name| layout.path(OutputKind::Func, None, &[name, "gmwmi", "intersected"], "nii.gz"))
        .collect();
    layout.check(&outputs.iter().map(PathBuf::as_path).collect::<Vec<_>>())?;

    let mut intersected = Vec::with_capacity(rois.len());
    for (roi, out) in rois.iter().zip(outputs) {
        let mut result = intersect_gmwmi(roi, gmwmi)?;
        info!(roi = %roi.name(), voxels = result.count(), "intersected ROI with GMWMI");
        result.save(&out)?;
        result.source = Some(out.clone());
        report.rois.push(out);
        intersected.push(result);
    }
    Ok(intersected)
}

fn merge_labels(
    opts: &ExtractorOptions,
    layout: &OutputLayout,
    mut rois: Vec<RoiVolume>,
    report: &mut ExtractionReport,
) -> Result<LabeledAtlas> {
    let roi2 = if rois.len() > 1 { rois.pop() } else { None };
    let roi1 = rois.pop().ok_or_else(|| Error::InvalidArgument("no ROI to merge".into()))?;
    let Some(roi2) = roi2 else {
        return merge(&roi1, None);
    };

    let out = layout.path(OutputKind::Func, None, &["rois", "merged"], "nii.gz");
    layout.check(&[&out])?;
    let roi2 = if roi2.grid.same_space(&roi1.grid) {
        roi2
    } else {
        info!(from = %roi2.grid, to = %roi1.grid, "regridding ROI 2 onto ROI 1");
        roi2.resample_nearest(&roi1.grid, &roi1.header)
    };
    let atlas = merge(&roi1, Some(&roi2))?;
    atlas.save(&out)?;
    info!(path = %out.display(), roi2 = ?opts.roi2, "wrote labelled atlas");
    report.atlas = Some(out);
    Ok(atlas)
}

/// Places a tractogram without its own reference on the atlas grid.
fn attach_atlas(opts: &ExtractorOptions, tractogram: Tractogram, atlas: &LabeledAtlas) -> Result<Tractogram> {
    let tractogram = tractogram.with_reference(&atlas.grid);
    tractogram.ensure_space(&atlas.grid, &format!("tractogram {} against the ROI atlas", opts.tract.display()))?;
    Ok(tractogram)
}

fn write_bundle(bundle: &Bundle, out: &Path, out_weights: &Path) -> Result<()> {
    bundle.tractogram.save(out)?;
    if let Some(w) = &bundle.weights {
        w.save(out_weights)?;
    }
    info!(path = %out.display(), streamlines = bundle.len(), "wrote bundle");
    Ok(())
}

fn mask_bundle(
    layout: &OutputLayout,
    desc: &[&str],
    ext: &str,
    masks: Masks<'_>,
    extracted: Bundle,
    report: &mut ExtractionReport,
) -> Result<Bundle> {
    if masks.is_empty() {
        return Ok(extracted);
    }

    let out = layout.path(OutputKind::Dwi, Some("masked"), &desc_with(desc, &["fsub"]), ext);
    let out_weights = layout.path(OutputKind::Dwi, Some("masked"), &desc_with(desc, &["fsub", "weights"]), "csv");
    layout.check(&[&out, &out_weights])?;
    let masked = apply_masks(&extracted.tractogram, masks, extracted.weights.as_ref())?;
    write_bundle(&masked, &out, &out_weights)?;
    report.masked_streamlines = Some(masked.len());
    report.masked_weights = masked.weights.as_ref().map(|_| out_weights);
    report.final_bundle = out.clone();
    report.masked = Some(out);
    Ok(masked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wraps_once() {
        let err = stage(Stage::Assign, || -> Result<()> { Err(Error::EmptyBundle) }).unwrap_err();
        let err = err.in_stage(Stage::Extract);
        match err {
            Error::Stage { stage, source } => {
                assert_eq!(stage, Stage::Assign);
                assert!(matches!(*source, Error::EmptyBundle));
            }
            other => panic!("expected a stage error, got {:?}", other),
        }
    }

    #[test]
    fn required_tools_follow_options() {
        let mut opts = ExtractorOptions::new("sub-01", Path::new("t.tck"), Path::new("a.label"), Path::new("out"));
        opts.roi2 = Some(PathBuf::from("b.nii.gz"));
        opts.gmwmi = Some(PathBuf::from("/nonexistent/gmwmi.nii.gz"));
        assert_eq!(
            required_tools(&opts),
            vec!["5tt2gmwmi", "5ttgen", "mri_label2vol", "mri_surf2vol", "mri_vol2surf"]
        );

        opts.skip_roi_projection = true;
        opts.skip_gmwmi_intersection = true;
        assert!(required_tools(&opts).is_empty());
    }

    #[test]
    fn second_hemisphere_defaults_to_first() {
        let mut opts = ExtractorOptions::new("s", Path::new("t.tck"), Path::new("a.label"), Path::new("o"));
        opts.hemis = vec![Hemisphere::Rh];
        assert_eq!(opts.hemi_for(1), Some(Hemisphere::Rh));
        opts.hemis = vec![Hemisphere::Lh, Hemisphere::Rh];
        assert_eq!(opts.hemi_for(0), Some(Hemisphere::Lh));
        assert_eq!(opts.hemi_for(1), Some(Hemisphere::Rh));
    }

    #[test]
    fn bad_search_distance_fails_validation() {
        let mut opts = ExtractorOptions::new("s", Path::new("t.tck"), Path::new("a.nii.gz"), Path::new("o"));
        opts.search_kind = SearchKind::Forward;
        opts.search_dist = Some(0.0);
        match stage(Stage::Validate, || validate(&opts).map(|_| ())) {
            Err(Error::Stage { stage, source }) => {
                assert_eq!(stage, Stage::Validate);
                assert!(matches!(*source, Error::InvalidSearchDistance { .. }));
            }
            other => panic!("expected a validation error, got {:?}", other),
        }
    }
}
