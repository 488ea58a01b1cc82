//! Extract a functionally defined white-matter sub-bundle.
//!
//! Takes a whole-brain tractogram and one or two gray-matter ROIs, projects
//! the ROIs into the white matter, intersects them with the gray-matter /
//! white-matter interface, and keeps the streamlines that connect them.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fsub_extractor::anat::{parse_hemispheres, ProjFrac, Registration, RegistrationFormat};
use fsub_extractor::pipeline::{run, ExtractorOptions, StatsOptions};
use fsub_extractor::stats::scalar_inputs;
use fsub_extractor::{Error, SearchKind};

#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Args {
    /// Subject name, used as the prefix of every output file.
    #[arg(long)]
    subject: String,

    /// Whole-brain tractogram, .tck or .trk.
    #[arg(long)]
    tract: PathBuf,

    /// Reference image for a .trk tractogram whose header has no affine.
    #[arg(long)]
    trk_ref: Option<PathBuf>,

    /// First ROI: .nii.gz, .nii, .mgz surface overlay or .label.
    #[arg(long)]
    roi1: PathBuf,

    /// Second ROI. Without it, streamlines touching ROI 1 are kept.
    #[arg(long)]
    roi2: Option<PathBuf>,

    /// FreeSurfer subjects directory; required for ROI projection and GMWMI creation.
    #[arg(long)]
    fs_dir: Option<PathBuf>,

    /// Hemisphere of each ROI: lh, rh, or a pair like lh,rh.
    #[arg(long)]
    hemi: Option<String>,

    /// Cortical thickness fractions for projection: start,stop,delta.
    #[arg(long, default_value = "-2,0,0.05", allow_hyphen_values = true)]
    projfrac: String,

    /// Existing gray-matter / white-matter interface. Created when absent or missing.
    #[arg(long)]
    gmwmi: Option<PathBuf>,

    /// GMWMI voxels above this value count as interface.
    #[arg(long, default_value_t = 0.0)]
    gmwmi_thresh: f64,

    /// Use the ROIs as given instead of projecting them into the white matter.
    #[arg(long)]
    skip_roi_projection: bool,

    /// Do not intersect the ROIs with the GMWMI.
    #[arg(long)]
    skip_gmwmi_intersection: bool,

    /// Transform from FreeSurfer space to the tractogram space, applied to projected ROIs.
    #[arg(long)]
    reg: Option<PathBuf>,

    /// Format of the --reg file.
    #[arg(long, value_enum, default_value = "itk")]
    reg_type: RegistrationFormat,

    /// Apply the inverse of the --reg transform.
    #[arg(long)]
    reg_invert: bool,

    /// How streamline endpoints are matched to the ROIs.
    #[arg(long, value_enum, default_value = "radial")]
    search_type: SearchKind,

    /// Search distance in mm for the forward, reverse and radial searches.
    #[arg(long, default_value_t = 4.0)]
    search_dist: f64,

    /// Per-streamline weights (e.g. SIFT2); the extracted weights are written alongside.
    #[arg(long)]
    sift2_weights: Option<PathBuf>,

    /// Drop streamlines entering this mask.
    #[arg(long)]
    exclude_mask: Option<PathBuf>,

    /// Keep only streamlines entering this mask.
    #[arg(long)]
    include_mask: Option<PathBuf>,

    /// Truncate streamlines where they leave this mask.
    #[arg(long)]
    streamline_mask: Option<PathBuf>,

    /// Comma-separated scalar maps to sample along the final bundle.
    #[arg(long)]
    scalars: Option<String>,

    /// Comma-separated names for the scalar maps, in the same order.
    #[arg(long)]
    scalar_names: Option<String>,

    /// Number of nodes in each tract profile.
    #[arg(long, default_value_t = 100)]
    n_points: usize,

    /// Output directory; files land in <out-dir>/<subject>/{anat,func,dwi}.
    #[arg(long, default_value = "./")]
    out_dir: PathBuf,

    /// Space label written into output names.
    #[arg(long, default_value = "DWI")]
    space: String,

    /// Refuse to replace existing outputs.
    #[arg(long)]
    no_overwrite: bool,

    /// Exit with an error when no streamline survives.
    #[arg(long)]
    fail_on_empty: bool,

    /// TOML file mapping tool names to executables.
    #[arg(long)]
    tool_config: Option<PathBuf>,

    /// Log debug messages.
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn options(args: Args) -> Result<(ExtractorOptions, bool), Error> {
    let mut opts = ExtractorOptions::new(&args.subject, &args.tract, &args.roi1, &args.out_dir);
    opts.roi2 = args.roi2;
    opts.trk_ref = args.trk_ref;
    opts.fs_dir = args.fs_dir;
    opts.hemis = match args.hemi.as_deref() {
        Some(h) => parse_hemispheres(h)?,
        None => Vec::new(),
    };
    opts.projfrac = args.projfrac.parse::<ProjFrac>()?;
    opts.gmwmi = args.gmwmi;
    opts.gmwmi_threshold = args.gmwmi_thresh;
    opts.skip_roi_projection = args.skip_roi_projection;
    opts.skip_gmwmi_intersection = args.skip_gmwmi_intersection;
    opts.registration = args.reg.map(|path| Registration {
        path,
        format: args.reg_type,
        invert: args.reg_invert,
    });
    opts.search_kind = args.search_type;
    opts.search_dist = Some(args.search_dist);
    opts.weights = args.sift2_weights;
    opts.exclude_mask = args.exclude_mask;
    opts.include_mask = args.include_mask;
    opts.streamline_mask = args.streamline_mask;
    opts.space = args.space;
    opts.overwrite = !args.no_overwrite;
    opts.tool_config = args.tool_config;
    opts.stats = match args.scalars.as_deref() {
        Some(paths) => Some(StatsOptions {
            scalars: scalar_inputs(paths, args.scalar_names.as_deref())?,
            n_points: args.n_points,
        }),
        None => None,
    };
    Ok((opts, args.fail_on_empty))
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let (opts, fail_on_empty) = options(args).unwrap_or_else(|e| {
        error!("Error! {}", e);
        std::process::exit(-2);
    });
    let report = run(&opts).unwrap_or_else(|e| {
        error!("Error! {}", e);
        std::process::exit(-2);
    });

    if report.is_empty() && fail_on_empty {
        error!("Error! {}", Error::EmptyBundle);
        std::process::exit(-2);
    }
    info!(
        input = report.input_streamlines,
        assigned = report.assigned_streamlines,
        extracted = report.extracted_streamlines,
        kept = report.final_streamlines,
        bundle = %report.final_bundle.display(),
        "done"
    );
}
