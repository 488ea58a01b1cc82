//! Sample scalar maps along a bundle: per-streamline means, summary statistics
//! and a tract profile for each scalar.
//!
//! Either one `--tract` or a `--tract-glob` pattern is given. With a pattern,
//! every matching bundle is processed and its outputs are prefixed with the
//! bundle's file stem.

use clap::Parser;
use glob::glob;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fsub_extractor::layout::stem;
use fsub_extractor::stats::{bundle_stats, scalar_inputs, ScalarInput};
use fsub_extractor::{Error, Tractogram, Volume, Weights};

#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Args {
    /// Bundle to sample, .tck or .trk.
    #[arg(long, required_unless_present = "tract_glob", conflicts_with = "tract_glob")]
    tract: Option<PathBuf>,

    /// Glob pattern of bundles to sample in turn, e.g. "out/*/dwi/*_desc-*Fsub.tck".
    #[arg(long)]
    tract_glob: Option<String>,

    /// Reference image for .trk bundles without a header affine.
    #[arg(long)]
    trk_ref: Option<PathBuf>,

    /// Comma-separated scalar maps (.nii.gz or .nii).
    #[arg(long)]
    scalar_paths: String,

    /// Comma-separated names for the scalar maps. Defaults to the file stems.
    #[arg(long)]
    scalar_names: Option<String>,

    /// Per-streamline weights of the bundle; enables the weighted mean.
    #[arg(long, conflicts_with = "tract_glob")]
    sift2_weights: Option<PathBuf>,

    /// Number of nodes in each tract profile.
    #[arg(long, default_value_t = 100)]
    n_points: usize,

    /// Output directory.
    #[arg(long, default_value = "./")]
    out_dir: PathBuf,

    /// Prefix of every output file. Defaults to the bundle's file stem.
    #[arg(long)]
    out_prefix: Option<String>,

    /// Refuse to replace existing outputs.
    #[arg(long)]
    no_overwrite: bool,

    /// Log debug messages.
    #[arg(short, long)]
    verbose: bool,
}

/// Computes the statistics of one bundle and writes them under `out_dir`.
///
/// # Arguments
///
/// * `tract` - the bundle file.
/// * `reference` - reference grid for `.trk` bundles, if any.
/// * `prefix` - output file prefix; the bundle stem when `None`.
fn process(
    args: &Args,
    tract: &Path,
    reference: Option<&Volume>,
    scalars: &[ScalarInput],
    prefix: Option<&str>,
) -> Result<(), Error> {
    let tractogram = Tractogram::load(tract, reference.map(|r| &r.grid))?;
    if tractogram.is_empty() {
        warn!(tract = %tract.display(), "bundle is empty; no statistics written");
        return Ok(());
    }
    let weights = args.sift2_weights.as_deref().map(Weights::load).transpose()?;
    let prefix = prefix.map_or_else(|| stem(tract), str::to_string);
    let base = args.out_dir.join(format!("{prefix}_"));
    let reports = bundle_stats(
        &tractogram,
        tract,
        scalars,
        weights.as_ref(),
        args.n_points,
        &base.to_string_lossy(),
        !args.no_overwrite,
    )?;
    for report in reports {
        info!(
            scalar = %report.name,
            streamlines = report.summary.count,
            mean = report.summary.mean,
            stats = %report.stats_txt.display(),
            "wrote statistics"
        );
    }
    Ok(())
}

fn run(args: &Args) -> Result<(), Error> {
    if args.n_points < 2 {
        return Err(Error::InvalidArgument(format!(
            "number of profile points ({}) must be larger than 1",
            args.n_points
        )));
    }
    let scalars = scalar_inputs(&args.scalar_paths, args.scalar_names.as_deref())?;
    let reference = args.trk_ref.as_deref().map(Volume::load).transpose()?;
    std::fs::create_dir_all(&args.out_dir)?;

    if let Some(tract) = &args.tract {
        return process(args, tract, reference.as_ref(), &scalars, args.out_prefix.as_deref());
    }

    let pattern = args.tract_glob.as_deref().unwrap_or_default();
    let mut paths: Vec<PathBuf> = glob(pattern)
        .map_err(|e| Error::InvalidArgument(format!("bad glob pattern '{pattern}': {e}")))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();
    if paths.is_empty() {
        warn!(pattern, "no bundle matched");
    }
    for path in &paths {
        info!(tract = %path.display(), "processing bundle");
        let prefix = args.out_prefix.as_ref().map(|p| format!("{p}_{}", stem(path)));
        process(args, path, reference.as_ref(), &scalars, prefix.as_deref())?;
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    let default = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    run(&args).unwrap_or_else(|e| {
        error!("Error! {}", e);
        std::process::exit(-2);
    });
}
