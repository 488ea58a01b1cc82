//! Dice overlap of two bundles, computed on the track-density maps of both
//! bundles over a template image grid.

use clap::Parser;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use fsub_extractor::density::tract_dice;
use fsub_extractor::{Error, Tractogram, Volume};

#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Args {
    /// First bundle, .tck or .trk.
    #[arg(long)]
    tract1: PathBuf,

    /// Second bundle, .tck or .trk.
    #[arg(long)]
    tract2: PathBuf,

    /// Image whose grid the density maps are computed on.
    #[arg(long)]
    template: PathBuf,

    /// Output directory.
    #[arg(long, default_value = "./")]
    out_dir: PathBuf,

    /// Output file prefix; the CSV is <prefix>_dice.csv.
    #[arg(long)]
    out_prefix: String,

    /// Also write both density maps.
    #[arg(long)]
    save_tdis: bool,

    /// Log debug messages.
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<f64, Error> {
    let template = Volume::load(&args.template)?;
    let first = Tractogram::load(&args.tract1, Some(&template.grid))?;
    let second = Tractogram::load(&args.tract2, Some(&template.grid))?;
    let report = tract_dice(
        &first,
        &second,
        &template,
        &args.out_dir,
        &args.out_prefix,
        args.save_tdis,
    )?;
    Ok(report.dice)
}

fn main() {
    let args = Args::parse();
    let default = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let dice = run(&args).unwrap_or_else(|e| {
        error!("Error! {}", e);
        std::process::exit(-2);
    });
    println!("{dice}");
}
