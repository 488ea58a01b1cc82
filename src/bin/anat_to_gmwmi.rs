//! Create a gray-matter / white-matter interface (GMWMI) from a FreeSurfer
//! subject directory or a T1-weighted image, plus its binarized version.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fsub_extractor::anat::{anat_to_gmwmi, GmwmiOptions};
use fsub_extractor::tools::ToolRegistry;
use fsub_extractor::Error;

#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Args {
    /// FreeSurfer subject directory (uses 5ttgen hsvs) or T1w image (uses 5ttgen fsl).
    #[arg(long)]
    anat: PathBuf,

    /// Output directory.
    #[arg(long, default_value = "./")]
    output: PathBuf,

    /// Subject name, used as the prefix of every output file.
    #[arg(long)]
    subject: String,

    /// Existing 5TT image; skips 5ttgen.
    #[arg(long)]
    fivett: Option<PathBuf>,

    /// GMWMI voxels above this value are kept in the binarized image.
    #[arg(long, default_value_t = 0.0)]
    threshold: f64,

    /// Space label written into output names.
    #[arg(long, default_value = "FS")]
    space: String,

    /// Refuse to replace existing outputs.
    #[arg(long)]
    no_overwrite: bool,

    /// TOML file mapping tool names to executables.
    #[arg(long)]
    tool_config: Option<PathBuf>,

    /// Log debug messages.
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<(), Error> {
    let mut needed = vec!["5tt2gmwmi"];
    if args.fivett.is_none() {
        needed.push("5ttgen");
    }
    let tools = ToolRegistry::resolve(&needed[..], args.tool_config.as_deref())?;
    tools.require(&needed)?;
    let outputs = anat_to_gmwmi(
        &tools,
        &GmwmiOptions {
            anat: &args.anat,
            out_dir: &args.output,
            subject: &args.subject,
            threshold: args.threshold,
            fivett: args.fivett.as_deref(),
            space: &args.space,
            overwrite: !args.no_overwrite,
        },
    )?;
    info!(
        fivett = %outputs.fivett.display(),
        gmwmi = %outputs.gmwmi.display(),
        binarized = %outputs.gmwmi_bin.display(),
        "GMWMI created"
    );
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
