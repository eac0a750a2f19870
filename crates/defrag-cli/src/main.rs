#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use defrag::{DefragReport, defragment};
use defrag_harness::{VerifyReport, percentage, verify_defragmented};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_OUTPUT_DIR: &str = "output-disk-image";
const OUTPUT_PREFIX: &str = "disk-defrag-";

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "disk-defrag",
    version,
    about = "Defragment an indirect-block disk image offline"
)]
struct Cli {
    /// Disk image to defragment. Never modified.
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Write the result here instead of the default location.
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Directory for the default output name (created if missing).
    #[arg(long, value_name = "DIR", default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Print the run report as JSON.
    #[arg(long)]
    json: bool,

    /// Run the transformation without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Check the result against the source before writing it.
    #[arg(long)]
    verify: bool,

    /// More log output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,
}

// ── Serializable output ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    image: String,
    output: Option<String>,
    report: &'a DefragReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification: Option<&'a VerifyReport>,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    if let Err(error) = run(&cli) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// `<dir>/disk-defrag-<last character of the image path>`.
fn default_output_path(image: &Path, dir: &Path) -> Result<PathBuf> {
    let name = image.to_string_lossy();
    let Some(suffix) = name.chars().last() else {
        bail!("image path is empty");
    };
    Ok(dir.join(format!("{OUTPUT_PREFIX}{suffix}")))
}

fn run(cli: &Cli) -> Result<()> {
    let source = fs::read(&cli.image)
        .with_context(|| format!("failed to read disk image {}", cli.image.display()))?;
    info!(image = %cli.image.display(), bytes = source.len(), "image loaded");

    let result = defragment(&source)
        .with_context(|| format!("failed to defragment {}", cli.image.display()))?;

    let verification = if cli.verify {
        let report = verify_defragmented(&source, &result.image)
            .context("failed to verify defragmented image")?;
        if !report.is_clean() {
            let failures: Vec<String> = report
                .failures()
                .map(|v| format!("{}: {}", v.check, v.detail))
                .collect();
            bail!("verification failed: {}", failures.join("; "));
        }
        debug!(checks = report.passed, "verification passed");
        Some(report)
    } else {
        None
    };

    let output = if cli.dry_run {
        None
    } else {
        let path = match &cli.output {
            Some(path) => path.clone(),
            None => default_output_path(&cli.image, &cli.output_dir)?,
        };
        write_atomic(&path, &result.image)?;
        info!(output = %path.display(), "image written");
        Some(path)
    };

    if cli.json {
        let out = RunOutput {
            image: cli.image.display().to_string(),
            output: output.as_ref().map(|p| p.display().to_string()),
            report: &result.report,
            verification: verification.as_ref(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("serialize output")?
        );
    } else {
        print_summary(&result.report, output.as_deref(), verification.as_ref());
    }
    Ok(())
}

/// Write `bytes` to a temporary file next to `path`, then rename over it.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(&dir)
        .with_context(|| format!("failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .with_context(|| format!("failed to write {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move output into place at {}", path.display()))?;
    Ok(())
}

fn print_summary(report: &DefragReport, output: Option<&Path>, verification: Option<&VerifyReport>) {
    println!("disk-defrag");
    println!("block_size: {}", report.block_size);
    println!(
        "inodes: {} live, {} relocated, {} skipped",
        report.live_inodes, report.inodes_relocated, report.inodes_skipped
    );
    println!(
        "blocks copied: {} ({} data, {} indirect)",
        report.blocks_copied(),
        report.data_blocks,
        report.indirect_blocks
    );
    println!(
        "free blocks: {} of {} (head {})",
        report.free_blocks, report.data_region_blocks, report.free_list_head
    );
    println!(
        "fragmented files: {} -> {} ({:.1}% before)",
        report.before.fragmented_files,
        report.after.fragmented_files,
        percentage(report.before.fragmented_files, report.before.files)
    );
    if let Some(verification) = verification {
        println!("verification: {} checks passed", verification.passed);
    }
    match output {
        Some(path) => println!("output: {}", path.display()),
        None => println!("output: none (dry run)"),
    }
}
