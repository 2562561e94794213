#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rfs_core::{
    job_status, run_transform, zero_loop_holes, FiemapSource, TransformConfig,
};
use rfs_device::{install_sigint_handler, DeviceFile, FileRole};
use rfs_error::RfsError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "rfs", about = "ReshapeFS — in-place filesystem reshaping toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relocate a loop file's blocks so its contents occupy the device
    /// directly.
    Transform {
        /// Block device (or image file) being reshaped. Must be
        /// unmounted.
        device: PathBuf,
        /// File on the device whose contents become the device.
        loop_file: PathBuf,
        /// File grown to fill the device's free space beforehand.
        zero_file: PathBuf,
        /// Resume this job id instead of starting a new job.
        #[arg(long)]
        job: Option<u32>,
        /// Staging byte budget (default 256 MiB).
        #[arg(long)]
        storage_size: Option<u64>,
        /// Parent directory for job state (default .reshape).
        #[arg(long)]
        job_root: Option<PathBuf>,
    },
    /// Move a directory tree, preserving metadata and special files.
    Move {
        source: PathBuf,
        dest: PathBuf,
        /// Always deep-copy, even on the same filesystem.
        #[arg(long)]
        force_copy: bool,
    },
    /// Zero every logical hole of a relocated loop file.
    ZeroHoles {
        /// Device holding the relocated loop file.
        device: PathBuf,
        /// Loop extent save file from the transform job.
        extents_file: PathBuf,
    },
    /// Report the persisted state of a job directory.
    Show {
        job_dir: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    init_logging();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        let code = error
            .downcast_ref::<RfsError>()
            .map_or(1, RfsError::exit_code);
        std::process::exit(code);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Transform {
            device,
            loop_file,
            zero_file,
            job,
            storage_size,
            job_root,
        } => transform_cmd(device, loop_file, zero_file, job, storage_size, job_root),
        Command::Move {
            source,
            dest,
            force_copy,
        } => move_cmd(&source, &dest, force_copy),
        Command::ZeroHoles {
            device,
            extents_file,
        } => zero_holes_cmd(&device, &extents_file),
        Command::Show { job_dir, json } => show_cmd(&job_dir, json),
    }
}

fn transform_cmd(
    device: PathBuf,
    loop_file: PathBuf,
    zero_file: PathBuf,
    job: Option<u32>,
    storage_size: Option<u64>,
    job_root: Option<PathBuf>,
) -> Result<()> {
    let mut config = TransformConfig::new(device, loop_file, zero_file);
    config.job_id = job;
    if let Some(bytes) = storage_size {
        config.requested_storage = bytes;
    }
    if let Some(root) = job_root {
        config.job_root = root;
    }

    let cancel = install_sigint_handler().context("installing SIGINT handler")?;
    let mut source = FiemapSource;
    let report = run_transform(&config, &mut source, &cancel)
        .with_context(|| format!("transform of {}", config.device_path.display()))?;

    println!("job {} complete in {}", report.job_id, report.job_dir.display());
    println!("block_size: {}", report.block_size);
    println!(
        "steps: {} total, {} executed this run",
        report.steps_total, report.steps_executed
    );
    println!(
        "storage: {} bytes primary, {} bytes secondary",
        report.primary_storage_bytes, report.secondary_storage_bytes
    );
    Ok(())
}

fn move_cmd(source: &PathBuf, dest: &PathBuf, force_copy: bool) -> Result<()> {
    let stats = rfs_move::move_tree_with(
        source,
        dest,
        rfs_move::MoveOptions { force_copy },
    )
    .with_context(|| format!("moving {} to {}", source.display(), dest.display()))?;
    println!(
        "moved {} dirs, {} files, {} symlinks, {} special files ({} bytes copied, {} skipped)",
        stats.dirs, stats.files, stats.symlinks, stats.specials, stats.bytes_copied, stats.skipped
    );
    Ok(())
}

fn zero_holes_cmd(device_path: &PathBuf, extents_file: &PathBuf) -> Result<()> {
    let device = DeviceFile::open(device_path, FileRole::Device)
        .with_context(|| format!("opening device {}", device_path.display()))?;
    let written = zero_loop_holes(&device, extents_file)
        .with_context(|| format!("zeroing holes on {}", device_path.display()))?;
    device.sync().context("syncing device")?;
    println!("zeroed {written} bytes of loop-file holes");
    Ok(())
}

fn show_cmd(job_dir: &PathBuf, json: bool) -> Result<()> {
    let status = job_status(job_dir)
        .with_context(|| format!("reading job state from {}", job_dir.display()))?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("serialize job status")?
        );
        return Ok(());
    }

    println!("job: {}", status.job_dir.display());
    let fmt_extents = |count: Option<usize>, bytes: Option<u64>| match (count, bytes) {
        (Some(count), Some(bytes)) => format!("{count} extents, {bytes} bytes"),
        _ => "not acquired".to_owned(),
    };
    println!(
        "loop-file: {}",
        fmt_extents(status.loop_extent_count, status.loop_bytes)
    );
    println!(
        "free-space: {}",
        fmt_extents(status.free_extent_count, status.free_bytes)
    );
    match (status.primary_storage_bytes, status.secondary_storage_bytes) {
        (Some(primary), Some(secondary)) => {
            println!("storage: {primary} bytes primary, {secondary} bytes secondary");
        }
        _ => println!("storage: not planned"),
    }
    if let Some(block_size) = status.block_size {
        println!("block_size: {block_size}");
    }
    match (status.completed_steps, status.total_steps) {
        (Some(completed), Some(total)) => println!("progress: {completed}/{total} steps"),
        _ => println!("progress: not started"),
    }
    Ok(())
}
