#![forbid(unsafe_code)]
//! The job dispatcher.
//!
//! Wires extent source → planner → storage → executor and owns the job
//! lifecycle:
//!
//! ```text
//! UNINIT → INIT_JOB_DIR → ACQUIRE_EXTENTS → PLAN → BUILD_STORAGE
//!        → EXECUTE → FINALIZE → DONE
//! ```
//!
//! Any phase may fail into `FAILED`; the persisted artifacts under the
//! job directory (extent save files, scratch file, progress marker) are
//! preserved so a re-run resumes at the earliest phase whose outputs
//! are missing: extent files present skip acquisition, a `progress`
//! marker resumes execution mid-plan, and a completed marker goes
//! straight to finalize.

use rfs_device::{
    read_file_extents, CancelToken, DeviceFile, FileRole, JobLock,
};
use std::os::unix::fs::FileTypeExt;
use rfs_error::{Result, RfsError};
use rfs_exec::Executor;
use rfs_persist::{
    load_extents, load_progress, save_extents, FREE_SPACE_EXTENTS, LOOP_FILE_EXTENTS,
    PRIMARY_STORAGE_EXTENTS, SECONDARY_STORAGE_EXTENTS,
};
use rfs_plan::{plan, MovePlan, PlanRequest};
use rfs_storage::StorageWindow;
use rfs_types::{BlockBits, BlockSizeProbe, Extent, ExtentList};
use serde::Serialize;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ── Phases ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobPhase {
    Uninit,
    InitJobDir,
    AcquireExtents,
    Plan,
    BuildStorage,
    Execute,
    Finalize,
    Done,
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninit => "UNINIT",
            Self::InitJobDir => "INIT_JOB_DIR",
            Self::AcquireExtents => "ACQUIRE_EXTENTS",
            Self::Plan => "PLAN",
            Self::BuildStorage => "BUILD_STORAGE",
            Self::Execute => "EXECUTE",
            Self::Finalize => "FINALIZE",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

// ── Extent source ───────────────────────────────────────────────────────────

/// Produces the loop-file and free-space extent lists for a job.
///
/// The returned free-space extents must be identity mapped
/// (`logical == physical`); every endpoint must have been accumulated
/// into `probe`. How the lists are obtained is the implementation's
/// business: production queries the filesystem, tests hand back fixed
/// lists.
pub trait ExtentSource {
    fn read_extents(
        &mut self,
        loop_file: &DeviceFile,
        zero_file: &DeviceFile,
        probe: &mut BlockSizeProbe,
    ) -> Result<(ExtentList, ExtentList)>;
}

/// FIEMAP-backed extent source: the loop file's extents are the data to
/// relocate; the zero file, having been grown to fill the device, marks
/// the free space with its own extents.
#[derive(Debug, Default)]
pub struct FiemapSource;

impl ExtentSource for FiemapSource {
    fn read_extents(
        &mut self,
        loop_file: &DeviceFile,
        zero_file: &DeviceFile,
        probe: &mut BlockSizeProbe,
    ) -> Result<(ExtentList, ExtentList)> {
        let loop_extents = read_file_extents(loop_file, probe)?;
        let zero_extents = read_file_extents(zero_file, probe)?;
        let mut free_extents = ExtentList::new();
        for e in &zero_extents {
            free_extents.insert(Extent::new(e.physical, e.physical, e.length));
        }
        Ok((loop_extents, free_extents))
    }
}

// ── Configuration and report ────────────────────────────────────────────────

/// Default staging allowance when the user does not pass one.
pub const DEFAULT_STORAGE_BYTES: u64 = 256 * 1024 * 1024;

/// Root under which job directories are allocated.
pub const DEFAULT_JOB_ROOT: &str = ".reshape";

#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub device_path: PathBuf,
    pub loop_path: PathBuf,
    pub zero_path: PathBuf,
    /// Parent of the per-job directories (`<job_root>/job.<N>`).
    pub job_root: PathBuf,
    /// Reuse this job id (resume); `None` allocates a fresh one.
    pub job_id: Option<u32>,
    /// Staging byte budget; the planner may use less.
    pub requested_storage: u64,
}

impl TransformConfig {
    #[must_use]
    pub fn new(device_path: PathBuf, loop_path: PathBuf, zero_path: PathBuf) -> Self {
        Self {
            device_path,
            loop_path,
            zero_path,
            job_root: PathBuf::from(DEFAULT_JOB_ROOT),
            job_id: None,
            requested_storage: DEFAULT_STORAGE_BYTES,
        }
    }
}

/// What a finished (or no-op) transform did.
#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub job_id: u32,
    pub job_dir: PathBuf,
    pub block_size: u64,
    pub steps_total: usize,
    pub steps_executed: usize,
    pub primary_storage_bytes: u64,
    pub secondary_storage_bytes: u64,
}

// ── Dispatcher ──────────────────────────────────────────────────────────────

/// Run one transform job to completion (or resume one).
pub fn run_transform(
    config: &TransformConfig,
    source: &mut dyn ExtentSource,
    cancel: &CancelToken,
) -> Result<TransformReport> {
    let mut phase = JobPhase::Uninit;
    let result = transform_phases(config, source, cancel, &mut phase);
    if let Err(ref err) = result {
        warn!(target: "rfs::core", phase = %phase, error = %err, "job failed");
    }
    result
}

fn enter(phase: &mut JobPhase, next: JobPhase) {
    info!(target: "rfs::core", from = %*phase, to = %next, "phase");
    *phase = next;
}

fn transform_phases(
    config: &TransformConfig,
    source: &mut dyn ExtentSource,
    cancel: &CancelToken,
    phase: &mut JobPhase,
) -> Result<TransformReport> {
    enter(phase, JobPhase::InitJobDir);
    let (job_id, job_dir) = init_job_dir(&config.job_root, config.job_id)?;
    let _lock = JobLock::acquire(&job_dir)?;

    let device = DeviceFile::open(&config.device_path, FileRole::Device)?;
    if device.length() == 0 {
        return Err(RfsError::Format(format!(
            "device '{}' has zero length",
            config.device_path.display()
        )));
    }

    enter(phase, JobPhase::AcquireExtents);
    let mut probe = BlockSizeProbe::new();
    probe.accumulate_value(device.length());
    let (loop_extents, free_extents) =
        acquire_extents(config, &device, &job_dir, source, &mut probe)?;

    let Some(block_bits) = probe.finish() else {
        // Empty device, empty loop file: nothing to do.
        info!(target: "rfs::core", "no extents and no device bits, job is a no-op");
        enter(phase, JobPhase::Done);
        return Ok(TransformReport {
            job_id,
            job_dir,
            block_size: 0,
            steps_total: 0,
            steps_executed: 0,
            primary_storage_bytes: 0,
            secondary_storage_bytes: 0,
        });
    };
    info!(target: "rfs::core", block_size = block_bits.block_size(), "effective block size");

    enter(phase, JobPhase::Plan);
    let move_plan = plan_job(config, &device, &job_dir, &loop_extents, &free_extents, block_bits)?;

    let progress = load_progress(&job_dir)?;
    let start_step = progress.map_or(0, |p| p.completed_steps);
    let already_done = progress.is_some_and(|p| p.is_done());

    let steps_executed = if already_done {
        info!(target: "rfs::core", "progress marker is complete, nothing to execute");
        0
    } else {
        enter(phase, JobPhase::BuildStorage);
        let mut window = StorageWindow::build(
            &device,
            &job_dir,
            &move_plan.primary_storage,
            move_plan.secondary_len,
        )?;

        enter(phase, JobPhase::Execute);
        let run = Executor::new(
            &device,
            &mut window,
            &move_plan,
            job_dir.clone(),
            cancel.clone(),
            start_step,
        )
        .and_then(|mut exec| {
            let remaining = exec.remaining();
            exec.run()?;
            Ok(remaining)
        });
        match run {
            Ok(remaining) => {
                window.teardown(true)?;
                remaining
            }
            Err(err) => {
                // Keep the scratch file; the job is resumable.
                if let Err(teardown_err) = window.teardown(false) {
                    warn!(target: "rfs::core", error = %teardown_err, "storage teardown failed");
                }
                *phase = JobPhase::Failed;
                return Err(err);
            }
        }
    };

    enter(phase, JobPhase::Finalize);
    device.sync()?;
    // A crash between the last step and teardown can leave the scratch
    // file behind; a completed job has no use for it.
    let scratch = job_dir.join(rfs_storage::SCRATCH_FILE_NAME);
    if scratch.exists() {
        if let Err(err) = fs::remove_file(&scratch) {
            warn!(target: "rfs::core", path = %scratch.display(), error = %err, "scratch cleanup failed");
        }
    }

    enter(phase, JobPhase::Done);
    info!(
        target: "rfs::core",
        job_id,
        steps = move_plan.steps.len(),
        executed = steps_executed,
        "transform complete"
    );
    Ok(TransformReport {
        job_id,
        job_dir,
        block_size: block_bits.block_size(),
        steps_total: move_plan.steps.len(),
        steps_executed,
        primary_storage_bytes: move_plan.primary_storage.total_length(),
        secondary_storage_bytes: move_plan.secondary_len,
    })
}

// ── Phase helpers ───────────────────────────────────────────────────────────

/// Create (or reuse) `<job_root>/job.<N>`. Fresh jobs probe upward for
/// the first id whose directory does not exist yet.
fn init_job_dir(job_root: &Path, job_id: Option<u32>) -> Result<(u32, PathBuf)> {
    if let Err(err) = fs::create_dir(job_root) {
        if err.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(RfsError::io_context(
                "mkdir",
                job_root.display().to_string(),
                err,
            ));
        }
    }

    if let Some(id) = job_id {
        let dir = job_root.join(format!("job.{id}"));
        if let Err(err) = fs::create_dir(&dir) {
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(RfsError::io_context("mkdir", dir.display().to_string(), err));
            }
        }
        info!(target: "rfs::core", job_id = id, dir = %dir.display(), "using job");
        return Ok((id, dir));
    }

    for id in 1_u32.. {
        let dir = job_root.join(format!("job.{id}"));
        match fs::create_dir(&dir) {
            Ok(()) => {
                info!(target: "rfs::core", job_id = id, dir = %dir.display(), "started job");
                return Ok((id, dir));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(RfsError::io_context("mkdir", dir.display().to_string(), err))
            }
        }
    }
    unreachable!("job id space exhausted")
}

fn acquire_extents(
    config: &TransformConfig,
    device: &DeviceFile,
    job_dir: &Path,
    source: &mut dyn ExtentSource,
    probe: &mut BlockSizeProbe,
) -> Result<(ExtentList, ExtentList)> {
    let loop_save = job_dir.join(LOOP_FILE_EXTENTS);
    let free_save = job_dir.join(FREE_SPACE_EXTENTS);

    if loop_save.exists() && free_save.exists() {
        info!(target: "rfs::core", "extent save files found, resuming without re-acquisition");
        let loop_extents = load_extents(&loop_save, probe)?;
        let free_extents = load_extents(&free_save, probe)?;
        return Ok((loop_extents, free_extents));
    }

    let loop_file = DeviceFile::open(&config.loop_path, FileRole::LoopFile)?;
    let zero_file = DeviceFile::open(&config.zero_path, FileRole::ZeroFile)?;
    check_same_device(device, &loop_file)?;
    check_same_device(device, &zero_file)?;

    let (loop_extents, free_extents) = source.read_extents(&loop_file, &zero_file, probe)?;
    save_extents(&loop_save, &loop_extents)?;
    save_extents(&free_save, &free_extents)?;
    Ok((loop_extents, free_extents))
}

/// The loop and zero files must live on the device being transformed.
/// Only checkable when the device really is a block device; image files
/// (tests, loop setups) skip it.
fn check_same_device(device: &DeviceFile, inner: &DeviceFile) -> Result<()> {
    let device_meta = device
        .file()
        .metadata()
        .map_err(|e| RfsError::io_context("fstat", device.path().display().to_string(), e))?;
    if !device_meta.file_type().is_block_device() {
        debug!(
            target: "rfs::core",
            "device is not a block device, skipping containment check"
        );
        return Ok(());
    }
    let inner_meta = inner
        .file()
        .metadata()
        .map_err(|e| RfsError::io_context("fstat", inner.path().display().to_string(), e))?;
    if inner_meta.dev() != device_meta.rdev() {
        return Err(RfsError::Format(format!(
            "{} '{}' is not contained in device '{}'",
            inner.role(),
            inner.path().display(),
            device.path().display()
        )));
    }
    Ok(())
}

fn plan_job(
    config: &TransformConfig,
    device: &DeviceFile,
    job_dir: &Path,
    loop_extents: &ExtentList,
    free_extents: &ExtentList,
    block_bits: BlockBits,
) -> Result<MovePlan> {
    let primary_save = job_dir.join(PRIMARY_STORAGE_EXTENTS);
    let secondary_save = job_dir.join(SECONDARY_STORAGE_EXTENTS);

    // A resumed job must replan with the exact persisted storage split,
    // or the recomputed steps would not line up with the progress marker.
    let fixed_storage = if primary_save.exists() && secondary_save.exists() {
        let mut scratch_probe = BlockSizeProbe::new();
        let primary = load_extents(&primary_save, &mut scratch_probe)?;
        let secondary = load_extents(&secondary_save, &mut scratch_probe)?;
        info!(
            target: "rfs::core",
            primary_bytes = primary.total_length(),
            secondary_bytes = secondary.total_length(),
            "reusing persisted storage split"
        );
        Some((primary, secondary.total_length()))
    } else {
        None
    };
    let fresh = fixed_storage.is_none();

    let move_plan = plan(&PlanRequest {
        loop_extents,
        free_extents,
        device_length: device.length(),
        block_bits,
        requested_storage: config.requested_storage,
        storage_alignment: rfs_device::page_size(),
        fixed_storage,
    })?;

    if fresh {
        save_extents(&primary_save, &move_plan.primary_storage)?;
        let mut secondary = ExtentList::new();
        secondary.insert(Extent::new(0, 0, move_plan.secondary_len));
        save_extents(&secondary_save, &secondary)?;
    }
    Ok(move_plan)
}

// ── Hole zeroer ─────────────────────────────────────────────────────────────

/// Write zeros over every logical hole of a relocated loop file.
///
/// Loads the persisted loop extents, re-infers the block size from the
/// saved endpoints plus the device length, and fills the logical
/// complement with zeros in 1 MiB chunks. Returns the bytes written.
pub fn zero_loop_holes(device: &DeviceFile, extents_save: &Path) -> Result<u64> {
    const ZERO_CHUNK: u64 = 1 << 20;

    let mut probe = BlockSizeProbe::new();
    let loop_extents = load_extents(extents_save, &mut probe)?;
    probe.accumulate_value(device.length());
    let Some(bits) = probe.finish() else {
        return Ok(0);
    };

    let mut holes = loop_extents.complement0_logical_shift(bits, device.length())?;
    holes.shift_left(bits)?;
    info!(
        target: "rfs::core",
        holes = holes.len(),
        bytes = holes.total_length(),
        block_size = bits.block_size(),
        "zeroing loop-file holes"
    );

    let zeros = vec![0_u8; ZERO_CHUNK as usize];
    let mut written = 0_u64;
    for hole in &holes {
        let mut offset = hole.physical;
        let mut left = hole.length;
        while left > 0 {
            let chunk = left.min(ZERO_CHUNK);
            device.write_at(offset, &zeros[..chunk as usize])?;
            offset += chunk;
            left -= chunk;
            written += chunk;
        }
    }
    Ok(written)
}

// ── Job status (for `show`) ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_dir: PathBuf,
    pub loop_extent_count: Option<usize>,
    pub loop_bytes: Option<u64>,
    pub free_extent_count: Option<usize>,
    pub free_bytes: Option<u64>,
    pub primary_storage_bytes: Option<u64>,
    pub secondary_storage_bytes: Option<u64>,
    pub block_size: Option<u64>,
    pub completed_steps: Option<usize>,
    pub total_steps: Option<usize>,
}

/// Summarize the persisted artifacts of a job directory.
pub fn job_status(job_dir: &Path) -> Result<JobStatus> {
    fn load_optional(
        job_dir: &Path,
        name: &str,
        probe: &mut BlockSizeProbe,
    ) -> Result<Option<ExtentList>> {
        let path = job_dir.join(name);
        if path.exists() {
            load_extents(&path, probe).map(Some)
        } else {
            Ok(None)
        }
    }

    let mut probe = BlockSizeProbe::new();
    let loop_extents = load_optional(job_dir, LOOP_FILE_EXTENTS, &mut probe)?;
    let free_extents = load_optional(job_dir, FREE_SPACE_EXTENTS, &mut probe)?;
    let primary = load_optional(job_dir, PRIMARY_STORAGE_EXTENTS, &mut probe)?;
    let secondary = load_optional(job_dir, SECONDARY_STORAGE_EXTENTS, &mut probe)?;
    let progress = load_progress(job_dir)?;

    Ok(JobStatus {
        job_dir: job_dir.to_path_buf(),
        loop_extent_count: loop_extents.as_ref().map(ExtentList::len),
        loop_bytes: loop_extents.as_ref().map(ExtentList::total_length),
        free_extent_count: free_extents.as_ref().map(ExtentList::len),
        free_bytes: free_extents.as_ref().map(ExtentList::total_length),
        primary_storage_bytes: primary.as_ref().map(ExtentList::total_length),
        secondary_storage_bytes: secondary.as_ref().map(ExtentList::total_length),
        block_size: probe.finish().map(BlockBits::block_size),
        completed_steps: progress.map(|p| p.completed_steps),
        total_steps: progress.map(|p| p.total_steps),
    })
}
