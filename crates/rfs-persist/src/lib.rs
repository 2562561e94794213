#![forbid(unsafe_code)]
//! Save files for interrupted jobs.
//!
//! Extent lists persist as plain text, one extent per line:
//! `<physical> <logical> <length>`, unsigned decimal, byte units,
//! newline terminated. The `progress` marker is a single line
//! `<completed_steps> <total_steps>` rewritten atomically after every
//! executed step, so a crash at any point leaves a resumable state.

use rfs_error::{Result, RfsError};
use rfs_types::{BlockSizeProbe, Extent, ExtentList};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;

// ── File names under the job directory ──────────────────────────────────────

pub const LOOP_FILE_EXTENTS: &str = "loop-file.extents";
pub const FREE_SPACE_EXTENTS: &str = "free-space.extents";
pub const PRIMARY_STORAGE_EXTENTS: &str = "primary-storage.extents";
pub const SECONDARY_STORAGE_EXTENTS: &str = "secondary-storage.extents";
pub const PROGRESS: &str = "progress";

// ── Extent lists ────────────────────────────────────────────────────────────

/// Write `extents` to `path`, replacing any previous contents, and
/// flush to stable storage.
pub fn save_extents(path: &Path, extents: &ExtentList) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| RfsError::io_context("create", path.display().to_string(), e))?;
    let mut out = BufWriter::new(&file);
    for e in extents {
        writeln!(out, "{} {} {}", e.physical, e.logical, e.length)
            .map_err(|e| RfsError::io_context("write", path.display().to_string(), e))?;
    }
    out.flush()
        .map_err(|e| RfsError::io_context("flush", path.display().to_string(), e))?;
    drop(out);
    file.sync_all()
        .map_err(|e| RfsError::io_context("fsync", path.display().to_string(), e))?;
    debug!(target: "rfs::persist", path = %path.display(), count = extents.len(), "extents saved");
    Ok(())
}

/// Load an extent list from `path`, accumulating every value into
/// `probe`.
///
/// Blank lines and trailing whitespace are tolerated; a `physical`
/// value lower than its predecessor's is a corrupt save file.
pub fn load_extents(path: &Path, probe: &mut BlockSizeProbe) -> Result<ExtentList> {
    let file = File::open(path)
        .map_err(|e| RfsError::io_context("open", path.display().to_string(), e))?;
    let reader = BufReader::new(file);

    let mut extents = ExtentList::new();
    let mut prev_physical = 0_u64;
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| RfsError::io_context("read", path.display().to_string(), e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let extent = parse_extent_line(trimmed).ok_or_else(|| {
            RfsError::Format(format!(
                "{}:{}: expected '<physical> <logical> <length>', got {trimmed:?}",
                path.display(),
                index + 1
            ))
        })?;
        if extent.physical < prev_physical {
            return Err(RfsError::Format(format!(
                "{}:{}: physical {} goes backwards (previous {})",
                path.display(),
                index + 1,
                extent.physical,
                prev_physical
            )));
        }
        prev_physical = extent.physical;
        probe.accumulate_extent(&extent);
        extents.insert(extent);
    }
    debug!(target: "rfs::persist", path = %path.display(), count = extents.len(), "extents loaded");
    Ok(extents)
}

fn parse_extent_line(line: &str) -> Option<Extent> {
    let mut fields = line.split_ascii_whitespace();
    let physical = fields.next()?.parse().ok()?;
    let logical = fields.next()?.parse().ok()?;
    let length = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(Extent::new(physical, logical, length))
}

// ── Progress marker ─────────────────────────────────────────────────────────

/// Executor position within a persisted plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed_steps: usize,
    pub total_steps: usize,
}

impl Progress {
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.completed_steps >= self.total_steps
    }
}

/// Rewrite the progress marker atomically (temp file + rename).
pub fn save_progress(job_dir: &Path, progress: Progress) -> Result<()> {
    let tmp = job_dir.join("progress.tmp");
    let path = job_dir.join(PROGRESS);

    let file = File::create(&tmp)
        .map_err(|e| RfsError::io_context("create", tmp.display().to_string(), e))?;
    let mut out = BufWriter::new(&file);
    writeln!(out, "{} {}", progress.completed_steps, progress.total_steps)
        .map_err(|e| RfsError::io_context("write", tmp.display().to_string(), e))?;
    out.flush()
        .map_err(|e| RfsError::io_context("flush", tmp.display().to_string(), e))?;
    drop(out);
    file.sync_all()
        .map_err(|e| RfsError::io_context("fsync", tmp.display().to_string(), e))?;
    fs::rename(&tmp, &path)
        .map_err(|e| RfsError::io_context("rename", path.display().to_string(), e))?;
    Ok(())
}

/// Read the progress marker, or `None` when no run has executed yet.
pub fn load_progress(job_dir: &Path) -> Result<Option<Progress>> {
    let path = job_dir.join(PROGRESS);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RfsError::io_context("read", path.display().to_string(), e)),
    };
    let mut fields = text.split_ascii_whitespace();
    let parse = |field: Option<&str>| -> Result<usize> {
        field
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| RfsError::Format(format!("{}: malformed progress marker", path.display())))
    };
    let completed_steps = parse(fields.next())?;
    let total_steps = parse(fields.next())?;
    if fields.next().is_some() || completed_steps > total_steps {
        return Err(RfsError::Format(format!(
            "{}: malformed progress marker",
            path.display()
        )));
    }
    Ok(Some(Progress {
        completed_steps,
        total_steps,
    }))
}

// ── Tests ───────────────────────────────────────────────────────────────────
