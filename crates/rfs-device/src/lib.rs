//! Device I/O for ReshapeFS.
//!
//! This is the only crate (besides the tree mover) that touches the raw
//! `libc` surface. Everything it exports is a safe wrapper:
//!
//! - [`DeviceFile`]: positional read/write with bounds checks against a
//!   length captured once at open time.
//! - [`Reservation`] (in `mem`): the anonymous-placeholder / `MAP_FIXED`
//!   replacement protocol used to build the contiguous storage window.
//! - [`read_file_extents`] (in `fiemap`): FIEMAP extent extraction.
//! - [`preallocate`]: `posix_fallocate` with a zero-fill fallback.
//! - [`JobLock`]: `flock`-based exclusive job ownership.
//! - [`CancelToken`]: cooperative cancellation checked at step
//!   boundaries, with optional SIGINT wiring.

mod fiemap;
mod mem;

pub use fiemap::read_file_extents;
pub use mem::Reservation;

use rfs_error::{Result, RfsError};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

// ── File roles ──────────────────────────────────────────────────────────────

/// The role a file descriptor plays in a job. Carries its own display
/// form for logs and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Device,
    LoopFile,
    ZeroFile,
    PrimaryStorage,
    SecondaryStorage,
    Storage,
}

impl FileRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::LoopFile => "loop-file",
            Self::ZeroFile => "zero-file",
            Self::PrimaryStorage => "primary-storage",
            Self::SecondaryStorage => "secondary-storage",
            Self::Storage => "storage",
        }
    }

    /// Only the device and the scratch file are ever written through.
    #[must_use]
    fn writable(self) -> bool {
        matches!(self, Self::Device | Self::SecondaryStorage)
    }
}

impl std::fmt::Display for FileRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Device length ───────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

/// Length of an open file: `BLKGETSIZE64` for block devices, falling
/// back to the stat size.
fn query_length(file: &File, what: &str) -> Result<u64> {
    let meta = file
        .metadata()
        .map_err(|e| RfsError::io_context("fstat", what.to_owned(), e))?;

    #[cfg(target_os = "linux")]
    if meta.file_type().is_block_device() {
        let mut len: u64 = 0;
        // SAFETY: fd is open for the lifetime of the call; BLKGETSIZE64
        // writes one u64 through the pointer.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut len) };
        if rc == 0 {
            return Ok(len);
        }
        warn!(
            target: "rfs::device",
            what,
            error = %io::Error::last_os_error(),
            "BLKGETSIZE64 failed, falling back to stat size"
        );
    }

    Ok(meta.len())
}

// ── DeviceFile ──────────────────────────────────────────────────────────────

/// An open file with a role, positional I/O and a length fixed at open.
#[derive(Debug)]
pub struct DeviceFile {
    file: File,
    role: FileRole,
    path: PathBuf,
    length: u64,
}

impl DeviceFile {
    /// Open `path` for its role (the device and scratch file read-write,
    /// everything else read-only) and capture its length.
    pub fn open(path: &Path, role: FileRole) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(role.writable())
            .open(path)
            .map_err(|e| RfsError::io_context("open", path.display().to_string(), e))?;
        let length = query_length(&file, role.as_str())?;
        debug!(target: "rfs::device", role = %role, path = %path.display(), length, "opened");
        Ok(Self {
            file,
            role,
            path: path.to_path_buf(),
            length,
        })
    }

    #[must_use]
    pub fn role(&self) -> FileRole {
        self.role
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length in bytes, captured at open time and authoritative since.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn check_bounds(&self, op: &'static str, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(RfsError::Overflow("I/O range"))?;
        if end > self.length {
            return Err(RfsError::io_context(
                op,
                format!("{} (offset {offset}, length {len})", self.role),
                io::Error::new(io::ErrorKind::UnexpectedEof, "range past end of device"),
            ));
        }
        Ok(())
    }

    /// Positional read of exactly `buf.len()` bytes.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds("pread", offset, buf.len())?;
        self.file.read_exact_at(buf, offset).map_err(|e| {
            RfsError::io_context("pread", format!("{} at offset {offset}", self.role), e)
        })
    }

    /// Positional write of all of `buf`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_bounds("pwrite", offset, buf.len())?;
        self.file.write_all_at(buf, offset).map_err(|e| {
            RfsError::io_context("pwrite", format!("{} at offset {offset}", self.role), e)
        })
    }

    /// Flush file and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| RfsError::io_context("fsync", self.role.as_str().to_owned(), e))
    }
}

/// Host page size; fixed-address mappings need page-aligned file
/// offsets, so primary storage extents are trimmed to this.
#[must_use]
pub fn page_size() -> u64 {
    // SAFETY: sysconf reads a constant.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).unwrap_or(4096)
}

// ── Preallocation ───────────────────────────────────────────────────────────

/// Zero-fill chunk used when the filesystem has no preallocation call.
const ZERO_CHUNK: usize = 64 * 1024;

/// Extend `file` to `len` bytes: `posix_fallocate` first, then a
/// zero-filled write loop for filesystems that refuse it.
pub fn preallocate(file: &File, what: &str, len: u64) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let off_len = libc::off_t::try_from(len).map_err(|_| RfsError::Overflow("fallocate length"))?;

    // SAFETY: fd is valid; posix_fallocate reads no user memory.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, off_len) };
    if rc == 0 {
        return Ok(());
    }
    debug!(
        target: "rfs::device",
        what,
        errno = rc,
        "posix_fallocate unsupported, writing zeros"
    );

    let zeros = [0_u8; ZERO_CHUNK];
    let mut pos = 0_u64;
    while pos < len {
        let chunk = usize::try_from((len - pos).min(ZERO_CHUNK as u64))
            .map_err(|_| RfsError::Overflow("zero-fill chunk"))?;
        file.write_all_at(&zeros[..chunk], pos)
            .map_err(|e| RfsError::io_context("pwrite", format!("{what} zero-fill"), e))?;
        pos += chunk as u64;
    }
    Ok(())
}

// ── Job lock ────────────────────────────────────────────────────────────────

/// Exclusive `flock` on `<job_dir>/lock`, held until dropped.
///
/// Concurrent jobs on one device are undefined behavior; this makes a
/// second `rfs` process on the same job directory fail fast instead.
#[derive(Debug)]
pub struct JobLock {
    _file: File,
    path: PathBuf,
}

impl JobLock {
    pub fn acquire(job_dir: &Path) -> Result<Self> {
        let path = job_dir.join("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| RfsError::io_context("open", path.display().to_string(), e))?;
        // SAFETY: fd is valid; flock takes no pointers.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(RfsError::io_context(
                "flock",
                path.display().to_string(),
                io::Error::last_os_error(),
            ));
        }
        debug!(target: "rfs::device", path = %path.display(), "job lock acquired");
        Ok(Self { _file: file, path })
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        debug!(target: "rfs::device", path = %self.path.display(), "job lock released");
        // The lock is dropped with the descriptor.
    }
}

// ── Cancellation ────────────────────────────────────────────────────────────

/// Cooperative cancellation flag, checked between plan steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out if cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RfsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

static SIGINT_TOKEN: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn sigint_handler(_sig: libc::c_int) {
    if let Some(token) = SIGINT_TOKEN.get() {
        token.flag.store(true, Ordering::SeqCst);
    }
}

/// Install a SIGINT handler that trips a [`CancelToken`] and return the
/// token. In-flight I/O completes; the executor stops at the next step
/// boundary. Subsequent calls return the same token.
pub fn install_sigint_handler() -> Result<CancelToken> {
    let token = SIGINT_TOKEN.get_or_init(CancelToken::new).clone();
    // SAFETY: the handler only stores into an atomic, which is
    // async-signal-safe.
    let prev = unsafe { libc::signal(libc::SIGINT, sigint_handler as libc::sighandler_t) };
    if prev == libc::SIG_ERR {
        return Err(RfsError::io_context(
            "signal",
            "SIGINT".to_owned(),
            io::Error::last_os_error(),
        ));
    }
    Ok(token)
}

// ── Tests ───────────────────────────────────────────────────────────────────
