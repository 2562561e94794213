//! Recursive tree mover.
//!
//! Moves a directory tree between two paths: regular files, directories,
//! symlinks, device nodes, FIFOs and sockets, preserving mode, ownership
//! and timestamps. A same-filesystem move is a single `rename`; across
//! filesystems every entry is copied and the source removed as the copy
//! succeeds. Regular files are copied sparsely: data segments found via
//! `SEEK_DATA`/`SEEK_HOLE`, final size set up front so trailing holes
//! survive.
//!
//! Ownership and timestamp failures are warnings, not errors; an entry
//! of unknown type is skipped with a warning.

use rfs_error::{Result, RfsError};
use std::ffi::CString;
use std::fs::{self, File};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, FileExt, MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::{debug, info, warn};

/// Copy chunk for regular file data segments.
const COPY_CHUNK: usize = 1 << 20;

/// Tree move behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveOptions {
    /// Skip the `rename` fast path and always deep-copy. The fast path
    /// only helps when source and destination share a filesystem, which
    /// a device migration never does.
    pub force_copy: bool,
}

/// Counters reported after a completed move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveStats {
    pub dirs: u64,
    pub files: u64,
    pub symlinks: u64,
    pub specials: u64,
    pub skipped: u64,
    pub bytes_copied: u64,
}

/// Move the tree rooted at `source` to `dest` (the new root path, not a
/// parent directory).
pub fn move_tree(source: &Path, dest: &Path) -> Result<MoveStats> {
    move_tree_with(source, dest, MoveOptions::default())
}

pub fn move_tree_with(source: &Path, dest: &Path, options: MoveOptions) -> Result<MoveStats> {
    let mut stats = MoveStats::default();
    move_entry(source, dest, options, &mut stats)?;
    info!(
        target: "rfs::move",
        dirs = stats.dirs,
        files = stats.files,
        symlinks = stats.symlinks,
        specials = stats.specials,
        skipped = stats.skipped,
        bytes = stats.bytes_copied,
        "move complete"
    );
    Ok(stats)
}

fn move_entry(
    source: &Path,
    dest: &Path,
    options: MoveOptions,
    stats: &mut MoveStats,
) -> Result<()> {
    let meta = fs::symlink_metadata(source)
        .map_err(|e| RfsError::io_context("lstat", source.display().to_string(), e))?;
    let file_type = meta.file_type();

    if !options.force_copy {
        if let Ok(()) = fs::rename(source, dest) {
            debug!(target: "rfs::move", source = %source.display(), dest = %dest.display(), "renamed");
            if file_type.is_dir() {
                stats.dirs += 1;
            } else if file_type.is_symlink() {
                stats.symlinks += 1;
            } else if file_type.is_file() {
                stats.files += 1;
            } else {
                stats.specials += 1;
            }
            return Ok(());
        }
    }

    if file_type.is_dir() {
        move_dir(source, dest, &meta, options, stats)
    } else if file_type.is_symlink() {
        move_symlink(source, dest, &meta, stats)
    } else if file_type.is_file() {
        move_regular(source, dest, &meta, stats)
    } else if is_special(&meta) {
        move_special(source, dest, &meta, stats)
    } else {
        let err = RfsError::UnsupportedFileType(source.display().to_string());
        warn!(
            target: "rfs::move",
            error = %err,
            mode = meta.mode(),
            "skipping entry"
        );
        stats.skipped += 1;
        Ok(())
    }
}

fn is_special(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    let file_type = meta.file_type();
    file_type.is_fifo()
        || file_type.is_socket()
        || file_type.is_block_device()
        || file_type.is_char_device()
}

fn move_dir(
    source: &Path,
    dest: &Path,
    meta: &fs::Metadata,
    options: MoveOptions,
    stats: &mut MoveStats,
) -> Result<()> {
    if let Err(err) = fs::create_dir(dest) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(RfsError::io_context("mkdir", dest.display().to_string(), err));
        }
    }
    let entries = fs::read_dir(source)
        .map_err(|e| RfsError::io_context("readdir", source.display().to_string(), e))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| RfsError::io_context("readdir", source.display().to_string(), e))?;
        move_entry(&entry.path(), &dest.join(entry.file_name()), options, stats)?;
    }
    // Children first, then the directory's own metadata, or the copied
    // timestamps would be clobbered by the child moves.
    copy_metadata(dest, meta, false)?;
    fs::remove_dir(source)
        .map_err(|e| RfsError::io_context("rmdir", source.display().to_string(), e))?;
    stats.dirs += 1;
    Ok(())
}

fn move_symlink(
    source: &Path,
    dest: &Path,
    meta: &fs::Metadata,
    stats: &mut MoveStats,
) -> Result<()> {
    let target = fs::read_link(source)
        .map_err(|e| RfsError::io_context("readlink", source.display().to_string(), e))?;
    symlink(&target, dest)
        .map_err(|e| RfsError::io_context("symlink", dest.display().to_string(), e))?;
    copy_metadata(dest, meta, true)?;
    fs::remove_file(source)
        .map_err(|e| RfsError::io_context("unlink", source.display().to_string(), e))?;
    stats.symlinks += 1;
    Ok(())
}

fn move_regular(
    source: &Path,
    dest: &Path,
    meta: &fs::Metadata,
    stats: &mut MoveStats,
) -> Result<()> {
    let src = File::open(source)
        .map_err(|e| RfsError::io_context("open", source.display().to_string(), e))?;
    let dst = File::create(dest)
        .map_err(|e| RfsError::io_context("create", dest.display().to_string(), e))?;
    let copied = copy_file_data(&src, &dst, source, meta.len())?;
    dst.sync_all()
        .map_err(|e| RfsError::io_context("fsync", dest.display().to_string(), e))?;
    drop(dst);
    copy_metadata(dest, meta, false)?;
    fs::remove_file(source)
        .map_err(|e| RfsError::io_context("unlink", source.display().to_string(), e))?;
    stats.files += 1;
    stats.bytes_copied += copied;
    Ok(())
}

/// Copy only the data segments, probing holes with `SEEK_DATA` /
/// `SEEK_HOLE`; the destination length is set up front so trailing
/// holes need no write at all. Filesystems without hole probing fall
/// back to a dense copy.
fn copy_file_data(src: &File, dst: &File, source: &Path, len: u64) -> Result<u64> {
    dst.set_len(len)
        .map_err(|e| RfsError::io_context("ftruncate", source.display().to_string(), e))?;

    let fd = src.as_raw_fd();
    let mut copied = 0_u64;
    let mut offset: libc::off_t = 0;
    loop {
        // SAFETY: lseek takes no pointers; fd is open.
        let data = unsafe { libc::lseek(fd, offset, libc::SEEK_DATA) };
        if data < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENXIO) => Ok(copied), // only holes remain
                Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => {
                    debug!(
                        target: "rfs::move",
                        path = %source.display(),
                        "no hole probing here, copying densely"
                    );
                    copy_range(src, dst, source, 0, len)?;
                    Ok(len)
                }
                _ => Err(RfsError::io_context(
                    "lseek(SEEK_DATA)",
                    source.display().to_string(),
                    err,
                )),
            };
        }
        // SAFETY: as above.
        let hole = unsafe { libc::lseek(fd, data, libc::SEEK_HOLE) };
        if hole < 0 {
            return Err(RfsError::io_context(
                "lseek(SEEK_HOLE)",
                source.display().to_string(),
                io::Error::last_os_error(),
            ));
        }
        let segment = (hole - data) as u64;
        copy_range(src, dst, source, data as u64, segment)?;
        copied += segment;
        offset = hole;
    }
}

fn copy_range(src: &File, dst: &File, source: &Path, start: u64, len: u64) -> Result<()> {
    let mut buf = vec![0_u8; COPY_CHUNK.min(len.try_into().unwrap_or(COPY_CHUNK))];
    let mut done = 0_u64;
    while done < len {
        let chunk = usize::try_from((len - done).min(buf.len() as u64))
            .map_err(|_| RfsError::Overflow("copy chunk"))?;
        src.read_exact_at(&mut buf[..chunk], start + done)
            .map_err(|e| RfsError::io_context("pread", source.display().to_string(), e))?;
        dst.write_all_at(&buf[..chunk], start + done)
            .map_err(|e| RfsError::io_context("pwrite", source.display().to_string(), e))?;
        done += chunk as u64;
    }
    Ok(())
}

fn move_special(
    source: &Path,
    dest: &Path,
    meta: &fs::Metadata,
    stats: &mut MoveStats,
) -> Result<()> {
    let cdest = cstring(dest)?;
    #[allow(clippy::cast_possible_truncation)]
    let mode = meta.mode() as libc::mode_t;
    // SAFETY: cdest is a valid NUL-terminated path.
    let rc = unsafe { libc::mknod(cdest.as_ptr(), mode, meta.rdev() as libc::dev_t) };
    if rc != 0 {
        return Err(RfsError::io_context(
            "mknod",
            dest.display().to_string(),
            io::Error::last_os_error(),
        ));
    }
    copy_metadata(dest, meta, false)?;
    fs::remove_file(source)
        .map_err(|e| RfsError::io_context("unlink", source.display().to_string(), e))?;
    stats.specials += 1;
    Ok(())
}

/// Mode is required; ownership and timestamps are best-effort.
fn copy_metadata(dest: &Path, meta: &fs::Metadata, is_symlink: bool) -> Result<()> {
    if !is_symlink {
        fs::set_permissions(dest, fs::Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(|e| RfsError::io_context("chmod", dest.display().to_string(), e))?;
    }

    let cdest = cstring(dest)?;
    // SAFETY: cdest is a valid NUL-terminated path.
    let rc = unsafe { libc::lchown(cdest.as_ptr(), meta.uid(), meta.gid()) };
    if rc != 0 {
        warn!(
            target: "rfs::move",
            path = %dest.display(),
            error = %io::Error::last_os_error(),
            "ownership not preserved"
        );
    }

    let times = [
        libc::timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        libc::timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    ];
    // SAFETY: cdest and times are valid for the duration of the call.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            cdest.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        warn!(
            target: "rfs::move",
            path = %dest.display(),
            error = %io::Error::last_os_error(),
            "timestamps not preserved"
        );
    }
    Ok(())
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| RfsError::Format(format!("path contains NUL: {}", path.display())))
}
