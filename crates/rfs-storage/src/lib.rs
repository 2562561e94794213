#![forbid(unsafe_code)]
//! The storage window: primary device extents plus an optional scratch
//! file, presented as one contiguous run of host memory.
//!
//! Construction reserves the total as an anonymous placeholder, then
//! replaces it segment by segment with fixed-address shared mappings:
//! each primary extent of the device in order, then the scratch file as
//! a single trailing segment. The executor addresses any storage byte
//! by a single window offset; writeback to the device or scratch file
//! is the kernel's, made durable per-range with `msync`.

use rfs_device::{preallocate, DeviceFile, FileRole, Reservation};
use rfs_error::{Result, RfsError};
use rfs_types::ExtentList;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Scratch file name inside the job directory.
pub const SCRATCH_FILE_NAME: &str = ".storage";

/// One mapped segment of the window, for reporting.
#[derive(Debug, Clone, Copy)]
pub struct StorageSegment {
    pub role: FileRole,
    /// Window byte offset where this segment starts.
    pub window_offset: u64,
    /// Offset in the backing file (device physical, or 0 for scratch).
    pub file_offset: u64,
    pub length: u64,
}

/// Contiguous storage window over primary extents + scratch file.
#[derive(Debug)]
pub struct StorageWindow {
    reservation: Reservation,
    segments: Vec<StorageSegment>,
    scratch: Option<(File, PathBuf)>,
    total_len: u64,
}

impl StorageWindow {
    /// Build the window for a job.
    ///
    /// `primary` holds the in-device storage extents in byte units;
    /// every `physical` offset must be page aligned (the planner selects
    /// them that way). `secondary_len` is the scratch file size in
    /// bytes, zero for none. Any failure tears down partial mappings and
    /// removes a scratch file created by this call.
    pub fn build(
        device: &DeviceFile,
        job_dir: &Path,
        primary: &ExtentList,
        secondary_len: u64,
    ) -> Result<Self> {
        let primary_len = primary.total_length();
        let total_len = primary_len
            .checked_add(secondary_len)
            .ok_or(RfsError::Overflow("storage length"))?;
        let total =
            usize::try_from(total_len).map_err(|_| RfsError::Overflow("storage length"))?;

        let mut reservation = Reservation::reserve(total)?;
        let mut segments = Vec::with_capacity(primary.len() + 1);

        let scratch_path = job_dir.join(SCRATCH_FILE_NAME);
        let scratch = if secondary_len > 0 {
            Some((create_scratch(&scratch_path, secondary_len)?, scratch_path))
        } else {
            debug!(
                target: "rfs::storage",
                "not creating {}, {} is large enough",
                FileRole::SecondaryStorage,
                FileRole::PrimaryStorage
            );
            None
        };

        // On any mapping failure, drop the reservation (one munmap) and
        // remove the scratch file we just created.
        let result = Self::map_segments(
            &mut reservation,
            &mut segments,
            device,
            primary,
            scratch.as_ref().map(|(file, _)| file),
            secondary_len,
        );
        if let Err(err) = result {
            drop(reservation);
            if let Some((_, path)) = &scratch {
                if let Err(unlink_err) = std::fs::remove_file(path) {
                    warn!(
                        target: "rfs::storage",
                        path = %path.display(),
                        error = %unlink_err,
                        "removing scratch file after failed construction"
                    );
                }
            }
            return Err(err);
        }

        info!(
            target: "rfs::storage",
            role = %FileRole::Storage,
            primary_bytes = primary_len,
            secondary_bytes = secondary_len,
            segments = segments.len(),
            "storage window mapped"
        );
        Ok(Self {
            reservation,
            segments,
            scratch,
            total_len,
        })
    }

    fn map_segments(
        reservation: &mut Reservation,
        segments: &mut Vec<StorageSegment>,
        device: &DeviceFile,
        primary: &ExtentList,
        scratch: Option<&File>,
        secondary_len: u64,
    ) -> Result<()> {
        use std::os::fd::AsRawFd;

        let mut window_offset = 0_usize;
        for extent in primary {
            let len =
                usize::try_from(extent.length).map_err(|_| RfsError::Overflow("extent length"))?;
            reservation.map_fixed(window_offset, len, device.as_raw_fd(), extent.physical)?;
            segments.push(StorageSegment {
                role: FileRole::PrimaryStorage,
                window_offset: window_offset as u64,
                file_offset: extent.physical,
                length: extent.length,
            });
            window_offset += len;
        }
        if let Some(file) = scratch {
            let len = usize::try_from(secondary_len)
                .map_err(|_| RfsError::Overflow("scratch length"))?;
            reservation.map_fixed(window_offset, len, file.as_raw_fd(), 0)?;
            segments.push(StorageSegment {
                role: FileRole::SecondaryStorage,
                window_offset: window_offset as u64,
                file_offset: 0,
                length: secondary_len,
            });
        }
        reservation.seal()
    }

    /// Total window length in bytes.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    #[must_use]
    pub fn segments(&self) -> &[StorageSegment] {
        &self.segments
    }

    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        self.reservation
            .slice(to_usize(offset)?, to_usize(len)?)
    }

    pub fn slice_mut(&mut self, offset: u64, len: u64) -> Result<&mut [u8]> {
        self.reservation
            .slice_mut(to_usize(offset)?, to_usize(len)?)
    }

    /// Make `[offset, offset + len)` durable in its backing file.
    pub fn msync(&self, offset: u64, len: u64) -> Result<()> {
        self.reservation.msync(to_usize(offset)?, to_usize(len)?)
    }

    /// Unmap the window. With `remove_scratch`, also delete the scratch
    /// file; on error paths it is left behind for post-mortem resume.
    pub fn teardown(self, remove_scratch: bool) -> Result<()> {
        let scratch = self.scratch.as_ref().map(|(_, path)| path.clone());
        drop(self);
        if remove_scratch {
            if let Some(path) = scratch {
                std::fs::remove_file(&path).map_err(|e| {
                    RfsError::io_context("unlink", path.display().to_string(), e)
                })?;
            }
        }
        Ok(())
    }
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| RfsError::Overflow("window offset"))
}

fn create_scratch(path: &Path, len: u64) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| RfsError::io_context("create", path.display().to_string(), e))?;
    info!(
        target: "rfs::storage",
        path = %path.display(),
        bytes = len,
        "creating {}",
        FileRole::SecondaryStorage
    );
    preallocate(&file, FileRole::SecondaryStorage.as_str(), len)?;
    Ok(file)
}

// ── Tests ───────────────────────────────────────────────────────────────────
