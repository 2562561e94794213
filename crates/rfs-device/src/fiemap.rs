//! FIEMAP extent extraction.
//!
//! Queries the filesystem for the physical layout of a file via the
//! `FS_IOC_FIEMAP` ioctl, feeding every endpoint into the block-size
//! probe. The sync flag is set so the kernel flushes delayed
//! allocations before reporting.

use crate::DeviceFile;
use rfs_error::{Result, RfsError};
use std::io;
use tracing::{debug, trace};

use rfs_types::{BlockSizeProbe, Extent, ExtentList};

const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;

const FIEMAP_FLAG_SYNC: u32 = 0x0000_0001;
const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;

/// Extents fetched per ioctl round.
const FIEMAP_BATCH: usize = 256;

#[repr(C)]
#[derive(Clone, Copy)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
struct FiemapRequest {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
    fm_extents: [FiemapExtent; FIEMAP_BATCH],
}

impl FiemapRequest {
    fn zeroed(start: u64) -> Self {
        const ZERO_EXTENT: FiemapExtent = FiemapExtent {
            fe_logical: 0,
            fe_physical: 0,
            fe_length: 0,
            fe_reserved64: [0; 2],
            fe_flags: 0,
            fe_reserved: [0; 3],
        };
        Self {
            fm_start: start,
            fm_length: u64::MAX - start,
            fm_flags: FIEMAP_FLAG_SYNC,
            fm_mapped_extents: 0,
            fm_extent_count: FIEMAP_BATCH as u32,
            fm_reserved: 0,
            fm_extents: [ZERO_EXTENT; FIEMAP_BATCH],
        }
    }
}

/// Read the physical extents of `file`, accumulating every endpoint
/// into `probe`. Extents land in the list keyed by `physical` with the
/// file offset as `logical`.
pub fn read_file_extents(file: &DeviceFile, probe: &mut BlockSizeProbe) -> Result<ExtentList> {
    let mut extents = ExtentList::new();
    let mut start = 0_u64;

    loop {
        let mut req = FiemapRequest::zeroed(start);
        // SAFETY: req is a properly sized FIEMAP buffer; the kernel
        // writes at most fm_extent_count extent records into it.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                FS_IOC_FIEMAP as _,
                std::ptr::addr_of_mut!(req),
            )
        };
        if rc != 0 {
            return Err(RfsError::io_context(
                "ioctl(FIEMAP)",
                format!("{} '{}'", file.role(), file.path().display()),
                io::Error::last_os_error(),
            ));
        }

        let mapped = req.fm_mapped_extents as usize;
        if mapped == 0 {
            break;
        }
        let mut saw_last = false;
        for fe in &req.fm_extents[..mapped.min(FIEMAP_BATCH)] {
            trace!(
                target: "rfs::fiemap",
                physical = fe.fe_physical,
                logical = fe.fe_logical,
                length = fe.fe_length,
                flags = fe.fe_flags,
                "extent"
            );
            extents.insert(Extent::new(fe.fe_physical, fe.fe_logical, fe.fe_length));
            probe.accumulate_value(fe.fe_physical | fe.fe_logical | fe.fe_length);
            start = fe.fe_logical.saturating_add(fe.fe_length);
            if fe.fe_flags & FIEMAP_EXTENT_LAST != 0 {
                saw_last = true;
            }
        }
        if saw_last {
            break;
        }
    }

    debug!(
        target: "rfs::fiemap",
        role = %file.role(),
        count = extents.len(),
        total_length = extents.total_length(),
        "extents read"
    );
    Ok(extents)
}
