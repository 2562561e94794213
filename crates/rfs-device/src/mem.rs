//! Anonymous placeholder mappings with fixed-address replacement.
//!
//! The storage window needs one contiguous host-address range whose
//! pieces are backed by different files at different offsets. The only
//! portable way to get that is to reserve the whole range as an
//! anonymous `PROT_NONE` mapping, then carve it up: `munmap` a
//! sub-range and remap it `MAP_SHARED | MAP_FIXED` at the same address.

use rfs_error::{Result, RfsError};
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use tracing::{debug, error, trace};

/// A reserved contiguous host-address range being replaced, segment by
/// segment, with shared file mappings.
///
/// Slices are only handed out after [`seal`](Self::seal) verified that
/// the file mappings cover the whole reservation; before that every
/// accessor fails with `NotOpen`.
#[derive(Debug)]
pub struct Reservation {
    base: *mut u8,
    len: usize,
    // (offset, len) of each replaced sub-range, in mapping order.
    mapped: Vec<(usize, usize)>,
    sealed: bool,
}

impl Reservation {
    /// Reserve `len` bytes of anonymous, inaccessible address space.
    pub fn reserve(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                base: ptr::null_mut(),
                len: 0,
                mapped: Vec::new(),
                sealed: true,
            });
        }
        // SAFETY: requesting a fresh anonymous mapping at an OS-chosen
        // address; no existing memory is affected.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RfsError::io_context(
                "mmap",
                format!("anonymous reservation of {len} bytes"),
                io::Error::last_os_error(),
            ));
        }
        debug!(target: "rfs::mem", len, "reserved contiguous address range");
        Ok(Self {
            base: base.cast(),
            len,
            mapped: Vec::new(),
            sealed: false,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replace `[offset, offset + len)` of the placeholder with a shared
    /// read-write mapping of `fd` at `file_offset`.
    ///
    /// Fails with `UnexpectedFixedMapping` if the kernel places the
    /// mapping anywhere other than the requested address.
    pub fn map_fixed(
        &mut self,
        offset: usize,
        len: usize,
        fd: RawFd,
        file_offset: u64,
    ) -> Result<()> {
        if self.sealed {
            return Err(RfsError::AlreadyOpen("storage window"));
        }
        let end = offset
            .checked_add(len)
            .ok_or(RfsError::Overflow("mapping range"))?;
        if end > self.len {
            return Err(RfsError::Overflow("mapping past reservation end"));
        }
        let file_off =
            libc::off_t::try_from(file_offset).map_err(|_| RfsError::Overflow("file offset"))?;

        let addr = self.base.wrapping_add(offset);
        // SAFETY: [addr, addr + len) lies inside our own reservation.
        if unsafe { libc::munmap(addr.cast(), len) } != 0 {
            return Err(RfsError::io_context(
                "munmap",
                format!("placeholder at offset {offset}"),
                io::Error::last_os_error(),
            ));
        }
        // SAFETY: remapping the sub-range just vacated, at a fixed
        // address we own.
        let new_addr = unsafe {
            libc::mmap(
                addr.cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                file_off,
            )
        };
        if new_addr == libc::MAP_FAILED {
            return Err(RfsError::io_context(
                "mmap",
                format!("fixed mapping at offset {offset}, length {len}"),
                io::Error::last_os_error(),
            ));
        }
        if new_addr.cast() != addr {
            // SAFETY: unmapping the stray mapping the kernel just gave us.
            if unsafe { libc::munmap(new_addr, len) } != 0 {
                error!(
                    target: "rfs::mem",
                    error = %io::Error::last_os_error(),
                    "munmap of misplaced fixed mapping failed"
                );
            }
            return Err(RfsError::UnexpectedFixedMapping {
                offset: offset as u64,
            });
        }
        trace!(target: "rfs::mem", offset, len, file_offset, "fixed mapping placed");
        self.mapped.push((offset, len));
        Ok(())
    }

    /// Verify the file mappings tile the reservation exactly, in order,
    /// and enable slice access.
    pub fn seal(&mut self) -> Result<()> {
        let mut cursor = 0_usize;
        for &(offset, len) in &self.mapped {
            if offset != cursor {
                return Err(RfsError::Overflow("storage window has unmapped gaps"));
            }
            cursor += len;
        }
        if cursor != self.len {
            return Err(RfsError::Overflow("storage window shorter than reservation"));
        }
        self.sealed = true;
        Ok(())
    }

    fn check_access(&self, offset: usize, len: usize) -> Result<()> {
        if !self.sealed {
            return Err(RfsError::NotOpen("storage window"));
        }
        let end = offset
            .checked_add(len)
            .ok_or(RfsError::Overflow("window range"))?;
        if end > self.len {
            return Err(RfsError::Overflow("window range past end"));
        }
        Ok(())
    }

    /// Borrow `[offset, offset + len)` of the window.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_access(offset, len)?;
        if len == 0 {
            return Ok(&[]);
        }
        // SAFETY: sealed guarantees the range is backed by a live
        // MAP_SHARED mapping owned by self.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset), len) })
    }

    /// Mutably borrow `[offset, offset + len)` of the window.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_access(offset, len)?;
        if len == 0 {
            return Ok(&mut []);
        }
        // SAFETY: as for `slice`, plus `&mut self` gives uniqueness.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) })
    }

    /// Flush `[offset, offset + len)` to the backing file synchronously.
    pub fn msync(&self, offset: usize, len: usize) -> Result<()> {
        self.check_access(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the range is inside our live mapping.
        let rc = unsafe { libc::msync(self.base.add(offset).cast(), len, libc::MS_SYNC) };
        if rc != 0 {
            return Err(RfsError::io_context(
                "msync",
                format!("window range at offset {offset}, length {len}"),
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        // SAFETY: unmapping the entire reservation, placeholder and
        // replacements alike, in one call.
        if unsafe { libc::munmap(self.base.cast(), self.len) } != 0 {
            error!(
                target: "rfs::mem",
                len = self.len,
                error = %io::Error::last_os_error(),
                "munmap of storage window failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    const PAGE: usize = 4096;

    fn temp_file_of(len: usize, fill: u8) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![fill; len]).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn empty_reservation_is_sealed_and_inert() {
        let res = Reservation::reserve(0).unwrap();
        assert!(res.is_empty());
        assert_eq!(res.slice(0, 0).unwrap(), &[] as &[u8]);
        res.msync(0, 0).unwrap();
    }

    #[test]
    fn access_before_seal_is_rejected() {
        let res = Reservation::reserve(PAGE).unwrap();
        assert!(matches!(
            res.slice(0, 1).unwrap_err(),
            RfsError::NotOpen("storage window")
        ));
    }

    #[test]
    fn seal_requires_full_coverage() {
        let tmp = temp_file_of(PAGE, 0);
        let mut res = Reservation::reserve(2 * PAGE).unwrap();
        res.map_fixed(0, PAGE, tmp.as_file().as_raw_fd(), 0).unwrap();
        assert!(res.seal().is_err());
    }

    #[test]
    fn window_aggregates_two_files_contiguously() {
        let a = temp_file_of(PAGE, 0xAA);
        let b = temp_file_of(2 * PAGE, 0xBB);

        let mut res = Reservation::reserve(3 * PAGE).unwrap();
        res.map_fixed(0, PAGE, a.as_file().as_raw_fd(), 0).unwrap();
        res.map_fixed(PAGE, 2 * PAGE, b.as_file().as_raw_fd(), 0)
            .unwrap();
        res.seal().unwrap();

        assert!(res.slice(0, PAGE).unwrap().iter().all(|&x| x == 0xAA));
        assert!(res.slice(PAGE, 2 * PAGE).unwrap().iter().all(|&x| x == 0xBB));
    }

    #[test]
    fn stores_reach_the_backing_file_after_msync() {
        let tmp = temp_file_of(PAGE, 0);
        let mut res = Reservation::reserve(PAGE).unwrap();
        res.map_fixed(0, PAGE, tmp.as_file().as_raw_fd(), 0).unwrap();
        res.seal().unwrap();

        res.slice_mut(0, 8).unwrap().copy_from_slice(b"windowed");
        res.msync(0, PAGE).unwrap();
        drop(res);

        let contents = std::fs::read(tmp.path()).unwrap();
        assert_eq!(&contents[..8], b"windowed");
    }

    #[test]
    fn mapping_at_a_file_offset_sees_that_offset() {
        use std::os::unix::fs::FileExt;

        let tmp = temp_file_of(3 * PAGE, 0);
        tmp.as_file().write_all_at(&[0xCC; PAGE], PAGE as u64).unwrap();

        let mut res = Reservation::reserve(PAGE).unwrap();
        res.map_fixed(0, PAGE, tmp.as_file().as_raw_fd(), PAGE as u64)
            .unwrap();
        res.seal().unwrap();
        assert!(res.slice(0, PAGE).unwrap().iter().all(|&x| x == 0xCC));
    }
}
