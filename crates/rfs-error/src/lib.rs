#![forbid(unsafe_code)]
//! Error types for ReshapeFS.
//!
//! Defines `RfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno and process exit-code mappings.

use thiserror::Error;

/// Unified error type for all ReshapeFS operations.
#[derive(Debug, Error)]
pub enum RfsError {
    /// Re-initialization of a subsystem that is already open (caller bug).
    #[error("{0} is already open")]
    AlreadyOpen(&'static str),

    /// Operation on a subsystem that was never initialized (caller bug).
    #[error("{0} is not open")]
    NotOpen(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An I/O error tagged with the operation and the file or offset it hit.
    #[error("{op} on {what} failed: {source}")]
    IoContext {
        op: &'static str,
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("length or address overflow: {0}")]
    Overflow(&'static str),

    #[error("misaligned extent ({physical}, {logical}, {length}) for block size {block_size}")]
    Misalignment {
        physical: u64,
        logical: u64,
        length: u64,
        block_size: u64,
    },

    #[error("kernel ignored the fixed-address mapping request at offset {offset}")]
    UnexpectedFixedMapping { offset: u64 },

    #[error("cannot make progress: {needed} more storage bytes required")]
    InsufficientStorage { needed: u64 },

    #[error("unsupported file type at {0}")]
    UnsupportedFileType(String),

    #[error("invalid save file: {0}")]
    Format(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl RfsError {
    /// Wrap an I/O error with the failing operation and its target.
    pub fn io_context(op: &'static str, what: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoContext {
            op,
            what: what.into(),
            source,
        }
    }

    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::AlreadyOpen(_) => libc::EISCONN,
            Self::NotOpen(_) => libc::ENOTCONN,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::IoContext { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::Overflow(_) => libc::EOVERFLOW,
            Self::Misalignment { .. } | Self::Format(_) => libc::EINVAL,
            Self::UnexpectedFixedMapping { .. } => libc::EFAULT,
            Self::InsufficientStorage { .. } => libc::ENOSPC,
            Self::UnsupportedFileType(_) => libc::EOPNOTSUPP,
            Self::Cancelled => libc::ECANCELED,
        }
    }

    /// Process exit code for the CLI: errno values are already small
    /// positive integers, so reuse them, clamped into the 8-bit range.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let errno = self.to_errno();
        if (1..=125).contains(&errno) { errno } else { 1 }
    }
}

/// Result alias using `RfsError`.
pub type Result<T> = std::result::Result<T, RfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(RfsError::AlreadyOpen("device").to_errno(), libc::EISCONN);
        assert_eq!(RfsError::NotOpen("storage").to_errno(), libc::ENOTCONN);
        assert_eq!(
            RfsError::InsufficientStorage { needed: 4096 }.to_errno(),
            libc::ENOSPC
        );
        assert_eq!(
            RfsError::UnexpectedFixedMapping { offset: 0 }.to_errno(),
            libc::EFAULT
        );
        assert_eq!(RfsError::Cancelled.to_errno(), libc::ECANCELED);
    }

    #[test]
    fn io_errors_surface_the_os_code() {
        let err = RfsError::io_context(
            "pwrite",
            "device",
            std::io::Error::from_raw_os_error(libc::ENOSPC),
        );
        assert_eq!(err.to_errno(), libc::ENOSPC);
        let msg = err.to_string();
        assert!(msg.contains("pwrite"), "missing op in {msg:?}");
        assert!(msg.contains("device"), "missing target in {msg:?}");
    }

    #[test]
    fn misalignment_reports_the_extent() {
        let err = RfsError::Misalignment {
            physical: 0,
            logical: 0,
            length: 7,
            block_size: 4,
        };
        assert_eq!(err.to_errno(), libc::EINVAL);
        assert!(err.to_string().contains("block size 4"));
    }

    #[test]
    fn exit_codes_fit_in_a_byte() {
        assert_eq!(RfsError::Cancelled.exit_code(), libc::ECANCELED);
        let err = RfsError::Io(std::io::Error::new(std::io::ErrorKind::Other, "no os code"));
        assert_eq!(err.exit_code(), libc::EIO);
    }
}
