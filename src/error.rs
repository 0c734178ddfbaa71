//! Error taxonomy shared by every backup-engine component.
//!
//! `BkpError` is the one error type that crosses module boundaries inside this
//! crate. It is deliberately coarse (kinds, not causes) because the control
//! channel and the FUSE adapter both need to collapse arbitrary lower-level
//! failures into the fixed vocabulary a client or the kernel understands.

use std::io;

use crate::Errno;

/// Error kinds surfaced across the lower-fs adapter, the metadata store, the
/// backup policy engine and the control channel.
#[derive(Debug, thiserror::Error)]
pub enum BkpError {
    /// The target file, backup object, or directory entry does not exist.
    #[error("not found")]
    NotFound,
    /// A create-if-not-exists call found an existing object at the target name.
    #[error("already exists")]
    Exists,
    /// A request argument was malformed (bad selector, negative length, ...).
    #[error("invalid argument")]
    InvalidArgument,
    /// The computed backup basename exceeds the 230-byte cap.
    #[error("name too long")]
    NameTooLong,
    /// A control operation was issued against a directory handle.
    #[error("is a directory")]
    IsDirectory,
    /// Allocation failure surfaced from the lower filesystem.
    #[error("out of memory")]
    NoMemory,
    /// The lower filesystem denied the operation.
    #[error("permission denied")]
    Permission,
    /// Catch-all I/O failure from the lower filesystem.
    #[error("I/O error: {0}")]
    Io(String),
    /// Step 5 of the write pipeline found a stale sibling that could not be
    /// reconciled by a single unlink-and-retry.
    #[error("conflicting backup object")]
    Conflict,
    /// An opcode or operation this engine does not implement.
    #[error("unsupported operation")]
    Unsupported,
}

impl BkpError {
    /// Classify a raw I/O error from a lower-filesystem call into one of the
    /// fixed kinds in [`BkpError`].
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => BkpError::NotFound,
            io::ErrorKind::AlreadyExists => BkpError::Exists,
            io::ErrorKind::PermissionDenied => BkpError::Permission,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => BkpError::InvalidArgument,
            _ => match err.raw_os_error() {
                Some(libc::ENOMEM) => BkpError::NoMemory,
                Some(libc::ENOENT) => BkpError::NotFound,
                Some(libc::EEXIST) => BkpError::Exists,
                Some(libc::EACCES) | Some(libc::EPERM) => BkpError::Permission,
                Some(libc::ENAMETOOLONG) => BkpError::NameTooLong,
                Some(libc::EISDIR) => BkpError::IsDirectory,
                Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) => BkpError::Unsupported,
                _ => BkpError::Io(err.to_string()),
            },
        }
    }

    /// Map onto the `Errno` the FUSE adapter hands back to the kernel.
    pub fn to_errno(&self) -> Errno {
        match self {
            BkpError::NotFound => Errno::ENOENT,
            BkpError::Exists => Errno::EEXIST,
            BkpError::InvalidArgument => Errno::EINVAL,
            BkpError::NameTooLong => Errno::ENAMETOOLONG,
            BkpError::IsDirectory => Errno::EISDIR,
            BkpError::NoMemory => Errno::ENOMEM,
            BkpError::Permission => Errno::EACCES,
            BkpError::Io(_) => Errno::EIO,
            BkpError::Conflict => Errno::EBUSY,
            BkpError::Unsupported => Errno::ENOSYS,
        }
    }

    /// Human-readable prefix the CLI client prints ahead of its own message,
    /// per the "user-visible behavior" rule in the error-handling section:
    /// categories are never exposed numerically to the end user.
    pub fn category_label(&self) -> &'static str {
        match self {
            BkpError::NotFound => "not found",
            BkpError::Exists => "already exists",
            BkpError::InvalidArgument => "invalid argument",
            BkpError::NameTooLong => "name too long",
            BkpError::IsDirectory => "is a directory",
            BkpError::NoMemory => "out of memory",
            BkpError::Permission => "permission denied",
            BkpError::Io(_) => "I/O error",
            BkpError::Conflict => "conflict",
            BkpError::Unsupported => "unsupported",
        }
    }
}

impl From<io::Error> for BkpError {
    fn from(err: io::Error) -> Self {
        BkpError::from_io(&err)
    }
}

impl From<nix::Error> for BkpError {
    fn from(err: nix::Error) -> Self {
        BkpError::from_io(&io::Error::from(err))
    }
}

/// Convenience alias used throughout the backup engine.
pub type BkpResult<T> = Result<T, BkpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_errno_values() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert!(matches!(BkpError::from_io(&err), BkpError::NotFound));

        let err = io::Error::from_raw_os_error(libc::EEXIST);
        assert!(matches!(BkpError::from_io(&err), BkpError::Exists));

        let err = io::Error::from_raw_os_error(libc::ENAMETOOLONG);
        assert!(matches!(BkpError::from_io(&err), BkpError::NameTooLong));
    }

    #[test]
    fn unknown_errno_falls_back_to_io() {
        let err = io::Error::from_raw_os_error(libc::EDEADLK);
        assert!(matches!(BkpError::from_io(&err), BkpError::Io(_)));
    }
}
