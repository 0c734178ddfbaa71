//! Low-level request/reply plumbing: kernel ABI structs, argument parsing,
//! and the small value types (`INodeNo`, `FileHandle`, ...) threaded through
//! the rest of the crate.

use std::time::SystemTime;

pub(crate) mod argument;
pub(crate) mod cuse_init_flags;
pub mod errno;
pub mod flags;
pub mod fuse_abi;
pub(crate) mod ioctl;
pub(crate) mod ioslice_concat;
pub(crate) mod notify;
pub(crate) mod reply;
pub(crate) mod request;
pub(crate) mod write_flags;

pub use errno::Errno;
pub(crate) use reply::Response;

/// Inode number, as seen by the kernel. `FUSE_ROOT_ID` (1) addresses the
/// mountpoint's root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct INodeNo(pub u64);

impl From<u64> for INodeNo {
    fn from(v: u64) -> Self {
        INodeNo(v)
    }
}

impl From<INodeNo> for u64 {
    fn from(v: INodeNo) -> Self {
        v.0
    }
}

/// Opaque per-open file handle, set by `open`/`opendir` and threaded through
/// every subsequent operation on that handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileHandle(pub u64);

impl From<u64> for FileHandle {
    fn from(v: u64) -> Self {
        FileHandle(v)
    }
}

impl From<FileHandle> for u64 {
    fn from(v: FileHandle) -> Self {
        v.0
    }
}

impl std::fmt::Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the owner of a POSIX byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockOwner(pub u64);

impl From<u64> for LockOwner {
    fn from(v: u64) -> Self {
        LockOwner(v)
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inode generation number, used together with the inode number to detect
/// stale NFS-exported handles across inode reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(pub u64);

/// Unique identifier of an in-flight FUSE request, echoed back in the reply
/// header so the kernel can match the response to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// A byte-range lock, as reported by `getlk`/`setlk`.
#[derive(Debug, Clone, Copy)]
pub struct Lock {
    /// Inclusive start/end of the locked byte range.
    pub range: (u64, u64),
    /// Lock type (`F_RDLCK` / `F_WRLCK` / `F_UNLCK`).
    pub typ: i32,
    /// PID of the process holding (or requesting) the lock.
    pub pid: u32,
}

/// The FUSE kernel ABI version negotiated during `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32);

/// Either a caller-specified timestamp or a request to set the field to the
/// current time, as used by `setattr`'s `atime`/`mtime` arguments.
#[derive(Debug, Clone, Copy)]
pub enum TimeOrNow {
    /// Use a specific timestamp.
    SpecificTime(SystemTime),
    /// Use the time the request is processed.
    Now,
}
