//! Encoding for asynchronous notifications sent from the filesystem to the kernel,
//! outside of any request/reply pair (`unique` is always zero, `error` carries the
//! notification code instead of an errno).

use std::io::IoSlice;
use std::num::TryFromIntError;
use std::os::unix::ffi::OsStrExt;

use smallvec::SmallVec;
use smallvec::smallvec;
use zerocopy::IntoBytes;

use super::INodeNo;
use super::fuse_abi as abi;
use super::fuse_abi::fuse_notify_code;

#[derive(Debug)]
pub(crate) enum Notification<'a> {
    PollWakeup(abi::fuse_notify_poll_wakeup_out),
    InvalInode(abi::fuse_notify_inval_inode_out),
    InvalEntry(abi::fuse_notify_inval_entry_out, &'a [u8]),
    Store(abi::fuse_notify_store_out, &'a [u8]),
    Delete(abi::fuse_notify_delete_out, &'a [u8]),
}

impl<'a> Notification<'a> {
    pub(crate) fn new_poll(kh: crate::notify::PollHandle) -> Self {
        Notification::PollWakeup(abi::fuse_notify_poll_wakeup_out { kh: kh.0 })
    }

    pub(crate) fn new_inval_inode(ino: INodeNo, off: i64, len: i64) -> Self {
        Notification::InvalInode(abi::fuse_notify_inval_inode_out {
            ino: ino.into(),
            off,
            len,
        })
    }

    pub(crate) fn new_inval_entry(
        parent: INodeNo,
        name: &'a std::ffi::OsStr,
    ) -> Result<Self, TryFromIntError> {
        let namelen: u32 = name.len().try_into()?;
        Ok(Notification::InvalEntry(
            abi::fuse_notify_inval_entry_out {
                parent: parent.into(),
                namelen,
                padding: 0,
            },
            name.as_bytes(),
        ))
    }

    pub(crate) fn new_store(
        ino: INodeNo,
        offset: u64,
        data: &'a [u8],
    ) -> Result<Self, TryFromIntError> {
        let size: u32 = data.len().try_into()?;
        Ok(Notification::Store(
            abi::fuse_notify_store_out {
                nodeid: ino.into(),
                offset,
                size,
                padding: 0,
            },
            data,
        ))
    }

    pub(crate) fn new_delete(
        parent: INodeNo,
        child: INodeNo,
        name: &'a std::ffi::OsStr,
    ) -> Result<Self, TryFromIntError> {
        let namelen: u32 = name.len().try_into()?;
        Ok(Notification::Delete(
            abi::fuse_notify_delete_out {
                parent: parent.into(),
                child: child.into(),
                namelen,
                padding: 0,
            },
            name.as_bytes(),
        ))
    }

    /// Build the wire representation (`fuse_out_header` with `unique = 0` and `error`
    /// holding the negated notify code, followed by the notification struct and any
    /// trailing name/data bytes) and hand it to `f` as a single iovec.
    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(
        &self,
        code: fuse_notify_code,
        f: F,
    ) -> Result<T, TryFromIntError> {
        let (body, extra): (&[u8], &[u8]) = match self {
            Notification::PollWakeup(s) => (s.as_bytes(), &[]),
            Notification::InvalInode(s) => (s.as_bytes(), &[]),
            Notification::InvalEntry(s, name) => (s.as_bytes(), name),
            Notification::Store(s, data) => (s.as_bytes(), data),
            Notification::Delete(s, name) => (s.as_bytes(), name),
        };
        let datalen = body.len() + extra.len();
        let len: u32 = (size_of::<abi::fuse_out_header>() + datalen).try_into()?;
        let header = abi::fuse_out_header {
            len,
            error: -(code as i32),
            unique: 0,
        };
        let mut iov: SmallVec<[IoSlice<'_>; 3]> = smallvec![IoSlice::new(header.as_bytes())];
        iov.push(IoSlice::new(body));
        if !extra.is_empty() {
            iov.push(IoSlice::new(extra));
        }
        Ok(f(&iov))
    }
}
