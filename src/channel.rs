//! FUSE kernel driver communication
//!
//! Raw communication channel to the FUSE kernel driver: a thin wrapper around the
//! `/dev/fuse` handle obtained by mounting, used to read incoming requests and to
//! write back replies.

use std::io;
use std::io::IoSlice;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dev_fuse::DevFuse;
use crate::mnt::Mount;
use crate::reply::ReplySender;
use crate::session::{SessionACL, SessionUnmounter};
use crate::MountOption;

/// A raw communication channel to the FUSE kernel driver
#[derive(Debug)]
pub(crate) struct Channel {
    device: Arc<DevFuse>,
    mount: Arc<Mutex<Option<Mount>>>,
    mountpoint: PathBuf,
}

impl Channel {
    pub(crate) fn new(
        mountpoint: &Path,
        options: &[MountOption],
        acl: SessionACL,
    ) -> io::Result<Channel> {
        let (device, mount) = Mount::new(mountpoint, options, acl)?;
        Ok(Channel {
            device,
            mount: Arc::new(Mutex::new(Some(mount))),
            mountpoint: mountpoint.to_path_buf(),
        })
    }

    pub(crate) fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// A cheap, copyable handle usable to send replies for requests read off this channel.
    pub(crate) fn sender(&self) -> ChannelSender {
        ChannelSender {
            fd: self.device.as_raw_fd(),
        }
    }

    /// A handle that can unmount the filesystem from outside the thread running the
    /// request loop.
    pub(crate) fn unmounter(&self) -> SessionUnmounter {
        SessionUnmounter::new(self.mountpoint.clone(), Arc::clone(&self.mount))
    }

    /// Receives data up to the capacity of the given buffer from the FUSE kernel driver.
    ///
    /// Blocks until a request is available; `EINTR` is retried transparently.
    pub(crate) fn receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            let rc = unsafe {
                libc::read(
                    self.device.as_raw_fd(),
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc as usize);
        }
    }
}

/// Sender end of a `Channel`, used by pending replies to write responses back to the
/// kernel.
///
/// Holds only the raw fd of the open `/dev/fuse` handle so it stays `Copy`: the owning
/// `Channel` (and therefore the fd) outlives every request dispatched while a session
/// is running.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelSender {
    fd: RawFd,
}

impl ReplySender for ChannelSender {
    fn send(&self, data: &[IoSlice<'_>]) -> io::Result<()> {
        let rc = unsafe {
            libc::writev(
                self.fd,
                data.as_ptr() as *const libc::iovec,
                data.len() as libc::c_int,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
