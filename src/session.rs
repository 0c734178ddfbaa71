//! Filesystem session
//!
//! A session runs a filesystem implementation while it is being mounted to a specific mount
//! point. A session begins by mounting the filesystem and ends by unmounting it. While the
//! filesystem is mounted, the session loop receives, dispatches and replies to kernel requests
//! for filesystem operations under its mount point.

use libc::{EAGAIN, EINTR, ENODEV, ENOENT};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fmt, io};

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::mnt::Mount;
use crate::request::Request;
use crate::Filesystem;
use crate::MountOption;

/// The max size of write requests from the kernel. The absolute minimum is 4k,
/// FUSE recommends at least 128k, max 16M is supported by the kernel.
pub(crate) const MAX_WRITE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the buffer used to receive requests from the kernel. A read can include any
/// number of bytes up to this size, and every read must be able to fit a full write
/// request plus its header.
const BUFFER_SIZE: usize = MAX_WRITE_SIZE + 4096;

/// Which remote UIDs are allowed to access a mounted filesystem, beyond the user
/// that performed the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionACL {
    /// Only the owner may access the filesystem
    Owner,
    /// Root and the owner may access the filesystem
    RootAndOwner,
    /// Everyone may access the filesystem
    All,
}

impl Default for SessionACL {
    fn default() -> Self {
        SessionACL::Owner
    }
}

impl SessionACL {
    pub(crate) fn to_mount_option(self) -> Option<&'static str> {
        match self {
            SessionACL::Owner => None,
            SessionACL::RootAndOwner | SessionACL::All => Some("allow_other"),
        }
    }
}

/// The session data structure
#[derive(Debug)]
pub struct Session<FS: Filesystem> {
    /// Filesystem operation implementations
    pub(crate) filesystem: FS,
    /// Communication channel to the kernel driver
    ch: Channel,
    /// FUSE protocol major version
    pub(crate) proto_major: u32,
    /// FUSE protocol minor version
    pub(crate) proto_minor: u32,
    /// True once the filesystem has replied to the `FUSE_INIT` handshake
    pub(crate) initialized: bool,
    /// True once the filesystem has processed `FUSE_DESTROY`
    pub(crate) destroyed: bool,
}

impl<FS: Filesystem> Session<FS> {
    /// Create a new session by mounting the given filesystem to the given mountpoint
    pub fn new(
        filesystem: FS,
        mountpoint: &Path,
        options: &[MountOption],
    ) -> io::Result<Session<FS>> {
        info!("Mounting {}", mountpoint.display());
        let ch = Channel::new(mountpoint, options, SessionACL::default())?;
        Ok(Session {
            filesystem,
            ch,
            proto_major: 0,
            proto_minor: 0,
            initialized: false,
            destroyed: false,
        })
    }

    /// Return path of the mounted filesystem
    pub fn mountpoint(&self) -> &Path {
        self.ch.mountpoint()
    }

    /// A handle that can be used to send asynchronous notifications to the kernel
    /// for this session (cache invalidation, poll wakeups), independent of request
    /// dispatch.
    pub fn notifier(&self) -> crate::notify::Notifier {
        crate::notify::Notifier::new(self.ch.sender())
    }

    /// Run the session loop that receives kernel requests and dispatches them to method
    /// calls into the filesystem.
    ///
    /// This read-dispatch-reply loop is non-concurrent to prevent having multiple buffers
    /// (which take up much memory), but is ok since the kernel serializes requests for a
    /// given filesystem anyway.
    pub fn run(mut self) -> io::Result<()> {
        let mut buffer = vec![0; BUFFER_SIZE];
        loop {
            let size = match self.ch.receive(&mut buffer) {
                Ok(size) => size,
                Err(err) => match err.raw_os_error() {
                    // Operation interrupted; safe to retry.
                    Some(ENOENT) | Some(EINTR) | Some(EAGAIN) => continue,
                    // Filesystem was unmounted; quit the loop.
                    Some(ENODEV) => break,
                    _ => return Err(err),
                },
            };
            let sender = self.ch.sender();
            if let Some(request) = Request::new(sender, &buffer[..size]) {
                request.dispatch(&mut self);
            }
            if self.destroyed {
                break;
            }
        }
        Ok(())
    }
}

impl<FS: 'static + Filesystem + Send> Session<FS> {
    /// Run the session loop in a background thread
    pub fn spawn(self) -> io::Result<BackgroundSession> {
        BackgroundSession::new(self)
    }
}

/// A handle that can be used to unmount a mounted filesystem explicitly, without
/// waiting for its owning `BackgroundSession` (or `Session`) to be dropped.
pub struct SessionUnmounter {
    mountpoint: PathBuf,
    mount: Arc<Mutex<Option<Mount>>>,
}

impl fmt::Debug for SessionUnmounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionUnmounter")
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}

impl SessionUnmounter {
    pub(crate) fn new(mountpoint: PathBuf, mount: Arc<Mutex<Option<Mount>>>) -> Self {
        SessionUnmounter { mountpoint, mount }
    }

    /// Unmount the filesystem immediately.
    pub fn unmount(&mut self) -> io::Result<()> {
        let mut guard = self.mount.lock();
        let mount = match guard.take() {
            Some(mount) => mount,
            None => return Ok(()),
        };
        match mount.umount(&[]) {
            Ok(()) => Ok(()),
            Err((remaining, err)) => {
                *guard = remaining;
                error!("Failed to unmount {}: {}", self.mountpoint.display(), err);
                Err(err)
            }
        }
    }
}

/// The background session data structure
pub struct BackgroundSession {
    /// Path of the mounted filesystem
    pub mountpoint: PathBuf,
    /// Thread guard of the background session
    pub guard: std::thread::JoinHandle<io::Result<()>>,
    /// Handle for unmounting the filesystem
    unmounter: SessionUnmounter,
    /// Handle usable to send asynchronous notifications while the session is running
    sender: crate::channel::ChannelSender,
}

impl BackgroundSession {
    /// Create a new background session for the given session by running its
    /// session loop in a background thread. If the returned handle is dropped,
    /// the filesystem is unmounted.
    pub fn new<FS: Filesystem + Send + 'static>(se: Session<FS>) -> io::Result<BackgroundSession> {
        let mountpoint = se.mountpoint().to_path_buf();
        let unmounter = se.ch.unmounter();
        let sender = se.ch.sender();
        let guard = std::thread::spawn(move || se.run());
        Ok(BackgroundSession {
            mountpoint,
            guard,
            unmounter,
            sender,
        })
    }

    /// A handle that can be used to send asynchronous notifications to the kernel
    /// for this session (cache invalidation, poll wakeups), independent of request
    /// dispatch.
    pub fn notifier(&self) -> crate::notify::Notifier {
        crate::notify::Notifier::new(self.sender)
    }

    /// Unmount the filesystem and join the background thread.
    pub fn join(self) {
        let BackgroundSession {
            mountpoint: _,
            guard,
            mut unmounter,
            sender: _,
        } = self;
        let _ = unmounter.unmount();
        let _ = guard.join();
    }
}

impl Drop for BackgroundSession {
    fn drop(&mut self) {
        info!("Unmounting {}", self.mountpoint.display());
        if let Err(err) = self.unmounter.unmount() {
            error!("Failed to unmount {}: {}", self.mountpoint.display(), err);
        }
    }
}

impl fmt::Debug for BackgroundSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundSession")
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}
