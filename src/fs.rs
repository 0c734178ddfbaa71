//! FUSE adapter: the only module that talks to [`crate::Filesystem`] types
//! directly. Delegates to the backup engine and its supporting modules,
//! which are FUSE-agnostic and operate on plain paths and [`BkpError`].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs as stdfs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::backup::BackupEngine;
use crate::config::BkpConfig;
use crate::control::wire as opcode;
use crate::control::{self, ControlOp, Selector};
use crate::direntry;
use crate::error::BkpError;
use crate::ll::flags::fopen_flags::FopenFlags;
use crate::{
    AccessFlags, BsdFileFlags, Errno, FileAttr, FileHandle, FileType, Filesystem, INodeNo,
    IoctlFlags, KernelConfig, LockOwner, OpenFlags, ReadFlags, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyOpen,
    ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow, WriteFlags,
};

const ROOT_INO: u64 = 1;
const ENTRY_TTL: Duration = Duration::from_secs(1);

struct InodeTable {
    next: u64,
    path_to_ino: HashMap<PathBuf, u64>,
    ino_to_path: HashMap<u64, PathBuf>,
}

impl InodeTable {
    fn new(root: PathBuf) -> Self {
        let mut ino_to_path = HashMap::new();
        let mut path_to_ino = HashMap::new();
        ino_to_path.insert(ROOT_INO, root.clone());
        path_to_ino.insert(root, ROOT_INO);
        InodeTable {
            next: ROOT_INO + 1,
            path_to_ino,
            ino_to_path,
        }
    }

    fn path(&self, ino: u64) -> Option<PathBuf> {
        self.ino_to_path.get(&ino).cloned()
    }

    fn ino_for(&mut self, path: &Path) -> u64 {
        if let Some(ino) = self.path_to_ino.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.path_to_ino.insert(path.to_path_buf(), ino);
        self.ino_to_path.insert(ino, path.to_path_buf());
        ino
    }

    fn forget(&mut self, path: &Path) {
        if let Some(ino) = self.path_to_ino.remove(path) {
            self.ino_to_path.remove(&ino);
        }
    }
}

/// The versioning stacking filesystem. Holds the lower directory root, the
/// parsed mount configuration, the backup policy engine (which owns the
/// per-file metadata-update critical section), and a minimal passthrough
/// inode allocator mapping FUSE inode numbers to lower paths.
pub struct BkpFs {
    engine: BackupEngine,
    inodes: Mutex<InodeTable>,
}

impl std::fmt::Debug for BkpFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BkpFs").finish_non_exhaustive()
    }
}

impl BkpFs {
    pub fn new(lower_root: PathBuf, config: BkpConfig) -> Self {
        BkpFs {
            engine: BackupEngine::new(config),
            inodes: Mutex::new(InodeTable::new(lower_root)),
        }
    }

    fn path(&self, ino: INodeNo) -> Option<PathBuf> {
        self.inodes.lock().path(ino.0)
    }

    fn child_path(&self, parent: INodeNo, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    fn alloc_ino(&self, path: &Path) -> INodeNo {
        INodeNo(self.inodes.lock().ino_for(path))
    }

    fn attr_of(&self, ino: u64, meta: &stdfs::Metadata) -> FileAttr {
        let kind = FileType::from_std(meta.file_type()).unwrap_or(FileType::RegularFile);
        FileAttr {
            ino: INodeNo(ino),
            size: meta.size(),
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: SystemTime::UNIX_EPOCH + Duration::from_secs(meta.ctime() as u64),
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            flags: 0,
        }
    }

    fn stat(&self, ino: u64, path: &Path) -> Result<FileAttr, BkpError> {
        let meta = stdfs::symlink_metadata(path)?;
        Ok(self.attr_of(ino, &meta))
    }

    /// Demultiplex a control-channel `ioctl` into its control operations.
    /// The on-wire layout is a leading `i32` opcode, then a per-op record of
    /// little-endian fields. Opcodes this engine does not define at all are
    /// forwarded verbatim to the lower filesystem's own `ioctl`, rather than
    /// answered with `ENOSYS` here.
    fn dispatch_ioctl(&self, path: &Path, cmd: u32, in_data: &[u8], out_size: u32) -> Result<Vec<u8>, BkpError> {
        if !opcode::is_known(cmd) {
            return crate::lower::ioctl_passthrough(path, cmd, in_data, out_size);
        }
        let op = decode_op(cmd, in_data)?;
        match op {
            ControlOp::GetMax => Ok(self.engine.config().maxvers.to_le_bytes().to_vec()),
            ControlOp::GetCount => Ok(control::get_count(path)?.to_le_bytes().to_vec()),
            ControlOp::GetSize(selector) => Ok(control::get_size(path, selector)?.to_le_bytes().to_vec()),
            ControlOp::View {
                selector,
                offset,
                buf_len,
            } => control::view(path, selector, offset, buf_len.min(out_size)),
            ControlOp::Delete(selector) => {
                control::delete(path, selector)?;
                Ok(Vec::new())
            }
            ControlOp::Restore(selector) => {
                control::restore(path, selector)?;
                Ok(Vec::new())
            }
        }
    }
}

fn selector_from_wire(raw: i32, is_delete: bool) -> Result<Selector, BkpError> {
    match raw {
        0 => Ok(Selector::Newest),
        -1 => Ok(Selector::Oldest),
        1 if is_delete => Ok(Selector::All),
        n if n > 0 => Ok(Selector::Nth(n as u32)),
        _ => Err(BkpError::InvalidArgument),
    }
}

fn decode_op(cmd: u32, in_data: &[u8]) -> Result<ControlOp, BkpError> {
    match cmd {
        opcode::GET_MAX => Ok(ControlOp::GetMax),
        opcode::GET_COUNT => Ok(ControlOp::GetCount),
        opcode::GET_SIZE => {
            let raw = read_i32(in_data, 0)?;
            Ok(ControlOp::GetSize(selector_from_wire(raw, false)?))
        }
        opcode::VIEW => {
            let raw = read_i32(in_data, 0)?;
            let offset = read_u64(in_data, 4)?;
            let buf_len = in_data.len().saturating_sub(12) as u32;
            let buf_len = if buf_len > 0 { buf_len } else { 4096 };
            Ok(ControlOp::View {
                selector: selector_from_wire(raw, false)?,
                offset,
                buf_len,
            })
        }
        opcode::DELETE => {
            let raw = read_i32(in_data, 0)?;
            Ok(ControlOp::Delete(selector_from_wire(raw, true)?))
        }
        opcode::RESTORE => {
            let raw = read_i32(in_data, 0)?;
            Ok(ControlOp::Restore(selector_from_wire(raw, false)?))
        }
        opcode::LIST => Err(BkpError::Unsupported),
        _ => Err(BkpError::Unsupported),
    }
}

fn read_i32(data: &[u8], at: usize) -> Result<i32, BkpError> {
    let bytes: [u8; 4] = data
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(BkpError::InvalidArgument)?;
    Ok(i32::from_le_bytes(bytes))
}

fn read_u64(data: &[u8], at: usize) -> Result<u64, BkpError> {
    let bytes: [u8; 8] = data
        .get(at..at + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or(BkpError::InvalidArgument)?;
    Ok(u64::from_le_bytes(bytes))
}

impl Filesystem for BkpFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        Ok(())
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        if name.as_bytes().starts_with(direntry::BACKUP_PREFIX.as_bytes()) {
            reply.error(Errno::ENOENT);
            return;
        }
        let ino = self.alloc_ino(&path);
        match self.stat(ino.0, &path) {
            Ok(attr) => reply.entry(&ENTRY_TTL, &attr, 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let Some(path) = self.path(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match self.stat(ino.0, &path) {
            Ok(attr) => reply.attr(&ENTRY_TTL, &attr),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        if let Some(mode) = mode {
            if let Err(err) = stdfs::set_permissions(&path, stdfs::Permissions::from_mode(mode)) {
                reply.error(BkpError::from_io(&err).to_errno());
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            let _ = nix::unistd::chown(
                &path,
                uid.map(nix::unistd::Uid::from_raw),
                gid.map(nix::unistd::Gid::from_raw),
            );
        }
        if let Some(size) = size {
            if let Err(err) = stdfs::File::options()
                .write(true)
                .open(&path)
                .and_then(|f| f.set_len(size))
            {
                reply.error(BkpError::from_io(&err).to_errno());
                return;
            }
        }
        match self.stat(ino.0, &path) {
            Ok(attr) => reply.attr(&ENTRY_TTL, &attr),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn mkdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        if let Err(err) = stdfs::create_dir(&path) {
            reply.error(BkpError::from_io(&err).to_errno());
            return;
        }
        let _ = stdfs::set_permissions(&path, stdfs::Permissions::from_mode(mode));
        let ino = self.alloc_ino(&path);
        match self.stat(ino.0, &path) {
            Ok(attr) => reply.entry(&ENTRY_TTL, &attr, 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match stdfs::remove_dir(&path) {
            Ok(()) => {
                self.inodes.lock().forget(&path);
                reply.ok();
            }
            Err(err) => reply.error(BkpError::from_io(&err).to_errno()),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        if let Err(err) = self.engine.cleanup_on_unlink(&path) {
            warn!("bkpfs: cleanup-on-unlink failed for {}: {err}", path.display());
        }
        match stdfs::remove_file(&path) {
            Ok(()) => {
                self.inodes.lock().forget(&path);
                reply.ok();
            }
            Err(err) => reply.error(BkpError::from_io(&err).to_errno()),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        reply.opened(FileHandle(ino.0), FopenFlags::empty());
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        reply.opened(FileHandle(ino.0), FopenFlags::empty());
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let handle = match crate::lower::open_lower(&path) {
            Ok(h) => h,
            Err(err) => {
                reply.error(err.to_errno());
                return;
            }
        };
        let mut buf = vec![0u8; size as usize];
        match crate::lower::read(&handle, &mut buf, offset) {
            Ok(n) => {
                buf.truncate(n);
                reply.data(&buf);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: i64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match self.engine.write(&path, data, offset as u64, data.len()) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.path(parent) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(Errno::EINVAL);
            return;
        };
        match crate::lower::create_child(&parent_path, name_str, mode) {
            Ok(handle) => {
                let ino = self.alloc_ino(handle.path());
                match self.stat(ino.0, handle.path()) {
                    Ok(attr) => reply.created(&ENTRY_TTL, &attr, 0, FileHandle(ino.0), FopenFlags::empty()),
                    Err(err) => reply.error(err.to_errno()),
                }
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn releasedir(&self, _req: &Request, _ino: INodeNo, _fh: FileHandle, _flags: OpenFlags, reply: ReplyEmpty) {
        reply.ok();
    }

    fn flush(&self, _req: &Request, _ino: INodeNo, _fh: FileHandle, _lock_owner: LockOwner, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&self, _req: &Request, _ino: INodeNo, _fh: FileHandle, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&self, _req: &Request, _ino: INodeNo, _fh: FileHandle, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(&self, _req: &Request, ino: INodeNo, _fh: FileHandle, offset: u64, mut reply: ReplyDirectory) {
        let Some(path) = self.path(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let entries = match stdfs::read_dir(&path) {
            Ok(rd) => rd,
            Err(err) => {
                reply.error(BkpError::from_io(&err).to_errno());
                return;
            }
        };
        let mut idx = 0i64;
        for entry in entries.flatten() {
            idx += 1;
            if (idx as u64) <= offset {
                continue;
            }
            let name = entry.file_name();
            let Some(name_str) = name.to_str() else { continue };
            if direntry::is_backup_name(name_str) {
                continue;
            }
            let child_path = entry.path();
            let child_ino = self.alloc_ino(&child_path);
            let kind = entry
                .file_type()
                .ok()
                .and_then(FileType::from_std)
                .unwrap_or(FileType::RegularFile);
            if reply.add(child_ino, idx, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn readdirplus(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let entries = match stdfs::read_dir(&path) {
            Ok(rd) => rd,
            Err(err) => {
                reply.error(BkpError::from_io(&err).to_errno());
                return;
            }
        };
        let mut idx = 0i64;
        for entry in entries.flatten() {
            idx += 1;
            if (idx as u64) <= offset {
                continue;
            }
            let name = entry.file_name();
            let Some(name_str) = name.to_str() else { continue };
            if direntry::is_backup_name(name_str) {
                continue;
            }
            let child_path = entry.path();
            let child_ino = self.alloc_ino(&child_path);
            let attr = match self.stat(child_ino.0, &child_path) {
                Ok(attr) => attr,
                Err(_) => continue,
            };
            if reply.add(child_ino, 0, idx, name, ENTRY_TTL, &attr, ENTRY_TTL) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&self, _req: &Request, ino: INodeNo, reply: ReplyStatfs) {
        let path = self.path(ino).unwrap_or_else(|| PathBuf::from("/"));
        match nix::sys::statvfs::statvfs(&path) {
            Ok(stat) => reply.statfs(
                stat.blocks(),
                stat.blocks_free(),
                stat.blocks_available(),
                stat.files(),
                stat.files_free(),
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(_) => reply.statfs(0, 0, 0, 0, 0, 512, 255, 0),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, _mask: AccessFlags, reply: ReplyEmpty) {
        match self.path(ino) {
            Some(path) if path.exists() => reply.ok(),
            _ => reply.error(Errno::ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ioctl(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        _flags: IoctlFlags,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
        reply: ReplyIoctl,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        if path.is_dir() {
            reply.error(BkpError::IsDirectory.to_errno());
            return;
        }
        match self.dispatch_ioctl(&path, cmd, in_data, out_size) {
            Ok(data) => {
                debug!("bkpfs: ioctl cmd={cmd} on {} -> {} bytes", path.display(), data.len());
                reply.ioctl(0, &data);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn getxattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(path) = self.path(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let Some(key) = name.to_str() else {
            reply.error(Errno::EINVAL);
            return;
        };
        match xattr::get(&path, key) {
            Ok(Some(value)) if size == 0 => reply.size(value.len() as u32),
            Ok(Some(value)) => reply.data(&value),
            Ok(None) => reply.error(BkpError::NotFound.to_errno()),
            Err(err) => reply.error(BkpError::from_io(&err).to_errno()),
        }
    }

    fn setxattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let Some(key) = name.to_str() else {
            reply.error(Errno::EINVAL);
            return;
        };
        match xattr::set(&path, key, value) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(BkpError::from_io(&err).to_errno()),
        }
    }

    fn removexattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.path(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let Some(key) = name.to_str() else {
            reply.error(Errno::EINVAL);
            return;
        };
        match xattr::remove(&path, key) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(BkpError::from_io(&err).to_errno()),
        }
    }
}
