//! Control channel: synchronous request/response operations addressed to an
//! open handle of a versioned file, demultiplexed off the `ioctl` entry
//! point at the FUSE boundary.

use std::path::Path;

use log::debug;

use crate::backup::backup_name;
use crate::error::{BkpError, BkpResult};
use crate::lower;
use crate::meta::{self, VersionMeta};

/// Selects a backup version relative to the file's current `(start_ver,
/// cur_ver)` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// Version `cur_ver - 1`.
    Newest,
    /// Version `start_ver`.
    Oldest,
    /// The `n`-th retained version, 1-indexed from oldest: `start_ver + n - 1`.
    Nth(u32),
    /// Delete-only: every retained version. Overloads the wire value `1`,
    /// a legacy ambiguity in the on-wire encoding.
    All,
}

impl Selector {
    /// Resolve against `meta`, yielding the concrete backup version number.
    /// `Selector::All` has no single resolution and is rejected here; callers
    /// performing delete-all must match on it before calling this.
    fn resolve(self, meta: VersionMeta) -> BkpResult<u32> {
        if meta.is_empty() {
            return Err(BkpError::NotFound);
        }
        let version = match self {
            Selector::Newest => meta.cur_ver - 1,
            Selector::Oldest => meta.start_ver,
            Selector::Nth(n) => meta.start_ver + n - 1,
            Selector::All => return Err(BkpError::InvalidArgument),
        };
        if version < meta.start_ver || version >= meta.cur_ver {
            return Err(BkpError::NotFound);
        }
        Ok(version)
    }
}

/// The six control-channel operations. `List` is a reserved, unimplemented
/// seventh opcode: the client enumerates backups entirely client-side via
/// `GetCount` plus the naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    GetMax,
    GetCount,
    GetSize(Selector),
    View { selector: Selector, offset: u64, buf_len: u32 },
    Delete(Selector),
    Restore(Selector),
}

/// On-wire opcode and selector encoding shared between the FUSE adapter's
/// `ioctl` demultiplexer and the `bkpctl` client. Operation codes are the
/// real Linux `_IOR`/`_IOW`/`_IOWR(MAJOR_NUM, nr, long)` encodings this
/// project's backing ioctl driver assigned them, not small sequential
/// integers, so a `cmd` this engine does not recognize is unambiguously an
/// opcode meant for the lower filesystem rather than a typo'd in-range value.
pub mod wire {
    const MAJOR_NUM: u32 = 484;
    const ARG_SIZE: u32 = size_of::<i64>() as u32;

    const IOC_READ: u32 = 2;
    const IOC_WRITE: u32 = 1;
    const IOC_READWRITE: u32 = 3;

    /// Replicates the kernel `_IOC(dir, type, nr, size)` macro bit-for-bit,
    /// including its lack of masking on `type`: with `MAJOR_NUM` wider than
    /// 8 bits, the upper bits spill into the size field exactly as the C
    /// macro produces them, so these constants match the real driver's
    /// opcodes rather than a cleaned-up reinterpretation of them.
    const fn ioc(dir: u32, nr: u32) -> u32 {
        (dir << 30) | (MAJOR_NUM << 8) | (ARG_SIZE << 16) | nr
    }

    /// `IOCTL_GET_MAX_VERS`: return the mount's configured retention window.
    pub const GET_MAX: u32 = ioc(IOC_READ, 0);
    /// `IOCTL_GET_NUM_VERS`: return the number of versions currently retained.
    pub const GET_COUNT: u32 = ioc(IOC_READ, 1);
    /// `IOCTL_LIST_VERS`: reserved, unimplemented. The client enumerates
    /// backups itself via `GetCount` plus the naming convention.
    pub const LIST: u32 = ioc(IOC_READ, 2);
    /// `IOCTL_RESTORE_VERS`: restore the selected backup's contents into the
    /// live file.
    pub const RESTORE: u32 = ioc(IOC_WRITE, 3);
    /// `IOCTL_DELETE_VERS`: unlink one or all backups.
    pub const DELETE: u32 = ioc(IOC_WRITE, 4);
    /// `IOCTL_VIEW_VERS`: read a range of bytes from the selected backup.
    pub const VIEW: u32 = ioc(IOC_READWRITE, 5);
    /// `IOCTL_GET_FILE_SIZE`: return the size in bytes of the selected backup.
    pub const GET_SIZE: u32 = ioc(IOC_READWRITE, 6);

    /// `true` iff `cmd` is one of the opcodes this engine defines. Anything
    /// else is delegated to the lower filesystem's own `ioctl` verbatim.
    pub fn is_known(cmd: u32) -> bool {
        matches!(cmd, GET_MAX | GET_COUNT | GET_SIZE | VIEW | DELETE | RESTORE | LIST)
    }

    /// Encode a [`super::Selector`] to its wire `i32`. `All` is only valid
    /// for `Delete` and is encoded as the overloaded value `1`.
    pub fn encode_selector(selector: super::Selector) -> i32 {
        match selector {
            super::Selector::Newest => 0,
            super::Selector::Oldest => -1,
            super::Selector::Nth(n) => n as i32,
            super::Selector::All => 1,
        }
    }
}

fn child_name(path: &Path, version: u32) -> BkpResult<(std::path::PathBuf, String)> {
    let parent = path.parent().ok_or(BkpError::InvalidArgument)?.to_path_buf();
    let basename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(BkpError::InvalidArgument)?;
    Ok((parent, backup_name(basename, version)?))
}

/// `GetMax`: the mount's configured retention window.
pub fn get_max(maxvers: u32) -> u32 {
    maxvers
}

/// `GetCount`: number of versions currently retained.
pub fn get_count(path: &Path) -> BkpResult<u32> {
    Ok(meta::load(path)?.count())
}

/// `GetSize`: size in bytes of the backup resolved by `selector`.
pub fn get_size(path: &Path, selector: Selector) -> BkpResult<u64> {
    let meta = meta::load(path)?;
    let version = selector.resolve(meta)?;
    let (parent, name) = child_name(path, version)?;
    let handle = lower::resolve_child(&parent, &name)?;
    lower::size(&handle)
}

/// `View`: read `buf_len` bytes from the selected backup at `offset`. A
/// partial read (fewer than `buf_len` bytes, short of EOF being the cause)
/// is surfaced as [`BkpError::IO`], not returned as a short read.
pub fn view(path: &Path, selector: Selector, offset: u64, buf_len: u32) -> BkpResult<Vec<u8>> {
    let meta = meta::load(path)?;
    let version = selector.resolve(meta)?;
    let (parent, name) = child_name(path, version)?;
    let handle = lower::resolve_child(&parent, &name)?;

    let mut buf = vec![0u8; buf_len as usize];
    let n = lower::read(&handle, &mut buf, offset)?;
    if n < buf_len as usize {
        let size = lower::size(&handle)?;
        if offset + n as u64 >= size {
            buf.truncate(n);
            return Ok(buf);
        }
        return Err(BkpError::Io("short read from backup object".to_string()));
    }
    Ok(buf)
}

/// `Delete`: unlink one or all backups and update the version record per the
/// normalization rules below.
pub fn delete(path: &Path, selector: Selector) -> BkpResult<()> {
    let meta = meta::load(path)?;
    if meta.is_empty() {
        return Err(BkpError::NotFound);
    }
    let (parent, _) = child_name(path, meta.start_ver)?;
    let basename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(BkpError::InvalidArgument)?;

    match selector {
        Selector::All => {
            let mut last_err = None;
            for n in meta.start_ver..meta.cur_ver {
                let name = backup_name(basename, n)?;
                if let Err(err) = lower::unlink_child(&parent, &name) {
                    last_err = Some(err);
                }
            }
            meta::store(path, VersionMeta::INITIAL)?;
            if let Some(err) = last_err {
                return Err(err);
            }
            debug!("bkpfs: deleted all backups of {}", path.display());
        }
        Selector::Oldest => {
            let name = backup_name(basename, meta.start_ver)?;
            lower::unlink_child(&parent, &name)?;
            let updated = VersionMeta {
                start_ver: meta.start_ver + 1,
                cur_ver: meta.cur_ver,
            }
            .normalize_if_empty();
            meta::store(path, updated)?;
        }
        Selector::Newest => {
            let name = backup_name(basename, meta.cur_ver - 1)?;
            lower::unlink_child(&parent, &name)?;
            let updated = VersionMeta {
                start_ver: meta.start_ver,
                cur_ver: meta.cur_ver - 1,
            }
            .normalize_if_empty();
            meta::store(path, updated)?;
        }
        Selector::Nth(_) => {
            // Delete is only specified for oldest/newest/all; an explicit
            // Nth on delete is rejected rather than silently reinterpreted.
            return Err(BkpError::InvalidArgument);
        }
    }
    Ok(())
}

/// `Restore`: truncate `F` to zero and copy the selected backup's contents
/// back into it. Does not itself create a backup of the pre-restore state.
pub fn restore(path: &Path, selector: Selector) -> BkpResult<()> {
    let meta = meta::load(path)?;
    let version = selector.resolve(meta)?;
    let (parent, name) = child_name(path, version)?;
    let backup = lower::resolve_child(&parent, &name)?;
    let backup_size = lower::size(&backup)?;

    let target = lower::open_lower(path)?;
    lower::truncate(&target, 0)?;
    let moved = lower::splice_copy(&backup, &target, backup_size)?;
    if moved != backup_size {
        return Err(BkpError::Io("short copy while restoring backup".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupEngine;
    use crate::config::BkpConfig;
    use std::fs;
    use tempfile::tempdir;

    fn seeded(dir: &Path, path: &Path) -> BackupEngine {
        fs::write(path, b"").unwrap();
        let engine = BackupEngine::new(BkpConfig {
            maxvers: 3,
            bkp_threshold: 4,
        });
        for chunk in [b"C1111111", b"C2222222", b"C3333333", b"C4444444", b"C5555555"] {
            engine.write(path, chunk, 0, 8).unwrap();
        }
        let _ = dir;
        engine
    }

    #[test]
    fn view_oldest_and_newest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        seeded(dir.path(), &path);

        assert_eq!(view(&path, Selector::Oldest, 0, 8).unwrap(), b"C2222222");
        assert_eq!(view(&path, Selector::Newest, 0, 8).unwrap(), b"C4444444");
    }

    #[test]
    fn delete_oldest_advances_start_ver() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        seeded(dir.path(), &path);
        let before = meta::load(&path).unwrap();

        delete(&path, Selector::Oldest).unwrap();

        let after = meta::load(&path).unwrap();
        assert_eq!(after.count(), 2);
        assert_eq!(after.start_ver, before.start_ver + 1);
    }

    #[test]
    fn delete_all_normalizes_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        seeded(dir.path(), &path);

        delete(&path, Selector::All).unwrap();

        assert_eq!(meta::load(&path).unwrap(), VersionMeta::INITIAL);
        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".bkp_"))
            .collect();
        assert!(remaining.is_empty());
    }

    #[test]
    fn restore_replaces_file_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        seeded(dir.path(), &path);

        restore(&path, Selector::Oldest).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"C2222222");
        assert_eq!(meta::load(&path).unwrap().count(), 3);
    }

    #[test]
    fn selector_out_of_range_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        seeded(dir.path(), &path);

        let err = view(&path, Selector::Nth(99), 0, 8).unwrap_err();
        assert!(matches!(err, BkpError::NotFound));
    }
}
