//! Lower-FS adapter: capability-level operations against the backing
//! filesystem. Every operation resolves a `path: PathBuf` rooted at the
//! mount's lower directory directly, the way a `libfuse` passthrough
//! filesystem addresses the lower store, rather than maintaining an inode
//! table of our own.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};

use log::trace;

use crate::error::{BkpError, BkpResult};

/// A lower-filesystem path, rooted at the mount's backing directory.
#[derive(Debug, Clone)]
pub struct LowerHandle {
    path: PathBuf,
}

impl LowerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open an existing lower object for reading and writing. Fails with
/// [`BkpError::NotFound`] if it does not exist.
pub fn open_lower(path: &Path) -> BkpResult<LowerHandle> {
    trace!("open_lower({})", path.display());
    if !path.exists() {
        return Err(BkpError::NotFound);
    }
    Ok(LowerHandle {
        path: path.to_path_buf(),
    })
}

/// Create `parent/name` with `mode`, failing with [`BkpError::Exists`] if an
/// object already sits at that name (atomic create-if-not-exists).
pub fn create_child(parent: &Path, name: &str, mode: u32) -> BkpResult<LowerHandle> {
    let path = parent.join(name);
    trace!("create_child({})", path.display());
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(&path)
        .map_err(|err| BkpError::from_io(&err))?;
    drop(file);
    Ok(LowerHandle { path })
}

/// Unlink `parent/name`.
pub fn unlink_child(parent: &Path, name: &str) -> BkpResult<()> {
    let path = parent.join(name);
    trace!("unlink_child({})", path.display());
    fs::remove_file(&path).map_err(|err| BkpError::from_io(&err))
}

/// Resolve `parent/name`, returning [`BkpError::NotFound`] if absent.
pub fn resolve_child(parent: &Path, name: &str) -> BkpResult<LowerHandle> {
    open_lower(&parent.join(name))
}

/// Read up to `buf.len()` bytes from `handle` at `off`. Returns the number of
/// bytes actually read (may be less than `buf.len()` at EOF).
pub fn read(handle: &LowerHandle, buf: &mut [u8], off: u64) -> BkpResult<usize> {
    trace!("read({}, off={})", handle.path.display(), off);
    let mut file = File::open(&handle.path).map_err(|err| BkpError::from_io(&err))?;
    file.seek(SeekFrom::Start(off))
        .map_err(|err| BkpError::from_io(&err))?;
    loop {
        match file.read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(BkpError::from_io(&err)),
        }
    }
}

/// Write `buf` to `handle` at `off`. Returns the number of bytes written.
pub fn write(handle: &LowerHandle, buf: &[u8], off: u64) -> BkpResult<usize> {
    trace!("write({}, off={}, len={})", handle.path.display(), off, buf.len());
    let mut file = OpenOptions::new()
        .write(true)
        .open(&handle.path)
        .map_err(|err| BkpError::from_io(&err))?;
    file.seek(SeekFrom::Start(off))
        .map_err(|err| BkpError::from_io(&err))?;
    loop {
        match file.write(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(BkpError::from_io(&err)),
        }
    }
}

/// Truncate `handle` to `new_len` bytes.
pub fn truncate(handle: &LowerHandle, new_len: u64) -> BkpResult<()> {
    trace!("truncate({}, {})", handle.path.display(), new_len);
    let file = OpenOptions::new()
        .write(true)
        .open(&handle.path)
        .map_err(|err| BkpError::from_io(&err))?;
    file.set_len(new_len).map_err(|err| BkpError::from_io(&err))
}

/// Size in bytes of the lower object, as seen by `stat`.
pub fn size(handle: &LowerHandle) -> BkpResult<u64> {
    let meta = fs::metadata(&handle.path).map_err(|err| BkpError::from_io(&err))?;
    Ok(meta.size())
}

/// Copy the full contents of `src` (from offset 0) into `dst` (at offset 0),
/// returning the number of bytes moved. Tries `splice(2)` first for a
/// zero-copy, kernel-mediated transfer, falling back to a buffered
/// read/write loop on `EINVAL`/`ENOSYS` (common when src and dst are not both
/// regular files on the same device class, or under emulation).
pub fn splice_copy(src: &LowerHandle, dst: &LowerHandle, len: u64) -> BkpResult<u64> {
    trace!(
        "splice_copy({} -> {}, len={})",
        src.path.display(),
        dst.path.display(),
        len
    );
    let src_file = File::open(&src.path).map_err(|err| BkpError::from_io(&err))?;
    let dst_file = OpenOptions::new()
        .write(true)
        .open(&dst.path)
        .map_err(|err| BkpError::from_io(&err))?;

    match splice_loop(&src_file, &dst_file, len) {
        Ok(n) => Ok(n),
        Err(nix::Error::EINVAL) | Err(nix::Error::ENOSYS) => buffered_copy(&src_file, &dst_file, len),
        Err(err) => Err(BkpError::from(err)),
    }
}

/// Relay `len` bytes from `src` to `dst` through an intermediate pipe via two
/// `splice(2)` calls per chunk. `splice` requires one endpoint of each call to
/// be a pipe, so a direct regular-file-to-regular-file splice is not
/// possible; this is the standard two-hop relay (as used by `cp --reflink`
/// fallbacks and similar zero-copy tools).
fn splice_loop(src: &File, dst: &File, len: u64) -> Result<u64, nix::Error> {
    let (pipe_read, pipe_write) = nix::unistd::pipe()?;
    let mut remaining = len;
    let mut moved = 0u64;
    while remaining > 0 {
        let chunk = remaining.min(1 << 20) as usize;
        let in_pipe = nix::fcntl::splice(
            src.as_fd(),
            None,
            pipe_write.as_fd(),
            None,
            chunk,
            nix::fcntl::SpliceFFlags::empty(),
        )?;
        if in_pipe == 0 {
            break;
        }
        let mut pipe_remaining = in_pipe;
        while pipe_remaining > 0 {
            let out = nix::fcntl::splice(
                pipe_read.as_fd(),
                None,
                dst.as_fd(),
                None,
                pipe_remaining,
                nix::fcntl::SpliceFFlags::empty(),
            )?;
            if out == 0 {
                break;
            }
            pipe_remaining -= out;
        }
        moved += in_pipe as u64;
        remaining -= in_pipe as u64;
    }
    Ok(moved)
}

fn buffered_copy(mut src: &File, mut dst: &File, len: u64) -> BkpResult<u64> {
    let mut remaining = len;
    let mut moved = 0u64;
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        let n = src.read(&mut buf[..chunk]).map_err(|err| BkpError::from_io(&err))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).map_err(|err| BkpError::from_io(&err))?;
        moved += n as u64;
        remaining -= n as u64;
    }
    Ok(moved)
}

/// Read an xattr value from `handle`. Returns [`BkpError::NotFound`] if the
/// key is unset.
pub fn xattr_get(handle: &LowerHandle, key: &str) -> BkpResult<Vec<u8>> {
    match xattr::get(&handle.path, key) {
        Ok(Some(bytes)) => Ok(bytes),
        Ok(None) => Err(BkpError::NotFound),
        Err(err) => Err(BkpError::from_io(&err)),
    }
}

/// Set an xattr value on `handle`.
pub fn xattr_set(handle: &LowerHandle, key: &str, value: &[u8]) -> BkpResult<()> {
    xattr::set(&handle.path, key, value).map_err(|err| BkpError::from_io(&err))
}

/// Forward an `ioctl` this filesystem does not interpret straight to the
/// lower file. The kernel has already sized `in_data` from `cmd`'s encoded
/// size field, so the argument layout is opaque to us here - round-trip it
/// as a flat buffer the way a `libfuse` passthrough filesystem would.
pub fn ioctl_passthrough(path: &Path, cmd: u32, in_data: &[u8], out_size: u32) -> BkpResult<Vec<u8>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| BkpError::from_io(&err))?;
    let mut buf = vec![0u8; in_data.len().max(out_size as usize)];
    buf[..in_data.len()].copy_from_slice(in_data);
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), cmd as libc::c_ulong, buf.as_mut_ptr()) };
    if rc < 0 {
        return Err(BkpError::from_io(&std::io::Error::last_os_error()));
    }
    buf.truncate(out_size as usize);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write as fs_write;
    use tempfile::tempdir;

    #[test]
    fn create_child_fails_on_existing_name() {
        let dir = tempdir().unwrap();
        create_child(dir.path(), "f", 0o644).unwrap();
        let err = create_child(dir.path(), "f", 0o644).unwrap_err();
        assert!(matches!(err, BkpError::Exists));
    }

    #[test]
    fn resolve_child_not_found() {
        let dir = tempdir().unwrap();
        let err = resolve_child(dir.path(), "missing").unwrap_err();
        assert!(matches!(err, BkpError::NotFound));
    }

    #[test]
    fn splice_copy_transfers_full_contents() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("src");
        fs_write(&src_path, b"hello world").unwrap();
        let src = open_lower(&src_path).unwrap();
        let dst = create_child(dir.path(), "dst", 0o644).unwrap();

        let moved = splice_copy(&src, &dst, 11).unwrap();
        assert_eq!(moved, 11);
        assert_eq!(fs::read(dst.path()).unwrap(), b"hello world");
    }

    #[test]
    fn read_write_round_trip() {
        let dir = tempdir().unwrap();
        let handle = create_child(dir.path(), "f", 0o644).unwrap();
        let n = write(&handle, b"abcdef", 0).unwrap();
        assert_eq!(n, 6);
        let mut buf = [0u8; 3];
        let n = read(&handle, &mut buf, 2).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"cde");
    }
}
