//! Backup policy engine: perform the user write, then conditionally produce
//! a backup object and update the version metadata record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::BkpConfig;
use crate::error::{BkpError, BkpResult};
use crate::lower;
use crate::meta::{self, VersionMeta};

/// Basename length cap (bytes) for the computed backup name.
const MAX_BASENAME_LEN: usize = 230;

/// Drives the write-then-maybe-backup pipeline and the cleanup-on-unlink
/// path. Holds one [`parking_lot::Mutex`] per file currently being written,
/// guarding the metadata load/store pair against torn reads within this
/// process - it does not provide cross-process or cross-write
/// linearizability.
pub struct BackupEngine {
    config: BkpConfig,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl BackupEngine {
    pub fn new(config: BkpConfig) -> Self {
        BackupEngine {
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BkpConfig {
        &self.config
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Writes through to the lower filesystem, then backs up the prior
    /// contents if policy triggers. `requested_len` is the size of the write
    /// the caller asked for, used for the threshold test even if the lower
    /// write itself wrote fewer bytes.
    pub fn write(
        &self,
        path: &Path,
        buf: &[u8],
        off: u64,
        requested_len: usize,
    ) -> BkpResult<usize> {
        let handle = lower::open_lower(path)?;
        let written = lower::write(&handle, buf, off)?;

        if self.config.maxvers == 0 || (requested_len as u32) < self.config.bkp_threshold {
            return Ok(written);
        }

        let lock = self.file_lock(path);
        let _guard = lock.lock();

        if let Err(err) = self.maybe_backup(path) {
            warn!("bkpfs: best-effort backup failed for {}: {err}", path.display());
        }

        Ok(written)
    }

    fn maybe_backup(&self, path: &Path) -> BkpResult<()> {
        let parent = path.parent().ok_or(BkpError::InvalidArgument)?;
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(BkpError::InvalidArgument)?;

        let mut meta = meta::load(path)?;
        let name = backup_name(basename, meta.cur_ver)?;

        let backup = match lower::create_child(parent, &name, 0o644) {
            Ok(handle) => handle,
            Err(BkpError::Exists) => {
                // A stale sibling at this version number should not exist;
                // unlink and retry create exactly once. If the name is
                // still taken (a concurrent racer won it first), surface
                // a conflict rather than the raw Exists.
                lower::unlink_child(parent, &name)?;
                match lower::create_child(parent, &name, 0o644) {
                    Ok(handle) => handle,
                    Err(BkpError::Exists) => return Err(BkpError::Conflict),
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        let src = lower::open_lower(path)?;
        let src_size = lower::size(&src)?;
        let copy_result = lower::splice_copy(&src, &backup, src_size);

        match copy_result {
            Ok(moved) if moved == src_size => {}
            Ok(_) | Err(_) => {
                let _ = lower::unlink_child(parent, &name);
                return copy_result.map(|_| ());
            }
        }

        debug!("bkpfs: created backup {name} for {}", path.display());

        if meta.cur_ver - meta.start_ver >= self.config.maxvers {
            let prune_name = backup_name(basename, meta.start_ver)?;
            if let Err(err) = lower::unlink_child(parent, &prune_name) {
                warn!("bkpfs: failed to prune {prune_name}: {err}");
            } else {
                debug!("bkpfs: pruned {prune_name} (retention gate)");
            }
            meta.start_ver += 1;
        }
        meta.cur_ver += 1;

        meta::store(path, meta)
    }

    /// Unlinks every retained backup of `path` before the caller's unlink of
    /// `path` itself is reported as successful. Per-version errors are
    /// logged, not fatal.
    pub fn cleanup_on_unlink(&self, path: &Path) -> BkpResult<()> {
        let parent = path.parent().ok_or(BkpError::InvalidArgument)?;
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(BkpError::InvalidArgument)?;

        let meta = meta::load(path)?;
        for n in meta.start_ver..meta.cur_ver {
            let name = match backup_name(basename, n) {
                Ok(name) => name,
                Err(err) => {
                    warn!("bkpfs: skipping prune of version {n}: {err}");
                    continue;
                }
            };
            if let Err(err) = lower::unlink_child(parent, &name) {
                warn!("bkpfs: failed to unlink backup {name} during cleanup: {err}");
            }
        }
        Ok(())
    }
}

/// Compute `.bkp_<basename>.<n>`, rejecting basenames whose encoded name
/// would exceed [`MAX_BASENAME_LEN`] bytes.
pub(crate) fn backup_name(basename: &str, n: u32) -> BkpResult<String> {
    let name = format!(".bkp_{basename}.{n}");
    if name.len() > MAX_BASENAME_LEN {
        return Err(BkpError::NameTooLong);
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn engine(maxvers: u32, bkp_threshold: u32) -> BackupEngine {
        BackupEngine::new(BkpConfig {
            maxvers,
            bkp_threshold,
        })
    }

    #[test]
    fn threshold_gate_skips_backup_for_small_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"").unwrap();
        let engine = engine(3, 4);

        engine.write(&path, b"abc", 0, 3).unwrap();

        assert_eq!(meta::load(&path).unwrap().count(), 0);
        assert!(!dir.path().join(".bkp_f.1").exists());
    }

    #[test]
    fn first_write_crossing_threshold_creates_one_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"").unwrap();
        let engine = engine(3, 4);

        engine.write(&path, b"AAAAAAAA", 0, 8).unwrap();

        assert_eq!(meta::load(&path).unwrap().count(), 1);
        assert!(dir.path().join(".bkp_f.1").exists());
        assert_eq!(fs::read(dir.path().join(".bkp_f.1")).unwrap(), b"");
    }

    #[test]
    fn retention_prunes_oldest_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"").unwrap();
        let engine = engine(3, 4);

        for chunk in [b"C1111111", b"C2222222", b"C3333333", b"C4444444", b"C5555555"] {
            engine.write(&path, chunk, 0, 8).unwrap();
        }

        let meta = meta::load(&path).unwrap();
        assert_eq!(meta.count(), 3);
        assert_eq!(fs::read(dir.path().join(format!(".bkp_f.{}", meta.start_ver))).unwrap(), b"C2222222");
        assert_eq!(
            fs::read(dir.path().join(format!(".bkp_f.{}", meta.cur_ver - 1))).unwrap(),
            b"C4444444"
        );
    }

    #[test]
    fn unlink_cascade_removes_all_backups() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"").unwrap();
        let engine = engine(3, 4);
        for chunk in [b"C1111111", b"C2222222", b"C3333333", b"C4444444", b"C5555555"] {
            engine.write(&path, chunk, 0, 8).unwrap();
        }

        engine.cleanup_on_unlink(&path).unwrap();

        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".bkp_"))
            .collect();
        assert!(remaining.is_empty());
    }
}
