//! Version metadata store: the per-file `(start_ver, cur_ver)` record.
//!
//! Persisted as a fixed-width xattr on the target file itself, rather than a
//! separate index file, so the record's lifetime is tied to the file: it
//! survives rename on most lower filesystems and needs no separate GC pass.

use std::path::Path;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{BkpError, BkpResult};

/// The xattr key holding a file's version metadata record.
pub const VER_META_XATTR: &str = "user.bkpfs.ver_meta";

/// On-disk encoding of [`VersionMeta`]: two little-endian `u32`s.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawVersionMeta {
    start_ver: u32,
    cur_ver: u32,
}

/// The per-file version metadata record: `start_ver` is the lowest backup
/// version currently retained, `cur_ver` is the version the *next* backup
/// will take. Retained versions are `[start_ver, cur_ver - 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMeta {
    pub start_ver: u32,
    pub cur_ver: u32,
}

impl VersionMeta {
    /// The record assumed when no backups have ever been taken.
    pub const INITIAL: VersionMeta = VersionMeta {
        start_ver: 1,
        cur_ver: 1,
    };

    /// Number of versions currently retained.
    pub fn count(&self) -> u32 {
        self.cur_ver - self.start_ver
    }

    /// `true` iff no backups are currently retained.
    pub fn is_empty(&self) -> bool {
        self.cur_ver == self.start_ver
    }

    /// Reset to the no-backups-retained state, per the control channel's
    /// delete normalization rules.
    pub fn normalize_if_empty(self) -> VersionMeta {
        if self.is_empty() {
            VersionMeta::INITIAL
        } else {
            self
        }
    }
}

impl From<RawVersionMeta> for VersionMeta {
    fn from(raw: RawVersionMeta) -> Self {
        VersionMeta {
            start_ver: raw.start_ver,
            cur_ver: raw.cur_ver,
        }
    }
}

impl From<VersionMeta> for RawVersionMeta {
    fn from(meta: VersionMeta) -> Self {
        RawVersionMeta {
            start_ver: meta.start_ver,
            cur_ver: meta.cur_ver,
        }
    }
}

/// Load `M(F)` from `path`'s xattr. Returns [`VersionMeta::INITIAL`] if the
/// xattr is absent (no backups yet); any other error is surfaced.
pub fn load(path: &Path) -> BkpResult<VersionMeta> {
    match xattr::get(path, VER_META_XATTR) {
        Ok(Some(bytes)) => {
            let raw = RawVersionMeta::read_from_bytes(&bytes).map_err(|_| BkpError::InvalidArgument)?;
            Ok(VersionMeta::from(raw))
        }
        Ok(None) => Ok(VersionMeta::INITIAL),
        Err(err) => Err(BkpError::from_io(&err)),
    }
}

/// Store `M(F)` into `path`'s xattr, overwriting any existing record. The
/// xattr interface gives single-value atomicity with respect to concurrent
/// readers of the same file.
pub fn store(path: &Path, meta: VersionMeta) -> BkpResult<()> {
    let raw = RawVersionMeta::from(meta);
    xattr::set(path, VER_META_XATTR, raw.as_bytes()).map_err(|err| BkpError::from_io(&err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_to_initial_when_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        File::create(&path).unwrap();
        assert_eq!(load(&path).unwrap(), VersionMeta::INITIAL);
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        File::create(&path).unwrap();
        let meta = VersionMeta {
            start_ver: 2,
            cur_ver: 5,
        };
        store(&path, meta).unwrap();
        assert_eq!(load(&path).unwrap(), meta);
    }

    #[test]
    fn normalize_if_empty_resets_to_initial() {
        let meta = VersionMeta {
            start_ver: 4,
            cur_ver: 4,
        };
        assert_eq!(meta.normalize_if_empty(), VersionMeta::INITIAL);

        let meta = VersionMeta {
            start_ver: 2,
            cur_ver: 4,
        };
        assert_eq!(meta.normalize_if_empty(), meta);
    }

    #[test]
    fn count_and_is_empty() {
        let meta = VersionMeta {
            start_ver: 3,
            cur_ver: 3,
        };
        assert!(meta.is_empty());
        assert_eq!(meta.count(), 0);

        let meta = VersionMeta {
            start_ver: 3,
            cur_ver: 6,
        };
        assert!(!meta.is_empty());
        assert_eq!(meta.count(), 3);
    }
}
