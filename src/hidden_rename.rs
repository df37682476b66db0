//! Hidden-rename policy (§4.2): the "unlink while open" dance. POSIX lets a
//! process keep reading/writing a file after it's been unlinked; most
//! on-disk filesystems the user plugs in underneath do not, so an unlink (or
//! rename-over) of an open node is turned into a rename to a synthesized
//! dotfile name instead, and the real removal is deferred to the final
//! `release`.

use std::path::{Path, PathBuf};

use crate::context::RequestInfo;
use crate::error::CoreError;
use crate::callbacks::PathnameFilesystem;

/// Upper bound on collision-probing attempts before giving up with `Busy`.
/// Matches the retry budget described in §4.2; in practice a single
/// collision is already astronomically unlikely given the id/counter
/// keyspace, so this only guards against a pathological backing store.
const MAX_ATTEMPTS: u32 = 10;

/// Builds the synthesized hidden name `.fuse_hidden<id><counter>`, both
/// fields rendered as fixed-width lowercase hex, matching the libfuse
/// convention so that stray hidden files are recognizable by inspection.
fn hidden_name(id: u64, counter: u32) -> String {
    format!(".fuse_hidden{id:08x}{counter:08x}")
}

/// Renames `parent_dir/old_name` to a fresh hidden name under the same
/// directory, retrying on collision against both the in-memory tree and the
/// backing store (probed with the user's own `getattr`, since a previous
/// mount generation may have left a same-named file behind). Returns the
/// hidden name chosen on success.
///
/// `id` seeds the synthesized name so concurrent hides from different nodes
/// don't need to agree on a shared counter.
pub fn hide<F: PathnameFilesystem + ?Sized>(
    fs: &F,
    req: &RequestInfo,
    parent_dir: &Path,
    old_name: &str,
    id: u64,
) -> Result<String, CoreError> {
    let old_path = parent_dir.join(old_name);

    for counter in 0..MAX_ATTEMPTS {
        let candidate = hidden_name(id, counter);
        let candidate_path: PathBuf = parent_dir.join(&candidate);

        if fs.getattr(req, &candidate_path).is_ok() {
            continue;
        }

        match fs.rename(req, &old_path, &candidate_path) {
            Ok(()) => return Ok(candidate),
            Err(libc::ENOSYS) => return Err(CoreError::Busy),
            Err(_) => continue,
        }
    }

    Err(CoreError::Busy)
}

/// Invoked when the last open handle on a hidden node is released: removes
/// the hidden backing file. Errors from the user's `unlink` are logged and
/// swallowed — a `release` reply already went out (or is about to), and
/// there's no sensible way to report a deferred-unlink failure back to the
/// kernel.
pub fn finalize_release<F: PathnameFilesystem + ?Sized>(
    fs: &F,
    req: &RequestInfo,
    hidden_path: &Path,
) {
    if let Err(errno) = fs.unlink(req, hidden_path) {
        log::warn!(
            "deferred unlink of hidden file {} failed: errno {errno}",
            hidden_path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{Attr, Entry, Statfs};
    use fuser::{FileAttr, FileType};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::{Duration, SystemTime};

    fn dummy_attr() -> Attr {
        Attr {
            attr: FileAttr {
                ino: 2,
                size: 0,
                blocks: 0,
                atime: SystemTime::UNIX_EPOCH,
                mtime: SystemTime::UNIX_EPOCH,
                ctime: SystemTime::UNIX_EPOCH,
                crtime: SystemTime::UNIX_EPOCH,
                kind: FileType::RegularFile,
                perm: 0o644,
                nlink: 1,
                uid: 0,
                gid: 0,
                rdev: 0,
                blksize: 512,
                flags: 0,
            },
            ttl: Duration::from_secs(1),
        }
    }

    /// A stub filesystem whose `getattr` reports existence for a fixed set
    /// of paths and whose `rename` always succeeds (recording the move).
    struct Stub {
        existing: Mutex<HashSet<PathBuf>>,
        renamed_to: Mutex<Option<PathBuf>>,
        refuse_rename: bool,
    }

    impl PathnameFilesystem for Stub {
        fn getattr(&self, _req: &RequestInfo, path: &std::path::Path) -> Result<Attr, i32> {
            if self.existing.lock().contains(path) {
                Ok(dummy_attr())
            } else {
                Err(libc::ENOENT)
            }
        }

        fn rename(&self, _req: &RequestInfo, _from: &std::path::Path, to: &std::path::Path) -> Result<(), i32> {
            if self.refuse_rename {
                return Err(libc::ENOSYS);
            }
            *self.renamed_to.lock() = Some(to.to_path_buf());
            Ok(())
        }

        fn unlink(&self, _req: &RequestInfo, _path: &std::path::Path) -> Result<(), i32> {
            Ok(())
        }

        fn mknod(&self, _: &RequestInfo, _: &std::path::Path, _: u32, _: u32, _: u32) -> Result<Entry, i32> {
            unreachable!()
        }

        fn statfs(&self, _: &RequestInfo, _: &std::path::Path) -> Result<Statfs, i32> {
            unreachable!()
        }
    }

    fn req() -> RequestInfo {
        RequestInfo {
            unique: 1,
            uid: 0,
            gid: 0,
            pid: 1,
        }
    }

    #[test]
    fn first_attempt_succeeds_when_no_collision() {
        let stub = Stub {
            existing: Mutex::new(HashSet::new()),
            renamed_to: Mutex::new(None),
            refuse_rename: false,
        };
        let name = hide(&stub, &req(), Path::new("/dir"), "victim", 7).unwrap();
        assert_eq!(name, ".fuse_hidden0000000700000000");
        assert_eq!(
            *stub.renamed_to.lock(),
            Some(PathBuf::from("/dir/.fuse_hidden0000000700000000"))
        );
    }

    #[test]
    fn retries_past_existing_collisions() {
        let mut existing = HashSet::new();
        existing.insert(PathBuf::from("/dir/.fuse_hidden0000000700000000"));
        existing.insert(PathBuf::from("/dir/.fuse_hidden0000000700000001"));
        let stub = Stub {
            existing: Mutex::new(existing),
            renamed_to: Mutex::new(None),
            refuse_rename: false,
        };
        let name = hide(&stub, &req(), Path::new("/dir"), "victim", 7).unwrap();
        assert_eq!(name, ".fuse_hidden0000000700000002");
    }

    #[test]
    fn missing_rename_support_is_busy() {
        let stub = Stub {
            existing: Mutex::new(HashSet::new()),
            renamed_to: Mutex::new(None),
            refuse_rename: true,
        };
        let err = hide(&stub, &req(), Path::new("/dir"), "victim", 1).unwrap_err();
        assert_eq!(err, CoreError::Busy);
    }
}
