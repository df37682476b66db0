//! The user-facing pathname-operations interface (§6). A filesystem author
//! implements [`PathnameFilesystem`] and hands it to [`crate::Router`];
//! every method has a default `ENOSYS` body, mirroring `fuser::Filesystem`'s
//! own "reasonable default" style, so a minimal implementation only
//! overrides what it actually supports.

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuser::{FileAttr, FileType};
use libc::c_int;

use crate::context::RequestInfo;

/// Filesystem statistics, as returned by `statfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Attributes plus the advisory cache TTLs the kernel should apply to them.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub attr: FileAttr,
    pub ttl: Duration,
}

/// Attributes plus the TTL used on entry-creating replies (`lookup`,
/// `mknod`, `mkdir`, `symlink`, `link`). `fuser::ReplyEntry::entry` takes a
/// single TTL covering both the attributes and the directory entry, unlike
/// `getattr`'s reply, so there is only one to carry here.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub attr: FileAttr,
    pub entry_ttl: Duration,
}

/// One entry produced by a `readdir` fill callback.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileType,
    pub name: std::ffi::OsString,
}

/// Callback a `readdir` implementation calls once per entry it wants to
/// emit. Returning entries past what the kernel asked for is harmless; the
/// directory buffer (§4.3) handles windowing.
pub type DirEntrySink<'a> = dyn FnMut(DirEntry) + 'a;

/// The pathname-based capability table a filesystem implements.
///
/// Every method receives the request's identity context and a reconstructed
/// absolute path rather than a raw node id. `&self` (not `&mut self`):
/// implementations that need interior mutability reach for their own
/// locking, matching `fuser::Filesystem`'s own signature and letting this
/// crate call into the table concurrently with a future multi-worker
/// request loop, per §5.
#[allow(unused_variables)]
pub trait PathnameFilesystem: Send + Sync + 'static {
    /// Called once, after the kernel's own INIT handshake (owned by
    /// `fuser`) has completed. See `ProtocolVersion` in the dispatcher.
    fn init(&self) -> Result<(), c_int> {
        Ok(())
    }

    /// Called on filesystem exit.
    fn destroy(&self) {}

    fn getattr(&self, req: &RequestInfo, path: &Path) -> Result<Attr, c_int> {
        Err(libc::ENOSYS)
    }

    fn readlink(&self, req: &RequestInfo, path: &Path) -> Result<Vec<u8>, c_int> {
        Err(libc::ENOSYS)
    }

    fn mknod(
        &self,
        req: &RequestInfo,
        path: &Path,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<Entry, c_int> {
        Err(libc::ENOSYS)
    }

    fn mkdir(&self, req: &RequestInfo, path: &Path, mode: u32, umask: u32) -> Result<Entry, c_int> {
        Err(libc::ENOSYS)
    }

    fn unlink(&self, req: &RequestInfo, path: &Path) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn rmdir(&self, req: &RequestInfo, path: &Path) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn symlink(&self, req: &RequestInfo, path: &Path, target: &Path) -> Result<Entry, c_int> {
        Err(libc::ENOSYS)
    }

    fn rename(&self, req: &RequestInfo, from: &Path, to: &Path) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn link(&self, req: &RequestInfo, path: &Path, new_path: &Path) -> Result<Entry, c_int> {
        Err(libc::ENOSYS)
    }

    fn chmod(&self, req: &RequestInfo, path: &Path, mode: u32) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn chown(
        &self,
        req: &RequestInfo,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn truncate(&self, req: &RequestInfo, path: &Path, size: u64) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn utime(
        &self,
        req: &RequestInfo,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn open(&self, req: &RequestInfo, path: &Path, flags: i32) -> Result<u64, c_int> {
        Ok(0)
    }

    fn read(
        &self,
        req: &RequestInfo,
        path: &Path,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> Result<Vec<u8>, c_int> {
        Err(libc::ENOSYS)
    }

    fn write(
        &self,
        req: &RequestInfo,
        path: &Path,
        fh: u64,
        offset: i64,
        data: &[u8],
    ) -> Result<u32, c_int> {
        Err(libc::ENOSYS)
    }

    fn statfs(&self, req: &RequestInfo, path: &Path) -> Result<Statfs, c_int> {
        Ok(Statfs::default())
    }

    fn flush(&self, req: &RequestInfo, path: &Path, fh: u64, lock_owner: u64) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn release(
        &self,
        req: &RequestInfo,
        path: &Path,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
    ) -> Result<(), c_int> {
        Ok(())
    }

    fn fsync(&self, req: &RequestInfo, path: &Path, fh: u64, datasync: bool) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn opendir(&self, req: &RequestInfo, path: &Path, flags: i32) -> Result<u64, c_int> {
        Ok(0)
    }

    /// Invokes `sink` once per directory entry starting at `offset`. The
    /// directory buffer (§4.3) decides, based on whether `offset` is zero,
    /// whether this is an all-at-once or streaming fill.
    fn readdir(
        &self,
        req: &RequestInfo,
        path: &Path,
        fh: u64,
        offset: i64,
        sink: &mut DirEntrySink<'_>,
    ) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn releasedir(&self, req: &RequestInfo, path: &Path, fh: u64, flags: i32) -> Result<(), c_int> {
        Ok(())
    }

    fn fsyncdir(&self, req: &RequestInfo, path: &Path, fh: u64, datasync: bool) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn setxattr(
        &self,
        req: &RequestInfo,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
    ) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }

    fn getxattr(
        &self,
        req: &RequestInfo,
        path: &Path,
        name: &OsStr,
        size: u32,
    ) -> Result<Vec<u8>, c_int> {
        Err(libc::ENOSYS)
    }

    fn listxattr(&self, req: &RequestInfo, path: &Path, size: u32) -> Result<Vec<u8>, c_int> {
        Err(libc::ENOSYS)
    }

    fn removexattr(&self, req: &RequestInfo, path: &Path, name: &OsStr) -> Result<(), c_int> {
        Err(libc::ENOSYS)
    }
}
