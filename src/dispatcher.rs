//! The protocol dispatcher (§4.4): implements `fuser::Filesystem` by
//! translating every node-id-based kernel request into a pathname-based
//! call against a [`PathnameFilesystem`], using [`Tree`] for node-id
//! bookkeeping and [`crate::dir_buffer`]/[`crate::hidden_rename`] for the
//! two stateful policies that sit in front of the plain callbacks.
//!
//! `fuser` already terminated the wire protocol, decoded the frame, and ran
//! the INIT handshake by the time any of these methods are called; this is
//! the layer spec.md calls "the hard part."

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use fuser::{
    KernelConfig, ReplyAttr, ReplyData, ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use parking_lot::Mutex;

use crate::callbacks::{DirEntry, PathnameFilesystem};
use crate::config::Config;
use crate::context::RequestInfo;
use crate::dir_buffer::DirHandle;
use crate::error::{clamp_errno, CoreError};
use crate::hidden_rename;
use crate::tree::Tree;

fn osstr_to_str(name: &OsStr) -> Result<&str, i32> {
    name.to_str().ok_or(libc::EILSEQ)
}

fn core_err(err: CoreError) -> i32 {
    err.into_errno()
}

/// Resolves a `setattr` time argument to a concrete instant: `fuser`
/// distinguishes "set to this value" from "set to the current time" so the
/// kernel doesn't need to know the daemon's clock, but `utime`'s callback
/// signature only deals in resolved instants.
fn resolve_time(t: TimeOrNow) -> std::time::SystemTime {
    match t {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => std::time::SystemTime::now(),
    }
}

/// Generic `Filesystem` implementation over any [`PathnameFilesystem`].
/// Construct one per mount with [`Router::new`] and hand it to
/// `fuser::mount2`/`fuser::spawn_mount2`.
pub struct Router<F: PathnameFilesystem> {
    fs: F,
    tree: Tree,
    config: Config,
    next_fh: AtomicU64,
    dir_handles: Mutex<HashMap<u64, std::sync::Arc<DirHandle>>>,
}

impl<F: PathnameFilesystem> Router<F> {
    pub fn new(fs: F, config: Config) -> Router<F> {
        Router {
            fs,
            tree: Tree::new(),
            config,
            next_fh: AtomicU64::new(1),
            dir_handles: Mutex::new(HashMap::new()),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn trace(&self, message: std::fmt::Arguments<'_>) {
        if self.config.debug {
            log::debug!("{message}");
        }
    }

    /// `use_ino` gate: unless the mount option trusts the user callback's
    /// own inode numbers, `st_ino` in every attribute reply is overridden
    /// with the synthesized node id, so the two identifier spaces (kernel
    /// node id and whatever `getattr` reports) agree by default.
    ///
    /// Only safe to apply to replies where `attr.ino` is purely the
    /// cosmetic `st_ino` seen by userspace `stat(2)` — `getattr`/`setattr`,
    /// and the `FileAttr` embedded in a `readdirplus` entry (whose nodeid
    /// travels as a separate argument to `ReplyDirectoryPlus::add`). Entry-
    /// creating replies must use [`Router::apply_entry_ino`] instead.
    fn apply_ino(&self, attr: &mut fuser::FileAttr, node_id: u64) {
        if !self.config.use_ino {
            attr.ino = node_id;
        }
    }

    /// Unconditionally sets `attr.ino` to the node-table id, for use on
    /// `lookup`/`mknod`/`mkdir`/`symlink`/`link` replies. `fuser`'s
    /// `ReplyEntry::entry` has no nodeid argument separate from
    /// `attr.ino` — whatever value is in that field becomes both the
    /// stat-visible inode number *and* the kernel-facing nodeid this
    /// crate's node table is keyed by. Honoring `use_ino` here (as
    /// `apply_ino` does) would let the kernel start addressing the node by
    /// the user's own inode number while the table still expects the
    /// synthesized id, desynchronizing the two and aborting the process on
    /// the next request against it.
    fn apply_entry_ino(&self, attr: &mut fuser::FileAttr, node_id: u64) {
        attr.ino = node_id;
    }

    /// The `allow_root` policy gate: true if the request should proceed.
    /// Only consulted by operations outside the whitelist that reference an
    /// already-open handle (`read`, `write`, `fsync`, `release`, `readdir`,
    /// `fsyncdir`, `releasedir`, `init`) — those always run regardless of
    /// uid, since by the time a handle exists the open that produced it was
    /// already gated.
    fn gate(&self, req: &Request<'_>) -> bool {
        if !self.config.allow_root {
            return true;
        }
        req.uid() == 0 || req.uid() == unsafe { libc::getuid() }
    }
}

impl<F: PathnameFilesystem> fuser::Filesystem for Router<F> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        self.fs.init()
    }

    fn destroy(&mut self) {
        self.fs.destroy();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let Ok(name) = osstr_to_str(name) else {
            reply.error(libc::EILSEQ);
            return;
        };
        self.trace(format_args!("lookup parent={parent} name={name}"));

        let resolved = match self.tree.resolve_shared(parent, Some(name)) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };

        match self.fs.getattr(&info, Path::new(&resolved.path)) {
            Ok(mut attr) => {
                let lookup = self.tree.lookup_or_insert(parent, name, info.unique);
                self.apply_entry_ino(&mut attr.attr, lookup.id);
                reply.entry(&attr.ttl, &attr.attr, lookup.generation);
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.tree.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.getattr(&info, Path::new(&resolved.path)) {
            Ok(mut attr) => {
                self.apply_ino(&mut attr.attr, ino);
                reply.attr(&attr.ttl, &attr.attr)
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        let path = Path::new(&resolved.path);

        // Apply each requested field in the fixed order of §4.4: mode,
        // then uid/gid jointly, then size, then atime/mtime jointly (only
        // when both are requested), stopping at the first failure.
        if let Some(mode) = mode {
            if let Err(errno) = self.fs.chmod(&info, path, mode) {
                reply.error(clamp_errno(errno));
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(errno) = self.fs.chown(&info, path, uid, gid) {
                reply.error(clamp_errno(errno));
                return;
            }
        }
        if let Some(size) = size {
            if let Err(errno) = self.fs.truncate(&info, path, size) {
                reply.error(clamp_errno(errno));
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            if let Err(errno) = self.fs.utime(
                &info,
                path,
                atime.map(resolve_time),
                mtime.map(resolve_time),
            ) {
                reply.error(clamp_errno(errno));
                return;
            }
        }

        match self.fs.getattr(&info, path) {
            Ok(mut attr) => {
                self.apply_ino(&mut attr.attr, ino);
                reply.attr(&attr.ttl, &attr.attr)
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.readlink(&info, Path::new(&resolved.path)) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let Ok(name) = osstr_to_str(name) else {
            reply.error(libc::EILSEQ);
            return;
        };
        let resolved = match self.tree.resolve_exclusive(parent, Some(name)) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.mknod(&info, Path::new(&resolved.path), mode, umask, rdev) {
            Ok(mut entry) => {
                let lookup = self.tree.lookup_or_insert(parent, name, info.unique);
                self.apply_entry_ino(&mut entry.attr, lookup.id);
                reply.entry(&entry.entry_ttl, &entry.attr, lookup.generation);
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let Ok(name) = osstr_to_str(name) else {
            reply.error(libc::EILSEQ);
            return;
        };
        let resolved = match self.tree.resolve_exclusive(parent, Some(name)) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.mkdir(&info, Path::new(&resolved.path), mode, umask) {
            Ok(mut entry) => {
                let lookup = self.tree.lookup_or_insert(parent, name, info.unique);
                self.apply_entry_ino(&mut entry.attr, lookup.id);
                reply.entry(&entry.entry_ttl, &entry.attr, lookup.generation);
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let Ok(name) = osstr_to_str(name) else {
            reply.error(libc::EILSEQ);
            return;
        };

        if !self.config.hard_remove && self.tree.is_open(parent, name) {
            self.hide_and_unlink(&info, parent, name, reply);
            return;
        }

        let resolved = match self.tree.resolve_exclusive(parent, Some(name)) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.unlink(&info, Path::new(&resolved.path)) {
            Ok(()) => {
                self.tree.remove(parent, name);
                reply.ok();
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let Ok(name) = osstr_to_str(name) else {
            reply.error(libc::EILSEQ);
            return;
        };
        let resolved = match self.tree.resolve_exclusive(parent, Some(name)) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.rmdir(&info, Path::new(&resolved.path)) {
            Ok(()) => {
                self.tree.remove(parent, name);
                reply.ok();
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let Ok(link_name) = osstr_to_str(link_name) else {
            reply.error(libc::EILSEQ);
            return;
        };
        let resolved = match self.tree.resolve_exclusive(parent, Some(link_name)) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.symlink(&info, Path::new(&resolved.path), target) {
            Ok(mut entry) => {
                let lookup = self.tree.lookup_or_insert(parent, link_name, info.unique);
                self.apply_entry_ino(&mut entry.attr, lookup.id);
                reply.entry(&entry.entry_ttl, &entry.attr, lookup.generation);
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let (Ok(name), Ok(new_name)) = (osstr_to_str(name), osstr_to_str(new_name)) else {
            reply.error(libc::EILSEQ);
            return;
        };

        if flags & libc::RENAME_EXCHANGE as u32 != 0 {
            reply.error(libc::ENOSYS);
            return;
        }
        let no_replace = flags & libc::RENAME_NOREPLACE as u32 != 0;
        if no_replace && self.tree.find_child(new_parent, new_name).is_some() {
            reply.error(libc::EEXIST);
            return;
        }

        // If the destination name is occupied by a file someone still has
        // open, displace it to a hidden shadow name first so the rename
        // below lands cleanly and the open handle keeps working against its
        // (now unreachable) hidden path, same as an open file unlinked out
        // from under it.
        if !self.config.hard_remove && self.tree.is_open(new_parent, new_name) {
            if let Err(err) = self.hide_in_place(&info, new_parent, new_name) {
                reply.error(core_err(err));
                return;
            }
        }

        let paths = match self
            .tree
            .resolve_pair_exclusive(parent, name, new_parent, new_name)
        {
            Ok(paths) => paths,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };

        match self
            .fs
            .rename(&info, Path::new(&paths.path_a), Path::new(&paths.path_b))
        {
            Ok(()) => {
                match self
                    .tree
                    .rename(parent, name, new_parent, new_name, false)
                {
                    Ok(_) => reply.ok(),
                    Err(err) => reply.error(core_err(err)),
                }
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        new_parent: u64,
        new_name: &OsStr,
        reply: ReplyEntry,
    ) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let Ok(new_name) = osstr_to_str(new_name) else {
            reply.error(libc::EILSEQ);
            return;
        };
        let source = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        let dest_path = source.path.clone();
        let dest = match self.tree.resolve_exclusive(new_parent, Some(new_name)) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self
            .fs
            .link(&info, Path::new(&dest_path), Path::new(&dest.path))
        {
            Ok(mut entry) => {
                let lookup = self.tree.lookup_or_insert(new_parent, new_name, info.unique);
                self.apply_entry_ino(&mut entry.attr, lookup.id);
                reply.entry(&entry.entry_ttl, &entry.attr, lookup.generation);
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.open(&info, Path::new(&resolved.path), flags) {
            Ok(fh) => {
                self.tree.bump_open(ino);
                reply.opened(fh, 0);
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.read(&info, Path::new(&resolved.path), fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.write(&info, Path::new(&resolved.path), fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.flush(&info, Path::new(&resolved.path), fh, lock_owner) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        let info = RequestInfo::from_request(req);
        let (_, was_hidden) = self.tree.attr_fields(ino);

        let path = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved.path,
            Err(_) => {
                // Detached (already unlinked, non-hidden) node: still release
                // the user handle below using whatever path it remembers, if
                // any. Most pathname filesystems only need `fh` here anyway.
                String::new()
            }
        };

        let result = self
            .fs
            .release(&info, Path::new(&path), fh, flags, lock_owner, flush);

        let should_finalize = self.tree.drop_open(ino);
        if should_finalize && was_hidden {
            hidden_rename::finalize_release(&self.fs, &info, Path::new(&path));
        }

        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.fsync(&info, Path::new(&resolved.path), fh, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.opendir(&info, Path::new(&resolved.path), flags) {
            Ok(_user_fh) => {
                let handle = self.next_handle();
                self.dir_handles
                    .lock()
                    .insert(handle, std::sync::Arc::new(DirHandle::new()));
                reply.opened(handle, 0);
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        let Some(handle) = self.dir_handles.lock().get(&fh).cloned() else {
            reply.error(libc::EBADF);
            return;
        };

        let path = resolved.path.clone();
        let fs = &self.fs;
        let tree = &self.tree;
        let readdir_ino = self.config.readdir_ino;
        let result = std::cell::RefCell::new(Ok(()));
        let result_ref = &result;

        handle.readdir(
            offset,
            |sink| {
                let mut wrap = |mut entry: DirEntry| {
                    if readdir_ino && entry.ino == 0 {
                        if let Some(id) = tree.find_child(ino, &entry.name.to_string_lossy()) {
                            entry.ino = id;
                        }
                    }
                    sink(entry, None);
                };
                *result_ref.borrow_mut() =
                    fs.readdir(&info, Path::new(&path), fh, offset, &mut wrap);
            },
            &mut reply,
        );

        match result.into_inner() {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        let Some(handle) = self.dir_handles.lock().get(&fh).cloned() else {
            reply.error(libc::EBADF);
            return;
        };

        let path = resolved.path.clone();
        let fs = &self.fs;
        let tree = &self.tree;
        let unique = info.unique;
        let use_ino = self.config.use_ino;
        let result = std::cell::RefCell::new(Ok(()));
        let result_ref = &result;

        handle.readdirplus(
            offset,
            |sink| {
                let mut wrap = |mut entry: DirEntry| {
                    let name = entry.name.to_string_lossy().into_owned();

                    // readdirplus needs a full attribute reply per entry,
                    // unlike plain readdir's name-only listing: look the
                    // child up by its own reconstructed path rather than
                    // asking the user callback to carry attrs through the
                    // sink, keeping `PathnameFilesystem::readdir` the one
                    // callback both reply kinds share. Resolved before the
                    // lookup below, since whether it succeeds decides
                    // whether this entry earns a lookup reference at all.
                    let child_path = Path::new(&path).join(&entry.name);
                    let attr_result = fs.getattr(&info, &child_path);

                    // Every entry readdirplus hands back establishes an
                    // implicit lookup reference the kernel will later
                    // balance with a `forget`, same as a real `lookup` —
                    // except "." and "..", which libfuse's own lowlevel
                    // readdirplus path never counts, since they don't name
                    // a fresh child of this directory. The dirent's `ino`
                    // here is the nodeid the kernel will address this entry
                    // by from now on (unlike plain `readdir`'s purely
                    // cosmetic one), so it's always the table's own id, not
                    // whatever the user callback happened to supply. An
                    // entry whose attributes can't be fetched never reaches
                    // the kernel (the directory buffer drops it below), so
                    // it must not take a lookup reference either.
                    match name.as_str() {
                        "." => entry.ino = ino,
                        ".." => entry.ino = tree.parent_of(ino),
                        _ if attr_result.is_ok() => {
                            let lookup = tree.lookup_or_insert(ino, &name, unique);
                            entry.ino = lookup.id;
                        }
                        _ => {}
                    }

                    let reply_ino = entry.ino;
                    let attr = attr_result.ok().map(|mut attr| {
                        if !use_ino {
                            attr.attr.ino = reply_ino;
                        }
                        attr
                    });
                    sink(entry, attr);
                };
                *result_ref.borrow_mut() =
                    fs.readdir(&info, Path::new(&path), fh, offset, &mut wrap);
            },
            |id| tree.attr_fields(id).0,
            &mut reply,
        );

        match result.into_inner() {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, reply: ReplyEmpty) {
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        let result = self.fs.releasedir(&info, Path::new(&resolved.path), fh, flags);
        self.dir_handles.lock().remove(&fh);
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn fsyncdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.fsyncdir(&info, Path::new(&resolved.path), fh, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.statfs(&info, Path::new(&resolved.path)) {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.bfree,
                stats.bavail,
                stats.files,
                stats.ffree,
                stats.bsize,
                stats.namelen,
                stats.frsize,
            ),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self
            .fs
            .setxattr(&info, Path::new(&resolved.path), name, value, flags, position)
        {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn getxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.getxattr(&info, Path::new(&resolved.path), name, size) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() > size as usize {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.listxattr(&info, Path::new(&resolved.path), size) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() > size as usize {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let info = RequestInfo::from_request(req);
        let resolved = match self.tree.resolve_shared(ino, None) {
            Ok(resolved) => resolved,
            Err(err) => {
                reply.error(core_err(err));
                return;
            }
        };
        match self.fs.removexattr(&info, Path::new(&resolved.path), name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(clamp_errno(errno)),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        if !self.gate(req) {
            reply.error(libc::EACCES);
            return;
        }
        let _ = ino;
        reply.ok();
    }
}

impl<F: PathnameFilesystem> Router<F> {
    fn hide_and_unlink(&mut self, info: &RequestInfo, parent: u64, name: &str, reply: ReplyEmpty) {
        match self.hide_in_place(info, parent, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(core_err(err)),
        }
    }

    /// Moves `parent/name` to a synthesized hidden name in its own
    /// directory, without touching whatever is ultimately supposed to
    /// happen to the name afterwards. Shared by `unlink`'s busy-unlink path
    /// and `rename`'s busy-destination path (§4.2, §4.4).
    fn hide_in_place(&mut self, info: &RequestInfo, parent: u64, name: &str) -> Result<(), CoreError> {
        let parent_path = self.tree.resolve_exclusive(parent, None)?.path;
        let id = self.tree.find_child(parent, name).ok_or(CoreError::NotFound)?;
        let hidden_name = hidden_rename::hide(&self.fs, info, Path::new(&parent_path), name, id)?;
        self.tree.rename(parent, name, parent, &hidden_name, true)?;
        Ok(())
    }
}

