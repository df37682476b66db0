//! Directory buffer (§4.3): caches the result of a directory's `readdir`
//! callback across the windowed sequence of kernel reads that make up one
//! logical listing.
//!
//! The kernel issues `readdir` in a loop, each call asking to resume at the
//! offset the previous reply stopped at, until a reply comes back with no
//! entries (EOF) or the directory is closed. Calling the user's `readdir`
//! callback fresh for every one of those kernel-level calls would mean
//! re-walking the whole directory per page; instead the first call (offset
//! 0) fills this buffer once, and subsequent calls slice into it.

use std::ffi::OsString;

use fuser::{FileType, ReplyDirectory, ReplyDirectoryPlus};
use parking_lot::Mutex;

use crate::callbacks::{Attr, DirEntry};

/// One buffered, fully-resolved directory entry. `attr` is only populated
/// for `readdirplus`-style fills; plain `readdir` leaves it `None`.
#[derive(Debug, Clone)]
struct Record {
    ino: u64,
    kind: FileType,
    name: OsString,
    attr: Option<Attr>,
}

struct State {
    /// `None` until the first fill; `Some` (possibly empty) thereafter.
    records: Option<Vec<Record>>,
}

/// Per-open-directory buffer. One instance is created in `opendir` and
/// dropped in `releasedir`; `fuser` hands back the same file handle on every
/// `readdir` call against that directory, so callers key on that handle to
/// find this buffer.
pub struct DirHandle {
    state: Mutex<State>,
}

impl DirHandle {
    pub fn new() -> DirHandle {
        DirHandle {
            state: Mutex::new(State { records: None }),
        }
    }

    /// Ensures the buffer is filled, invoking `fill` (the user's `readdir`
    /// callback, already wired up to call back into this buffer) if this is
    /// the first read against the handle, or if `offset` is zero — a kernel
    /// rewind (`rewinddir(3)` without a matching `releasedir`) asks for the
    /// listing again from the start, and the buffer is invalidated and
    /// refilled rather than replaying a stale snapshot.
    fn ensure_filled(&self, offset: i64, fill: impl FnOnce(&mut dyn FnMut(DirEntry, Option<Attr>))) {
        let mut state = self.state.lock();
        if offset == 0 {
            state.records = None;
        } else if state.records.is_some() {
            return;
        }
        let mut records = Vec::new();
        fill(&mut |entry, attr| {
            records.push(Record {
                ino: entry.ino,
                kind: entry.kind,
                name: entry.name,
                attr,
            });
        });
        state.records = Some(records);
    }

    /// Serves one `readdir` reply starting at `offset`, filling the buffer
    /// first if needed. `offset` is the 1-based index into the buffered
    /// record list the kernel wants resumed from (the convention `fuser`'s
    /// own examples use: each added entry's offset is its index + 1).
    /// Stops adding entries as soon as `reply.add` reports the kernel's
    /// reply buffer is full, leaving the rest for the next call.
    pub fn readdir(
        &self,
        offset: i64,
        fill: impl FnOnce(&mut dyn FnMut(DirEntry, Option<Attr>)),
        reply: &mut ReplyDirectory,
    ) {
        self.ensure_filled(offset, fill);
        let state = self.state.lock();
        let records = state.records.as_ref().expect("just filled");
        let start = offset.max(0) as usize;
        for (index, record) in records.iter().enumerate().skip(start) {
            let next_offset = (index + 1) as i64;
            if reply.add(record.ino, next_offset, record.kind, &record.name) {
                break;
            }
        }
    }

    /// As [`DirHandle::readdir`], but for `readdirplus`: entries without a
    /// buffered `attr` are skipped rather than replied with placeholder
    /// attributes, since a caller that mixes plain and structured fills
    /// wants the gap to be visible rather than silently papered over.
    pub fn readdirplus(
        &self,
        offset: i64,
        fill: impl FnOnce(&mut dyn FnMut(DirEntry, Option<Attr>)),
        generation: impl Fn(u64) -> u64,
        reply: &mut ReplyDirectoryPlus,
    ) {
        self.ensure_filled(offset, fill);
        let state = self.state.lock();
        let records = state.records.as_ref().expect("just filled");
        let start = offset.max(0) as usize;
        for (index, record) in records.iter().enumerate().skip(start) {
            let Some(attr) = &record.attr else { continue };
            let next_offset = (index + 1) as i64;
            let full = reply.add(
                record.ino,
                next_offset,
                &record.name,
                &attr.ttl,
                &attr.attr,
                generation(record.ino),
            );
            if full {
                break;
            }
        }
    }
}

impl Default for DirHandle {
    fn default() -> Self {
        DirHandle::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ino: u64, name: &str) -> DirEntry {
        DirEntry {
            ino,
            kind: FileType::RegularFile,
            name: OsString::from(name),
        }
    }

    #[test]
    fn fill_runs_once_across_ascending_offsets() {
        let handle = DirHandle::new();
        let calls = std::sync::atomic::AtomicU32::new(0);

        let fill = |sink: &mut dyn FnMut(DirEntry, Option<Attr>)| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            sink(entry(2, "a"), None);
            sink(entry(3, "b"), None);
        };
        handle.ensure_filled(0, fill);
        // A follow-up page at a non-zero offset must not re-invoke fill.
        handle.ensure_filled(1, |_| panic!("fill must not run twice for a forward page"));

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let state = handle.state.lock();
        assert_eq!(state.records.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn rewind_to_offset_zero_restarts_the_fill() {
        let handle = DirHandle::new();
        let calls = std::sync::atomic::AtomicU32::new(0);

        let fill = |sink: &mut dyn FnMut(DirEntry, Option<Attr>)| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            sink(entry(2, "a"), None);
        };
        handle.ensure_filled(0, fill);
        handle.ensure_filled(0, fill);

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_directory_fills_with_zero_records_not_none() {
        let handle = DirHandle::new();
        handle.ensure_filled(0, |_sink| {});
        let state = handle.state.lock();
        assert_eq!(state.records.as_ref().unwrap().len(), 0);
    }
}
