//! `Tree` pairs the node table with the two locks described in §5: a
//! reader/writer "tree lock" held for the duration of a pathname operation
//! (so the path string handed to a user callback can't be invalidated by a
//! concurrent rename), and a plain mutex "node lock" guarding the table
//! itself for short critical sections only.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::CoreError;
use crate::node_table::{Lookup, NodeTable, RenameOutcome, ROOT_ID};

/// Held across a pathname operation's user callback. Dropping it releases
/// the tree lock. Exists so call sites can't accidentally hold the lock
/// past the callback by forgetting to drop a raw guard.
pub struct SharedPath<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    pub path: String,
}

pub struct ExclusivePath<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    pub path: String,
}

pub struct Tree {
    lock: RwLock<()>,
    table: Mutex<NodeTable>,
}

impl Tree {
    pub fn new() -> Tree {
        Tree {
            lock: RwLock::new(()),
            table: Mutex::new(NodeTable::new()),
        }
    }

    /// Acquires the tree lock in shared mode and resolves `id` (optionally
    /// with a trailing not-yet-created component) to a path. The returned
    /// guard must be held for the duration of the ensuing user callback.
    pub fn resolve_shared(&self, id: u64, extra: Option<&str>) -> Result<SharedPath<'_>, CoreError> {
        let guard = self.lock.read();
        let path = self.table.lock().path_of(id, extra)?;
        Ok(SharedPath { _guard: guard, path })
    }

    /// Same as [`Tree::resolve_shared`] but takes the tree lock exclusively,
    /// for namespace-mutating operations (`unlink`, `rmdir`, `rename`).
    pub fn resolve_exclusive(
        &self,
        id: u64,
        extra: Option<&str>,
    ) -> Result<ExclusivePath<'_>, CoreError> {
        let guard = self.lock.write();
        let path = self.table.lock().path_of(id, extra)?;
        Ok(ExclusivePath { _guard: guard, path })
    }

    /// Resolves two paths under one exclusive tree-lock acquisition, for
    /// `rename`, which needs both the source and destination parent paths
    /// stable against concurrent mutation.
    pub fn resolve_pair_exclusive(
        &self,
        parent_a: u64,
        name_a: &str,
        parent_b: u64,
        name_b: &str,
    ) -> Result<ExclusivePathPair<'_>, CoreError> {
        let guard = self.lock.write();
        let table = self.table.lock();
        let path_a = table.path_of(parent_a, Some(name_a))?;
        let path_b = table.path_of(parent_b, Some(name_b))?;
        drop(table);
        Ok(ExclusivePathPair {
            _guard: guard,
            path_a,
            path_b,
        })
    }

    pub fn lookup_or_insert(&self, parent_id: u64, name: &str, version: u64) -> Lookup {
        self.table.lock().lookup_or_insert(parent_id, name, version)
    }

    pub fn forget(&self, id: u64, count: u64) {
        if id == ROOT_ID {
            return;
        }
        self.table.lock().forget(id, count);
    }

    pub fn remove(&self, parent_id: u64, name: &str) -> Option<u64> {
        self.table.lock().remove(parent_id, name)
    }

    pub fn rename(
        &self,
        old_parent: u64,
        old_name: &str,
        new_parent: u64,
        new_name: &str,
        hide: bool,
    ) -> Result<RenameOutcome, CoreError> {
        self.table
            .lock()
            .rename(old_parent, old_name, new_parent, new_name, hide)
    }

    pub fn is_open(&self, parent_id: u64, name: &str) -> bool {
        self.table.lock().is_open(parent_id, name)
    }

    pub fn bump_open(&self, id: u64) {
        self.table.lock().bump_open(id);
    }

    pub fn drop_open(&self, id: u64) -> bool {
        self.table.lock().drop_open(id)
    }

    pub fn attr_fields(&self, id: u64) -> (u64, bool) {
        let table = self.table.lock();
        let node = table.get(id);
        (node.generation, node.is_hidden)
    }

    /// The parent of `id`, or `id` itself if detached (unlinked-but-open)
    /// or already root. Used to fill in the `..` readdir entry's inode
    /// number, which has no `(parent, name)` binding of its own to resolve.
    pub fn parent_of(&self, id: u64) -> u64 {
        let table = self.table.lock();
        let node = table.get(id);
        if node.parent_id == 0 {
            id
        } else {
            node.parent_id
        }
    }

    /// Node-id lookup for readdir inode enrichment (`readdir_ino`): resolves
    /// a sibling's id from its name without touching lookup counts.
    pub fn find_child(&self, parent_id: u64, name: &str) -> Option<u64> {
        self.table.lock().find_child(parent_id, name)
    }

    /// Number of nodes currently tracked (root included). Exposed for tests
    /// and for a filesystem's own diagnostics.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

pub struct ExclusivePathPair<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    pub path_a: String,
    pub path_b: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_resolve_returns_root() {
        let tree = Tree::new();
        let resolved = tree.resolve_shared(ROOT_ID, None).unwrap();
        assert_eq!(resolved.path, "/");
    }

    #[test]
    fn resolve_pair_gives_both_paths_under_one_acquisition() {
        let tree = Tree::new();
        let a = tree.lookup_or_insert(ROOT_ID, "a", 1).id;
        let _ = a;
        let pair = tree
            .resolve_pair_exclusive(ROOT_ID, "a", ROOT_ID, "b")
            .unwrap();
        assert_eq!(pair.path_a, "/a");
        assert_eq!(pair.path_b, "/b");
    }
}
