//! The in-memory node table: identifier <-> (parent, name) bindings and
//! path reconstruction.
//!
//! This is deliberately the largest module in the crate — see §4.1 of the
//! design. Everything here runs under the node lock (a short-lived
//! `parking_lot::Mutex`, owned by `Tree`) except `path_of`, which only reads.

use std::collections::HashMap;

use crate::error::CoreError;

/// Fixed identifier of the mount root. Never reused, never freed.
pub const ROOT_ID: u64 = 1;

/// Maximum length of a reconstructed path, in bytes. libfuse's own
/// `PATH_MAX`-alike bound; exceeding it is treated as `NOT_FOUND` rather
/// than silently truncating.
pub const MAX_PATH_LEN: usize = 4096;

/// A single entry in the node table.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: u64,
    pub generation: u64,
    pub parent_id: u64,
    pub name: String,
    pub refctr: u64,
    pub nlookup: u64,
    pub open_count: u64,
    pub is_hidden: bool,
    pub version: u64,
}

impl Node {
    fn detached(&self) -> bool {
        self.name.is_empty()
    }
}

/// Result of a successful `lookup_or_insert`.
#[derive(Debug, Clone, Copy)]
pub struct Lookup {
    pub id: u64,
    pub generation: u64,
    /// True if this call allocated a fresh node rather than finding an
    /// existing one.
    pub created: bool,
}

/// Outcome of a rename against the node table.
#[derive(Debug, Clone, Copy)]
pub enum RenameOutcome {
    Ok,
    /// The destination name is occupied by an open file and `hide` was
    /// requested — the caller is expected to run the hidden-rename policy
    /// instead of a plain rename.
    DestinationBusy,
}

pub struct NodeTable {
    by_id: HashMap<u64, Node>,
    by_name: HashMap<(u64, String), u64>,
    next_id: u64,
    generation: u64,
}

impl NodeTable {
    pub fn new() -> NodeTable {
        let mut by_id = HashMap::new();
        by_id.insert(
            ROOT_ID,
            Node {
                id: ROOT_ID,
                generation: 0,
                parent_id: 0,
                name: "/".to_string(),
                refctr: 1,
                nlookup: 1,
                open_count: 0,
                is_hidden: false,
                version: 0,
            },
        );
        NodeTable {
            by_id,
            by_name: HashMap::new(),
            next_id: ROOT_ID + 1,
            generation: 0,
        }
    }

    /// Number of nodes currently tracked, root included. Used by tests to
    /// assert that the table converges back to root-only after a sequence
    /// of lookups and forgets.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Id-index lookup. Fatal if absent: the kernel only ever references
    /// identifiers this table handed out.
    pub fn get(&self, id: u64) -> &Node {
        self.by_id
            .get(&id)
            .unwrap_or_else(|| crate::error::abort_corrupted(&format!("unknown node id {id}")))
    }

    pub fn try_get(&self, id: u64) -> Option<&Node> {
        self.by_id.get(&id)
    }

    /// Name-index lookup, used by `lookup`, `remove`, and `is_open`.
    pub fn find_child(&self, parent_id: u64, name: &str) -> Option<u64> {
        self.by_name.get(&(parent_id, name.to_string())).copied()
    }

    pub fn is_open(&self, parent_id: u64, name: &str) -> bool {
        self.find_child(parent_id, name)
            .map(|id| self.get(id).open_count > 0)
            .unwrap_or(false)
    }

    /// Reconstructs an absolute path by walking `parent_id` to the root,
    /// optionally appending a not-yet-created trailing component. Never
    /// returns a string containing `//`; always begins with `/`; the root
    /// reconstructs as exactly `/`.
    pub fn path_of(&self, id: u64, extra: Option<&str>) -> Result<String, CoreError> {
        let mut segments: Vec<&str> = Vec::new();
        if let Some(extra) = extra {
            segments.push(extra);
        }

        let mut current = id;
        while current != ROOT_ID {
            let node = self.by_id.get(&current).ok_or(CoreError::NotFound)?;
            if node.detached() {
                return Err(CoreError::NotFound);
            }
            segments.push(&node.name);
            current = node.parent_id;
            if current == 0 {
                return Err(CoreError::NotFound);
            }
        }

        if segments.is_empty() {
            return Ok("/".to_string());
        }

        let mut path = String::new();
        for segment in segments.iter().rev() {
            path.push('/');
            path.push_str(segment);
        }

        if path.len() > MAX_PATH_LEN {
            return Err(CoreError::NameTooLong);
        }

        Ok(path)
    }

    /// Finds or creates the node bound to `(parent_id, name)`. Bumps
    /// `nlookup` either way. `version` is the request unique-id that caused
    /// this lookup, stashed for diagnostics (see `Node::version`).
    pub fn lookup_or_insert(&mut self, parent_id: u64, name: &str, version: u64) -> Lookup {
        if let Some(&id) = self.by_name.get(&(parent_id, name.to_string())) {
            let node = self.by_id.get_mut(&id).expect("name index out of sync");
            node.nlookup += 1;
            node.version = version;
            return Lookup {
                id,
                generation: node.generation,
                created: false,
            };
        }

        let (id, generation) = self.allocate_id();
        let node = Node {
            id,
            generation,
            parent_id: 0,
            name: String::new(),
            refctr: 0,
            nlookup: 1,
            open_count: 0,
            is_hidden: false,
            version,
        };
        self.by_id.insert(id, node);
        self.attach(id, parent_id, name);

        Lookup {
            id,
            generation,
            created: true,
        }
    }

    /// Detaches `(parent_id, name)` from the tree without freeing it.
    /// Returns the node id that was detached, if any existed.
    pub fn remove(&mut self, parent_id: u64, name: &str) -> Option<u64> {
        let id = self.find_child(parent_id, name)?;
        self.detach(id);
        Some(id)
    }

    /// Rebinds `(old_parent, old_name)` to `(new_parent, new_name)`,
    /// preserving the node's identifier. If a different node already
    /// occupies the destination, it is detached first — unless `hide` is
    /// set, in which case that collision is reported as `DestinationBusy`
    /// so the caller can run the hidden-rename policy instead.
    pub fn rename(
        &mut self,
        old_parent: u64,
        old_name: &str,
        new_parent: u64,
        new_name: &str,
        hide: bool,
    ) -> Result<RenameOutcome, CoreError> {
        let id = self.find_child(old_parent, old_name).ok_or(CoreError::NotFound)?;

        if let Some(&victim) = self.by_name.get(&(new_parent, new_name.to_string())) {
            if victim != id {
                if hide {
                    return Ok(RenameOutcome::DestinationBusy);
                }
                self.detach(victim);
            }
        }

        // Detach and reattach under the new binding without running the
        // free check in between: the node is still live, just relocated.
        // `attach` below re-establishes the self-attachment count, so drop
        // it here too, or the node ends up double-counted against itself.
        let mut node = self.by_id.remove(&id).expect("id index out of sync");
        self.by_name.remove(&(old_parent, old_name.to_string()));
        if let Some(parent) = self.by_id.get_mut(&old_parent) {
            parent.refctr -= 1;
        }
        node.refctr -= 1;
        node.name.clear();
        node.parent_id = 0;
        self.by_id.insert(id, node);

        self.attach(id, new_parent, new_name);
        if hide {
            self.by_id.get_mut(&id).expect("just attached").is_hidden = true;
        }

        Ok(RenameOutcome::Ok)
    }

    /// Applies a kernel forget: decrements `nlookup` by `count`, detaching
    /// and potentially freeing the node once it drops to zero. A forget
    /// against the root is always a no-op.
    pub fn forget(&mut self, id: u64, count: u64) {
        if id == ROOT_ID {
            return;
        }
        let Some(node) = self.by_id.get_mut(&id) else {
            return;
        };
        node.nlookup = node.nlookup.saturating_sub(count);
        if node.nlookup != 0 {
            return;
        }
        // Still bound to a name: detach it (dropping its self- and
        // parent-held refctr contributions) before the free check, or an
        // attached leaf — refctr >= 1 from its own self-attachment — would
        // never reach the refctr == 0 that `maybe_free` requires. A node
        // that was already detached by an earlier unlink/rename-over has
        // nothing left to detach; just run the free check directly.
        let already_detached = self.by_id.get(&id).map(|n| n.detached()).unwrap_or(false);
        if already_detached {
            self.maybe_free(id);
        } else {
            self.detach(id);
        }
    }

    pub fn bump_open(&mut self, id: u64) {
        self.by_id.get_mut(&id).expect("open on unknown node").open_count += 1;
    }

    /// Decrements the open count and returns `true` if this was the final
    /// release of a node that had been hidden — the caller must then issue
    /// the user's `unlink` on the hidden path.
    pub fn drop_open(&mut self, id: u64) -> bool {
        let node = self.by_id.get_mut(&id).expect("release on unknown node");
        node.open_count = node.open_count.saturating_sub(1);
        let finalize = node.open_count == 0 && node.is_hidden;
        if finalize {
            // Hidden nodes are still attached under their hidden name until
            // now — the rename that hid them deferred detaching so open
            // handles could keep resolving it. Detach drops that binding and
            // its refctr contributions and runs the free check itself.
            self.detach(id);
        } else if node.open_count == 0 {
            self.maybe_free(id);
        }
        finalize
    }

    fn attach(&mut self, id: u64, parent_id: u64, name: &str) {
        let node = self.by_id.get_mut(&id).expect("attach on unknown node");
        node.parent_id = parent_id;
        node.name = name.to_string();
        node.refctr += 1;
        self.by_name.insert((parent_id, name.to_string()), id);
        if let Some(parent) = self.by_id.get_mut(&parent_id) {
            parent.refctr += 1;
        }
    }

    fn detach(&mut self, id: u64) {
        let Some(node) = self.by_id.get_mut(&id) else {
            return;
        };
        if node.detached() {
            return;
        }
        let parent_id = node.parent_id;
        let name = std::mem::take(&mut node.name);
        node.parent_id = 0;
        node.refctr -= 1;
        self.by_name.remove(&(parent_id, name));
        if let Some(parent) = self.by_id.get_mut(&parent_id) {
            parent.refctr -= 1;
        }
        self.maybe_free(id);
        if parent_id != ROOT_ID {
            self.maybe_free(parent_id);
        }
    }

    /// Frees a node from the id index once it is unreachable (`refctr ==
    /// 0`), has no outstanding kernel lookups, and has no open handles.
    /// Root is never freed.
    fn maybe_free(&mut self, id: u64) {
        if id == ROOT_ID {
            return;
        }
        let free = match self.by_id.get(&id) {
            Some(node) => node.refctr == 0 && node.nlookup == 0 && node.open_count == 0,
            None => false,
        };
        if free {
            self.by_id.remove(&id);
        }
    }

    fn allocate_id(&mut self) -> (u64, u64) {
        loop {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.generation += 1;
                self.next_id = 1;
            }
            if candidate != 0 && !self.by_id.contains_key(&candidate) {
                return (candidate, self.generation);
            }
        }
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        NodeTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_reconstructs_as_exactly_slash() {
        let table = NodeTable::new();
        assert_eq!(table.path_of(ROOT_ID, None).unwrap(), "/");
    }

    #[test]
    fn empty_directory_lookup_is_not_found() {
        let table = NodeTable::new();
        assert!(table.find_child(ROOT_ID, "a").is_none());
    }

    #[test]
    fn lookup_or_insert_is_idempotent_and_bumps_nlookup_by_two() {
        let mut table = NodeTable::new();
        let first = table.lookup_or_insert(ROOT_ID, "a", 1);
        assert!(first.created);
        let second = table.lookup_or_insert(ROOT_ID, "a", 2);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(table.get(first.id).nlookup, 2);
    }

    #[test]
    fn path_of_appends_trailing_name_without_double_slash() {
        let table = NodeTable::new();
        let path = table.path_of(ROOT_ID, Some("a")).unwrap();
        assert_eq!(path, "/a");
        assert!(!path.contains("//"));
    }

    #[test]
    fn path_of_nested_entry() {
        let mut table = NodeTable::new();
        let dir = table.lookup_or_insert(ROOT_ID, "d", 1).id;
        let file = table.lookup_or_insert(dir, "f", 2).id;
        assert_eq!(table.path_of(file, None).unwrap(), "/d/f");
    }

    #[test]
    fn create_rename_forget_returns_table_to_root_only() {
        let mut table = NodeTable::new();
        let x = table.lookup_or_insert(ROOT_ID, "x", 1).id;
        assert_eq!(table.len(), 2);

        matches!(
            table
                .rename(ROOT_ID, "x", ROOT_ID, "y", false)
                .unwrap(),
            RenameOutcome::Ok
        );
        assert_eq!(table.find_child(ROOT_ID, "y"), Some(x));
        assert!(table.find_child(ROOT_ID, "x").is_none());
        assert_eq!(table.path_of(x, None).unwrap(), "/y");

        table.forget(x, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unlink_detaches_but_keeps_node_alive_while_open() {
        let mut table = NodeTable::new();
        let f = table.lookup_or_insert(ROOT_ID, "f", 1).id;
        table.bump_open(f);

        table.remove(ROOT_ID, "f");
        // Still tracked: open handle outstanding.
        assert!(table.try_get(f).is_some());
        assert!(table.find_child(ROOT_ID, "f").is_none());

        let should_unlink_hidden = table.drop_open(f);
        assert!(!should_unlink_hidden); // wasn't marked hidden
        assert!(table.try_get(f).is_none());
    }

    #[test]
    fn hide_rename_marks_node_and_unlink_fires_on_last_release() {
        let mut table = NodeTable::new();
        let f = table.lookup_or_insert(ROOT_ID, "f", 1).id;
        table.bump_open(f);

        let outcome = table
            .rename(ROOT_ID, "f", ROOT_ID, ".fuse_hidden0000000100000000", true)
            .unwrap();
        assert!(matches!(outcome, RenameOutcome::Ok));
        assert!(table.get(f).is_hidden);
        assert!(table.find_child(ROOT_ID, "f").is_none());

        let finalize = table.drop_open(f);
        assert!(finalize);
        assert!(table.try_get(f).is_none());
    }

    #[test]
    fn identifier_reuse_bumps_generation_on_wraparound() {
        let mut table = NodeTable::new();
        table.next_id = u64::MAX;
        let before = table.lookup_or_insert(ROOT_ID, "a", 1);
        let gen_before = before.generation;
        table.forget(before.id, 1);

        let after = table.lookup_or_insert(ROOT_ID, "b", 2);
        assert!(after.generation > gen_before);
    }

    #[test]
    fn path_too_long_is_rejected() {
        let mut table = NodeTable::new();
        let mut parent = ROOT_ID;
        let long_name = "x".repeat(200);
        for i in 0..30 {
            let name = format!("{long_name}{i}");
            parent = table.lookup_or_insert(parent, &name, i as u64).id;
        }
        assert_eq!(table.path_of(parent, None), Err(CoreError::NameTooLong));
    }
}
