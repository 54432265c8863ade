//! Bidirectional inode <-> path mapping. Inode 1 is
//! always the root path. Numbers are never reused: the counter only
//! ever increases, even across `release`, so a retired inode can never
//! alias a different path for the lifetime of the process.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::metrics;
use crate::tree::ROOT;

pub const ROOT_INODE: u64 = 1;

struct State {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    next_inode: u64,
}

pub struct InodeMap {
    state: Mutex<State>,
}

impl InodeMap {
    pub fn new() -> Self {
        let mut path_to_inode = HashMap::new();
        let mut inode_to_path = HashMap::new();
        path_to_inode.insert(ROOT.to_string(), ROOT_INODE);
        inode_to_path.insert(ROOT_INODE, ROOT.to_string());
        InodeMap {
            state: Mutex::new(State {
                path_to_inode,
                inode_to_path,
                next_inode: ROOT_INODE + 1,
            }),
        }
    }

    /// Returns the existing inode for `path`, or allocates a fresh one.
    pub fn from_path(&self, path: &str) -> u64 {
        let mut state = self.state.lock();
        if let Some(&inode) = state.path_to_inode.get(path) {
            return inode;
        }
        let inode = state.next_inode;
        state.next_inode += 1;
        state.path_to_inode.insert(path.to_string(), inode);
        state.inode_to_path.insert(inode, path.to_string());
        metrics::metrics().open_inodes.set(state.inode_to_path.len() as i64);
        inode
    }

    pub fn to_path(&self, inode: u64) -> Result<String> {
        let state = self.state.lock();
        state
            .inode_to_path
            .get(&inode)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("inode {inode}")))
    }

    /// Forgets the mapping for `inode`. The path->inode entry is removed
    /// too, but `next_inode` never decreases, so a later `from_path` for
    /// the same path mints a brand new number.
    pub fn release(&self, inode: u64) {
        let mut state = self.state.lock();
        if inode == ROOT_INODE {
            return;
        }
        if let Some(path) = state.inode_to_path.remove(&inode) {
            state.path_to_inode.remove(&path);
        }
        metrics::metrics().open_inodes.set(state.inode_to_path.len() as i64);
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        InodeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preassigned() {
        let map = InodeMap::new();
        assert_eq!(map.from_path(ROOT), ROOT_INODE);
        assert_eq!(map.to_path(ROOT_INODE).unwrap(), ROOT);
    }

    #[test]
    fn repeated_lookup_returns_same_inode() {
        let map = InodeMap::new();
        let a = map.from_path("a/b");
        let b = map.from_path("a/b");
        assert_eq!(a, b);
    }

    #[test]
    fn released_inode_number_is_never_reused() {
        let map = InodeMap::new();
        let first = map.from_path("f");
        map.release(first);
        let second = map.from_path("f");
        assert_ne!(first, second, "path reused after release must get a fresh inode");
    }

    #[test]
    fn unknown_inode_is_not_found() {
        let map = InodeMap::new();
        assert!(map.to_path(9999).is_err());
    }

    #[test]
    fn root_cannot_be_released() {
        let map = InodeMap::new();
        map.release(ROOT_INODE);
        assert_eq!(map.to_path(ROOT_INODE).unwrap(), ROOT);
    }
}
