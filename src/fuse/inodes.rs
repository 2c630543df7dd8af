//! Inode → virtual path bookkeeping.
//!
//! A hard-linked inode can be known under several names; the most recently
//! seen one is used to address it. Entries live until the kernel forgets
//! every lookup of them, except the mount root which is permanent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use fuser::FUSE_ROOT_ID;

#[derive(Debug, Default)]
struct Node {
    /// Oldest first
    names: Vec<PathBuf>,
    lookups: u64,
}

#[derive(Debug)]
pub struct InodeTable {
    nodes: HashMap<u64, Node>,
    by_path: HashMap<PathBuf, u64>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            nodes: HashMap::new(),
            by_path: HashMap::new(),
        };
        table.remember(FUSE_ROOT_ID, PathBuf::from("/"));
        table
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn path(&self, ino: u64) -> Option<&Path> {
        self.nodes.get(&ino)?.names.last().map(PathBuf::as_path)
    }

    /// Record that `path` names `ino`, taking the name away from any other
    /// inode that held it.
    pub fn remember(&mut self, ino: u64, path: PathBuf) {
        if let Some(previous) = self.by_path.insert(path.clone(), ino) {
            if previous != ino {
                self.drop_name(previous, &path);
            }
        }
        let node = self.nodes.entry(ino).or_default();
        node.names.retain(|name| name != &path);
        node.names.push(path);
    }

    /// Count one kernel lookup of `ino`, which must already be remembered
    pub fn lookup(&mut self, ino: u64) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.lookups += 1;
        }
    }

    /// Drop `nlookup` kernel references to `ino`
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        let Some(node) = self.nodes.get_mut(&ino) else {
            return;
        };
        node.lookups = node.lookups.saturating_sub(nlookup);
        if node.lookups == 0 && ino != FUSE_ROOT_ID {
            self.remove(ino);
        }
    }

    /// `path` no longer exists; its inode keeps any other names it has
    pub fn unlink(&mut self, path: &Path) {
        if let Some(ino) = self.by_path.remove(path) {
            self.drop_name(ino, path);
        }
    }

    /// Move `old` and everything below it to `new`
    pub fn rename(&mut self, old: &Path, new: &Path) {
        let moved: Vec<(PathBuf, u64)> = self
            .by_path
            .iter()
            .filter_map(|(path, ino)| {
                let rest = path.strip_prefix(old).ok()?;
                let target = if rest.as_os_str().is_empty() {
                    new.to_path_buf()
                } else {
                    new.join(rest)
                };
                Some((target, *ino))
            })
            .collect();
        // the replaced target, if any, loses its name first
        self.unlink(new);
        for (target, ino) in moved {
            let source = match target.strip_prefix(new) {
                Ok(rest) if !rest.as_os_str().is_empty() => old.join(rest),
                _ => old.to_path_buf(),
            };
            self.unlink(&source);
            self.remember(ino, target);
        }
    }

    fn drop_name(&mut self, ino: u64, path: &Path) {
        let Some(node) = self.nodes.get_mut(&ino) else {
            return;
        };
        node.names.retain(|name| name != path);
        if node.names.is_empty() && node.lookups == 0 && ino != FUSE_ROOT_ID {
            self.nodes.remove(&ino);
        }
    }

    fn remove(&mut self, ino: u64) {
        if let Some(node) = self.nodes.remove(&ino) {
            for name in node.names {
                if self.by_path.get(&name) == Some(&ino) {
                    self.by_path.remove(&name);
                }
            }
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
