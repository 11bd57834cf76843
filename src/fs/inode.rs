//! Inode number management
//!
//! FUSE addresses everything by inode number while the lower layer is
//! addressed by path, so the table maps virtual inode numbers to logical
//! (plaintext) paths and back. Entries carry the kernel's lookup count and
//! disappear once it is forgotten.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

#[derive(Debug, Clone)]
struct InodeEntry {
    path: PathBuf,
    lookups: u64,
}

/// Bidirectional map between inode numbers and logical paths
pub struct InodeTable {
    next_ino: AtomicU64,
    inodes: RwLock<HashMap<u64, InodeEntry>>,
    path_to_ino: RwLock<HashMap<PathBuf, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            inodes: RwLock::new(HashMap::new()),
            path_to_ino: RwLock::new(HashMap::new()),
        };

        let root = PathBuf::from("/");
        table.inodes.write().insert(
            ROOT_INO,
            InodeEntry {
                path: root.clone(),
                lookups: 1,
            },
        );
        table.path_to_ino.write().insert(root, ROOT_INO);

        table
    }

    /// Logical path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.read().get(&ino).map(|e| e.path.clone())
    }

    /// Inode currently assigned to a path, without counting a lookup
    pub fn ino(&self, path: &Path) -> Option<u64> {
        self.path_to_ino.read().get(path).copied()
    }

    /// Resolve a path for the kernel, assigning an inode if needed.
    ///
    /// Every call counts as one lookup to be balanced by `forget`.
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut inodes = self.inodes.write();
        let mut path_to_ino = self.path_to_ino.write();

        if let Some(&ino) = path_to_ino.get(path) {
            if let Some(entry) = inodes.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        inodes.insert(
            ino,
            InodeEntry {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        path_to_ino.insert(path.to_path_buf(), ino);
        ino
    }

    /// Drop `nlookup` references; the inode goes away at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }

        let mut inodes = self.inodes.write();
        let Some(entry) = inodes.get_mut(&ino) else {
            return;
        };

        entry.lookups = entry.lookups.saturating_sub(nlookup);
        if entry.lookups == 0 {
            let path = entry.path.clone();
            inodes.remove(&ino);

            let mut path_to_ino = self.path_to_ino.write();
            if path_to_ino.get(&path) == Some(&ino) {
                path_to_ino.remove(&path);
            }
        }
    }

    /// Detach a path after unlink or rmdir.
    ///
    /// The inode number stays valid until forgotten but no longer resolves
    /// by path.
    pub fn unlink(&self, path: &Path) {
        self.path_to_ino.write().remove(path);
    }

    /// Move a path and everything below it
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut inodes = self.inodes.write();
        let mut path_to_ino = self.path_to_ino.write();

        // A replaced target loses its path
        path_to_ino.remove(to);

        let moved: Vec<(PathBuf, u64)> = path_to_ino
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();

        for (old_path, ino) in moved {
            path_to_ino.remove(&old_path);

            let new_path = match old_path.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };

            if let Some(entry) = inodes.get_mut(&ino) {
                entry.path = new_path.clone();
            }
            path_to_ino.insert(new_path, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.inodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.read().is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::from("/")));
        assert_eq!(table.ino(Path::new("/")), Some(ROOT_INO));

        table.forget(ROOT_INO, 100);
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::from("/")));
    }

    #[test]
    fn test_lookup_is_stable() {
        let table = InodeTable::new();

        let first = table.lookup(Path::new("/docs"));
        let second = table.lookup(Path::new("/docs"));
        let other = table.lookup(Path::new("/music"));

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(table.path(first), Some(PathBuf::from("/docs")));
    }

    #[test]
    fn test_forget_balances_lookups() {
        let table = InodeTable::new();
        let ino = table.lookup(Path::new("/a"));
        table.lookup(Path::new("/a"));

        table.forget(ino, 1);
        assert!(table.path(ino).is_some());

        table.forget(ino, 1);
        assert!(table.path(ino).is_none());
        assert!(table.ino(Path::new("/a")).is_none());
    }

    #[test]
    fn test_rename_moves_subtree() {
        let table = InodeTable::new();
        let dir = table.lookup(Path::new("/old"));
        let file = table.lookup(Path::new("/old/inner/file.txt"));
        let sibling = table.lookup(Path::new("/older"));

        table.rename(Path::new("/old"), Path::new("/new"));

        assert_eq!(table.path(dir), Some(PathBuf::from("/new")));
        assert_eq!(table.path(file), Some(PathBuf::from("/new/inner/file.txt")));
        assert_eq!(table.path(sibling), Some(PathBuf::from("/older")));
        assert_eq!(table.ino(Path::new("/new/inner/file.txt")), Some(file));
        assert!(table.ino(Path::new("/old")).is_none());
    }

    #[test]
    fn test_rename_over_existing() {
        let table = InodeTable::new();
        let source = table.lookup(Path::new("/a"));
        let target = table.lookup(Path::new("/b"));

        table.rename(Path::new("/a"), Path::new("/b"));

        assert_eq!(table.ino(Path::new("/b")), Some(source));
        // The replaced inode keeps its number until forgotten
        assert!(table.path(target).is_some());
        table.forget(target, 1);
        assert_eq!(table.ino(Path::new("/b")), Some(source));
    }

    #[test]
    fn test_unlink_keeps_inode_until_forget() {
        let table = InodeTable::new();
        let ino = table.lookup(Path::new("/gone"));

        table.unlink(Path::new("/gone"));
        assert!(table.ino(Path::new("/gone")).is_none());
        assert!(table.path(ino).is_some());

        let fresh = table.lookup(Path::new("/gone"));
        assert_ne!(fresh, ino);

        table.forget(ino, 1);
        assert_eq!(table.ino(Path::new("/gone")), Some(fresh));
    }
}
