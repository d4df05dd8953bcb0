use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::fs::ROOT_INO;
use crate::path::RelPath;

struct Tables {
    ino_by_path: HashMap<RelPath, u64>,
    path_by_ino: HashMap<u64, RelPath>,
    generation_by_ino: HashMap<u64, u64>,
    next_ino: u64,
    next_generation: u64,
}

/// Bidirectional path ⇄ ino mapping for one mount.
///
/// Ino 1 is reserved for the root `.`. Allocation is strictly monotonic and
/// freed inos are never reused; a path that is unlinked and recreated gets a
/// fresh ino with a higher generation. Both directions live behind one lock
/// so rename re-keys atomically.
pub struct InodeTable {
    inner: RwLock<Tables>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut ino_by_path = HashMap::new();
        let mut path_by_ino = HashMap::new();
        let mut generation_by_ino = HashMap::new();
        ino_by_path.insert(RelPath::root(), ROOT_INO);
        path_by_ino.insert(ROOT_INO, RelPath::root());
        generation_by_ino.insert(ROOT_INO, 0);
        Self {
            inner: RwLock::new(Tables {
                ino_by_path,
                path_by_ino,
                generation_by_ino,
                next_ino: ROOT_INO + 1,
                next_generation: 1,
            }),
        }
    }

    pub fn ino_of(&self, path: &RelPath) -> Option<u64> {
        self.inner.read().ino_by_path.get(path).copied()
    }

    pub fn path_of(&self, ino: u64) -> Option<RelPath> {
        self.inner.read().path_by_ino.get(&ino).cloned()
    }

    pub fn generation_of(&self, ino: u64) -> u64 {
        self.inner
            .read()
            .generation_by_ino
            .get(&ino)
            .copied()
            .unwrap_or(0)
    }

    /// Resolve a path to its ino, allocating a fresh one on first sight.
    pub fn ino_of_or_alloc(&self, path: &RelPath) -> u64 {
        let mut inner = self.inner.write();
        if let Some(&ino) = inner.ino_by_path.get(path) {
            return ino;
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.ino_by_path.insert(path.clone(), ino);
        inner.path_by_ino.insert(ino, path.clone());
        inner.generation_by_ino.insert(ino, generation);
        debug!("allocated ino {} for {}", ino, path);
        ino
    }

    /// Drop a path's binding after unlink. The ino becomes a tombstone;
    /// re-lookup of the same path allocates a new ino.
    pub fn forget(&self, path: &RelPath) {
        if path.is_root() {
            return;
        }
        let mut inner = self.inner.write();
        if let Some(ino) = inner.ino_by_path.remove(path) {
            inner.path_by_ino.remove(&ino);
            inner.generation_by_ino.remove(&ino);
        }
    }

    /// Re-key `old` (and everything underneath it) onto `new` in a single
    /// critical section. Inos travel with their paths. Live bindings at the
    /// destination are dropped, matching server-side overwrite semantics.
    ///
    /// A no-op when nothing under `old` is tracked, so a replayed rename
    /// event (or one synthesized from an unlink+add pair) leaves an already
    /// re-keyed table untouched.
    pub fn rename(&self, old: &RelPath, new: &RelPath) {
        if old == new {
            return;
        }
        let mut inner = self.inner.write();

        let moved: Vec<(RelPath, u64)> = inner
            .ino_by_path
            .iter()
            .filter(|(p, _)| p.starts_with(old))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        if moved.is_empty() {
            return;
        }

        let displaced: Vec<(RelPath, u64)> = inner
            .ino_by_path
            .iter()
            .filter(|(p, _)| p.starts_with(new))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (path, ino) in displaced {
            inner.ino_by_path.remove(&path);
            inner.path_by_ino.remove(&ino);
            inner.generation_by_ino.remove(&ino);
        }

        for (path, ino) in moved {
            inner.ino_by_path.remove(&path);
            if let Some(rebased) = path.rebase(old, new) {
                inner.ino_by_path.insert(rebased.clone(), ino);
                inner.path_by_ino.insert(ino, rebased);
            } else {
                inner.path_by_ino.remove(&ino);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().path_by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
