use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::fs::Attr;
use crate::path::RelPath;
use crate::remote::{RemoteDirent, VolumeStats};

/// TTL policy for cached metadata. A zero duration disables that cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub attr_ttl: Duration,
    pub dir_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            attr_ttl: Duration::from_secs(2),
            dir_ttl: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<T> {
    data: T,
    deadline: Instant,
}

impl<T> Entry<T> {
    fn new(data: T, ttl: Duration) -> Self {
        Self {
            data,
            deadline: Instant::now() + ttl,
        }
    }

    fn is_fresh(&self) -> bool {
        Instant::now() < self.deadline
    }
}

/// Hit/miss accounting, mostly for the status command and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Keyed store of attributes and directory listings with per-entry TTL.
///
/// Never surfaces errors to callers: an expired or missing entry is simply a
/// miss, and the next upcall repopulates from the server.
pub struct MetaCache {
    attrs: RwLock<HashMap<RelPath, Entry<Attr>>>,
    dirs: RwLock<HashMap<RelPath, Entry<Vec<RemoteDirent>>>>,
    volume: RwLock<Option<Entry<VolumeStats>>>,
    stats: RwLock<CacheStats>,
    config: CacheConfig,
}

impl MetaCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            attrs: RwLock::new(HashMap::new()),
            dirs: RwLock::new(HashMap::new()),
            volume: RwLock::new(None),
            stats: RwLock::new(CacheStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get_attr(&self, path: &RelPath) -> Option<Attr> {
        let hit = self
            .attrs
            .read()
            .get(path)
            .filter(|e| e.is_fresh())
            .map(|e| e.data);
        self.record(hit.is_some());
        hit
    }

    pub fn put_attr(&self, path: &RelPath, attr: Attr) {
        if self.config.attr_ttl.is_zero() {
            return;
        }
        self.attrs
            .write()
            .insert(path.clone(), Entry::new(attr, self.config.attr_ttl));
    }

    pub fn invalidate_attr(&self, path: &RelPath) {
        if self.attrs.write().remove(path).is_some() {
            self.stats.write().invalidations += 1;
        }
    }

    pub fn get_dir(&self, path: &RelPath) -> Option<Vec<RemoteDirent>> {
        let hit = self
            .dirs
            .read()
            .get(path)
            .filter(|e| e.is_fresh())
            .map(|e| e.data.clone());
        self.record(hit.is_some());
        hit
    }

    pub fn put_dir(&self, path: &RelPath, entries: Vec<RemoteDirent>) {
        if self.config.dir_ttl.is_zero() {
            return;
        }
        self.dirs
            .write()
            .insert(path.clone(), Entry::new(entries, self.config.dir_ttl));
    }

    pub fn invalidate_dir(&self, path: &RelPath) {
        if self.dirs.write().remove(path).is_some() {
            self.stats.write().invalidations += 1;
        }
    }

    /// Drop every attr and dirent entry at or under `path`.
    pub fn invalidate_subtree(&self, path: &RelPath) {
        let mut removed = 0u64;
        {
            let mut attrs = self.attrs.write();
            let before = attrs.len();
            attrs.retain(|p, _| !p.starts_with(path));
            removed += (before - attrs.len()) as u64;
        }
        {
            let mut dirs = self.dirs.write();
            let before = dirs.len();
            dirs.retain(|p, _| !p.starts_with(path));
            removed += (before - dirs.len()) as u64;
        }
        if removed > 0 {
            self.stats.write().invalidations += removed;
        }
    }

    pub fn get_volume(&self) -> Option<VolumeStats> {
        self.volume
            .read()
            .as_ref()
            .filter(|e| e.is_fresh())
            .map(|e| e.data.clone())
    }

    pub fn put_volume(&self, stats: VolumeStats) {
        if self.config.attr_ttl.is_zero() {
            return;
        }
        *self.volume.write() = Some(Entry::new(stats, self.config.attr_ttl));
    }

    pub fn clear(&self) {
        self.attrs.write().clear();
        self.dirs.write().clear();
        *self.volume.write() = None;
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.read()
    }

    fn record(&self, hit: bool) {
        let mut stats = self.stats.write();
        if hit {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
    }
}

impl Default for MetaCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
