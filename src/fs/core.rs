use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fs::cache::{CacheConfig, MetaCache};
use crate::fs::handle::{OpenFileTable, OpenFlags, OpenHandle, UploadStream};
use crate::fs::inode::InodeTable;
use crate::fs::{Attr, DirEntry, FileKind, ROOT_INO};
use crate::path::RelPath;
use crate::remote::{FsChangeEvent, RemoteClient, RemoteDirent, VolumeStats};

/// Attribute changes requested by the kernel's `setattr`. uid/gid are
/// accepted and ignored; ownership always reflects the mounting user.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub atime_s: Option<i64>,
    pub mtime_s: Option<i64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// The kernel-facing protocol, independent of any particular FUSE shim.
///
/// Every operation takes kernel-style identifiers (ino, fh) and returns
/// typed results; errno translation happens in the shim. All state lives in
/// the four owned components: inode table, metadata cache, open-file table,
/// and the stateless remote client.
pub struct FsCore {
    client: Arc<RemoteClient>,
    cache: MetaCache,
    inodes: InodeTable,
    handles: OpenFileTable,
    uid: u32,
    gid: u32,
}

impl FsCore {
    pub fn new(client: RemoteClient, cache_config: CacheConfig) -> Self {
        Self {
            client: Arc::new(client),
            cache: MetaCache::new(cache_config),
            inodes: InodeTable::new(),
            handles: OpenFileTable::new(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    pub fn cache(&self) -> &MetaCache {
        &self.cache
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn attr_ttl(&self) -> std::time::Duration {
        self.cache.config().attr_ttl
    }

    fn path_of(&self, ino: u64) -> Result<RelPath> {
        self.inodes
            .path_of(ino)
            .ok_or_else(|| Error::NotFound(format!("unknown inode {}", ino)))
    }

    fn child_path(&self, parent: u64, name: &str) -> Result<RelPath> {
        self.path_of(parent)?.join(name)
    }

    /// Attributes for a path: cache, then the remote metadata endpoint.
    async fn fetch_attr(&self, path: &RelPath) -> Result<Attr> {
        if path.is_root() {
            return Ok(Attr::root(self.uid, self.gid));
        }
        if let Some(attr) = self.cache.get_attr(path) {
            return Ok(attr);
        }
        let dirent = self.client.stats(path).await?;
        let ino = self.inodes.ino_of_or_alloc(path);
        let attr = Attr::from_dirent(ino, &dirent, self.uid, self.gid);
        self.cache.put_attr(path, attr);
        Ok(attr)
    }

    /// Listing for a directory: cache, then `/list`. A fresh listing also
    /// pre-populates the attr cache for every child.
    async fn dir_entries(&self, path: &RelPath) -> Result<Vec<RemoteDirent>> {
        if let Some(entries) = self.cache.get_dir(path) {
            return Ok(entries);
        }
        let entries = self.client.list(path).await?;
        for dirent in &entries {
            if let Ok(child) = path.join(&dirent.name) {
                let ino = self.inodes.ino_of_or_alloc(&child);
                self.cache
                    .put_attr(&child, Attr::from_dirent(ino, dirent, self.uid, self.gid));
            }
        }
        self.cache.put_dir(path, entries.clone());
        Ok(entries)
    }

    fn invalidate_after_write(&self, path: &RelPath) {
        self.cache.invalidate_attr(path);
        if let Some(parent) = path.parent() {
            self.cache.invalidate_dir(&parent);
        }
    }

    pub async fn lookup(&self, parent: u64, name: &str) -> Result<(Attr, u64)> {
        let path = self.child_path(parent, name)?;
        if let Some(attr) = self.cache.get_attr(&path) {
            return Ok((attr, self.inodes.generation_of(attr.ino)));
        }

        let parent_path = self.path_of(parent)?;
        let entries = self.dir_entries(&parent_path).await?;
        let dirent = entries
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        let ino = self.inodes.ino_of_or_alloc(&path);
        let attr = Attr::from_dirent(ino, dirent, self.uid, self.gid);
        self.cache.put_attr(&path, attr);
        Ok((attr, self.inodes.generation_of(ino)))
    }

    pub async fn getattr(&self, ino: u64) -> Result<Attr> {
        let path = self.path_of(ino)?;
        self.fetch_attr(&path).await
    }

    /// Complete listing with `.` and `..` prepended; the shim paginates.
    pub async fn readdir(&self, ino: u64) -> Result<Vec<DirEntry>> {
        let path = self.path_of(ino)?;
        let attr = self.fetch_attr(&path).await?;
        if !attr.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }

        let parent_ino = path
            .parent()
            .and_then(|p| self.inodes.ino_of(&p))
            .unwrap_or(ROOT_INO);
        let mut out = vec![
            DirEntry {
                name: ".".to_string(),
                kind: FileKind::Directory,
                ino,
            },
            DirEntry {
                name: "..".to_string(),
                kind: FileKind::Directory,
                ino: parent_ino,
            },
        ];

        for dirent in self.dir_entries(&path).await? {
            let Ok(child) = path.join(&dirent.name) else {
                warn!("skipping unrepresentable entry {:?} in {}", dirent.name, path);
                continue;
            };
            out.push(DirEntry {
                name: dirent.name.clone(),
                kind: if dirent.is_dir() {
                    FileKind::Directory
                } else {
                    FileKind::File
                },
                ino: self.inodes.ino_of_or_alloc(&child),
            });
        }
        Ok(out)
    }

    /// Validate existence and allocate a handle. No remote open exists.
    pub async fn open(&self, ino: u64, flags: OpenFlags) -> Result<u64> {
        let path = self.path_of(ino)?;
        let attr = self.fetch_attr(&path).await?;
        if attr.is_dir() {
            return Err(Error::IsADirectory(path.to_string()));
        }
        if flags.write && flags.truncate && attr.size > 0 {
            self.client.truncate(&path, 0).await?;
            self.invalidate_after_write(&path);
        }
        Ok(self.handles.insert(OpenHandle::new(ino, path, flags)))
    }

    /// Zero-length write to materialize the file, then ino + handle.
    pub async fn create(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<(Attr, u64, u64)> {
        let parent_path = self.path_of(parent)?;
        let path = parent_path.join(name)?;

        self.client.write_bytes(&path, 0, Bytes::new()).await?;

        let ino = self.inodes.ino_of_or_alloc(&path);
        let now = now_epoch();
        let attr = Attr {
            ino,
            kind: FileKind::File,
            size: 0,
            mode: (mode & 0o777) as u16,
            mtime_s: now,
            atime_s: now,
            ctime_s: now,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
        };
        self.cache.put_attr(&path, attr);
        self.cache.invalidate_dir(&parent_path);

        let fh = self.handles.insert(OpenHandle::new(ino, path, flags));
        Ok((attr, self.inodes.generation_of(ino), fh))
    }

    /// Stateless range read. Returns at most `size` bytes; empty means EOF.
    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Bytes> {
        let handle = self
            .handles
            .get(fh)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown file handle {}", fh)))?;
        let guard = handle.lock().await;
        let path = guard.path.clone();

        if size == 0 {
            return Ok(Bytes::new());
        }

        let attr = self.fetch_attr(&path).await?;
        if offset >= attr.size {
            return Ok(Bytes::new());
        }
        let end = (offset + size as u64).min(attr.size) - 1;

        let mut stream = self.client.read_range(&path, offset, end).await?;
        let mut buf = BytesMut::with_capacity((end - offset + 1) as usize);
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Sequential writes feed the open upload stream; a non-sequential
    /// offset finalizes the stream and opens a new one at that offset.
    pub async fn write(&self, fh: u64, offset: u64, data: Bytes) -> Result<u32> {
        let handle = self
            .handles
            .get(fh)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown file handle {}", fh)))?;
        let mut guard = handle.lock().await;
        if !guard.flags.write {
            return Err(Error::PermissionDenied(format!(
                "handle {} not open for writing",
                fh
            )));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let len = data.len() as u32;

        let sequential = guard.upload.is_some() && offset == guard.write_cursor;
        if !sequential {
            if guard.upload.is_some() {
                self.finalize_stream(&mut guard).await?;
            }
            self.begin_stream(&mut guard, offset);
        }
        self.push_chunk(&mut guard, data).await?;
        Ok(len)
    }

    pub async fn flush(&self, fh: u64) -> Result<()> {
        let handle = self
            .handles
            .get(fh)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown file handle {}", fh)))?;
        let mut guard = handle.lock().await;
        if guard.upload.is_some() {
            self.finalize_stream(&mut guard).await?;
            guard.dirty = false;
        }
        Ok(())
    }

    /// The wire contract has no durability endpoint; completion of the
    /// upload stream is as synced as the data gets.
    pub async fn fsync(&self, fh: u64, _datasync: bool) -> Result<()> {
        self.flush(fh).await
    }

    pub async fn release(&self, fh: u64) -> Result<()> {
        let Some(handle) = self.handles.remove(fh) else {
            return Ok(());
        };
        let mut guard = handle.lock().await;
        if guard.upload.is_some() {
            self.finalize_stream(&mut guard).await?;
        }
        Ok(())
    }

    pub async fn mkdir(&self, parent: u64, name: &str, mode: u32) -> Result<(Attr, u64)> {
        let parent_path = self.path_of(parent)?;
        let path = parent_path.join(name)?;

        self.client.mkdir(&path).await?;

        let ino = self.inodes.ino_of_or_alloc(&path);
        let now = now_epoch();
        let attr = Attr {
            ino,
            kind: FileKind::Directory,
            size: 0,
            mode: (mode & 0o777) as u16,
            mtime_s: now,
            atime_s: now,
            ctime_s: now,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
        };
        self.cache.put_attr(&path, attr);
        self.cache.invalidate_dir(&parent_path);
        Ok((attr, self.inodes.generation_of(ino)))
    }

    pub async fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        let parent_path = self.path_of(parent)?;
        let path = parent_path.join(name)?;

        self.client.delete(&path).await?;

        self.inodes.forget(&path);
        self.cache.invalidate_attr(&path);
        self.cache.invalidate_dir(&parent_path);
        Ok(())
    }

    /// The remote delete is recursive, so the empty check has to happen
    /// here before anything irreversible goes out.
    pub async fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        let parent_path = self.path_of(parent)?;
        let path = parent_path.join(name)?;

        let entries = self.dir_entries(&path).await?;
        if !entries.is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        self.client.delete(&path).await?;

        self.inodes.forget(&path);
        self.cache.invalidate_subtree(&path);
        self.cache.invalidate_dir(&parent_path);
        Ok(())
    }

    pub async fn rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<()> {
        let old_parent_path = self.path_of(parent)?;
        let new_parent_path = self.path_of(new_parent)?;
        let old = old_parent_path.join(name)?;
        let new = new_parent_path.join(new_name)?;

        self.client.rename(&old, &new).await?;

        self.cache.invalidate_subtree(&new);
        self.inodes.rename(&old, &new);
        self.cache.invalidate_subtree(&old);
        self.cache.invalidate_dir(&old_parent_path);
        self.cache.invalidate_dir(&new_parent_path);
        Ok(())
    }

    /// chmod, truncate, utimes in that order; uid/gid changes are ignored.
    /// Returns attributes refreshed from the server.
    pub async fn setattr(&self, ino: u64, req: SetAttrRequest) -> Result<Attr> {
        let path = self.path_of(ino)?;

        if let Some(mode) = req.mode {
            self.client.chmod(&path, mode).await?;
        }
        if let Some(size) = req.size {
            self.client.truncate(&path, size).await?;
        }
        if req.atime_s.is_some() || req.mtime_s.is_some() {
            self.client.utimes(&path, req.atime_s, req.mtime_s).await?;
        }

        self.invalidate_after_write(&path);
        self.fetch_attr(&path).await
    }

    /// Volume summary, cached for the attribute TTL. A degraded server
    /// yields the static fallback rather than failing `df`.
    pub async fn statfs(&self) -> Result<VolumeStats> {
        if let Some(stats) = self.cache.get_volume() {
            return Ok(stats);
        }
        match self.client.statfs().await {
            Ok(stats) => {
                self.cache.put_volume(stats.clone());
                Ok(stats)
            }
            Err(e) => {
                warn!("statfs failed, serving fallback summary: {}", e);
                Ok(VolumeStats::fallback())
            }
        }
    }

    fn begin_stream(&self, handle: &mut OpenHandle, offset: u64) {
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
        let client = Arc::clone(&self.client);
        let path = handle.path.clone();
        let task = tokio::spawn(async move {
            client.write_at(&path, offset, ReceiverStream::new(rx)).await
        });
        handle.upload = Some(UploadStream {
            tx,
            task,
            start_offset: offset,
            pushed: 0,
        });
        handle.write_cursor = offset;
        debug!("opened upload stream for {} at offset {}", handle.path, offset);
    }

    async fn push_chunk(&self, handle: &mut OpenHandle, data: Bytes) -> Result<()> {
        let len = data.len() as u64;
        let upload = handle.upload.as_mut().expect("push without active stream");
        if upload.tx.send(Ok(data)).await.is_err() {
            // The request task ended under us; harvest its real error.
            return match self.finalize_stream(handle).await {
                Err(e) => Err(e),
                Ok(_) => Err(Error::Transport("upload stream closed early".to_string())),
            };
        }
        upload.pushed += len;
        handle.write_cursor += len;
        handle.dirty = true;
        Ok(())
    }

    /// Close the body, wait for the server's reply, and invalidate the
    /// written path either way so the next read re-fetches.
    async fn finalize_stream(&self, handle: &mut OpenHandle) -> Result<u64> {
        let Some(upload) = handle.upload.take() else {
            return Ok(0);
        };
        drop(upload.tx);
        let result = upload
            .task
            .await
            .map_err(|e| Error::Transport(format!("upload task failed: {}", e)))?;
        self.invalidate_after_write(&handle.path);
        debug!(
            "finalized upload stream for {} (start {}, pushed {})",
            handle.path, upload.start_offset, upload.pushed
        );
        result
    }

    /// Fan-in point for the push channel. Handlers are idempotent: replayed
    /// or synthesized events (unlink+add standing in for a rename) converge
    /// to the same state.
    pub fn apply_change(&self, event: FsChangeEvent) {
        match event.op.as_str() {
            "add" | "write" | "change" => self.change_upsert(&event),
            "addDir" => {
                if let Some(path) = event_path(event.rel_path.as_deref()) {
                    if let Some(parent) = path.parent() {
                        self.cache.invalidate_dir(&parent);
                    }
                }
            }
            "unlink" | "unlinkDir" => {
                if let Some(path) = event_path(event.rel_path.as_deref()) {
                    self.cache.invalidate_subtree(&path);
                    if let Some(parent) = path.parent() {
                        self.cache.invalidate_dir(&parent);
                    }
                    self.inodes.forget(&path);
                }
            }
            "rename" | "renameDir" => {
                let old = event_path(event.old_path.as_deref());
                let new = event_path(event.new_path.as_deref());
                if let (Some(old), Some(new)) = (old, new) {
                    self.inodes.rename(&old, &new);
                    self.cache.invalidate_subtree(&old);
                    if let Some(parent) = old.parent() {
                        self.cache.invalidate_dir(&parent);
                    }
                    if let Some(parent) = new.parent() {
                        self.cache.invalidate_dir(&parent);
                    }
                    self.change_upsert_at(&new, &event);
                }
            }
            other => debug!("ignoring unknown fs_change op {:?}", other),
        }
    }

    fn change_upsert(&self, event: &FsChangeEvent) {
        if let Some(path) = event_path(event.rel_path.as_deref()) {
            self.cache.invalidate_attr(&path);
            if let Some(parent) = path.parent() {
                self.cache.invalidate_dir(&parent);
            }
            self.change_upsert_at(&path, event);
        }
    }

    fn change_upsert_at(&self, path: &RelPath, event: &FsChangeEvent) {
        let Some((is_dir, size, mtime, mode)) = event.metadata() else {
            return;
        };
        let ino = self.inodes.ino_of_or_alloc(path);
        let attr = Attr {
            ino,
            kind: if is_dir {
                FileKind::Directory
            } else {
                FileKind::File
            },
            size: if is_dir { 0 } else { size },
            mode,
            mtime_s: mtime,
            atime_s: mtime,
            ctime_s: mtime,
            nlink: if is_dir { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
        };
        self.cache.put_attr(path, attr);
    }
}

fn event_path(raw: Option<&str>) -> Option<RelPath> {
    RelPath::parse(raw?).ok()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> FsCore {
        // The push-channel handlers never touch the network.
        FsCore::new(RemoteClient::new("http://127.0.0.1:1"), CacheConfig::default())
    }

    fn rel(s: &str) -> RelPath {
        RelPath::parse(s).unwrap()
    }

    fn write_event(path: &str, size: u64) -> FsChangeEvent {
        serde_json::from_str(&format!(
            r#"{{"op":"write","relPath":"{}","is_dir":false,"size":{},"mtime":1700000000,"permissions":"644"}}"#,
            path, size
        ))
        .unwrap()
    }

    #[test]
    fn test_change_write_upserts_attr() {
        let core = core();
        core.apply_change(write_event("./f.txt", 99));
        let attr = core.cache().get_attr(&rel("./f.txt")).unwrap();
        assert_eq!(attr.size, 99);
        assert_eq!(core.inodes().ino_of(&rel("./f.txt")), Some(attr.ino));
    }

    #[test]
    fn test_change_unlink_forgets_subtree_caches() {
        let core = core();
        core.apply_change(write_event("./d/f", 1));
        let ino = core.inodes().ino_of(&rel("./d/f")).unwrap();

        let ev: FsChangeEvent =
            serde_json::from_str(r#"{"op":"unlink","relPath":"./d/f"}"#).unwrap();
        core.apply_change(ev);

        assert!(core.cache().get_attr(&rel("./d/f")).is_none());
        assert_eq!(core.inodes().ino_of(&rel("./d/f")), None);
        assert_eq!(core.inodes().path_of(ino), None);
    }

    #[test]
    fn test_change_rename_moves_ino() {
        let core = core();
        core.apply_change(write_event("./a/x", 7));
        let ino = core.inodes().ino_of(&rel("./a/x")).unwrap();

        let ev: FsChangeEvent = serde_json::from_str(
            r#"{"op":"rename","oldPath":"./a/x","newPath":"./b/x","is_dir":false,"size":7,"mtime":2,"permissions":"644"}"#,
        )
        .unwrap();
        core.apply_change(ev);

        assert_eq!(core.inodes().ino_of(&rel("./a/x")), None);
        assert_eq!(core.inodes().ino_of(&rel("./b/x")), Some(ino));
        assert_eq!(core.cache().get_attr(&rel("./b/x")).unwrap().size, 7);
    }

    #[test]
    fn test_change_rename_is_idempotent() {
        let core = core();
        core.apply_change(write_event("./a/x", 7));
        let ino = core.inodes().ino_of(&rel("./a/x")).unwrap();

        let ev: FsChangeEvent = serde_json::from_str(
            r#"{"op":"rename","oldPath":"./a/x","newPath":"./b/x","is_dir":false,"size":7,"mtime":2,"permissions":"644"}"#,
        )
        .unwrap();
        core.apply_change(ev.clone());
        core.apply_change(ev);

        assert_eq!(core.inodes().ino_of(&rel("./b/x")), Some(ino));
    }

    #[test]
    fn test_change_unknown_op_is_ignored() {
        let core = core();
        let ev: FsChangeEvent =
            serde_json::from_str(r#"{"op":"rebalance","relPath":"./x"}"#).unwrap();
        core.apply_change(ev);
        assert_eq!(core.inodes().len(), 1);
    }
}
