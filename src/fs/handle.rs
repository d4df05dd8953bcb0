use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::path::RelPath;

/// Access mode bits the adapter cares about, decoded from the kernel's
/// raw open flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn from_raw(flags: i32) -> Self {
        let accmode = flags & libc::O_ACCMODE;
        Self {
            read: accmode == libc::O_RDONLY || accmode == libc::O_RDWR,
            write: accmode == libc::O_WRONLY || accmode == libc::O_RDWR,
            append: flags & libc::O_APPEND != 0,
            truncate: flags & libc::O_TRUNC != 0,
        }
    }
}

/// A half-open streamed PUT. Chunks pushed into `tx` flow straight into the
/// request body; dropping the sender ends the body and lets the request
/// complete. `task` resolves to the server-confirmed written byte count, or
/// to the error of a stream that died mid-flight. A failure stays queued in
/// the task until the next write, flush, fsync, or release finalizes the
/// stream and reports it.
pub struct UploadStream {
    pub tx: mpsc::Sender<std::io::Result<Bytes>>,
    pub task: JoinHandle<Result<u64>>,
    pub start_offset: u64,
    pub pushed: u64,
}

/// Per-handle state. One handle is owned by exactly one kernel file handle;
/// all operations on it are serialized by the table's per-handle mutex.
pub struct OpenHandle {
    pub ino: u64,
    pub path: RelPath,
    pub flags: OpenFlags,
    pub write_cursor: u64,
    pub dirty: bool,
    pub upload: Option<UploadStream>,
}

impl OpenHandle {
    pub fn new(ino: u64, path: RelPath, flags: OpenFlags) -> Self {
        Self {
            ino,
            path,
            flags,
            write_cursor: 0,
            dirty: false,
            upload: None,
        }
    }
}

/// Handles keyed by a monotonic 64-bit `fh`. Operations on one handle are
/// serialized by its mutex; different handles proceed in parallel.
pub struct OpenFileTable {
    handles: RwLock<HashMap<u64, Arc<Mutex<OpenHandle>>>>,
    next_fh: AtomicU64,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles
            .write()
            .insert(fh, Arc::new(Mutex::new(handle)));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<Mutex<OpenHandle>>> {
        self.handles.read().get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<Mutex<OpenHandle>>> {
        self.handles.write().remove(&fh)
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}
