pub mod cache;
pub mod core;
pub mod filesystem;
pub mod handle;
pub mod inode;
pub mod operations;

pub use cache::{CacheConfig, MetaCache};
pub use self::core::{FsCore, SetAttrRequest};
pub use filesystem::RemoteFsFilesystem;
pub use inode::InodeTable;
pub use operations::MountOptions;

use crate::remote::RemoteDirent;

/// Inode number of the mount root.
pub const ROOT_INO: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// File attributes as the kernel-facing protocol sees them. Size and mode
/// are authoritative from the server; uid/gid come from the mounting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub kind: FileKind,
    pub size: u64,
    pub mode: u16,
    pub mtime_s: i64,
    pub atime_s: i64,
    pub ctime_s: i64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Attr {
    pub fn from_dirent(ino: u64, dirent: &RemoteDirent, uid: u32, gid: u32) -> Self {
        let kind = if dirent.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };
        Self {
            ino,
            kind,
            size: dirent.size(),
            mode: dirent.mode(),
            mtime_s: dirent.mtime,
            atime_s: dirent.mtime,
            ctime_s: dirent.mtime,
            nlink: dirent.nlink(),
            uid,
            gid,
        }
    }

    /// Synthetic attributes for the mount root.
    pub fn root(uid: u32, gid: u32) -> Self {
        Self {
            ino: ROOT_INO,
            kind: FileKind::Directory,
            size: 0,
            mode: 0o755,
            mtime_s: 0,
            atime_s: 0,
            ctime_s: 0,
            nlink: 2,
            uid,
            gid,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn blocks(&self) -> u64 {
        (self.size + 511) / 512
    }
}

/// One directory entry handed back through `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
    pub ino: u64,
}
