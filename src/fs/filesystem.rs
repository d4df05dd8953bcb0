use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tracing::debug;

use crate::error::Error;
use crate::fs::core::{FsCore, SetAttrRequest};
use crate::fs::handle::OpenFlags;
use crate::fs::{Attr, FileKind};

/// The FUSE shim: translates `fuser` upcalls into [`FsCore`] operations and
/// errors into errno values. All real work happens on the tokio runtime; the
/// fuser session thread only bridges in and out of it.
pub struct RemoteFsFilesystem {
    core: Arc<FsCore>,
    rt: tokio::runtime::Handle,
    ttl: Duration,
}

impl RemoteFsFilesystem {
    pub fn new(core: Arc<FsCore>, rt: tokio::runtime::Handle) -> Self {
        let ttl = core.attr_ttl();
        Self { core, rt, ttl }
    }

    pub fn core(&self) -> &Arc<FsCore> {
        &self.core
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
    }
}

fn file_attr(attr: &Attr) -> FileAttr {
    let at = epoch_time(attr.atime_s);
    let mt = epoch_time(attr.mtime_s);
    let ct = epoch_time(attr.ctime_s);
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks(),
        atime: at,
        mtime: mt,
        ctime: ct,
        crtime: mt,
        kind: file_type(attr.kind),
        perm: attr.mode,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn epoch_time(secs: i64) -> SystemTime {
    if secs <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    }
}

fn time_to_epoch(t: TimeOrNow) -> i64 {
    let st = match t {
        TimeOrNow::SpecificTime(st) => st,
        TimeOrNow::Now => SystemTime::now(),
    };
    st.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn name_str(name: &OsStr) -> Result<&str, Error> {
    name.to_str()
        .ok_or_else(|| Error::InvalidArgument(format!("non-UTF-8 name: {:?}", name)))
}

impl Filesystem for RemoteFsFilesystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent: {}, name: {:?})", parent, name);
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e.errno()),
        };
        match self.rt.block_on(self.core.lookup(parent, name)) {
            Ok((attr, generation)) => reply.entry(&self.ttl, &file_attr(&attr), generation),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr(ino: {})", ino);
        match self.rt.block_on(self.core.getattr(ino)) {
            Ok(attr) => reply.attr(&self.ttl, &file_attr(&attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino: {}, mode: {:?}, size: {:?})", ino, mode, size);
        let request = SetAttrRequest {
            mode,
            size,
            atime_s: atime.map(time_to_epoch),
            mtime_s: mtime.map(time_to_epoch),
            uid,
            gid,
        };
        match self.rt.block_on(self.core.setattr(ino, request)) {
            Ok(attr) => reply.attr(&self.ttl, &file_attr(&attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino: {}, offset: {})", ino, offset);
        let entries = match self.rt.block_on(self.core.readdir(ino)) {
            Ok(entries) => entries,
            Err(e) => return reply.error(e.errno()),
        };
        for (i, entry) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(entry.ino, (i + 1) as i64, file_type(entry.kind), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino: {}, flags: {:#o})", ino, flags);
        match self
            .rt
            .block_on(self.core.open(ino, OpenFlags::from_raw(flags)))
        {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent: {}, name: {:?}, mode: {:#o})", parent, name, mode);
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e.errno()),
        };
        let mode = mode & !umask;
        match self.rt.block_on(self.core.create(
            parent,
            name,
            mode,
            OpenFlags::from_raw(flags),
        )) {
            Ok((attr, generation, fh)) => {
                reply.created(&self.ttl, &file_attr(&attr), generation, fh, 0)
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(fh: {}, offset: {}, size: {})", fh, offset, size);
        match self
            .rt
            .block_on(self.core.read(fh, offset.max(0) as u64, size))
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(fh: {}, offset: {}, len: {})", fh, offset, data.len());
        let data = Bytes::copy_from_slice(data);
        match self
            .rt
            .block_on(self.core.write(fh, offset.max(0) as u64, data))
        {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(fh: {})", fh);
        match self.rt.block_on(self.core.flush(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(fh: {}, datasync: {})", fh, datasync);
        match self.rt.block_on(self.core.fsync(fh, datasync)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(fh: {})", fh);
        match self.rt.block_on(self.core.release(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent: {}, name: {:?})", parent, name);
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e.errno()),
        };
        match self.rt.block_on(self.core.mkdir(parent, name, mode & !umask)) {
            Ok((attr, generation)) => reply.entry(&self.ttl, &file_attr(&attr), generation),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent: {}, name: {:?})", parent, name);
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e.errno()),
        };
        match self.rt.block_on(self.core.unlink(parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent: {}, name: {:?})", parent, name);
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e.errno()),
        };
        match self.rt.block_on(self.core.rmdir(parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent: {}, name: {:?} -> newparent: {}, newname: {:?})",
            parent, name, newparent, newname
        );
        let (name, newname) = match (name_str(name), name_str(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => return reply.error(e.errno()),
        };
        match self
            .rt
            .block_on(self.core.rename(parent, name, newparent, newname))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        debug!("statfs");
        match self.rt.block_on(self.core.statfs()) {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.bfree,
                stats.bavail,
                stats.files,
                stats.ffree,
                stats.bsize as u32,
                255,
                stats.bsize as u32,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }
}
