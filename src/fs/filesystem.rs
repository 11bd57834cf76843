//! FUSE filesystem implementation
//!
//! Routes each kernel request to the lower layer, which encodes paths and
//! ciphers content. Errors only reach the kernel as an errno.

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use super::handle::{HandleTable, OpenFile};
use super::inode::{InodeTable, ROOT_INO};
use super::lower::{file_attr, LowerLayer};
use crate::error::{Error, Result};
use crate::path::LOGICAL_NAME_MAX;
use crate::session::{CipherContexts, Session};

const TTL: Duration = Duration::from_secs(1);

/// The encrypted overlay filesystem
pub struct PkCryptFs {
    lower: LowerLayer,
    contexts: Arc<CipherContexts>,
    inodes: InodeTable,
    handles: HandleTable,
}

impl PkCryptFs {
    pub fn new(session: Session) -> Self {
        let session = Arc::new(session);
        let contexts = Arc::new(CipherContexts::new(&session));

        Self {
            lower: LowerLayer::new(Arc::clone(&session), Arc::clone(&contexts)),
            contexts,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
        }
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf> {
        self.inodes
            .path(ino)
            .ok_or_else(|| Error::Io(std::io::Error::from_raw_os_error(libc::ENOENT)))
    }

    /// Logical path of `name` inside directory `parent`.
    ///
    /// Logical names are always encoded, so none of them can reach the
    /// internal state folder.
    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        Ok(self.path_of(parent)?.join(name))
    }

    fn attr(&self, ino: u64, path: &Path) -> Result<FileAttr> {
        let meta = self.lower.metadata(path)?;
        Ok(file_attr(ino, &meta))
    }

    /// Attributes of a newly resolved path, counting one kernel lookup
    fn entry(&self, path: &Path) -> Result<FileAttr> {
        let meta = self.lower.metadata(path)?;
        let ino = self.inodes.lookup(path);
        Ok(file_attr(ino, &meta))
    }

    fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let path = self.child_path(parent, name)?;
        self.entry(&path)
    }

    #[allow(clippy::too_many_arguments)]
    fn do_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr> {
        let path = self.path_of(ino)?;

        if let Some(mode) = mode {
            self.lower.chmod(&path, mode)?;
        }

        if uid.is_some() || gid.is_some() {
            self.lower.chown(&path, uid, gid)?;
        }

        if let Some(size) = size {
            match fh.and_then(|fh| self.handles.get(fh)) {
                Some(handle) => self.lower.truncate_file(&handle.file, size)?,
                None => self.lower.truncate(&path, size)?,
            }
        }

        if atime.is_some() || mtime.is_some() {
            self.lower
                .set_times(&path, atime.map(resolve_time), mtime.map(resolve_time))?;
        }

        self.attr(ino, &path)
    }

    fn do_readdir(&self, ino: u64) -> Result<Vec<(u64, fuser::FileType, OsString)>> {
        let path = self.path_of(ino)?;
        let parent_ino = path
            .parent()
            .and_then(|parent| self.inodes.ino(parent))
            .unwrap_or(ROOT_INO);

        let mut entries = vec![
            (ino, fuser::FileType::Directory, OsString::from(".")),
            (parent_ino, fuser::FileType::Directory, OsString::from("..")),
        ];

        for entry in self.lower.readdir(&path)? {
            let child_path = path.join(&entry.name);
            let child_ino = self.inodes.ino(&child_path).unwrap_or(entry.ino);
            entries.push((child_ino, entry.kind, entry.name));
        }

        Ok(entries)
    }

    fn do_rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> Result<()> {
        let from = self.child_path(parent, name)?;
        let to = self.child_path(newparent, newname)?;

        if flags & !libc::RENAME_NOREPLACE != 0 {
            return Err(Error::InvalidArgument(format!(
                "unsupported rename flags {:#x}",
                flags
            )));
        }
        if flags & libc::RENAME_NOREPLACE != 0 && self.lower.metadata(&to).is_ok() {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EEXIST)));
        }

        self.lower.rename(&from, &to)?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    /// Open handle for `fh`, or `EBADF` when it is unknown or lacks the access mode
    fn handle_for(&self, fh: u64, usable: impl Fn(&OpenFile) -> bool) -> Result<Arc<OpenFile>> {
        match self.handles.get(fh) {
            Some(handle) if usable(handle.as_ref()) => Ok(handle),
            _ => Err(Error::Io(std::io::Error::from_raw_os_error(libc::EBADF))),
        }
    }

    fn do_read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let handle = self.handle_for(fh, OpenFile::is_readable)?;
        let offset = u64::try_from(offset)
            .map_err(|_| Error::InvalidArgument(format!("negative offset {}", offset)))?;
        self.lower.read(&handle, offset, size)
    }

    fn do_write(&self, fh: u64, offset: i64, data: &[u8]) -> Result<usize> {
        let handle = self.handle_for(fh, OpenFile::is_writable)?;
        let offset = u64::try_from(offset)
            .map_err(|_| Error::InvalidArgument(format!("negative offset {}", offset)))?;
        self.lower.write(&handle, offset, data)
    }

    fn do_create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(FileAttr, u64)> {
        let path = self.child_path(parent, name)?;
        let file = self.lower.create(&path, flags, mode & !umask)?;
        let attr = self.entry(&path)?;
        let fh = self.handles.open(OpenFile::new(attr.ino, flags, file));
        Ok((attr, fh))
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn reply_entry(result: Result<FileAttr>, reply: ReplyEntry) {
    match result {
        Ok(attr) => reply.entry(&TTL, &attr, 0),
        Err(e) => reply.error(e.to_errno()),
    }
}

fn reply_empty(result: Result<()>, reply: ReplyEmpty) {
    match result {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.to_errno()),
    }
}

impl Filesystem for PkCryptFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        info!(
            "Mounted {} for {}",
            self.lower.session().root().display(),
            self.lower.session().user()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("Unmounting, releasing {} cipher contexts", self.contexts.len());
        self.contexts.clear();
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        reply_entry(self.do_lookup(parent, name), reply);
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        debug!("forget(ino={}, nlookup={})", ino, nlookup);
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.path_of(ino).and_then(|path| self.attr(ino, &path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );

        match self.do_setattr(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => {
                error!("setattr on inode {} failed: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match self.path_of(ino).and_then(|path| self.lower.readlink(&path)) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let result = self.child_path(parent, name).and_then(|path| {
            self.lower.mknod(&path, mode & !umask, rdev)?;
            self.entry(&path)
        });
        reply_entry(result, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let result = self.child_path(parent, name).and_then(|path| {
            self.lower.mkdir(&path, mode & !umask)?;
            self.entry(&path)
        });
        reply_entry(result, reply);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let result = self.child_path(parent, name).and_then(|path| {
            self.lower.unlink(&path)?;
            self.inodes.unlink(&path);
            Ok(())
        });
        reply_empty(result, reply);
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let result = self.child_path(parent, name).and_then(|path| {
            self.lower.rmdir(&path)?;
            self.inodes.unlink(&path);
            Ok(())
        });
        reply_empty(result, reply);
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        let result = self.child_path(parent, link_name).and_then(|path| {
            self.lower.symlink(target, &path)?;
            self.entry(&path)
        });
        reply_entry(result, reply);
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        reply_empty(self.do_rename(parent, name, newparent, newname, flags), reply);
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        let result = self.path_of(ino).and_then(|existing| {
            let path = self.child_path(newparent, newname)?;
            self.lower.link(&existing, &path)?;
            self.entry(&path)
        });
        reply_entry(result, reply);
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);

        let result = self.path_of(ino).and_then(|path| self.lower.open(&path, flags));
        match result {
            Ok(file) => {
                let fh = self.handles.open(OpenFile::new(ino, flags, file));
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        match self.do_read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read of inode {} failed: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        match self.do_write(fh, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                error!("write to inode {} failed: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);

        if self.handles.get(fh).is_some() {
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.handles.close(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let result = if datasync {
            handle.file.sync_data()
        } else {
            handle.file.sync_all()
        };
        reply_empty(result.map_err(Error::WriteFailure), reply);
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);

        match self.path_of(ino).and_then(|path| self.lower.metadata(&path)) {
            Ok(meta) if meta.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            let buffer_full = reply.add(*child_ino, (i + 1) as i64, *kind, name);
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={})", ino);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.lower.statfs() {
            Ok(stat) => {
                let fragment_size = stat.fragment_size() as u32;
                reply.statfs(
                    u64::from(stat.blocks()),
                    u64::from(stat.blocks_free()),
                    u64::from(stat.blocks_available()),
                    u64::from(stat.files()),
                    u64::from(stat.files_free()),
                    stat.block_size() as u32,
                    LOGICAL_NAME_MAX as u32,
                    fragment_size,
                );
            }
            Err(e) => {
                error!("statfs failed: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        let result = self
            .path_of(ino)
            .and_then(|path| self.lower.access(&path, mask));
        reply_empty(result, reply);
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);

        match self.do_create(parent, name, mode, umask, flags) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
