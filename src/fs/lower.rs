//! Lower layer access through encoded paths
//!
//! Every logical path is encoded before it touches the underlying
//! filesystem, and every name read back from it is decoded. File content
//! goes through the block engine.

use crate::block;
use crate::error::{Error, Result};
use crate::fs::handle::OpenFile;
use crate::layout::STATE_DIR;
use crate::path::{decode_component, decode_path, encode_path};
use crate::session::{CipherContexts, Session};
use nix::sys::stat::{Mode, SFlag};
use nix::sys::statvfs::Statvfs;
use nix::unistd::AccessFlags;
use std::ffi::OsString;
use std::fs::{self, DirBuilder, File, FileTimes, Metadata, OpenOptions, Permissions};
use std::os::unix::fs::{
    DirBuilderExt, DirEntryExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::warn;

/// Flags handled here instead of being passed to the underlying open
const MANAGED_FLAGS: i32 =
    libc::O_ACCMODE | libc::O_APPEND | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC;

/// Directory entry with its decoded name
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: fuser::FileType,
    /// Inode number on the underlying filesystem
    pub ino: u64,
}

/// Pass-through interface to the encrypted root
pub struct LowerLayer {
    session: Arc<Session>,
    contexts: Arc<CipherContexts>,
}

impl LowerLayer {
    pub fn new(session: Arc<Session>, contexts: Arc<CipherContexts>) -> Self {
        Self { session, contexts }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Resolve a logical path to its on-disk location
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        self.contexts
            .with_context(|ctx| encode_path(&self.session, ctx, path, true))?
    }

    /// Metadata of the entry itself, not of a symlink target
    pub fn metadata(&self, path: &Path) -> Result<Metadata> {
        Ok(fs::symlink_metadata(self.resolve(path)?)?)
    }

    /// List a directory, skipping entries whose names do not decode
    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let resolved = self.resolve(path)?;
        let at_root = path == Path::new("/");
        let mut entries = Vec::new();

        for entry in fs::read_dir(&resolved)? {
            let entry = entry?;
            let raw = entry.file_name();

            if at_root && raw == STATE_DIR {
                continue;
            }

            let name = match self
                .contexts
                .with_context(|ctx| decode_component(ctx, &raw))?
            {
                Ok(name) => name,
                Err(e) => {
                    warn!("Skipping undecodable entry {:?} in {:?}: {}", raw, path, e);
                    continue;
                }
            };

            entries.push(DirEntry {
                name,
                kind: file_kind(entry.file_type()?),
                ino: entry.ino(),
            });
        }

        Ok(entries)
    }

    /// Read and decode a symlink target
    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let target = fs::read_link(self.resolve(path)?)?;
        self.contexts.with_context(|ctx| decode_path(ctx, &target))?
    }

    /// Create a symlink whose stored target is encoded too
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let encoded_target = self
            .contexts
            .with_context(|ctx| encode_path(&self.session, ctx, target, false))??;
        std::os::unix::fs::symlink(encoded_target, self.resolve(link)?)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        DirBuilder::new().mode(mode).create(self.resolve(path)?)?;
        Ok(())
    }

    pub fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> Result<()> {
        nix::sys::stat::mknod(
            &self.resolve(path)?,
            SFlag::from_bits_truncate(mode & libc::S_IFMT),
            Mode::from_bits_truncate(mode & 0o7777),
            libc::dev_t::from(rdev),
        )
        .map_err(std::io::Error::from)?;
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(self.resolve(path)?)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(self.resolve(path)?)?;
        Ok(())
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)?;
        Ok(())
    }

    pub fn link(&self, existing: &Path, new: &Path) -> Result<()> {
        fs::hard_link(self.resolve(existing)?, self.resolve(new)?)?;
        Ok(())
    }

    /// Open an existing file.
    ///
    /// Partial block writes read the block back first, so the file is
    /// always opened readable. Appends are positioned by `write`.
    pub fn open(&self, path: &Path, flags: i32) -> Result<File> {
        Ok(open_options(flags).open(self.resolve(path)?)?)
    }

    /// Create and open a regular file
    pub fn create(&self, path: &Path, flags: i32, mode: u32) -> Result<File> {
        let mut options = open_options(flags | libc::O_RDWR);
        options.mode(mode);
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
        Ok(options.open(self.resolve(path)?)?)
    }

    /// Read logical bytes through the block engine
    pub fn read(&self, handle: &OpenFile, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut buf = block::alloc_buffer(size as usize)?;
        let n = self.contexts.with_context(|ctx| {
            block::read(&self.session, ctx, &handle.file, offset, &mut buf)
        })??;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write logical bytes through the block engine
    pub fn write(&self, handle: &OpenFile, offset: u64, data: &[u8]) -> Result<usize> {
        let offset = if handle.is_append() {
            handle.file.metadata()?.len()
        } else {
            offset
        };

        self.contexts
            .with_context(|ctx| block::write(&self.session, ctx, &handle.file, offset, data))?
    }

    /// Change the logical size of an open file
    pub fn truncate_file(&self, file: &File, size: u64) -> Result<()> {
        self.contexts
            .with_context(|ctx| block::resize(&self.session, ctx, file, size))?
    }

    pub fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.resolve(path)?)?;
        self.truncate_file(&file, size)
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(self.resolve(path)?, Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        std::os::unix::fs::lchown(self.resolve(path)?, uid, gid)?;
        Ok(())
    }

    pub fn set_times(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let mut times = FileTimes::new();
        if let Some(atime) = atime {
            times = times.set_accessed(atime);
        }
        if let Some(mtime) = mtime {
            times = times.set_modified(mtime);
        }

        File::open(self.resolve(path)?)?.set_times(times)?;
        Ok(())
    }

    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        nix::unistd::access(&self.resolve(path)?, AccessFlags::from_bits_truncate(mask))
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Statistics of the filesystem holding the root
    pub fn statfs(&self) -> Result<Statvfs> {
        nix::sys::statvfs::statvfs(self.session.root())
            .map_err(|e| Error::Io(std::io::Error::from(e)))
    }
}

fn open_options(flags: i32) -> OpenOptions {
    let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;

    let mut options = OpenOptions::new();
    options
        .read(true)
        .write(writable)
        .truncate(writable && flags & libc::O_TRUNC != 0)
        .custom_flags(flags & !MANAGED_FLAGS);
    options
}

/// Map an on-disk file type to the FUSE file type
pub fn file_kind(file_type: fs::FileType) -> fuser::FileType {
    if file_type.is_dir() {
        fuser::FileType::Directory
    } else if file_type.is_symlink() {
        fuser::FileType::Symlink
    } else if file_type.is_block_device() {
        fuser::FileType::BlockDevice
    } else if file_type.is_char_device() {
        fuser::FileType::CharDevice
    } else if file_type.is_fifo() {
        fuser::FileType::NamedPipe
    } else if file_type.is_socket() {
        fuser::FileType::Socket
    } else {
        fuser::FileType::RegularFile
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

/// Attributes reported for a virtual inode.
///
/// Block ciphering preserves length, so the on-disk size is the logical size.
pub fn file_attr(ino: u64, meta: &Metadata) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
        kind: file_kind(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}
