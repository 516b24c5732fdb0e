//! Encrypting mirror FUSE filesystem
//!
//! Wires the inode table, passthrough primitives, encrypting handles and the
//! content cipher into the kernel callback set. Structural operations
//! forward to the mirrored tree; content operations run through
//! [`EncryptedFileHandle`] under the per-path lock.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
    FUSE_ROOT_ID,
};
use libc::ENOENT;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

use super::handle::{EncryptedFileHandle, HandleManager, PathLocks};
use super::inode::{attr_from_metadata, kind_of, InodeTable};
use super::mirror::MirrorRoot;
use crate::crypto::ContentCipher;
use crate::error::Result;

const TTL: Duration = Duration::from_secs(1);

/// Encrypting mirror filesystem
pub struct MirrorCryptFs {
    /// Passthrough interface to the mirrored tree
    mirror: MirrorRoot,
    /// Content cipher shared by all handles
    cipher: Arc<ContentCipher>,
    /// Virtual inode management
    inodes: InodeTable,
    /// Open file handles
    handles: HandleManager,
    /// Per-path locks over whole-file rewrite spans
    locks: PathLocks,
}

impl MirrorCryptFs {
    /// Create a new filesystem over `root`
    pub fn new(root: PathBuf, cipher: Arc<ContentCipher>) -> Result<Self> {
        Ok(Self {
            mirror: MirrorRoot::new(root)?,
            cipher,
            inodes: InodeTable::new(),
            handles: HandleManager::new(),
            locks: PathLocks::new(),
        })
    }

    /// Path of `name` inside the directory bound to `parent`
    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        Some(self.inodes.path_of(parent)?.join(name))
    }

    /// lstat a path, register its inode and build the reply attributes
    fn stat_entry(&self, path: &Path) -> Result<FileAttr> {
        let meta = self.mirror.metadata(path)?;
        let ino = self.inodes.assign(path);
        Ok(attr_from_metadata(ino, &meta))
    }
}

impl Filesystem for MirrorCryptFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.stat_entry(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        let path = match self.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.stat_entry(&path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
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
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?}, fh={:?})",
            ino, mode, uid, gid, size, fh
        );

        let path = match self.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let result = (|| -> Result<()> {
            if let Some(mode) = mode {
                self.mirror.chmod(&path, mode)?;
            }

            if uid.is_some() || gid.is_some() {
                self.mirror.chown(&path, uid, gid)?;
            }

            if let Some(size) = size {
                // Truncation rewrites the whole blob; hold the path lock
                let lock = self.locks.lock(&path);
                let _guard = lock.lock();

                match fh {
                    Some(fh) => self.handles.get(fh)?.lock().truncate(size)?,
                    None => {
                        let mut handle = EncryptedFileHandle::open(
                            &self.mirror,
                            &path,
                            libc::O_RDWR,
                            None,
                            Arc::clone(&self.cipher),
                        )?;
                        handle.truncate(size)?;
                    }
                }
            }

            if atime.is_some() || mtime.is_some() {
                let meta = self.mirror.metadata(&path)?;
                let resolve = |t: Option<TimeOrNow>, current: SystemTime| match t {
                    Some(TimeOrNow::SpecificTime(t)) => t,
                    Some(TimeOrNow::Now) => SystemTime::now(),
                    None => current,
                };
                let atime = resolve(atime, meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH));
                let mtime = resolve(mtime, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));
                self.mirror.utimens(&path, atime, mtime)?;
            }

            Ok(())
        })();

        match result.and_then(|_| self.stat_entry(&path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => {
                error!("setattr failed on {:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        let path = match self.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.mirror.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self
            .mirror
            .mknod(&path, mode, rdev as u64)
            .and_then(|_| self.stat_entry(&path))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => {
                error!("mknod failed on {:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self
            .mirror
            .mkdir(&path, mode)
            .and_then(|_| self.stat_entry(&path))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.mirror.unlink(&path) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.mirror.rmdir(&path) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!(
            "symlink(parent={}, link_name={:?}, target={:?})",
            parent, link_name, target
        );

        let path = match self.child_path(parent, link_name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self
            .mirror
            .symlink(target, &path)
            .and_then(|_| self.stat_entry(&path))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        let (from, to) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Some(from), Some(to)) => (from, to),
            _ => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.mirror.rename(&from, &to) {
            Ok(()) => {
                // The destination's old binding, if any, is gone now
                self.inodes.remove(&to);
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => {
                error!("rename {:?} -> {:?} failed: {}", from, to, e);
                reply.error(e.errno());
            }
        }
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

        let (original, link) = match (self.inodes.path_of(ino), self.child_path(newparent, newname))
        {
            (Some(original), Some(link)) => (original, link),
            _ => {
                reply.error(ENOENT);
                return;
            }
        };

        match self
            .mirror
            .link(&original, &link)
            .and_then(|_| self.stat_entry(&link))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);

        let path = match self.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match EncryptedFileHandle::open(&self.mirror, &path, flags, None, Arc::clone(&self.cipher))
        {
            Ok(handle) => {
                let fh = self.handles.insert(handle);
                reply.opened(fh, 0);
            }
            Err(e) => {
                error!("open failed on {:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!(
            "create(parent={}, name={:?}, mode={:o}, flags={:#o})",
            parent, name, mode, flags
        );

        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let result = EncryptedFileHandle::open(
            &self.mirror,
            &path,
            flags | libc::O_CREAT,
            Some(mode & 0o7777),
            Arc::clone(&self.cipher),
        )
        .and_then(|handle| {
            let attr = self.stat_entry(&path)?;
            Ok((self.handles.insert(handle), attr))
        });

        match result {
            Ok((fh, attr)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => {
                error!("create failed on {:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
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

        let path = match self.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let result = (|| -> Result<Vec<u8>> {
            let lock = self.locks.lock(&path);
            let _guard = lock.lock();
            let handle = self.handles.get(fh)?;
            let mut handle = handle.lock();
            handle.read(offset.max(0) as u64, size)
        })();

        match result {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read failed on {:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        debug!(
            "write(ino={}, fh={}, offset={}, len={})",
            ino,
            fh,
            offset,
            data.len()
        );

        let path = match self.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let result = (|| -> Result<usize> {
            let lock = self.locks.lock(&path);
            let _guard = lock.lock();
            let handle = self.handles.get(fh)?;
            let mut handle = handle.lock();
            handle.write(offset.max(0) as u64, data)
        })();

        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                error!("write failed on {:?}: {}", path, e);
                reply.error(e.errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);

        let result = self
            .handles
            .get(fh)
            .and_then(|handle| handle.lock().flush());

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
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

        match self.handles.remove(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        let result = self
            .handles
            .get(fh)
            .and_then(|handle| handle.lock().fsync(datasync));

        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("fsync failed: {}", e);
                reply.error(e.errno());
            }
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

        let path = match self.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let listing = match self.mirror.readdir(&path) {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let parent_ino = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.inodes.assign(parent),
            _ => FUSE_ROOT_ID,
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];

        for entry in listing {
            let child_ino = self.inodes.assign(&path.join(&entry.name));
            entries.push((
                child_ino,
                kind_of(&entry.file_type),
                entry.name.to_string_lossy().to_string(),
            ));
        }

        for (i, (child_ino, file_type, name)) in entries.iter().enumerate().skip(offset as usize) {
            let buffer_full = reply.add(*child_ino, (i + 1) as i64, *file_type, name);
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        let path = match self.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.mirror.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        debug!("statfs()");

        match self.mirror.statfs(Path::new("/")) {
            Ok(stats) => reply.statfs(
                stats.blocks() as u64,
                stats.blocks_free() as u64,
                stats.blocks_available() as u64,
                stats.files() as u64,
                stats.files_free() as u64,
                stats.block_size() as u32,
                stats.name_max() as u32,
                stats.fragment_size() as u32,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptionConfig;
    use std::fs;
    use tempfile::tempdir;

    fn test_fs(root: &Path) -> MirrorCryptFs {
        let params = EncryptionConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        };
        let cipher = Arc::new(ContentCipher::new(b"secret", params).unwrap());
        MirrorCryptFs::new(root.to_path_buf(), cipher).unwrap()
    }

    #[test]
    fn test_child_path_joins_parent() {
        let dir = tempdir().unwrap();
        let fs = test_fs(dir.path());

        assert_eq!(
            fs.child_path(FUSE_ROOT_ID, OsStr::new("a.txt")),
            Some(PathBuf::from("/a.txt"))
        );
        assert_eq!(fs.child_path(999, OsStr::new("a.txt")), None);
    }

    #[test]
    fn test_stat_entry_reports_underlying_metadata() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"blob bytes").unwrap();

        let fsys = test_fs(dir.path());
        let attr = fsys.stat_entry(Path::new("/a.txt")).unwrap();

        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 10);
        assert_eq!(
            fsys.inodes.path_of(attr.ino),
            Some(PathBuf::from("/a.txt"))
        );
    }

    #[test]
    fn test_stat_entry_missing_path_is_enoent() {
        let dir = tempdir().unwrap();
        let fsys = test_fs(dir.path());

        let err = fsys.stat_entry(Path::new("/missing")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
