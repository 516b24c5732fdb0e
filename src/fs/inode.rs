//! Virtual inode management
//!
//! The kernel addresses files by inode number; the mirrored tree is
//! addressed by path. This table owns the mapping. Attributes are never
//! cached: every query re-stats the underlying file so metadata passthrough
//! stays verbatim.

use fuser::{FileAttr, FileType, FUSE_ROOT_ID};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};

/// Maps virtual inode numbers to mirrored paths and back
pub struct InodeTable {
    /// Next virtual inode number
    next_ino: AtomicU64,
    /// Virtual ino -> kernel-visible path
    paths: RwLock<HashMap<u64, PathBuf>>,
    /// Kernel-visible path -> virtual ino
    inos: RwLock<HashMap<PathBuf, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(FUSE_ROOT_ID + 1),
            paths: RwLock::new(HashMap::new()),
            inos: RwLock::new(HashMap::new()),
        };

        table.paths.write().insert(FUSE_ROOT_ID, PathBuf::from("/"));
        table.inos.write().insert(PathBuf::from("/"), FUSE_ROOT_ID);

        table
    }

    /// Allocate a new virtual inode number
    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }

    /// Get the path bound to an inode
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.paths.read().get(&ino).cloned()
    }

    /// Get the inode bound to a path
    pub fn ino_of(&self, path: &Path) -> Option<u64> {
        self.inos.read().get(path).copied()
    }

    /// Look up the inode for a path, assigning a fresh one on first sight
    pub fn assign(&self, path: &Path) -> u64 {
        if let Some(ino) = self.ino_of(path) {
            return ino;
        }
        let ino = self.alloc_ino();
        self.paths.write().insert(ino, path.to_path_buf());
        self.inos.write().insert(path.to_path_buf(), ino);
        ino
    }

    /// Rebind a path, and everything under it, after a rename
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut paths = self.paths.write();
        let mut inos = self.inos.write();

        let moved: Vec<(u64, PathBuf)> = paths
            .iter()
            .filter_map(|(&ino, p)| {
                p.strip_prefix(from).ok().map(|rest| {
                    let rebased = if rest.as_os_str().is_empty() {
                        to.to_path_buf()
                    } else {
                        to.join(rest)
                    };
                    (ino, rebased)
                })
            })
            .collect();

        for (ino, rebased) in moved {
            if let Some(old) = paths.insert(ino, rebased.clone()) {
                inos.remove(&old);
            }
            inos.insert(rebased, ino);
        }
    }

    /// Drop the binding for a removed path
    pub fn remove(&self, path: &Path) {
        if let Some(ino) = self.inos.write().remove(path) {
            self.paths.write().remove(&ino);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Build fuser attributes from lstat output, verbatim except for the
/// virtual inode number. Size is the on-disk (ciphertext) size.
#[cfg(unix)]
pub fn attr_from_metadata(ino: u64, meta: &Metadata) -> FileAttr {
    use std::os::unix::fs::MetadataExt;

    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime: UNIX_EPOCH + Duration::from_secs(meta.ctime() as u64),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind: kind_of(&meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// Translate a filesystem type into the fuser directory-entry type
pub fn kind_of(ft: &std::fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt;

    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.ino_of(Path::new("/")), Some(FUSE_ROOT_ID));
        assert_eq!(table.path_of(FUSE_ROOT_ID), Some(PathBuf::from("/")));
    }

    #[test]
    fn test_assign_is_stable() {
        let table = InodeTable::new();
        let a = table.assign(Path::new("/a.txt"));
        let b = table.assign(Path::new("/b.txt"));

        assert_ne!(a, b);
        assert_eq!(table.assign(Path::new("/a.txt")), a);
        assert_eq!(table.path_of(a), Some(PathBuf::from("/a.txt")));
    }

    #[test]
    fn test_rename_rebinds_path() {
        let table = InodeTable::new();
        let ino = table.assign(Path::new("/a.txt"));

        table.rename(Path::new("/a.txt"), Path::new("/b.txt"));

        assert_eq!(table.ino_of(Path::new("/a.txt")), None);
        assert_eq!(table.ino_of(Path::new("/b.txt")), Some(ino));
        assert_eq!(table.path_of(ino), Some(PathBuf::from("/b.txt")));
    }

    #[test]
    fn test_rename_carries_directory_children() {
        let table = InodeTable::new();
        let dir = table.assign(Path::new("/dir"));
        let child = table.assign(Path::new("/dir/file.txt"));
        let sibling = table.assign(Path::new("/dirx"));

        table.rename(Path::new("/dir"), Path::new("/moved"));

        assert_eq!(table.path_of(dir), Some(PathBuf::from("/moved")));
        assert_eq!(table.path_of(child), Some(PathBuf::from("/moved/file.txt")));
        // A sibling sharing the name prefix is untouched
        assert_eq!(table.path_of(sibling), Some(PathBuf::from("/dirx")));
    }

    #[test]
    fn test_remove_drops_binding() {
        let table = InodeTable::new();
        let ino = table.assign(Path::new("/a.txt"));

        table.remove(Path::new("/a.txt"));

        assert_eq!(table.ino_of(Path::new("/a.txt")), None);
        assert_eq!(table.path_of(ino), None);
    }
}
