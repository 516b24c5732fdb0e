//! Mirrored-tree passthrough layer
//!
//! Resolves kernel-visible paths against the mirrored root and forwards
//! structural and metadata operations to the real filesystem unchanged.
//! Nothing here touches file contents; those go through the encrypting
//! handles.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::stat::{self, Mode, SFlag, UtimensatFlags};
use nix::sys::statvfs::{statvfs, Statvfs};
use nix::sys::time::TimeSpec;
use nix::unistd::{self, AccessFlags, Gid, Uid};
use std::ffi::OsString;
use std::fs::{self, Metadata, Permissions};
use std::os::unix::fs::{symlink, DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Directory entry read from the mirrored tree
#[derive(Debug, Clone)]
pub struct MirrorDirEntry {
    pub name: OsString,
    pub file_type: fs::FileType,
    pub ino: u64,
}

/// Passthrough interface to the mirrored directory tree
pub struct MirrorRoot {
    /// Root path of the mirrored tree
    root: PathBuf,
}

impl MirrorRoot {
    /// Create a new mirror interface rooted at `root`
    pub fn new(root: PathBuf) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::PathNotFound(root.to_string_lossy().to_string()));
        }
        Ok(Self { root })
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a kernel-visible path to its location under the mirrored
    /// root. Pure mapping; `..` escapes are left to the underlying
    /// filesystem's own access control.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.root.join(relative)
    }

    /// lstat a path; symlinks are mirrored as symlinks, never followed here
    pub fn metadata(&self, path: &Path) -> Result<Metadata> {
        Ok(fs::symlink_metadata(self.resolve(path))?)
    }

    /// Check if path exists in the mirrored tree
    pub fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(self.resolve(path)).is_ok()
    }

    /// Read directory entries
    pub fn readdir(&self, path: &Path) -> Result<Vec<MirrorDirEntry>> {
        let resolved = self.resolve(path);
        let mut entries = Vec::new();

        for entry in fs::read_dir(&resolved)? {
            let entry = entry?;
            let file_type = entry.file_type()?;

            #[cfg(unix)]
            let ino = {
                use std::os::unix::fs::DirEntryExt;
                entry.ino()
            };
            #[cfg(not(unix))]
            let ino = 0;

            entries.push(MirrorDirEntry {
                name: entry.file_name(),
                file_type,
                ino,
            });
        }

        Ok(entries)
    }

    /// Read symlink target
    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(self.resolve(path))?)
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(self.resolve(path))?)
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_dir(self.resolve(path))?)
    }

    /// `target` is stored verbatim; dangling or absolute targets are the
    /// client's business, exactly as on the real filesystem.
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        Ok(symlink(target, self.resolve(link))?)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::rename(self.resolve(from), self.resolve(to))?)
    }

    pub fn link(&self, original: &Path, link: &Path) -> Result<()> {
        Ok(fs::hard_link(self.resolve(original), self.resolve(link))?)
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        Ok(fs::set_permissions(
            self.resolve(path),
            Permissions::from_mode(mode),
        )?)
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        unistd::chown(
            &self.resolve(path),
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
        )?;
        Ok(())
    }

    /// Create a filesystem node; `mode` carries both the type and the
    /// permission bits, as in mknod(2).
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        stat::mknod(&self.resolve(path), kind, perm, rdev as libc::dev_t)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        fs::DirBuilder::new()
            .mode(mode)
            .create(self.resolve(path))?;
        Ok(())
    }

    pub fn utimens(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        stat::utimensat(
            None,
            &self.resolve(path),
            &timespec(atime),
            &timespec(mtime),
            UtimensatFlags::FollowSymlink,
        )?;
        Ok(())
    }

    /// Check real-user access; a failed check surfaces as EACCES
    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        let flags = AccessFlags::from_bits_truncate(mask);
        unistd::access(&self.resolve(path), flags).map_err(|_| Error::from(Errno::EACCES))?;
        Ok(())
    }

    /// statvfs of the mirrored root's filesystem, verbatim. Free space is
    /// reported in ciphertext terms, which overstates what plaintext fits.
    pub fn statfs(&self, path: &Path) -> Result<Statvfs> {
        Ok(statvfs(&self.resolve(path))?)
    }
}

fn timespec(t: SystemTime) -> TimeSpec {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    TimeSpec::new(d.as_secs() as i64, d.subsec_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_strips_leading_separator() {
        let dir = tempdir().unwrap();
        let mirror = MirrorRoot::new(dir.path().to_path_buf()).unwrap();

        assert_eq!(
            mirror.resolve(Path::new("/a/b.txt")),
            dir.path().join("a/b.txt")
        );
        assert_eq!(mirror.resolve(Path::new("/")), dir.path());
    }

    #[test]
    fn test_missing_root_rejected() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(MirrorRoot::new(missing).is_err());
    }

    #[test]
    fn test_readdir_lists_underlying_entries() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("file1.txt"), b"1").unwrap();
        fs::write(dir.path().join("file2.txt"), b"2").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let mirror = MirrorRoot::new(dir.path().to_path_buf()).unwrap();
        let mut names: Vec<_> = mirror
            .readdir(Path::new("/"))
            .unwrap()
            .into_iter()
            .map(|e| e.name.to_string_lossy().to_string())
            .collect();
        names.sort();

        assert_eq!(names, ["file1.txt", "file2.txt", "subdir"]);
    }

    #[test]
    fn test_metadata_matches_underlying_file() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"content").unwrap();

        let mirror = MirrorRoot::new(dir.path().to_path_buf()).unwrap();
        mirror.chmod(Path::new("/a.txt"), 0o640).unwrap();

        let seen = mirror.metadata(Path::new("/a.txt")).unwrap();
        let real = fs::symlink_metadata(dir.path().join("a.txt")).unwrap();
        assert_eq!(seen.mode(), real.mode());
        assert_eq!(seen.mode() & 0o7777, 0o640);
        assert_eq!(seen.uid(), real.uid());
        assert_eq!(seen.len(), real.len());
    }

    #[test]
    fn test_rename_moves_entry() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();

        let mirror = MirrorRoot::new(dir.path().to_path_buf()).unwrap();
        mirror
            .rename(Path::new("/a.txt"), Path::new("/b.txt"))
            .unwrap();

        assert!(mirror.metadata(Path::new("/a.txt")).is_err());
        assert!(mirror.metadata(Path::new("/b.txt")).is_ok());
    }

    #[test]
    fn test_access_failure_is_eacces() {
        let dir = tempdir().unwrap();
        let mirror = MirrorRoot::new(dir.path().to_path_buf()).unwrap();

        let err = mirror
            .access(Path::new("/missing"), libc::R_OK)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn test_symlink_round_trip() {
        let dir = tempdir().unwrap();
        let mirror = MirrorRoot::new(dir.path().to_path_buf()).unwrap();

        mirror
            .symlink(Path::new("target.txt"), Path::new("/ln"))
            .unwrap();
        assert_eq!(
            mirror.readlink(Path::new("/ln")).unwrap(),
            PathBuf::from("target.txt")
        );
    }

    #[test]
    fn test_statfs_reports_root_filesystem() {
        let dir = tempdir().unwrap();
        let mirror = MirrorRoot::new(dir.path().to_path_buf()).unwrap();
        let stats = mirror.statfs(Path::new("/")).unwrap();
        assert!(stats.blocks() > 0);
    }
}
