//! Encrypting file handles
//!
//! The core of cryptmirror. Every open file gets a handle presenting a
//! decrypted, byte-addressable view over the on-disk ciphertext blob: reads
//! decrypt the whole blob and slice out the requested range; every mutation
//! re-encrypts the whole plaintext and rewrites the blob from the start.
//! Per-operation cost is proportional to file size; that is the whole-file
//! design, not an accident.

use crate::crypto::ContentCipher;
use crate::error::{Error, Result};
use crate::fs::mirror::MirrorRoot;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, Metadata, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-open-file state over an encrypted blob.
///
/// Created on open, mutated by read/write/truncate, dropped on release.
/// Handles on the same path are independent of each other; [`PathLocks`]
/// serializes their whole-file rewrite spans.
pub struct EncryptedFileHandle {
    /// Kernel-visible path; doubles as the lock key
    path: PathBuf,
    /// Location of the blob under the mirrored root
    real_path: PathBuf,
    /// Open flags; append is cleared once the handle is rewired for rewrite
    flags: i32,
    /// Descriptor onto the ciphertext blob
    file: File,
    cipher: Arc<ContentCipher>,
}

impl EncryptedFileHandle {
    /// Open (creating if flagged) the blob behind `path`.
    ///
    /// Write-capable handles also request read access on the blob: every
    /// mutation reads the current ciphertext back before rewriting, and the
    /// kernel has already enforced the client's requested access mode.
    pub fn open(
        mirror: &MirrorRoot,
        path: &Path,
        flags: i32,
        mode: Option<u32>,
        cipher: Arc<ContentCipher>,
    ) -> Result<Self> {
        let real_path = mirror.resolve(path);
        let file = open_blob(&real_path, flags, mode)?;

        Ok(Self {
            path: path.to_path_buf(),
            real_path,
            flags,
            file,
            cipher,
        })
    }

    /// Kernel-visible path this handle is open on
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let accmode = self.flags & libc::O_ACCMODE;
        accmode == libc::O_WRONLY || accmode == libc::O_RDWR
    }

    /// Check if opened for append
    pub fn is_append(&self) -> bool {
        (self.flags & libc::O_APPEND) != 0
    }

    /// Decrypt the current blob in full. A zero-length blob is a freshly
    /// created file and reads as empty plaintext.
    fn read_plaintext(&mut self) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut blob = Vec::new();
        self.file.read_to_end(&mut blob)?;
        self.file.seek(SeekFrom::Start(0))?;

        if blob.is_empty() {
            return Ok(Vec::new());
        }
        self.cipher.open(&blob)
    }

    /// Read `size` plaintext bytes starting at `offset`; `size == 0` means
    /// the rest of the file. Slicing past the end yields the remaining
    /// bytes, possibly none; never an error.
    pub fn read(&mut self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let plaintext = self.read_plaintext()?;

        let start = (offset as usize).min(plaintext.len());
        let end = if size == 0 {
            plaintext.len()
        } else {
            (start + size as usize).min(plaintext.len())
        };

        Ok(plaintext[start..end].to_vec())
    }

    /// Re-open the descriptor read-write with append stripped. Append cannot
    /// be honored on the raw blob: the logical content has to be read back
    /// and the whole blob rewritten from the start.
    fn reopen_for_rewrite(&mut self) -> Result<()> {
        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.real_path)?;
        self.flags = (self.flags & !(libc::O_APPEND | libc::O_ACCMODE)) | libc::O_RDWR;
        Ok(())
    }

    /// Accept `buf` at `offset` and durably rewrite the blob.
    ///
    /// A write at nonzero offset produces `old_plaintext ++ buf`; a write at
    /// offset zero starts over from empty. Concatenation, not a positional
    /// splice; kept byte-compatible with the behavior this filesystem has
    /// always had (see DESIGN.md).
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        if self.is_append() {
            self.reopen_for_rewrite()?;
        }

        let mut plaintext = if offset != 0 {
            self.read_plaintext()?
        } else {
            Vec::new()
        };
        plaintext.extend_from_slice(buf);

        self.rewrite_blob(&plaintext)?;
        Ok(buf.len())
    }

    /// Set the logical (plaintext) length, zero-filling on growth.
    pub fn truncate(&mut self, length: u64) -> Result<()> {
        let mut plaintext = self.read_plaintext()?;
        plaintext.resize(length as usize, 0);
        self.rewrite_blob(&plaintext)
    }

    fn rewrite_blob(&mut self, plaintext: &[u8]) -> Result<()> {
        let blob = self.cipher.seal(plaintext)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&blob)?;
        // A shorter blob must not leave stale ciphertext behind it
        self.file.set_len(blob.len() as u64)?;
        Ok(())
    }

    /// Flush buffered data for write-capable handles, then dup-and-close the
    /// descriptor so buffered kernel state is delivered, as passthrough
    /// filesystems conventionally do on close.
    pub fn flush(&mut self) -> Result<()> {
        if self.is_writable() || self.is_append() {
            self.file.flush()?;
        }
        let duped = nix::unistd::dup(self.file.as_raw_fd())?;
        nix::unistd::close(duped)?;
        Ok(())
    }

    /// Flush, then sync file data (and metadata unless `datasync`)
    pub fn fsync(&mut self, datasync: bool) -> Result<()> {
        self.flush()?;
        if datasync {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// fstat the underlying blob descriptor
    pub fn fgetattr(&self) -> Result<Metadata> {
        Ok(self.file.metadata()?)
    }
}

/// Map open(2) flags onto OpenOptions for the blob descriptor
fn open_blob(real_path: &Path, flags: i32, mode: Option<u32>) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let accmode = flags & libc::O_ACCMODE;
    let writable = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;
    let append = (flags & libc::O_APPEND) != 0;
    let truncate = (flags & libc::O_TRUNC) != 0;
    let creating = (flags & libc::O_CREAT) != 0;

    let mut options = OpenOptions::new();
    // Read access is always requested: even write-only handles read the
    // blob back before re-encrypting. Creation implies write access on the
    // blob, whatever access mode the client asked for.
    options.read(true);
    if append && !truncate {
        options.append(true);
    } else if writable || creating {
        options.write(true);
        if truncate {
            options.truncate(true);
        }
    }
    if creating {
        options.create(true);
    }
    if (flags & libc::O_EXCL) != 0 {
        options.create_new(true);
    }
    if let Some(mode) = mode {
        options.mode(mode);
    }

    Ok(options.open(real_path)?)
}

/// Allocates handle ids and owns the open handles
pub struct HandleManager {
    /// Next handle ID
    next_fh: AtomicU64,
    /// Open handles
    handles: RwLock<HashMap<u64, Arc<Mutex<EncryptedFileHandle>>>>,
}

impl HandleManager {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handle and return its ID
    pub fn insert(&self, handle: EncryptedFileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, Arc::new(Mutex::new(handle)));
        fh
    }

    /// Get a handle by ID
    pub fn get(&self, fh: u64) -> Result<Arc<Mutex<EncryptedFileHandle>>> {
        self.handles
            .read()
            .get(&fh)
            .cloned()
            .ok_or(Error::InvalidHandle(fh))
    }

    /// Close a handle; the descriptor drops with the last reference
    pub fn remove(&self, fh: u64) -> Result<()> {
        self.handles
            .write()
            .remove(&fh)
            .map(|_| ())
            .ok_or(Error::InvalidHandle(fh))
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-path mutual exclusion for whole-file rewrite spans.
///
/// Two handles on one path are otherwise unaware of each other; without
/// this scope, interleaved read-decrypt/encrypt-write sequences could
/// silently drop one writer's update.
pub struct PathLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Get the lock guarding `path`, creating it on first use
    pub fn lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for PathLocks {
    fn default() -> Self {
        Self::new()
    }
}
