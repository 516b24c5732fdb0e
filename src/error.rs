//! Error types for cryptmirror

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errno reported back through the FUSE reply for this error.
    ///
    /// Decryption failures map to EBADMSG so clients can tell "file present
    /// but unreadable under this password" apart from a plain I/O error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::PathNotFound(_) => libc::ENOENT,
            Error::Sys(errno) => *errno as libc::c_int,
            Error::Decryption(_) => libc::EBADMSG,
            Error::InvalidHandle(_) => libc::EBADF,
            Error::KeyDerivation(_)
            | Error::Encryption(_)
            | Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::Internal(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errno_passthrough() {
        let err = Error::Io(std::io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_decryption_errno_distinct_from_io() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        let dec = Error::Decryption("bad tag".to_string());
        assert_eq!(io.errno(), libc::EIO);
        assert_eq!(dec.errno(), libc::EBADMSG);
        assert_ne!(io.errno(), dec.errno());
    }

    #[test]
    fn test_sys_errno_passthrough() {
        let err = Error::Sys(nix::errno::Errno::EACCES);
        assert_eq!(err.errno(), libc::EACCES);
    }
}
