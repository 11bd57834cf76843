//! Error types for pkcryptfs
//!
//! One enum covers the whole core: codec, cipher, key wrapping, block I/O
//! and configuration. The FUSE layer only carries an errno, so every variant
//! also knows its closest POSIX error code.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A buffer could not be allocated
    #[error("Not enough memory for the operation")]
    MemoryExhaustion,

    /// Malformed path, user name or key material
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No wrapped key record exists for the user
    #[error("No such user: {0}")]
    UserNotFound(String),

    /// A wrapped key record already exists for the user
    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    /// The wrapped key record could not be created
    #[error("Cannot add user {user}: {reason}")]
    CannotAddUser { user: String, reason: String },

    /// Refused to delete the last wrapped key record
    #[error("Only one user left, removing it would make all data unrecoverable")]
    OnlyOneUserRemaining,

    /// The content key could not be unwrapped with the given private key
    #[error("Cannot decrypt the content key: {0}")]
    DecryptFailure(String),

    /// The content key could not be wrapped with the given public key
    #[error("Cannot encrypt the content key: {0}")]
    EncryptFailure(String),

    #[error("Read failed: {0}")]
    ReadFailure(#[source] io::Error),

    #[error("Write failed: {0}")]
    WriteFailure(#[source] io::Error),

    /// Configuration record absent, unreadable or missing a required key
    #[error("Configuration missing or malformed: {0}")]
    ConfigMissingOrMalformed(String),

    /// Malformed base64 input
    #[error("Corrupt encoding: {0}")]
    CorruptEncoding(String),

    /// The root already holds wrapped key records
    #[error("Already initialized: {0}")]
    AlreadyInitialized(PathBuf),

    /// Encoded path component exceeds the underlying name limit
    #[error("Encoded name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Closest POSIX errno for the FUSE reply
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::MemoryExhaustion => libc::ENOMEM,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::UserNotFound(_) => libc::ENOENT,
            Error::UserAlreadyExists(_) | Error::AlreadyInitialized(_) => libc::EEXIST,
            Error::CannotAddUser { .. } => libc::EACCES,
            Error::OnlyOneUserRemaining => libc::EPERM,
            Error::NameTooLong(_) => libc::ENAMETOOLONG,
            Error::ReadFailure(e) | Error::WriteFailure(e) | Error::Io(e) => io_errno(e),
            Error::DecryptFailure(_)
            | Error::EncryptFailure(_)
            | Error::ConfigMissingOrMalformed(_)
            | Error::CorruptEncoding(_)
            | Error::KeyDerivation(_)
            | Error::Internal(_) => libc::EIO,
        }
    }
}

/// Raw OS errno of an I/O error, `EIO` when there is none
fn io_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_keep_os_errno() {
        let e = Error::Io(io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(e.to_errno(), libc::ENOENT);

        let e = Error::WriteFailure(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.to_errno(), libc::ENOSPC);

        let e = Error::ReadFailure(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert_eq!(e.to_errno(), libc::EIO);
    }

    #[test]
    fn test_core_errors_map_to_errno() {
        assert_eq!(Error::MemoryExhaustion.to_errno(), libc::ENOMEM);
        assert_eq!(Error::InvalidArgument("x".into()).to_errno(), libc::EINVAL);
        assert_eq!(Error::NameTooLong(300).to_errno(), libc::ENAMETOOLONG);
        assert_eq!(Error::CorruptEncoding("QQ=".into()).to_errno(), libc::EIO);
        assert_eq!(Error::OnlyOneUserRemaining.to_errno(), libc::EPERM);
    }

    #[test]
    fn test_messages_distinguish_kinds() {
        let missing = Error::UserNotFound("alice".into()).to_string();
        let decrypt = Error::DecryptFailure("bad key".into()).to_string();
        let write = Error::WriteFailure(io::Error::from_raw_os_error(libc::EACCES)).to_string();

        assert!(missing.contains("No such user"));
        assert!(decrypt.contains("Cannot decrypt"));
        assert!(write.contains("Write failed"));
    }
}
