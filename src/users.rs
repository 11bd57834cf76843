//! Wrapped key records and user management
//!
//! Every authorized user owns one file under the keys folder holding the
//! content key encrypted with their public key. Adding a user needs the
//! private key of someone already authorized; removing one only deletes the
//! record and never re-encrypts data. The last record can never be removed.

use crate::config::{ConfigRecord, BLOCK_SIZE_KEY, MIN_BLOCK_SIZE};
use crate::crypto::keywrap::{generate_content_key, unwrap_key, wrap_key, ContentKey};
use crate::error::{Error, Result};
use crate::layout::Layout;
use nix::fcntl::{Flock, FlockArg};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Manages the wrapped key records of one encrypted root
#[derive(Debug, Clone)]
pub struct UserStore {
    layout: Layout,
}

impl UserStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            layout: Layout::new(root),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Create the internal folders, a fresh content key and the first user.
    ///
    /// `block_size` overrides the default and any environment override.
    pub fn init(
        &self,
        user: &str,
        public_key: &RsaPublicKey,
        block_size: Option<usize>,
    ) -> Result<()> {
        validate_user_name(user)?;

        let keys_dir = self.layout.keys_dir();
        std::fs::create_dir_all(&keys_dir).map_err(Error::WriteFailure)?;
        let _lock = self.lock_keys()?;

        if self.count_users()? > 0 {
            return Err(Error::AlreadyInitialized(self.layout.root().to_path_buf()));
        }

        let mut config = ConfigRecord::with_defaults();
        config.apply_env_overrides();
        if let Some(size) = block_size {
            config.set(BLOCK_SIZE_KEY, size.to_string());
        }
        config.block_size().map_err(|_| {
            Error::InvalidArgument(format!("block size must be at least {}", MIN_BLOCK_SIZE))
        })?;

        let content_key = generate_content_key();
        let wrapped = wrap_key(public_key, &content_key)?;

        config.save(self.layout.config_file())?;
        self.write_wrapped_key(user, &wrapped)?;

        info!(
            "Initialized {} for user {}",
            self.layout.root().display(),
            user
        );
        Ok(())
    }

    /// Load the configuration record of this root
    pub fn config(&self) -> Result<ConfigRecord> {
        ConfigRecord::load(self.layout.config_file())
    }

    /// Unwrap the content key with an authorized user's private key
    pub fn read_content_key(&self, user: &str, private_key: &RsaPrivateKey) -> Result<ContentKey> {
        validate_user_name(user)?;

        let wrapped = std::fs::read(self.layout.key_file(user)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::UserNotFound(user.to_string()),
            _ => Error::ReadFailure(e),
        })?;

        unwrap_key(private_key, &wrapped)
    }

    /// Grant `new_user` access using the credentials of `user`
    pub fn add_user(
        &self,
        user: &str,
        private_key: &RsaPrivateKey,
        new_user: &str,
        new_public_key: &RsaPublicKey,
    ) -> Result<()> {
        validate_user_name(new_user)?;

        if self.layout.key_file(new_user).exists() {
            return Err(Error::UserAlreadyExists(new_user.to_string()));
        }

        let content_key = self.read_content_key(user, private_key)?;
        let wrapped = wrap_key(new_public_key, &content_key)?;
        self.write_wrapped_key(new_user, &wrapped)?;

        info!("User {} added by {}", new_user, user);
        Ok(())
    }

    /// Store a wrapped key record without ever replacing an existing one.
    ///
    /// The record is written to a temporary file in the keys folder and
    /// linked into place only once complete.
    pub fn write_wrapped_key(&self, user: &str, wrapped: &[u8]) -> Result<()> {
        validate_user_name(user)?;

        let cannot_add = |e: std::io::Error| Error::CannotAddUser {
            user: user.to_string(),
            reason: e.to_string(),
        };

        let mut temp = NamedTempFile::new_in(self.layout.keys_dir()).map_err(cannot_add)?;
        temp.write_all(wrapped).map_err(cannot_add)?;
        temp.as_file().sync_all().map_err(cannot_add)?;

        temp.persist_noclobber(self.layout.key_file(user))
            .map_err(|e| match e.error.kind() {
                ErrorKind::AlreadyExists => Error::UserAlreadyExists(user.to_string()),
                _ => cannot_add(e.error),
            })?;

        debug!("Wrote {} byte key record for {}", wrapped.len(), user);
        Ok(())
    }

    /// Revoke a user. Refused when only one record is left.
    pub fn delete_user(&self, user: &str) -> Result<()> {
        validate_user_name(user)?;

        // Count and removal must not interleave with another deletion
        let _lock = self.lock_keys()?;
        if self.count_users()? <= 1 {
            return Err(Error::OnlyOneUserRemaining);
        }

        std::fs::remove_file(self.layout.key_file(user)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::UserNotFound(user.to_string()),
            _ => Error::WriteFailure(e),
        })?;

        info!("User {} deleted", user);
        Ok(())
    }

    /// Names of all users holding a key record, sorted
    pub fn list_users(&self) -> Result<Vec<String>> {
        let keys_dir = self.layout.keys_dir();
        let entries = std::fs::read_dir(&keys_dir).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::ConfigMissingOrMalformed(format!(
                "{} does not exist",
                keys_dir.display()
            )),
            _ => Error::ReadFailure(e),
        })?;

        let mut users = Vec::new();
        for entry in entries {
            let entry = entry.map_err(Error::ReadFailure)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("Skipping non UTF-8 key record {:?}", name);
                continue;
            };
            // Covers "." and ".." as well as unfinished temporary records
            if name.starts_with('.') {
                continue;
            }
            users.push(name.to_string());
        }

        users.sort();
        Ok(users)
    }

    pub fn count_users(&self) -> Result<usize> {
        Ok(self.list_users()?.len())
    }

    /// Exclusive advisory lock on the keys folder, released on drop
    fn lock_keys(&self) -> Result<Flock<File>> {
        let keys_dir = self.layout.keys_dir();
        let dir = File::open(&keys_dir).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::ConfigMissingOrMalformed(format!(
                "{} does not exist",
                keys_dir.display()
            )),
            _ => Error::ReadFailure(e),
        })?;

        Flock::lock(dir, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::Io(std::io::Error::from(errno)))
    }
}

/// User names become file names in the keys folder
pub fn validate_user_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty user name".to_string()));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidArgument(format!(
            "user name {:?} contains a path separator or NUL",
            name
        )));
    }
    if name.starts_with('.') {
        return Err(Error::InvalidArgument(format!(
            "user name {:?} must not start with '.'",
            name
        )));
    }
    Ok(())
}
