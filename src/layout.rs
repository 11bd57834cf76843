//! On-disk layout of an encrypted root
//!
//! ```text
//! <root>/.pkcryptfs/config/config        name = value settings
//! <root>/.pkcryptfs/config/keys/<user>   wrapped content key per user
//! <root>/enc_...                         encrypted names and blocks
//! ```

use std::path::{Path, PathBuf};

/// Hidden directory holding the internal, unencrypted state
pub const STATE_DIR: &str = ".pkcryptfs";

const CONFIG_DIR: &str = "config";
const CONFIG_FILE: &str = "config";
const KEYS_DIR: &str = "keys";

/// Paths of the internal folders of one root
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.state_dir().join(CONFIG_DIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join(CONFIG_FILE)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.config_dir().join(KEYS_DIR)
    }

    /// Wrapped key record of one user
    pub fn key_file(&self, user: &str) -> PathBuf {
        self.keys_dir().join(user)
    }
}
