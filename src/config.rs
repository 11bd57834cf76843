//! Configuration management for pkcryptfs
//!
//! The per-root configuration record is a plain `name = value` file kept
//! next to the wrapped keys. Mount options come from the command line.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Key holding the block size in the configuration record
pub const BLOCK_SIZE_KEY: &str = "blocksize";

/// Block size written into a freshly initialized root
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Smallest block size a session accepts
pub const MIN_BLOCK_SIZE: usize = 8;

/// Environment override for the block size of a new root
pub const BLOCK_SIZE_ENV: &str = "PKCRYPTFS_BLOCK_SIZE";

/// Configuration record stored at `<root>/.pkcryptfs/config/config`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigRecord {
    entries: BTreeMap<String, String>,
}

impl ConfigRecord {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for a new root with the default block size
    pub fn with_defaults() -> Self {
        let mut record = Self::new();
        record.set(BLOCK_SIZE_KEY, DEFAULT_BLOCK_SIZE.to_string());
        record
    }

    /// Parse `name = value` lines.
    ///
    /// Blank lines, `#` comments and lines without a name or value are
    /// skipped. When a name repeats, the first value wins.
    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeMap::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() || value.is_empty() {
                continue;
            }

            entries
                .entry(name.to_string())
                .or_insert_with(|| value.to_string());
        }

        ConfigRecord { entries }
    }

    /// Load the record from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::ConfigMissingOrMalformed(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Ok(Self::parse(&content))
    }

    /// Save the record to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), self.render()).map_err(Error::WriteFailure)
    }

    /// Serialize as `name = value` lines
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(name, value)| format!("{} = {}\n", name, value))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: String) {
        self.entries.insert(name.to_string(), value);
    }

    /// Validated block size
    pub fn block_size(&self) -> Result<usize> {
        let raw = self.get(BLOCK_SIZE_KEY).ok_or_else(|| {
            Error::ConfigMissingOrMalformed(format!("{} key not found", BLOCK_SIZE_KEY))
        })?;

        let size: usize = raw.parse().map_err(|_| {
            Error::ConfigMissingOrMalformed(format!("{} is not a number: {}", BLOCK_SIZE_KEY, raw))
        })?;

        if size < MIN_BLOCK_SIZE {
            return Err(Error::ConfigMissingOrMalformed(format!(
                "{} must be at least {}, got {}",
                BLOCK_SIZE_KEY, MIN_BLOCK_SIZE, size
            )));
        }

        Ok(size)
    }

    /// Apply environment overrides (used when creating a root)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var(BLOCK_SIZE_ENV) {
            if let Ok(size) = size.trim().parse::<usize>() {
                self.set(BLOCK_SIZE_KEY, size.to_string());
            }
        }
    }
}

/// Mount configuration
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/pkcryptfs"),
            allow_other: false,
            auto_unmount: true,
        }
    }
}

impl MountConfig {
    /// Build FUSE mount options
    pub fn mount_options(&self) -> Vec<fuser::MountOption> {
        let mut options = vec![
            fuser::MountOption::FSName("pkcryptfs".to_string()),
            fuser::MountOption::DefaultPermissions,
        ];

        if self.auto_unmount {
            options.push(fuser::MountOption::AutoUnmount);
        }

        if self.allow_other {
            options.push(fuser::MountOption::AllowOther);
        }

        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_skips_malformed_lines() {
        let record = ConfigRecord::parse(
            "# comment\n\
             blocksize = 128\n\
             novalue =\n\
             = noname\n\
             garbage line\n\
             \n\
             extra=  spaced value  \n",
        );

        assert_eq!(record.get("blocksize"), Some("128"));
        assert_eq!(record.get("extra"), Some("spaced value"));
        assert_eq!(record.get("novalue"), None);
        assert_eq!(record.block_size().unwrap(), 128);
    }

    #[test]
    fn test_first_duplicate_wins() {
        let record = ConfigRecord::parse("blocksize = 16\nblocksize = 32\n");
        assert_eq!(record.block_size().unwrap(), 16);
    }

    #[test]
    fn test_block_size_validation() {
        assert!(matches!(
            ConfigRecord::parse("other = 1").block_size(),
            Err(Error::ConfigMissingOrMalformed(_))
        ));
        assert!(matches!(
            ConfigRecord::parse("blocksize = 7").block_size(),
            Err(Error::ConfigMissingOrMalformed(_))
        ));
        assert!(matches!(
            ConfigRecord::parse("blocksize = big").block_size(),
            Err(Error::ConfigMissingOrMalformed(_))
        ));
        assert_eq!(ConfigRecord::parse("blocksize = 8").block_size().unwrap(), 8);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config");

        let record = ConfigRecord::with_defaults();
        record.save(&path).unwrap();

        let loaded = ConfigRecord::load(&path).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.block_size().unwrap(), DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ConfigRecord::load(dir.path().join("absent")),
            Err(Error::ConfigMissingOrMalformed(_))
        ));
    }

    #[test]
    fn test_mount_options() {
        let config = MountConfig {
            allow_other: true,
            ..Default::default()
        };
        let options = config.mount_options();
        assert!(options.contains(&fuser::MountOption::AllowOther));
        assert!(options.contains(&fuser::MountOption::AutoUnmount));
    }
}
