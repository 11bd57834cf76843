//! pkcryptfs - Encrypted overlay filesystem with per-user public-key access
//!
//! File contents and names under a root directory are encrypted with a
//! shared content key. Each authorized user holds a copy of that key
//! wrapped with their RSA public key, so access can be granted and
//! revoked without re-encrypting any data.

pub mod block;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod layout;
pub mod path;
pub mod session;
pub mod users;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigRecord, MountConfig};
    pub use crate::error::{Error, Result};
    pub use crate::fs::PkCryptFs;
    pub use crate::session::Session;
    pub use crate::users::UserStore;
}
