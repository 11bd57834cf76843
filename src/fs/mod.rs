//! FUSE filesystem implementation
//!
//! Implements the FUSE filesystem interface, translating logical paths
//! and file content to their encrypted form in the lower directory.

mod filesystem;
mod handle;
mod inode;
mod lower;

pub use filesystem::PkCryptFs;
pub use handle::{HandleTable, OpenFile};
pub use inode::{InodeTable, ROOT_INO};
pub use lower::{file_attr, file_kind, DirEntry, LowerLayer};
