//! Cryptographic primitives for pkcryptfs
//!
//! - `kdf`: cipher key and IV derivation from the content key
//! - `cipher`: positional AES-256-CTR engine
//! - `keywrap`: content key generation and RSA wrapping

pub mod cipher;
pub mod kdf;
pub mod keywrap;

pub use cipher::CipherContext;
pub use kdf::{derive_key, DerivedKey};
pub use keywrap::{generate_content_key, unwrap_key, wrap_key, ContentKey};

/// Size of the shared content key in bytes
pub const CONTENT_KEY_SIZE: usize = 64;

/// AES-256 key size in bytes
pub const CIPHER_KEY_SIZE: usize = 32;

/// CTR initialization vector size in bytes
pub const CIPHER_IV_SIZE: usize = 16;

/// PBKDF2 iteration count for cipher key derivation
pub const KDF_ITERATIONS: u32 = 1000;

/// Keystream byte position where path components are ciphered
pub const NAME_STREAM_POSITION: u128 = 1 << 100;
