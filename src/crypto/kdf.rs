//! Cipher key and IV derivation
//!
//! The stream cipher is never keyed with the content key directly. Every
//! cipher context derives its AES key and IV from it with PBKDF2-HMAC-SHA256.
//! The content key is already uniformly random, so no salt is used and the
//! iteration count only has to be fixed, not large.

use crate::crypto::{CIPHER_IV_SIZE, CIPHER_KEY_SIZE, KDF_ITERATIONS};
use crate::error::{Error, Result};
use ring::pbkdf2;
use std::num::NonZeroU32;
use zeroize::Zeroizing;

/// AES key and IV derived from the content key
pub struct DerivedKey {
    /// The derived key material (zeroized on drop)
    key: Zeroizing<[u8; CIPHER_KEY_SIZE]>,
    /// Initialization vector
    iv: [u8; CIPHER_IV_SIZE],
}

impl DerivedKey {
    /// Get the key bytes
    pub fn key(&self) -> &[u8; CIPHER_KEY_SIZE] {
        &self.key
    }

    /// Get the IV
    pub fn iv(&self) -> &[u8; CIPHER_IV_SIZE] {
        &self.iv
    }
}

/// Derive the cipher key and IV from secret material
pub fn derive_key(secret: &[u8]) -> Result<DerivedKey> {
    if secret.is_empty() {
        return Err(Error::KeyDerivation("Empty key material".to_string()));
    }

    let iterations = NonZeroU32::new(KDF_ITERATIONS)
        .ok_or_else(|| Error::KeyDerivation("Iteration count must be positive".to_string()))?;

    let mut output = Zeroizing::new([0u8; CIPHER_KEY_SIZE + CIPHER_IV_SIZE]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &[],
        secret,
        output.as_mut(),
    );

    let mut key = Zeroizing::new([0u8; CIPHER_KEY_SIZE]);
    key.copy_from_slice(&output[..CIPHER_KEY_SIZE]);
    let mut iv = [0u8; CIPHER_IV_SIZE];
    iv.copy_from_slice(&output[CIPHER_KEY_SIZE..]);

    Ok(DerivedKey { key, iv })
}
