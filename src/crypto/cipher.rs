//! Symmetric stream cipher engine
//!
//! AES-256 in CTR mode: ciphertext and plaintext have the same length, and
//! the keystream can be positioned anywhere, so each block of a file is
//! ciphered on its own at `block * block_size`.
//!
//! The running cipher state moves on every call, which is why a context is
//! owned by a single worker and never shared.

use crate::crypto::kdf::derive_key;
use crate::crypto::NAME_STREAM_POSITION;
use crate::error::{Error, Result};
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Per-worker cipher state, one per direction
pub struct CipherContext {
    encryptor: Aes256Ctr,
    decryptor: Aes256Ctr,
}

impl CipherContext {
    /// Key both directions from the content key
    pub fn new(content_key: &[u8]) -> Result<Self> {
        let derived = derive_key(content_key)?;

        let encryptor = Aes256Ctr::new_from_slices(derived.key(), derived.iv())
            .map_err(|e| Error::KeyDerivation(format!("Invalid cipher key length: {}", e)))?;
        let decryptor = Aes256Ctr::new_from_slices(derived.key(), derived.iv())
            .map_err(|e| Error::KeyDerivation(format!("Invalid cipher key length: {}", e)))?;

        Ok(Self {
            encryptor,
            decryptor,
        })
    }

    /// Encrypt `data` in place as if it sat at `position` in the stream
    pub fn encrypt_at(&mut self, position: u64, data: &mut [u8]) {
        self.encryptor.seek(u128::from(position));
        self.encryptor.apply_keystream(data);
    }

    /// Decrypt `data` in place as if it sat at `position` in the stream
    pub fn decrypt_at(&mut self, position: u64, data: &mut [u8]) {
        self.decryptor.seek(u128::from(position));
        self.decryptor.apply_keystream(data);
    }

    /// Encrypt a buffer, returning a buffer of the same length
    pub fn encrypt(&mut self, position: u64, plaintext: &[u8]) -> Vec<u8> {
        let mut out = plaintext.to_vec();
        self.encrypt_at(position, &mut out);
        out
    }

    /// Decrypt a buffer, returning a buffer of the same length
    pub fn decrypt(&mut self, position: u64, ciphertext: &[u8]) -> Vec<u8> {
        let mut out = ciphertext.to_vec();
        self.decrypt_at(position, &mut out);
        out
    }

    /// Deterministic encryption of a path component.
    ///
    /// Names use a keystream region far above any file offset.
    pub fn encrypt_name(&mut self, name: &[u8]) -> Vec<u8> {
        let mut out = name.to_vec();
        self.encryptor.seek(NAME_STREAM_POSITION);
        self.encryptor.apply_keystream(&mut out);
        out
    }

    pub fn decrypt_name(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        let mut out = ciphertext.to_vec();
        self.decryptor.seek(NAME_STREAM_POSITION);
        self.decryptor.apply_keystream(&mut out);
        out
    }
}

impl std::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherContext").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> CipherContext {
        CipherContext::new(&[0x42u8; 64]).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_length() {
        let mut ctx = context();
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();

        let ciphertext = ctx.encrypt(0, &plaintext);
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_ne!(ciphertext, plaintext);

        assert_eq!(ctx.decrypt(0, &ciphertext), plaintext);
    }

    #[test]
    fn test_position_is_independent_of_history() {
        let mut ctx = context();
        let data = vec![0xAAu8; 100];

        let first = ctx.encrypt(64, &data);
        ctx.encrypt(0, &[0u8; 1000]);
        let second = ctx.encrypt(64, &data);

        assert_eq!(first, second);
    }

    #[test]
    fn test_positions_are_consistent_with_one_stream() {
        let mut ctx = context();
        let data: Vec<u8> = (0..48u8).collect();

        let whole = ctx.encrypt(0, &data);
        let tail = ctx.encrypt(16, &data[16..]);

        assert_eq!(&whole[16..], &tail[..]);
    }

    #[test]
    fn test_two_contexts_agree() {
        let mut a = context();
        let mut b = context();

        let ciphertext = a.encrypt(128, b"block");
        assert_eq!(b.decrypt(128, &ciphertext), b"block");
        assert_eq!(a.encrypt_name(b"name"), b.encrypt_name(b"name"));
    }

    #[test]
    fn test_names_do_not_share_file_keystream() {
        let mut ctx = context();
        let name = b"report.txt";

        let as_name = ctx.encrypt_name(name);
        let as_content = ctx.encrypt(0, name);

        assert_ne!(as_name, as_content);
        assert_eq!(ctx.decrypt_name(&as_name), name);
    }

    #[test]
    fn test_wrong_key_yields_different_plaintext() {
        let mut right = context();
        let mut wrong = CipherContext::new(&[0x43u8; 64]).unwrap();

        let ciphertext = right.encrypt(0, b"secret");
        assert_ne!(wrong.decrypt(0, &ciphertext), b"secret");
    }
}
