//! Content key generation and RSA key wrapping
//!
//! All file content and names of one root are encrypted with a single
//! random content key. Each authorized user holds a copy of it encrypted
//! under their RSA public key, so granting or revoking access never touches
//! the encrypted data.

use crate::crypto::CONTENT_KEY_SIZE;
use crate::error::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::debug;
use zeroize::Zeroizing;

/// Default modulus size for generated key pairs
pub const DEFAULT_RSA_BITS: usize = 2048;

/// The shared symmetric content key (zeroized on drop)
#[derive(Clone)]
pub struct ContentKey {
    key: Zeroizing<[u8; CONTENT_KEY_SIZE]>,
}

impl ContentKey {
    /// Build from raw bytes, which must be exactly `CONTENT_KEY_SIZE` long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CONTENT_KEY_SIZE {
            return Err(Error::InvalidArgument(format!(
                "content key must be {} bytes, got {}",
                CONTENT_KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; CONTENT_KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Generate a fresh content key from the operating system RNG
pub fn generate_content_key() -> ContentKey {
    let mut key = Zeroizing::new([0u8; CONTENT_KEY_SIZE]);
    OsRng.fill_bytes(key.as_mut());
    ContentKey { key }
}

/// Encrypt the content key under a user's public key.
///
/// The result is exactly as long as the key's modulus.
pub fn wrap_key(public_key: &RsaPublicKey, content_key: &ContentKey) -> Result<Vec<u8>> {
    let wrapped = public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, content_key.as_bytes())
        .map_err(|e| Error::EncryptFailure(e.to_string()))?;

    debug!(
        "Wrapped content key into {} bytes (modulus {} bytes)",
        wrapped.len(),
        public_key.size()
    );
    Ok(wrapped)
}

/// Decrypt a wrapped content key with a user's private key
pub fn unwrap_key(private_key: &RsaPrivateKey, wrapped: &[u8]) -> Result<ContentKey> {
    let plaintext = Zeroizing::new(
        private_key
            .decrypt_blinded(&mut OsRng, Pkcs1v15Encrypt, wrapped)
            .map_err(|e| Error::DecryptFailure(e.to_string()))?,
    );

    if plaintext.len() != CONTENT_KEY_SIZE {
        return Err(Error::DecryptFailure(format!(
            "unwrapped key is {} bytes, expected {}",
            plaintext.len(),
            CONTENT_KEY_SIZE
        )));
    }

    ContentKey::from_slice(&plaintext)
}

/// Load a PEM private key (PKCS#8 or PKCS#1)
pub fn read_private_key<P: AsRef<Path>>(path: P) -> Result<RsaPrivateKey> {
    let path = path.as_ref();
    let pem = Zeroizing::new(std::fs::read_to_string(path).map_err(Error::ReadFailure)?);

    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| {
            Error::InvalidArgument(format!(
                "{} is not a PEM RSA private key: {}",
                path.display(),
                e
            ))
        })
}

/// Load a PEM public key (SubjectPublicKeyInfo or PKCS#1)
pub fn read_public_key<P: AsRef<Path>>(path: P) -> Result<RsaPublicKey> {
    let path = path.as_ref();
    let pem = std::fs::read_to_string(path).map_err(Error::ReadFailure)?;

    RsaPublicKey::from_public_key_pem(&pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
        .map_err(|e| {
            Error::InvalidArgument(format!(
                "{} is not a PEM RSA public key: {}",
                path.display(),
                e
            ))
        })
}

/// Generate a new RSA key pair
pub fn generate_key_pair(bits: usize) -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| Error::KeyDerivation(format!("RSA key generation failed: {}", e)))
}

/// Write a private key as PKCS#8 PEM, readable by the owner only
pub fn write_private_key<P: AsRef<Path>>(key: &RsaPrivateKey, path: P) -> Result<()> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Internal(format!("Cannot encode private key: {}", e)))?;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path.as_ref())
        .map_err(Error::WriteFailure)?;
    file.write_all(pem.as_bytes()).map_err(Error::WriteFailure)?;
    file.sync_all().map_err(Error::WriteFailure)
}

/// Write a public key as SubjectPublicKeyInfo PEM
pub fn write_public_key<P: AsRef<Path>>(key: &RsaPublicKey, path: P) -> Result<()> {
    let pem = key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Internal(format!("Cannot encode public key: {}", e)))?;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path.as_ref())
        .map_err(Error::WriteFailure)?;
    file.write_all(pem.as_bytes()).map_err(Error::WriteFailure)
}


#[cfg(test)]
mod tests {
    use super::test_keys::{private_key, public_key};
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_content_key() {
        let first = generate_content_key();
        let second = generate_content_key();

        assert_eq!(first.as_bytes().len(), CONTENT_KEY_SIZE);
        assert_ne!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn test_wrap_unwrap() {
        let key = generate_content_key();

        let wrapped = wrap_key(&public_key(0), &key).unwrap();
        assert_eq!(wrapped.len(), public_key(0).size());

        let unwrapped = unwrap_key(private_key(0), &wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_unwrap_with_wrong_key_fails() {
        let key = generate_content_key();
        let wrapped = wrap_key(&public_key(0), &key).unwrap();

        assert!(matches!(
            unwrap_key(private_key(1), &wrapped),
            Err(Error::DecryptFailure(_))
        ));
    }

    #[test]
    fn test_unwrap_rejects_wrong_length() {
        // A correctly padded payload that is not a content key
        let wrapped = public_key(0)
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &[9u8; 32])
            .unwrap();

        assert!(matches!(
            unwrap_key(private_key(0), &wrapped),
            Err(Error::DecryptFailure(_))
        ));
    }

    #[test]
    fn test_unwrap_rejects_garbage() {
        assert!(matches!(
            unwrap_key(private_key(0), b"not a wrapped key"),
            Err(Error::DecryptFailure(_))
        ));
    }

    #[test]
    fn test_pem_files() {
        let dir = tempdir().unwrap();
        let private_path = dir.path().join("alice.pem");
        let public_path = dir.path().join("alice.pub.pem");

        write_private_key(private_key(2), &private_path).unwrap();
        write_public_key(&public_key(2), &public_path).unwrap();

        let loaded_private = read_private_key(&private_path).unwrap();
        let loaded_public = read_public_key(&public_path).unwrap();
        assert_eq!(&loaded_private, private_key(2));
        assert_eq!(loaded_public, public_key(2));

        // Refuses to overwrite an existing key file
        assert!(write_private_key(private_key(2), &private_path).is_err());
    }

    #[test]
    fn test_pkcs1_private_key_accepted() {
        use rsa::pkcs1::EncodeRsaPrivateKey;

        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.pem");
        let pem = private_key(0).to_pkcs1_pem(LineEnding::LF).unwrap();
        std::fs::write(&path, pem.as_bytes()).unwrap();

        assert_eq!(&read_private_key(&path).unwrap(), private_key(0));
    }

    #[test]
    fn test_invalid_pem_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.pem");
        std::fs::write(&path, "-----BEGIN NOTHING-----\n").unwrap();

        assert!(matches!(
            read_public_key(&path),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            read_private_key(dir.path().join("missing.pem")),
            Err(Error::ReadFailure(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = ContentKey::from_slice(&[0xAB; CONTENT_KEY_SIZE]).unwrap();
        let shown = format!("{:?}", key);
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains("171"));
    }
}
