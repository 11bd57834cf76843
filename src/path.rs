//! Translation between logical paths and their on-disk names
//!
//! Each component of a logical path is stored as `enc_` followed by the
//! url-safe base64 of its ciphertext. The separator stays a plain `/`, and
//! `.` / `..` pass through so relative symlink targets keep working.
//!
//! Names are ciphered from a fixed keystream position, which makes the
//! encoding deterministic: the same name always maps to the same on-disk
//! name and lookups never need to scan a directory.

use crate::codec::{self, Alphabet};
use crate::crypto::CipherContext;
use crate::error::{Error, Result};
use crate::session::Session;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Prefix tagging an encrypted component on disk
pub const MARKER: &str = "enc_";

/// Longest component the underlying filesystem accepts
pub const NAME_MAX: usize = 255;

/// Longest logical component whose encoding still fits in `NAME_MAX`
pub const LOGICAL_NAME_MAX: usize = (NAME_MAX - MARKER.len()) / 4 * 3;

fn is_passthrough(component: &[u8]) -> bool {
    component == b"." || component == b".."
}

/// Encrypt one logical component
pub fn encode_component(ctx: &mut CipherContext, name: &OsStr) -> Result<OsString> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return Err(Error::InvalidArgument("empty path component".to_string()));
    }
    if bytes.contains(&b'/') || bytes.contains(&0) {
        return Err(Error::InvalidArgument(format!(
            "path component {:?} contains a separator or NUL",
            name
        )));
    }
    if is_passthrough(bytes) {
        return Ok(name.to_os_string());
    }

    let ciphertext = ctx.encrypt_name(bytes);
    let encoded = format!("{}{}", MARKER, codec::encode(&ciphertext, Alphabet::UrlSafe));

    if encoded.len() > NAME_MAX {
        return Err(Error::NameTooLong(encoded.len()));
    }

    Ok(OsString::from(encoded))
}

/// Recover the logical name of one on-disk component.
///
/// Components without the marker are returned unchanged. A marked
/// component must decrypt to a name `encode_component` could have produced.
pub fn decode_component(ctx: &mut CipherContext, name: &OsStr) -> Result<OsString> {
    let bytes = name.as_bytes();
    let Some(payload) = bytes.strip_prefix(MARKER.as_bytes()) else {
        return Ok(name.to_os_string());
    };

    let ciphertext = codec::decode(payload, Alphabet::UrlSafe)?;
    let plaintext = ctx.decrypt_name(&ciphertext);
    if plaintext.is_empty()
        || plaintext.contains(&b'/')
        || plaintext.contains(&0)
        || is_passthrough(&plaintext)
    {
        return Err(Error::CorruptEncoding(format!(
            "{:?} does not decrypt to a valid name",
            name
        )));
    }

    Ok(OsString::from_vec(plaintext))
}

/// Encode a logical path.
///
/// With `prepend_root` the result is rooted at the session root, otherwise
/// it keeps the shape of the input (absolute or relative), which is what a
/// symlink target needs.
pub fn encode_path(
    session: &Session,
    ctx: &mut CipherContext,
    path: &Path,
    prepend_root: bool,
) -> Result<PathBuf> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(Error::InvalidArgument("empty path".to_string()));
    }

    let mut encoded = if prepend_root {
        session.root().to_path_buf()
    } else if bytes[0] == b'/' {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };

    for component in bytes.split(|&b| b == b'/').filter(|c| !c.is_empty()) {
        encoded.push(encode_component(ctx, OsStr::from_bytes(component))?);
    }

    Ok(encoded)
}

/// Decode an on-disk path (such as a stored symlink target)
pub fn decode_path(ctx: &mut CipherContext, encoded: &Path) -> Result<PathBuf> {
    let bytes = encoded.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(Error::InvalidArgument("empty path".to_string()));
    }

    let mut decoded = if bytes[0] == b'/' {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };

    for component in bytes.split(|&b| b == b'/').filter(|c| !c.is_empty()) {
        decoded.push(decode_component(ctx, OsStr::from_bytes(component))?);
    }

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ContentKey, CONTENT_KEY_SIZE};

    fn fixture() -> (Session, CipherContext) {
        let key = ContentKey::from_slice(&[0x11u8; CONTENT_KEY_SIZE]).unwrap();
        let ctx = CipherContext::new(key.as_bytes()).unwrap();
        let session = Session::new("/srv/vault", "alice", key, 64).unwrap();
        (session, ctx)
    }

    #[test]
    fn test_component_round_trip_keeps_spaces() {
        let (_, mut ctx) = fixture();
        let name = OsStr::new("secret file.txt");

        let encoded = encode_component(&mut ctx, name).unwrap();
        let text = encoded.to_str().unwrap();
        assert!(text.starts_with(MARKER));
        assert!(text[MARKER.len()..]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'='));
        assert!(!text.contains("secret"));

        assert_eq!(decode_component(&mut ctx, &encoded).unwrap(), name);
    }

    #[test]
    fn test_component_round_trip_arbitrary_bytes() {
        let (_, mut ctx) = fixture();
        for len in 1..=40usize {
            let bytes: Vec<u8> = (0..len).map(|i| (i * 91 + 3) as u8 | 1).collect();
            let bytes: Vec<u8> = bytes.into_iter().filter(|&b| b != b'/').collect();
            let name = OsStr::from_bytes(&bytes);
            if is_passthrough(&bytes) {
                continue;
            }

            let encoded = encode_component(&mut ctx, name).unwrap();
            assert_eq!(decode_component(&mut ctx, &encoded).unwrap(), name);
        }
    }

    #[test]
    fn test_marker_inside_plaintext_round_trips() {
        let (_, mut ctx) = fixture();
        let name = OsStr::new("enc_already_looks_encrypted");

        let encoded = encode_component(&mut ctx, name).unwrap();
        assert_ne!(encoded, name);
        assert_eq!(decode_component(&mut ctx, &encoded).unwrap(), name);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let (_, mut a) = fixture();
        let (_, mut b) = fixture();

        a.encrypt(0, &[0u8; 500]);
        assert_eq!(
            encode_component(&mut a, OsStr::new("notes")).unwrap(),
            encode_component(&mut b, OsStr::new("notes")).unwrap()
        );
    }

    #[test]
    fn test_plain_components_pass_through() {
        let (_, mut ctx) = fixture();

        assert_eq!(
            decode_component(&mut ctx, OsStr::new(".pkcryptfs")).unwrap(),
            OsStr::new(".pkcryptfs")
        );
        assert_eq!(
            encode_component(&mut ctx, OsStr::new("..")).unwrap(),
            OsStr::new("..")
        );
    }

    #[test]
    fn test_bare_marker_is_corrupt() {
        let (_, mut ctx) = fixture();
        assert!(matches!(
            decode_component(&mut ctx, OsStr::new("enc_")),
            Err(Error::CorruptEncoding(_))
        ));
        assert!(matches!(
            decode_component(&mut ctx, OsStr::new("enc_QQ=")),
            Err(Error::CorruptEncoding(_))
        ));
    }

    #[test]
    fn test_impossible_plaintext_is_corrupt() {
        let (_, mut ctx) = fixture();

        for plaintext in [&b"a/b"[..], &b".."[..], &b"."[..], &b"x\0y"[..]] {
            let ciphertext = ctx.encrypt_name(plaintext);
            let forged = format!("{}{}", MARKER, codec::encode(&ciphertext, Alphabet::UrlSafe));
            assert!(
                matches!(
                    decode_component(&mut ctx, OsStr::new(&forged)),
                    Err(Error::CorruptEncoding(_))
                ),
                "{:?} should not decode",
                plaintext
            );
        }
    }

    #[test]
    fn test_nul_in_component_rejected() {
        let (_, mut ctx) = fixture();
        assert!(matches!(
            encode_component(&mut ctx, OsStr::from_bytes(b"x\0y")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_name_length_limit() {
        let (_, mut ctx) = fixture();

        assert_eq!(LOGICAL_NAME_MAX, 186);
        let longest = "x".repeat(LOGICAL_NAME_MAX);
        let encoded = encode_component(&mut ctx, OsStr::new(&longest)).unwrap();
        assert!(encoded.len() <= NAME_MAX);

        let too_long = "x".repeat(LOGICAL_NAME_MAX + 1);
        assert!(matches!(
            encode_component(&mut ctx, OsStr::new(&too_long)),
            Err(Error::NameTooLong(256))
        ));
    }

    #[test]
    fn test_encode_path_with_root() {
        let (session, mut ctx) = fixture();

        let encoded = encode_path(&session, &mut ctx, Path::new("/docs/secret file.txt"), true)
            .unwrap();
        assert!(encoded.starts_with("/srv/vault"));

        let relative = encoded.strip_prefix("/srv/vault").unwrap();
        let components: Vec<_> = relative.components().collect();
        assert_eq!(components.len(), 2);
        assert_eq!(
            decode_path(&mut ctx, relative).unwrap(),
            PathBuf::from("docs/secret file.txt")
        );

        assert_eq!(
            encode_path(&session, &mut ctx, Path::new("/"), true).unwrap(),
            PathBuf::from("/srv/vault")
        );
    }

    #[test]
    fn test_encode_path_without_root() {
        let (session, mut ctx) = fixture();

        let relative = encode_path(&session, &mut ctx, Path::new("../shared//notes"), false)
            .unwrap();
        assert!(relative.is_relative());
        assert!(relative.starts_with(".."));
        assert_eq!(
            decode_path(&mut ctx, &relative).unwrap(),
            PathBuf::from("../shared/notes")
        );

        let absolute = encode_path(&session, &mut ctx, Path::new("/etc/motd"), false).unwrap();
        assert!(absolute.is_absolute());
        assert!(!absolute.starts_with("/srv/vault"));
        assert_eq!(
            decode_path(&mut ctx, &absolute).unwrap(),
            PathBuf::from("/etc/motd")
        );
    }

    #[test]
    fn test_empty_path_rejected() {
        let (session, mut ctx) = fixture();

        assert!(matches!(
            encode_path(&session, &mut ctx, Path::new(""), true),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            decode_path(&mut ctx, Path::new("")),
            Err(Error::InvalidArgument(_))
        ));
    }
}
