//! Base64 codec used for encrypted path components
//!
//! Encoding always pads with `=`. Decoding skips every byte outside the
//! selected alphabet (line breaks, spaces, foreign symbols) and only then
//! checks that the remaining symbol count is a positive multiple of four.

use crate::error::{Error, Result};
use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

const STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

const URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Base64 alphabet selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alphabet {
    /// RFC 4648 alphabet (`+` and `/`)
    Standard,
    /// Filename safe alphabet (`-` and `_`)
    UrlSafe,
}

impl Alphabet {
    fn engine(self) -> &'static GeneralPurpose {
        match self {
            Alphabet::Standard => &STANDARD,
            Alphabet::UrlSafe => &URL_SAFE,
        }
    }

    fn accepts(self, symbol: u8) -> bool {
        match symbol {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'=' => true,
            b'+' | b'/' => self == Alphabet::Standard,
            b'-' | b'_' => self == Alphabet::UrlSafe,
            _ => false,
        }
    }
}

/// Encode bytes with `=` padding
pub fn encode(data: &[u8], alphabet: Alphabet) -> String {
    alphabet.engine().encode(data)
}

/// Decode text, skipping extraneous symbols
pub fn decode(text: &[u8], alphabet: Alphabet) -> Result<Vec<u8>> {
    let symbols: Vec<u8> = text
        .iter()
        .copied()
        .filter(|&b| alphabet.accepts(b))
        .collect();

    if symbols.is_empty() {
        return Err(Error::CorruptEncoding("no base64 symbols".to_string()));
    }
    if symbols.len() % 4 != 0 {
        return Err(Error::CorruptEncoding(format!(
            "{} symbols is not a multiple of 4",
            symbols.len()
        )));
    }

    alphabet
        .engine()
        .decode(&symbols)
        .map_err(|e| Error::CorruptEncoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(encode(b"ciao", Alphabet::Standard), "Y2lhbw==");
        assert_eq!(encode(b"A", Alphabet::UrlSafe), "QQ==");
        assert_eq!(encode(&[0xfb, 0xff], Alphabet::Standard), "+/8=");
        assert_eq!(encode(&[0xfb, 0xff], Alphabet::UrlSafe), "-_8=");
        assert_eq!(decode(b"Y2lhbw==", Alphabet::Standard).unwrap(), b"ciao");
    }

    #[test]
    fn test_round_trip_all_lengths() {
        for len in 0..64usize {
            let data: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            for alphabet in [Alphabet::Standard, Alphabet::UrlSafe] {
                let text = encode(&data, alphabet);
                if data.is_empty() {
                    assert!(text.is_empty());
                    continue;
                }
                assert_eq!(decode(text.as_bytes(), alphabet).unwrap(), data);
            }
        }
    }

    #[test]
    fn test_extraneous_symbols_skipped() {
        let decoded = decode(b"Y2l\nhb w=\r\n=", Alphabet::Standard).unwrap();
        assert_eq!(decoded, b"ciao");

        // '+' is foreign to the url-safe alphabet and is skipped
        let decoded = decode(b"QQ+==", Alphabet::UrlSafe).unwrap();
        assert_eq!(decoded, b"A");
    }

    #[test]
    fn test_corrupt_input() {
        assert!(matches!(
            decode(b"QQ=", Alphabet::UrlSafe),
            Err(Error::CorruptEncoding(_))
        ));
        assert!(matches!(
            decode(b"", Alphabet::UrlSafe),
            Err(Error::CorruptEncoding(_))
        ));
        assert!(matches!(
            decode(b"!!\n", Alphabet::Standard),
            Err(Error::CorruptEncoding(_))
        ));
    }
}
