//! Freenet's URL-safe base64 variant.
//!
//! Identical to the standard alphabet except `+` and `/` are replaced by
//! `~` and `-`. Padding is never written and is ignored when decoding.

use base64::Engine;
use base64::alphabet::Alphabet;
use base64::engine::DecodePaddingMode;
use base64::engine::GeneralPurpose;
use base64::engine::GeneralPurposeConfig;

use crate::error::KeyError;
use crate::error::KeyResult;

const FREENET_ALPHABET: Alphabet =
    match Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789~-") {
        Ok(alphabet) => alphabet,
        Err(_) => panic!("freenet base64 alphabet is invalid"),
    };

/// Engine for Freenet base64.
pub const FREENET_BASE64: GeneralPurpose = GeneralPurpose::new(
    &FREENET_ALPHABET,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Encode bytes as Freenet base64.
pub fn encode(data: &[u8]) -> String {
    FREENET_BASE64.encode(data)
}

/// Decode a Freenet base64 field.
pub fn decode(field: &'static str, value: &str) -> KeyResult<Vec<u8>> {
    FREENET_BASE64.decode(value).map_err(|_| KeyError::InvalidBase64 {
        field,
        value: value.to_string(),
    })
}

/// Decode a Freenet base64 field that must have exactly `N` bytes.
pub fn decode_fixed<const N: usize>(field: &'static str, value: &str) -> KeyResult<[u8; N]> {
    let bytes = decode(field, value)?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| KeyError::InvalidLength {
        field,
        expected: N,
        actual,
    })
}
