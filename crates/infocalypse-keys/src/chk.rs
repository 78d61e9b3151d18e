//! Content hash keys.
//!
//! A CHK addresses an immutable block. It is 69 bytes of key material:
//! a 32-byte routing key, a 32-byte crypto key and 5 extra bytes. The
//! extra bytes carry the crypto algorithm, the control document flag and
//! the compression codec.
//!
//! ```text
//! CHK@<routing>,<crypto>,<extra>[/<filename>]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::encoding;
use crate::error::KeyError;
use crate::error::KeyResult;

/// Length of the routing key.
pub const ROUTING_KEY_LEN: usize = 32;

/// Length of the crypto key.
pub const CRYPTO_KEY_LEN: usize = 32;

/// Length of the extra (control) bytes.
pub const EXTRA_LEN: usize = 5;

/// Length of the binary CHK form.
pub const CHK_LEN: usize = ROUTING_KEY_LEN + CRYPTO_KEY_LEN + EXTRA_LEN;

const CHK_PREFIX: &str = "CHK@";

/// Offset of the control document flag in the extra bytes.
const CONTROL_BYTE: usize = 2;

/// Value of the control byte for a splitfile metadata block.
const CONTROL_DOCUMENT: u8 = 2;

/// Extra bytes for an uncompressed AES-CTR data block.
pub const DEFAULT_EXTRA: [u8; EXTRA_LEN] = [0x00, 0x03, 0x00, 0xff, 0xff];

/// A content hash key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chk {
    routing: [u8; ROUTING_KEY_LEN],
    crypto: [u8; CRYPTO_KEY_LEN],
    extra: [u8; EXTRA_LEN],
    filename: Option<String>,
}

impl Chk {
    /// Build a CHK from its raw parts.
    pub fn from_parts(
        routing: [u8; ROUTING_KEY_LEN],
        crypto: [u8; CRYPTO_KEY_LEN],
        extra: [u8; EXTRA_LEN],
    ) -> Self {
        Self {
            routing,
            crypto,
            extra,
            filename: None,
        }
    }

    /// Parse the textual form.
    pub fn parse(uri: &str) -> KeyResult<Self> {
        let rest = uri.strip_prefix(CHK_PREFIX).ok_or_else(|| KeyError::WrongKeyType {
            expected: "CHK",
            uri: uri.to_string(),
        })?;

        let (material, filename) = match rest.split_once('/') {
            Some((material, name)) if !name.is_empty() => (material, Some(name.to_string())),
            Some((material, _)) => (material, None),
            None => (rest, None),
        };

        let mut fields = material.split(',');
        let (Some(routing), Some(crypto), Some(extra), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(KeyError::MalformedKey {
                uri: uri.to_string(),
                reason: "expected routing,crypto,extra".to_string(),
            });
        };

        Ok(Self {
            routing: encoding::decode_fixed::<ROUTING_KEY_LEN>("routing", routing)?,
            crypto: encoding::decode_fixed::<CRYPTO_KEY_LEN>("crypto", crypto)?,
            extra: encoding::decode_fixed::<EXTRA_LEN>("extra", extra)?,
            filename,
        })
    }

    /// Decode the 69-byte binary form used inside top-keys.
    pub fn from_bytes(bytes: &[u8]) -> KeyResult<Self> {
        if bytes.len() != CHK_LEN {
            return Err(KeyError::InvalidLength {
                field: "chk",
                expected: CHK_LEN,
                actual: bytes.len(),
            });
        }
        let mut routing = [0u8; ROUTING_KEY_LEN];
        let mut crypto = [0u8; CRYPTO_KEY_LEN];
        let mut extra = [0u8; EXTRA_LEN];
        routing.copy_from_slice(&bytes[..ROUTING_KEY_LEN]);
        crypto.copy_from_slice(&bytes[ROUTING_KEY_LEN..ROUTING_KEY_LEN + CRYPTO_KEY_LEN]);
        extra.copy_from_slice(&bytes[ROUTING_KEY_LEN + CRYPTO_KEY_LEN..]);
        Ok(Self::from_parts(routing, crypto, extra))
    }

    /// Encode the 69-byte binary form. The filename is not part of it.
    pub fn to_bytes(&self) -> [u8; CHK_LEN] {
        let mut out = [0u8; CHK_LEN];
        out[..ROUTING_KEY_LEN].copy_from_slice(&self.routing);
        out[ROUTING_KEY_LEN..ROUTING_KEY_LEN + CRYPTO_KEY_LEN].copy_from_slice(&self.crypto);
        out[ROUTING_KEY_LEN + CRYPTO_KEY_LEN..].copy_from_slice(&self.extra);
        out
    }

    pub fn routing_key(&self) -> &[u8; ROUTING_KEY_LEN] {
        &self.routing
    }

    pub fn crypto_key(&self) -> &[u8; CRYPTO_KEY_LEN] {
        &self.crypto
    }

    pub fn extra(&self) -> &[u8; EXTRA_LEN] {
        &self.extra
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Same key with the filename removed.
    pub fn without_filename(&self) -> Self {
        Self {
            filename: None,
            ..self.clone()
        }
    }

    /// Same key with a filename appended.
    pub fn with_filename(&self, filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..self.clone()
        }
    }

    /// True if the store will interpret the block as splitfile metadata.
    pub fn is_control_document(&self) -> bool {
        self.extra[CONTROL_BYTE] == CONTROL_DOCUMENT
    }

    /// The key with the control flag cleared.
    ///
    /// Fetching it returns the raw top metadata block of a splitfile
    /// instead of the reassembled data.
    pub fn raw_metadata(&self) -> Self {
        let mut chk = self.without_filename();
        chk.extra[CONTROL_BYTE] = 0;
        chk
    }

    /// The key with the control flag set.
    ///
    /// Used after re-inserting a modified metadata block as plain data so
    /// the resulting key resolves through the metadata again.
    pub fn as_control_document(&self) -> Self {
        let mut chk = self.clone();
        chk.extra[CONTROL_BYTE] = CONTROL_DOCUMENT;
        chk
    }
}

impl fmt::Display for Chk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CHK_PREFIX}{},{},{}",
            encoding::encode(&self.routing),
            encoding::encode(&self.crypto),
            encoding::encode(&self.extra)
        )?;
        if let Some(name) = &self.filename {
            write!(f, "/{name}")?;
        }
        Ok(())
    }
}

impl FromStr for Chk {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Chk {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Chk {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "CHK@4E2BANwYJXWPrqn~bnu9KwETk~QHkwIKO5E6ygoLYqw,\
                          6R8IaBcigOxCuMFjLCLGBSJ4oYPgMsJ8w9FdHzAQ5ws,AAMC--8";

    fn sample_chk() -> Chk {
        Chk::from_parts([7u8; ROUTING_KEY_LEN], [9u8; CRYPTO_KEY_LEN], DEFAULT_EXTRA)
    }

    #[test]
    fn test_parse_real_key() {
        let chk = Chk::parse(SAMPLE).expect("should parse");
        assert_eq!(chk.extra(), &[0x00, 0x03, 0x02, 0xff, 0xff]);
        assert!(chk.is_control_document());
        assert_eq!(chk.to_string(), SAMPLE);
    }

    #[test]
    fn test_parse_with_filename() {
        let uri = format!("{SAMPLE}/bundle.hg");
        let chk = Chk::parse(&uri).expect("should parse");
        assert_eq!(chk.filename(), Some("bundle.hg"));
        assert_eq!(chk.to_string(), uri);
        assert_eq!(chk.without_filename().to_string(), SAMPLE);
    }

    #[test]
    fn test_trailing_slash_is_not_a_filename() {
        let chk = Chk::parse(&format!("{SAMPLE}/")).expect("should parse");
        assert_eq!(chk.filename(), None);
    }

    #[test]
    fn test_rejects_other_key_types() {
        let err = Chk::parse("SSK@abc,def,AQACAAE/x").unwrap_err();
        assert!(matches!(err, KeyError::WrongKeyType { .. }));
    }

    #[test]
    fn test_rejects_missing_fields() {
        let err = Chk::parse("CHK@abc,def").unwrap_err();
        assert!(matches!(err, KeyError::MalformedKey { .. }));
    }

    #[test]
    fn test_binary_round_trip() {
        let chk = sample_chk();
        let bytes = chk.to_bytes();
        assert_eq!(bytes.len(), CHK_LEN);
        assert_eq!(Chk::from_bytes(&bytes).expect("should decode"), chk);
    }

    #[test]
    fn test_binary_rejects_short_input() {
        assert!(Chk::from_bytes(&[0u8; 68]).is_err());
    }

    #[test]
    fn test_control_flag_toggles() {
        let chk = sample_chk();
        assert!(!chk.is_control_document());
        let meta = chk.as_control_document();
        assert!(meta.is_control_document());
        assert_eq!(meta.raw_metadata(), chk);
    }
}
