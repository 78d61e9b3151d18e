//! Error types for key parsing.

use snafu::Snafu;

/// Errors produced while parsing or converting Freenet keys.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum KeyError {
    /// The URI does not start with the expected key type.
    #[snafu(display("expected a {expected} key, got: {uri}"))]
    WrongKeyType { expected: &'static str, uri: String },

    /// The routing/crypto/extra triple is malformed.
    #[snafu(display("malformed key material in {uri}: {reason}"))]
    MalformedKey { uri: String, reason: String },

    /// A key field was not valid Freenet base64.
    #[snafu(display("invalid base64 in {field} field: {value}"))]
    InvalidBase64 { field: &'static str, value: String },

    /// A decoded field has the wrong number of bytes.
    #[snafu(display("{field} must be {expected} bytes, got {actual}"))]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The USK path is missing its name or version.
    #[snafu(display("invalid USK path in {uri}: {reason}"))]
    InvalidUskPath { uri: String, reason: String },
}

/// Result alias for key operations.
pub type KeyResult<T> = Result<T, KeyError>;
