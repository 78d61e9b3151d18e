//! Freenet key codecs for Infocalypse.
//!
//! - [`Chk`]: content hash keys for immutable blocks, in text and the
//!   69-byte binary form carried by top-keys.
//! - [`Usk`] / [`Ssk`]: updatable and signed subspace keys, the `.R1`/`.R0`
//!   redundancy convention and the per-repository USK hash.
//! - [`encoding`]: Freenet's base64 alphabet.

pub mod chk;
pub mod encoding;
pub mod error;
pub mod usk;

pub use chk::CHK_LEN;
pub use chk::Chk;
pub use error::KeyError;
pub use error::KeyResult;
pub use usk::Ssk;
pub use usk::Usk;
