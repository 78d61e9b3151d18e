//! Freenet Client Protocol (FCP 2.0) transport.
//!
//! One socket carries every request. [`FcpObjectStore`] writes requests
//! tagged with an `Identifier`, and a reader task routes each reply back to
//! the waiting request by that identifier.

mod client;
mod codec;
mod message;

pub use client::FcpConfig;
pub use client::FcpObjectStore;
pub use codec::FcpCodec;
pub use message::FcpMessage;
