//! Command implementations.

pub mod genkey;
pub mod info;
pub mod publish;
pub mod pull;
