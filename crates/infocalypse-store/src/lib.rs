//! Object store layer for Infocalypse.
//!
//! Everything the update engine sends to Freenet goes through this crate:
//!
//! - [`traits`]: segregated async store traits and the composite [`ObjectStore`]
//! - [`fcp`]: a multiplexed FCP 2.0 client over one socket
//! - [`memory_store`]: a deterministic in-memory store for tests
//! - [`runner`]: the round-robin request scheduler with deadlines
//!
//! # Example
//!
//! ```rust,ignore
//! use infocalypse_store::prelude::*;
//!
//! let store = Arc::new(FcpObjectStore::connect(&FcpConfig::default()).await?);
//! let mut runner = RequestRunner::new(store);
//! let outcome = runner.run(&mut [&mut my_state_machine]).await;
//! ```

pub mod constants;
pub mod error;
pub mod fcp;
pub mod memory_store;
pub mod runner;
pub mod traits;
pub mod types;

pub use constants::BLOCK_LEN;
pub use error::StoreError;
pub use error::StoreResult;
pub use fcp::FcpConfig;
pub use fcp::FcpObjectStore;
pub use memory_store::InMemoryObjectStore;
pub use runner::RequestQueue;
pub use runner::RequestRunner;
pub use runner::RunOutcome;
pub use runner::RunnerConfig;
pub use traits::KeyOps;
pub use traits::ObjectRead;
pub use traits::ObjectStore;
pub use traits::ObjectWrite;
pub use traits::RequestControl;
pub use types::ConnectionState;
pub use types::GetOptions;
pub use types::GetResult;
pub use types::Progress;
pub use types::RequestContext;
pub use types::RequestKind;
pub use types::RequestTag;
pub use types::SskKeypair;
pub use types::StoreRequest;
pub use types::StoreResponse;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::StoreError;
    pub use crate::error::StoreResult;
    pub use crate::fcp::FcpConfig;
    pub use crate::fcp::FcpObjectStore;
    pub use crate::runner::RequestQueue;
    pub use crate::runner::RequestRunner;
    pub use crate::runner::RunOutcome;
    pub use crate::traits::KeyOps;
    pub use crate::traits::ObjectRead;
    pub use crate::traits::ObjectStore;
    pub use crate::traits::ObjectWrite;
    pub use crate::types::GetOptions;
    pub use crate::types::RequestContext;
    pub use crate::types::RequestKind;
    pub use crate::types::StoreRequest;
    pub use crate::types::StoreResponse;
}
