//! Update engine for Mercurial repositories published on Freenet.
//!
//! A repository is published as a set of bundles plus an update graph that
//! says which bundle takes you from which version to which. A small
//! top-key record at the repository's USK points at the graph and the
//! newest bundles.
//!
//! - [`graph`]: the update graph, path selection and minimization
//! - [`topkey`]: the binary top-key codec
//! - [`bundle_cache`]: on-disk bundles for one operation
//! - [`repo`]: the version control backend
//! - [`sm`]: the insert and pull state machines
//! - [`ops`]: top-level operations driving the machines on a store
//! - [`config`]: the persisted TOML config
//!
//! # Example
//!
//! ```rust,ignore
//! use infocalypse_update::prelude::*;
//!
//! let store = Arc::new(FcpObjectStore::connect(&FcpConfig::default()).await?);
//! let mut session = Session::new(store, Config::default());
//! let repo = MercurialRepo::open(".")?;
//! let report = ops::push(&mut session, &repo, Some(repo.root()), &insert_uri).await?;
//! println!("published version {}", report.version);
//! ```

pub mod bundle_cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod graph;
pub mod ops;
pub mod repo;
pub mod sm;
pub mod topkey;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use error::UpdateError;
pub use error::UpdateResult;
pub use graph::UpdateGraph;
pub use ops::Session;
pub use repo::RepoBackend;
pub use topkey::TopKey;
pub use topkey::TopKeyUpdate;
pub use types::ChangesetId;
pub use types::EdgeTriple;
pub use types::IndexPair;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::UpdateError;
    pub use crate::error::UpdateResult;
    pub use crate::graph::UpdateGraph;
    pub use crate::ops;
    pub use crate::ops::RepoInfo;
    pub use crate::ops::Session;
    pub use crate::repo::MemoryRepo;
    pub use crate::repo::MercurialRepo;
    pub use crate::repo::RepoBackend;
    pub use crate::sm::InsertMode;
    pub use crate::sm::InsertOutcome;
    pub use crate::sm::InsertReport;
    pub use crate::sm::PullOutcome;
    pub use crate::sm::PullReport;
    pub use crate::topkey::TopKey;
    pub use crate::types::ChangesetId;
}
