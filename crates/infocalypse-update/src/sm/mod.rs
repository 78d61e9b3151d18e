//! Request-driven state machines for inserting and pulling.
//!
//! Both machines are [`RequestQueue`](infocalypse_store::RequestQueue)s:
//! the runner asks them for work and hands back results, and every state
//! transition happens inside those callbacks. Nothing here touches the
//! network directly.
//!
//! ```text
//!   insert: InvertingKey ─► RequestingPrevTopKey ─► RequestingPrevGraph
//!                │                                        │
//!                └──────────(create)──────► InsertingBundles ◄┘
//!                                                 │
//!                          InsertingGraph ◄───────┘
//!                                │
//!                          InsertingTopKey ─► Finishing ─► Quiescent
//!
//!   pull:   RequestingTopKey ─► RequiresGraph ─┬► RequestingBundles ─► Finishing
//!                                              └► RequestingGraph ──┘
//! ```

mod context;
mod insert;
mod pull;
mod requests;

use infocalypse_keys::Usk;
pub use context::SmContext;
pub use insert::InsertMachine;
pub use insert::InsertMode;
pub use insert::InsertOutcome;
pub use insert::InsertParams;
pub use insert::InsertReport;
pub use pull::PullMachine;
pub use pull::PullOutcome;
pub use pull::PullParams;
pub use pull::PullReport;
pub use requests::RequestSet;

/// Both name variants of a repository USK at `version`.
///
/// A name ending in `.R1` also publishes under `.R0`.
pub fn top_key_uris(usk: &Usk, version: i64) -> Vec<Usk> {
    usk.with_version(version).redundant_variants()
}
