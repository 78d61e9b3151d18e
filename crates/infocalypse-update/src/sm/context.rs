//! Per-machine bookkeeping shared across states.

use std::collections::HashSet;

use infocalypse_store::RequestTag;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Orphans, pending cancellations and the shutdown signal of one machine.
///
/// Orphaned requests keep running after their state has moved on; their
/// results are discarded when they arrive.
#[derive(Debug, Default)]
pub struct SmContext {
    orphans: HashSet<RequestTag>,
    cancellations: Vec<RequestTag>,
    shutdown: CancellationToken,
}

impl SmContext {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            ..Self::default()
        }
    }

    /// Let requests finish but ignore their results.
    pub fn orphan(&mut self, tags: impl IntoIterator<Item = RequestTag>) {
        for tag in tags {
            debug!(tag = %tag, "orphaning request");
            self.orphans.insert(tag);
        }
    }

    /// Ask the runner to cancel requests on its next tick.
    pub fn cancel(&mut self, tags: impl IntoIterator<Item = RequestTag>) {
        self.cancellations.extend(tags);
    }

    /// True (once) if `tag` was orphaned.
    pub fn take_orphan(&mut self, tag: &RequestTag) -> bool {
        self.orphans.remove(tag)
    }

    pub fn drain_cancellations(&mut self) -> Vec<RequestTag> {
        std::mem::take(&mut self.cancellations)
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
