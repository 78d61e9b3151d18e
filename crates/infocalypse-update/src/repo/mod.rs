//! Version control backends.
//!
//! The update engine only needs a narrow view of the repository: the
//! changeset DAG, bundle creation and bundle application.
//!
//! - [`MercurialRepo`]: shells out to `hg`
//! - [`MemoryRepo`]: an in-memory DAG for tests

mod hg;
mod memory;

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::path::Path;

pub use hg::MercurialRepo;
pub use memory::MemoryRepo;

use crate::error::UpdateResult;
use crate::types::ChangesetId;

/// The repository operations the update engine relies on.
pub trait RepoBackend: Send + Sync {
    /// Current heads.
    fn heads(&self) -> UpdateResult<Vec<ChangesetId>>;

    fn has(&self, rev: &ChangesetId) -> UpdateResult<bool>;

    /// Direct parents, never including `NULL_REV`.
    fn parents(&self, rev: &ChangesetId) -> UpdateResult<Vec<ChangesetId>>;

    /// Direct children.
    fn children(&self, rev: &ChangesetId) -> UpdateResult<Vec<ChangesetId>>;

    /// All ancestors of `rev`, excluding `rev` itself.
    fn ancestors(&self, rev: &ChangesetId) -> UpdateResult<Vec<ChangesetId>> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<ChangesetId> = self.parents(rev)?.into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.parents(&next)?);
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Write a bundle of everything reachable from `heads` but not from
    /// `bases` to `out`, returning its length.
    fn make_bundle(&self, bases: &[ChangesetId], heads: &[ChangesetId], out: &Path) -> UpdateResult<u64>;

    /// Pull the changesets in a bundle file into the repository.
    fn apply_bundle(&mut self, bundle: &Path) -> UpdateResult<()>;

    /// Resolve a revision spec such as `tip` or a hex id.
    fn hex_of(&self, rev_spec: &str) -> UpdateResult<ChangesetId>;

    /// True if every rev is present. `NULL_REV` always is.
    fn has_all(&self, revs: &[ChangesetId]) -> UpdateResult<bool> {
        for rev in revs {
            if !rev.is_null() && !self.has(rev)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
