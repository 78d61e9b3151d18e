//! Growing the graph from the local repository.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::UpdateGraph;
use super::paths::block_cost;
use crate::bundle_cache::BundleCache;
use crate::constants::BLOCK_LEN;
use crate::constants::FIRST_INDEX;
use crate::constants::MAX_METADATA_HACK_LEN;
use crate::constants::MAX_PATH_LEN;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::repo::RepoBackend;
use crate::topkey::TopKeyUpdate;
use crate::types::ChangesetId;
use crate::types::ChkSlot;
use crate::types::EdgeTriple;
use crate::types::IndexId;
use crate::types::IndexPair;
use crate::types::NULL_REV;

/// Maps every changeset covered by the graph to the first index holding it.
pub type VersionTable = BTreeMap<ChangesetId, IndexId>;

/// Result of [`UpdateGraph::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphUpdate {
    /// Every target is already in the graph; nothing changed.
    UpToDate,
    /// Edges added by the update, all with placeholder CHKs.
    Updated(Vec<EdgeTriple>),
}

/// Build the version table by walking the ancestors of every head.
pub fn build_version_table<R: RepoBackend + ?Sized>(graph: &UpdateGraph, repo: &R) -> UpdateResult<VersionTable> {
    let mut table = VersionTable::new();
    table.insert(NULL_REV, FIRST_INDEX);
    for (index, entry) in graph.indices() {
        if index == FIRST_INDEX {
            continue;
        }
        for head in &entry.heads {
            if !repo.has(head)? {
                return Err(UpdateError::Repo {
                    message: format!("graph head {head} of index {index} is not in the repository"),
                });
            }
            table.entry(*head).or_insert(index);
            for ancestor in repo.ancestors(head)? {
                table.entry(ancestor).or_insert(index);
            }
        }
    }
    Ok(table)
}

/// Bases and heads of the changesets in indices `start..=end`, as if they
/// had been inserted as one index.
pub fn get_rollup_bounds<R: RepoBackend + ?Sized>(
    graph: &UpdateGraph,
    repo: &R,
    table: &VersionTable,
    start: IndexId,
    end: IndexId,
) -> UpdateResult<(Vec<ChangesetId>, Vec<ChangesetId>)> {
    graph.get_rollup_bounds(repo, table, start, end)
}

impl UpdateGraph {
    /// See [`get_rollup_bounds`].
    ///
    /// Bases produced inside the range are dropped. Heads with a child that
    /// belongs to an index at or before `end` are dropped.
    pub fn get_rollup_bounds<R: RepoBackend + ?Sized>(
        &self,
        repo: &R,
        table: &VersionTable,
        start: IndexId,
        end: IndexId,
    ) -> UpdateResult<(Vec<ChangesetId>, Vec<ChangesetId>)> {
        if start > end || start <= FIRST_INDEX {
            return Err(UpdateError::Invariant {
                message: format!("bad rollup range {start}..={end}"),
            });
        }

        let mut bases = BTreeSet::new();
        let mut heads = BTreeSet::new();
        for index in start..=end {
            let entry = self.index(index).ok_or_else(|| UpdateError::Invariant {
                message: format!("rollup references missing index {index}"),
            })?;
            for base in &entry.bases {
                if base.is_null() || table.get(base).is_none_or(|produced| *produced < start) {
                    bases.insert(*base);
                }
            }
            for head in &entry.heads {
                let mut superseded = false;
                for child in repo.children(head)? {
                    if table.get(&child).is_some_and(|produced| *produced <= end) {
                        superseded = true;
                        break;
                    }
                }
                if !superseded {
                    heads.insert(*head);
                }
            }
        }

        if heads.is_empty() {
            return Err(UpdateError::Invariant {
                message: format!("rollup of {start}..={end} has no heads"),
            });
        }
        Ok((bases.into_iter().collect(), heads.into_iter().collect()))
    }

    /// Add an index for `targets` and the edges needed to publish it.
    ///
    /// Returns [`GraphUpdate::UpToDate`] without touching the graph when
    /// every target is already covered.
    pub fn update<R: RepoBackend + ?Sized>(
        &mut self,
        repo: &R,
        targets: &[ChangesetId],
        cache: &mut BundleCache,
    ) -> UpdateResult<GraphUpdate> {
        let mut table = build_version_table(self, repo)?;

        let mut new_heads: Vec<ChangesetId> = targets.iter().filter(|rev| !table.contains_key(*rev)).copied().collect();
        new_heads.sort();
        new_heads.dedup();
        if new_heads.is_empty() {
            debug!("graph already covers every target");
            return Ok(GraphUpdate::UpToDate);
        }

        // Walk back from the new heads to the changesets the graph knows.
        let mut bases = BTreeSet::new();
        let mut new_revs = BTreeSet::new();
        let mut interior = BTreeSet::new();
        for head in &new_heads {
            let mut queue = VecDeque::from([*head]);
            while let Some(rev) = queue.pop_front() {
                if !new_revs.insert(rev) {
                    continue;
                }
                let parents = repo.parents(&rev)?;
                if parents.is_empty() {
                    bases.insert(NULL_REV);
                }
                for parent in parents {
                    if table.contains_key(&parent) {
                        bases.insert(parent);
                    } else {
                        interior.insert(parent);
                        queue.push_back(parent);
                    }
                }
            }
        }
        // A target that is an ancestor of another target is not a head.
        new_heads.retain(|head| !interior.contains(head));

        let new_index = self.add_index(bases.iter().copied(), new_heads.iter().copied());
        for rev in &new_revs {
            table.entry(*rev).or_insert(new_index);
        }
        info!(index = new_index, heads = new_heads.len(), bases = bases.len(), "added graph index");

        let mut added = Vec::new();

        let primary = cache.make_redundant_bundle(self, repo, &table, new_index)?;
        added.push(self.add_edge(primary.pair, primary.length, ChkSlot::Pending)?);

        let canonical = self.canonical_path(new_index, usize::MAX)?;
        if canonical.len() > MAX_PATH_LEN {
            let pair = self.compress_canonical_path(&canonical, new_index);
            if self.edge(pair).is_none() {
                let shortcut = cache.make_bundle(self, repo, &table, pair)?;
                added.push(self.add_edge(pair, shortcut.length, ChkSlot::Pending)?);
                debug!(shortcut = %pair, steps = canonical.len(), "compressed canonical path");
            }
        }

        let block = BLOCK_LEN as u64;
        if primary.length <= block && primary.pair.span() > 1 {
            let pair = IndexPair::new(primary.pair.from + 1, new_index);
            if self.edge(pair).is_none() {
                let extra = cache.make_bundle(self, repo, &table, pair)?;
                added.push(self.add_edge(pair, extra.length, ChkSlot::Pending)?);
            }
        } else if primary.length <= MAX_METADATA_HACK_LEN {
            // A first publish that fits one block stays a single edge.
            if new_index != FIRST_INDEX + 1 || primary.length > block {
                added.push(self.add_edge(primary.pair, primary.length, ChkSlot::PendingAlt)?);
            }
        } else {
            warn!(
                error = %UpdateError::BundleTooLargeForSalt { length: primary.length },
                pair = %primary.pair,
                "no redundant copy for latest update"
            );
        }

        // Older canonical steps missing their redundant copy get one now.
        for edge in self.canonical_path(new_index, usize::MAX)? {
            let pair = edge.pair();
            if pair.to == new_index || self.redundancy(pair) > 1 {
                continue;
            }
            let length = self.edge_length(pair)?;
            if length <= MAX_METADATA_HACK_LEN {
                added.push(self.add_edge(pair, length, ChkSlot::PendingAlt)?);
            }
        }

        Ok(GraphUpdate::Updated(added))
    }

    /// Add redundant copies for every edge into the latest index that
    /// lacks one. Returns the new triples.
    pub fn add_latest_redundancy(&mut self) -> UpdateResult<Vec<EdgeTriple>> {
        let latest = self.latest_index();
        let missing: Vec<(IndexPair, u64)> = self
            .edges()
            .filter(|(pair, entry)| pair.to == latest && entry.chks.len() == 1 && entry.length <= MAX_METADATA_HACK_LEN)
            .map(|(pair, entry)| (pair, entry.length))
            .collect();
        missing
            .into_iter()
            .map(|(pair, length)| self.add_edge(pair, length, ChkSlot::PendingAlt))
            .collect()
    }

    /// Pick the shortcut `(from, to)` replacing the tail of an over-long
    /// canonical path: the earliest step whose own block cost is at least
    /// that of all the steps after it.
    fn compress_canonical_path(&self, path: &[EdgeTriple], to: IndexId) -> IndexPair {
        let costs: Vec<u64> = path
            .iter()
            .map(|edge| self.edge(edge.pair()).map_or(1, |entry| block_cost(entry.length)))
            .collect();
        let last_split = (MAX_PATH_LEN - 1).min(path.len().saturating_sub(2)).max(1);
        let split = (1..=last_split)
            .find(|k| costs[k - 1] >= costs[*k..].iter().sum::<u64>())
            .unwrap_or(last_split);
        IndexPair::new(path[split].from, to)
    }

    /// Updates for the top-key, most useful first.
    ///
    /// Pairs advertised by [`UpdateGraph::get_top_key_edges`] become one
    /// update each, with their resolved CHKs and rolled-up bounds.
    pub fn get_top_key_updates<R: RepoBackend + ?Sized>(&self, repo: &R) -> UpdateResult<Vec<TopKeyUpdate>> {
        let table = build_version_table(self, repo)?;
        let mut pairs: Vec<IndexPair> = Vec::new();
        for edge in self.get_top_key_edges()? {
            if !pairs.contains(&edge.pair()) {
                pairs.push(edge.pair());
            }
        }

        let mut updates = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let Some(entry) = self.edge(pair) else {
                continue;
            };
            let chks: Vec<_> = entry.chks.iter().filter_map(ChkSlot::chk).cloned().collect();
            if chks.is_empty() {
                continue;
            }
            let (parents, heads) = self.get_rollup_bounds(repo, &table, pair.from + 1, pair.to)?;
            updates.push(TopKeyUpdate {
                length: entry.length,
                parents,
                heads,
                chks,
                parents_complete: true,
                heads_complete: true,
            });
        }
        Ok(updates)
    }
}
