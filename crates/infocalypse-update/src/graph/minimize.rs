//! Shrinking the graph to fit one store block.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use tracing::debug;
use tracing::warn;

use super::EdgeEntry;
use super::IndexEntry;
use super::UpdateGraph;
use super::update::VersionTable;
use super::update::build_version_table;
use crate::constants::FIRST_INDEX;
use crate::error::UpdateResult;
use crate::repo::RepoBackend;
use crate::types::IndexId;
use crate::types::IndexPair;

/// Rollup bounds already computed for a `(start, end)` range.
type BoundsCache = HashMap<(IndexId, IndexId), IndexEntry>;

impl UpdateGraph {
    /// A subgraph whose text form fits in `max_bytes` where possible.
    ///
    /// Always keeps the top-key edges and the canonical path of the latest
    /// index. Then adds canonical paths of older indices, newest first,
    /// then any remaining edges, newest first, as long as the result still
    /// fits. Indices no retained edge touches are merged into the next
    /// surviving index and the survivors renumbered.
    pub fn minimize<R: RepoBackend + ?Sized>(&self, repo: &R, max_bytes: usize) -> UpdateResult<UpdateGraph> {
        if self.serialized_len() <= max_bytes {
            return Ok(self.clone());
        }

        let table = build_version_table(self, repo)?;
        let mut bounds = BoundsCache::new();
        let latest = self.latest_index();

        let mut retained: BTreeSet<IndexPair> = BTreeSet::new();
        retained.extend(self.get_top_key_edges()?.iter().map(|edge| edge.pair()));
        retained.extend(self.canonical_path(latest, usize::MAX)?.iter().map(|edge| edge.pair()));

        let mut best = self.coalesce(repo, &table, &retained, &mut bounds)?;
        if best.serialized_len() > max_bytes {
            warn!(
                len = best.serialized_len(),
                max_bytes, "graph does not fit even with only required edges"
            );
            return Ok(best);
        }

        let mut candidates: Vec<IndexPair> = Vec::new();
        for index in (0..latest).rev() {
            if let Ok(path) = self.canonical_path(index, usize::MAX) {
                candidates.extend(path.iter().map(|edge| edge.pair()));
            }
        }
        let mut rest: Vec<IndexPair> = self.edges().map(|(pair, _)| pair).collect();
        rest.sort_by_key(|pair| std::cmp::Reverse((pair.to, pair.from)));
        candidates.extend(rest);

        for pair in candidates {
            if retained.contains(&pair) {
                continue;
            }
            retained.insert(pair);
            let trial = self.coalesce(repo, &table, &retained, &mut bounds)?;
            if trial.serialized_len() <= max_bytes {
                best = trial;
            } else {
                retained.remove(&pair);
            }
        }

        debug!(
            before = self.serialized_len(),
            after = best.serialized_len(),
            edges = retained.len(),
            "minimized graph"
        );
        Ok(best)
    }

    /// Keep `retained` edges, merge every other index into the next
    /// surviving one and renumber.
    fn coalesce<R: RepoBackend + ?Sized>(
        &self,
        repo: &R,
        table: &VersionTable,
        retained: &BTreeSet<IndexPair>,
        bounds: &mut BoundsCache,
    ) -> UpdateResult<UpdateGraph> {
        let mut survivors: BTreeSet<IndexId> = BTreeSet::from([FIRST_INDEX, self.latest_index()]);
        for pair in retained {
            survivors.insert(pair.from);
            survivors.insert(pair.to);
        }

        let mut renumber: BTreeMap<IndexId, IndexId> = BTreeMap::new();
        let mut indices: BTreeMap<IndexId, IndexEntry> = BTreeMap::new();
        let mut previous: Option<IndexId> = None;
        for (new_id, old_id) in (FIRST_INDEX..).zip(survivors.iter().copied()) {
            let entry = match previous {
                None => self.index(old_id).cloned().unwrap_or_default(),
                Some(prev) if prev + 1 == old_id => self.index(old_id).cloned().unwrap_or_default(),
                Some(prev) => {
                    let range = (prev + 1, old_id);
                    if let Some(entry) = bounds.get(&range) {
                        entry.clone()
                    } else {
                        let (bases, heads) = self.get_rollup_bounds(repo, table, range.0, range.1)?;
                        let entry = IndexEntry::new(bases, heads);
                        bounds.insert(range, entry.clone());
                        entry
                    }
                }
            };
            renumber.insert(old_id, new_id);
            indices.insert(new_id, entry);
            previous = Some(old_id);
        }

        let mut edges: BTreeMap<IndexPair, EdgeEntry> = BTreeMap::new();
        for pair in retained {
            if let (Some(entry), Some(from), Some(to)) = (self.edge(*pair), renumber.get(&pair.from), renumber.get(&pair.to))
            {
                edges.insert(IndexPair::new(*from, *to), entry.clone());
            }
        }
        Ok(UpdateGraph::from_parts(indices, edges))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle_cache::BundleCache;
    use crate::constants::GRAPH_INSERT_LEN;
    use crate::graph::GraphUpdate;
    use crate::repo::MemoryRepo;
    use crate::types::ChkSlot;

    /// A published graph with `count` single-changeset updates, all CHKs
    /// resolved.
    fn published(count: usize, payload: usize) -> (MemoryRepo, UpdateGraph) {
        let mut repo = MemoryRepo::new();
        let mut graph = UpdateGraph::new();
        let mut cache = BundleCache::new(None).unwrap();
        let mut tip = None;
        let mut n: u8 = 0;
        for _ in 0..count {
            let parents: Vec<_> = tip.into_iter().collect();
            let rev = repo.commit(&parents, payload).unwrap();
            if let GraphUpdate::Updated(edges) = graph.update(&repo, &[rev], &mut cache).unwrap() {
                for edge in edges {
                    n = n.wrapping_add(1);
                    let length = graph.edge_length(edge.pair()).unwrap();
                    graph.set_chk(edge, length, crate::graph::test_support::chk(n)).unwrap();
                }
            }
            tip = Some(rev);
        }
        (repo, graph)
    }

    #[test]
    fn test_minimize_noop_when_small() {
        let (repo, graph) = published(3, 100);
        assert_eq!(graph.minimize(&repo, GRAPH_INSERT_LEN).unwrap(), graph);
    }

    #[test]
    fn test_minimize_fits_and_keeps_top_key_edges() {
        let (repo, graph) = published(120, 100);
        assert!(graph.serialized_len() > 8 * 1024);

        let small = graph.minimize(&repo, 8 * 1024).unwrap();
        assert!(small.serialized_len() <= 8 * 1024);
        assert!(small.pending_edges().is_empty());

        let reparsed = UpdateGraph::parse(&small.to_text()).unwrap();
        assert_eq!(reparsed, small);
        assert_eq!(small.latest_heads(), graph.latest_heads());

        for edge in small.get_top_key_edges().unwrap() {
            let entry = small.edge(edge.pair()).unwrap();
            let slot = &entry.chks[edge.ordinal as usize];
            let original = graph
                .edges()
                .find(|(_, original)| original.length == entry.length && original.chks.contains(slot));
            assert!(original.is_some(), "top key edge {edge} lost its original");
        }
    }

    #[test]
    fn test_minimize_coalesces_dropped_indices() {
        let (repo, graph) = published(40, 100);
        let small = graph.minimize(&repo, 2 * 1024).unwrap();
        assert!(small.latest_index() < graph.latest_index());
        small.validate().unwrap();
        // Every surviving edge still has a canonical route to the end.
        assert!(small.canonical_path(small.latest_index(), usize::MAX).is_ok());
        assert!(small.edges().all(|(_, entry)| entry.chks.iter().all(|slot| matches!(slot, ChkSlot::Chk(_)))));
    }
}
