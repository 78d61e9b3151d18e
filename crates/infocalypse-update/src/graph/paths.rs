//! Path planning over the graph.
//!
//! A path is a sequence of pairs where each step starts at or before the
//! index the previous step reached: applying `(f, t)` to a repository that
//! already holds everything through `a` is valid whenever `f <= a < t`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use rand::Rng;

use super::UpdateGraph;
use crate::constants::BLOCK_LEN;
use crate::constants::CHEAP_PATH_FACTOR;
use crate::constants::FIRST_INDEX;
use crate::constants::MAX_ENUMERATED_PATHS;
use crate::constants::MAX_PATH_LEN;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::types::EdgeTriple;
use crate::types::IndexId;
use crate::types::IndexPair;

/// A sequence of pairs, applied in order.
pub type UpdatePath = Vec<IndexPair>;

/// Store blocks needed to fetch a bundle of `length` bytes.
pub fn block_cost(length: u64) -> u64 {
    length.div_ceil(BLOCK_LEN as u64).max(1)
}

/// Ordering key for canonical path search: fewer steps, then fewer bytes,
/// then more redundant copies.
type PathCost = (usize, u64, i64);

impl UpdateGraph {
    fn path_cost(&self, path: &[IndexPair]) -> u64 {
        path.iter()
            .map(|pair| self.edge(*pair).map_or(0, |entry| block_cost(entry.length)))
            .sum()
    }

    /// The preferred bootstrap path from the empty repository to `to`.
    ///
    /// Returns ordinal 0 of each step. Fails with `NoPath` when no path of
    /// at most `max_len` steps exists.
    pub fn canonical_path(&self, to: IndexId, max_len: usize) -> UpdateResult<Vec<EdgeTriple>> {
        let no_path = || UpdateError::NoPath { from: FIRST_INDEX, to };
        if to <= FIRST_INDEX || self.index(to).is_none() {
            return Err(no_path());
        }

        // best[a] = cheapest way to hold everything through index a, and
        // the step plus prior state that got there.
        let mut best: BTreeMap<IndexId, (PathCost, Option<(IndexPair, IndexId)>)> = BTreeMap::new();
        best.insert(FIRST_INDEX, ((0, 0, 0), None));
        for reached in FIRST_INDEX..to {
            let Some(&((steps, bytes, redundancy), _)) = best.get(&reached) else {
                continue;
            };
            for (pair, entry) in self.edges() {
                if !(pair.from <= reached && reached < pair.to && pair.to <= to) {
                    continue;
                }
                let cost = (steps + 1, bytes + entry.length, redundancy - entry.chks.len() as i64);
                let better = best.get(&pair.to).is_none_or(|(current, _)| cost < *current);
                if better {
                    best.insert(pair.to, (cost, Some((pair, reached))));
                }
            }
        }

        let Some(((steps, _, _), _)) = best.get(&to) else {
            return Err(no_path());
        };
        if *steps > max_len {
            return Err(no_path());
        }

        let mut path = Vec::with_capacity(*steps);
        let mut at = to;
        while let Some((_, Some((pair, prior)))) = best.get(&at) {
            path.push(pair.triple(0));
            at = *prior;
        }
        path.reverse();
        Ok(path)
    }

    /// Enumerate paths whose first step contains `containing_start` and
    /// whose last step reaches at least `to_end`.
    ///
    /// Bounded by `max_len` steps and [`MAX_ENUMERATED_PATHS`] results.
    pub fn enumerate_update_paths(&self, containing_start: IndexId, to_end: IndexId, max_len: usize) -> Vec<UpdatePath> {
        let mut out = Vec::new();
        let mut partial = Vec::with_capacity(max_len);
        self.enumerate_from(containing_start, to_end, max_len, &mut partial, &mut out);
        out
    }

    fn enumerate_from(
        &self,
        start: IndexId,
        to_end: IndexId,
        max_len: usize,
        partial: &mut UpdatePath,
        out: &mut Vec<UpdatePath>,
    ) {
        if partial.len() >= max_len {
            return;
        }
        for pair in self.edges_containing(start) {
            if out.len() >= MAX_ENUMERATED_PATHS {
                return;
            }
            partial.push(pair);
            if pair.to >= to_end {
                out.push(partial.clone());
            } else {
                self.enumerate_from(pair.to + 1, to_end, max_len, partial, out);
            }
            partial.pop();
        }
    }

    /// Edges a top-key advertises, most useful first.
    ///
    /// The cheapest single-step updates into the latest index (two when
    /// they tie), followed by the canonical path of the latest index from
    /// newest step to oldest. Every ordinal of a chosen pair is included.
    pub fn get_top_key_edges(&self) -> UpdateResult<Vec<EdgeTriple>> {
        let latest = self.latest_index();
        if latest == FIRST_INDEX {
            return Ok(Vec::new());
        }

        let mut single: Vec<(u64, IndexPair)> = self
            .edges()
            .filter(|(pair, _)| pair.to == latest)
            .map(|(pair, entry)| (block_cost(entry.length), pair))
            .collect();
        single.sort_by_key(|(cost, pair)| (*cost, std::cmp::Reverse(pair.from)));

        let mut pairs: Vec<IndexPair> = Vec::new();
        if let Some((cheapest, first)) = single.first() {
            pairs.push(*first);
            if let Some((cost, second)) = single.get(1)
                && cost == cheapest
            {
                pairs.push(*second);
            }
        }

        let mut canonical: Vec<IndexPair> =
            self.canonical_path(latest, usize::MAX)?.into_iter().map(|edge| edge.pair()).collect();
        canonical.reverse();
        for pair in canonical {
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }

        Ok(pairs
            .into_iter()
            .flat_map(|pair| (0..self.redundancy(pair)).map(move |ordinal| pair.triple(ordinal as u8)))
            .collect())
    }

    /// Choose the next bundles to request when the local repository holds
    /// everything through `from_index`.
    ///
    /// Returns `(first_priority, second_priority)`. First priority holds the
    /// steps of every path costing at most twice the cheapest one. Second
    /// priority holds canonical path steps past `from_index`, backfilled
    /// with any edge containing `from_index + 1`. At most `redundancy`
    /// edges are returned in total. Triples in `known` are skipped, and when
    /// both copies of a pair are unknown one is picked at random.
    pub fn get_update_edges<R: Rng + ?Sized>(
        &self,
        from_index: IndexId,
        redundancy: usize,
        known: &BTreeSet<EdgeTriple>,
        rng: &mut R,
    ) -> UpdateResult<(Vec<EdgeTriple>, Vec<EdgeTriple>)> {
        let latest = self.latest_index();
        if from_index >= latest {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut paths: Vec<(u64, UpdatePath)> = self
            .enumerate_update_paths(from_index + 1, latest, MAX_PATH_LEN)
            .into_iter()
            .map(|path| (self.path_cost(&path), path))
            .collect();
        paths.sort_by_key(|(cost, path)| (*cost, path.len()));

        let mut first_pairs: Vec<IndexPair> = Vec::new();
        if let Some((cheapest, _)) = paths.first() {
            let limit = cheapest.saturating_mul(CHEAP_PATH_FACTOR);
            for (_, path) in paths.iter().filter(|(cost, _)| *cost <= limit) {
                for pair in path {
                    if !first_pairs.contains(pair) {
                        first_pairs.push(*pair);
                    }
                }
            }
        }

        let mut second_pairs: Vec<IndexPair> = self
            .canonical_path(latest, usize::MAX)
            .map(|path| path.into_iter().map(|edge| edge.pair()).filter(|pair| pair.to > from_index).collect())
            .unwrap_or_default();
        second_pairs.sort_by_key(|pair| pair.to);
        for pair in self.edges_containing(from_index + 1) {
            if !second_pairs.contains(&pair) {
                second_pairs.push(pair);
            }
        }

        let mut taken: BTreeSet<IndexPair> = BTreeSet::new();
        let mut pick = |pairs: Vec<IndexPair>, budget: usize, rng: &mut R| -> Vec<EdgeTriple> {
            let mut chosen = Vec::new();
            for pair in pairs {
                if chosen.len() >= budget {
                    break;
                }
                if taken.contains(&pair) {
                    continue;
                }
                if let Some(edge) = self.choose_ordinal(pair, known, rng) {
                    taken.insert(pair);
                    chosen.push(edge);
                }
            }
            chosen
        };
        let first = pick(first_pairs, redundancy, &mut *rng);
        let second = pick(second_pairs, redundancy.saturating_sub(first.len()), &mut *rng);
        Ok((first, second))
    }

    fn choose_ordinal<R: Rng + ?Sized>(
        &self,
        pair: IndexPair,
        known: &BTreeSet<EdgeTriple>,
        rng: &mut R,
    ) -> Option<EdgeTriple> {
        let unknown: Vec<EdgeTriple> = (0..self.redundancy(pair))
            .map(|ordinal| pair.triple(ordinal as u8))
            .filter(|edge| !known.contains(edge))
            .collect();
        match unknown.len() {
            0 => None,
            1 => Some(unknown[0]),
            n => Some(unknown[rng.random_range(0..n)]),
        }
    }
}
