//! The update graph.
//!
//! Vertices are indices `-1, 0, 1, ...`, each labeled with the base and
//! head changesets of one insert. Edges are incremental bundles between
//! indices; a pair may carry two redundant copies (ordinals 0 and 1) at
//! different CHKs.
//!
//! The graph is a plain value. Callers clone it before [`UpdateGraph::update`]
//! so a failed insert leaves the published graph untouched.

mod format;
mod minimize;
mod paths;
mod update;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use infocalypse_keys::Chk;

pub use paths::UpdatePath;
pub use paths::block_cost;
pub use update::GraphUpdate;
pub use update::VersionTable;
pub use update::build_version_table;
pub use update::get_rollup_bounds;

use crate::constants::BLOCK_LEN;
use crate::constants::FIRST_INDEX;
use crate::constants::MAX_METADATA_HACK_LEN;
use crate::constants::MAX_ORDINALS;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::types::ChangesetId;
use crate::types::ChkSlot;
use crate::types::EdgeTriple;
use crate::types::IndexId;
use crate::types::IndexPair;
use crate::types::InsertType;
use crate::types::NULL_REV;

/// Labels of one graph index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexEntry {
    pub bases: BTreeSet<ChangesetId>,
    pub heads: BTreeSet<ChangesetId>,
}

impl IndexEntry {
    pub fn new(bases: impl IntoIterator<Item = ChangesetId>, heads: impl IntoIterator<Item = ChangesetId>) -> Self {
        Self {
            bases: bases.into_iter().collect(),
            heads: heads.into_iter().collect(),
        }
    }
}

/// Length and CHK slots shared by every ordinal of an index pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeEntry {
    pub length: u64,
    pub chks: Vec<ChkSlot>,
}

/// The update graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateGraph {
    indices: BTreeMap<IndexId, IndexEntry>,
    edges: BTreeMap<IndexPair, EdgeEntry>,
}

impl Default for UpdateGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateGraph {
    /// A graph holding only the empty-repository index.
    pub fn new() -> Self {
        let mut indices = BTreeMap::new();
        indices.insert(FIRST_INDEX, IndexEntry::new([], [NULL_REV]));
        Self {
            indices,
            edges: BTreeMap::new(),
        }
    }

    pub fn latest_index(&self) -> IndexId {
        self.indices.keys().next_back().copied().unwrap_or(FIRST_INDEX)
    }

    pub fn index(&self, index: IndexId) -> Option<&IndexEntry> {
        self.indices.get(&index)
    }

    pub fn indices(&self) -> impl Iterator<Item = (IndexId, &IndexEntry)> {
        self.indices.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn edges(&self) -> impl Iterator<Item = (IndexPair, &EdgeEntry)> {
        self.edges.iter().map(|(pair, entry)| (*pair, entry))
    }

    pub fn edge(&self, pair: IndexPair) -> Option<&EdgeEntry> {
        self.edges.get(&pair)
    }

    /// Every edge triple, in pair order.
    pub fn triples(&self) -> Vec<EdgeTriple> {
        self.edges
            .iter()
            .flat_map(|(pair, entry)| (0..entry.chks.len()).map(move |ordinal| pair.triple(ordinal as u8)))
            .collect()
    }

    /// Number of redundant copies stored for a pair.
    pub fn redundancy(&self, pair: IndexPair) -> usize {
        self.edges.get(&pair).map_or(0, |entry| entry.chks.len())
    }

    pub fn edge_length(&self, pair: IndexPair) -> UpdateResult<u64> {
        self.edges.get(&pair).map(|entry| entry.length).ok_or_else(|| UpdateError::Invariant {
            message: format!("no edge {pair}"),
        })
    }

    /// Heads of the latest index.
    pub fn latest_heads(&self) -> Vec<ChangesetId> {
        self.indices
            .values()
            .next_back()
            .map(|entry| entry.heads.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Append an index after the current latest one.
    pub fn add_index(
        &mut self,
        bases: impl IntoIterator<Item = ChangesetId>,
        heads: impl IntoIterator<Item = ChangesetId>,
    ) -> IndexId {
        let index = self.latest_index() + 1;
        self.indices.insert(index, IndexEntry::new(bases, heads));
        index
    }

    /// Add an edge, or a redundant copy of an existing pair.
    ///
    /// Every ordinal of a pair shares one bundle length.
    pub fn add_edge(&mut self, pair: IndexPair, length: u64, slot: ChkSlot) -> UpdateResult<EdgeTriple> {
        if pair.from >= pair.to {
            return Err(UpdateError::Invariant {
                message: format!("edge {pair} does not advance"),
            });
        }
        for endpoint in [pair.from, pair.to] {
            if !self.indices.contains_key(&endpoint) {
                return Err(UpdateError::Invariant {
                    message: format!("edge {pair} references missing index {endpoint}"),
                });
            }
        }

        let entry = self.edges.entry(pair).or_insert_with(|| EdgeEntry {
            length,
            chks: Vec::with_capacity(MAX_ORDINALS),
        });
        if entry.length != length {
            return Err(UpdateError::Invariant {
                message: format!("edge {pair} has length {} not {length}", entry.length),
            });
        }
        if entry.chks.len() >= MAX_ORDINALS {
            return Err(UpdateError::Invariant {
                message: format!("edge {pair} already has {MAX_ORDINALS} copies"),
            });
        }
        entry.chks.push(slot);
        Ok(pair.triple((entry.chks.len() - 1) as u8))
    }

    pub fn get_chk(&self, edge: EdgeTriple) -> UpdateResult<&ChkSlot> {
        self.edges
            .get(&edge.pair())
            .and_then(|entry| entry.chks.get(edge.ordinal as usize))
            .ok_or_else(|| UpdateError::Invariant {
                message: format!("no edge {edge}"),
            })
    }

    /// Resolve a placeholder once its insert has completed.
    pub fn set_chk(&mut self, edge: EdgeTriple, length: u64, chk: Chk) -> UpdateResult<()> {
        let entry = self.edges.get_mut(&edge.pair()).ok_or_else(|| UpdateError::Invariant {
            message: format!("no edge {edge}"),
        })?;
        if entry.length != length {
            return Err(UpdateError::Invariant {
                message: format!("edge {edge} has length {} not {length}", entry.length),
            });
        }
        let slot = entry.chks.get_mut(edge.ordinal as usize).ok_or_else(|| UpdateError::Invariant {
            message: format!("no edge {edge}"),
        })?;
        *slot = ChkSlot::Chk(chk.without_filename());
        Ok(())
    }

    /// Edges whose CHK has not been filled in yet.
    pub fn pending_edges(&self) -> Vec<EdgeTriple> {
        self.triples()
            .into_iter()
            .filter(|edge| self.get_chk(*edge).is_ok_and(ChkSlot::is_pending))
            .collect()
    }

    /// Find the edge stored under `chk`, ignoring any filename.
    pub fn find_chk(&self, chk: &Chk) -> Option<EdgeTriple> {
        let wanted = chk.without_filename();
        self.edges.iter().find_map(|(pair, entry)| {
            entry
                .chks
                .iter()
                .position(|slot| slot.chk() == Some(&wanted))
                .map(|ordinal| pair.triple(ordinal as u8))
        })
    }

    /// Pairs `(f, t)` with `f < index <= t`.
    pub fn edges_containing(&self, index: IndexId) -> Vec<IndexPair> {
        self.edges.keys().filter(|pair| pair.contains(index)).copied().collect()
    }

    /// How the bundle for `edge` must be inserted.
    pub fn insert_type(&self, edge: EdgeTriple) -> UpdateResult<InsertType> {
        let length = self.edge_length(edge.pair())?;
        if edge.ordinal == 0 {
            return Ok(InsertType::Normal);
        }
        Ok(if length <= BLOCK_LEN as u64 {
            InsertType::Padded
        } else if length <= MAX_METADATA_HACK_LEN {
            InsertType::SaltedMetadata
        } else {
            InsertType::Huge
        })
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> UpdateResult<()> {
        let invariant = |message: String| Err(UpdateError::Invariant { message });

        let first = self.indices.get(&FIRST_INDEX);
        if first != Some(&IndexEntry::new([], [NULL_REV])) {
            return invariant("index -1 must be the empty-repository sentinel".to_string());
        }
        for (expected, index) in (FIRST_INDEX..).zip(self.indices.keys()) {
            if *index != expected {
                return invariant(format!("index {expected} is missing"));
            }
        }

        let mut seen_heads: BTreeMap<ChangesetId, IndexId> = BTreeMap::new();
        for (index, entry) in &self.indices {
            if entry.heads.is_empty() {
                return invariant(format!("index {index} has no heads"));
            }
            for head in &entry.heads {
                if let Some(other) = seen_heads.insert(*head, *index) {
                    return invariant(format!("{head} is a head of both {other} and {index}"));
                }
            }
        }

        for (pair, entry) in &self.edges {
            if pair.from >= pair.to || !self.indices.contains_key(&pair.from) || !self.indices.contains_key(&pair.to) {
                return invariant(format!("edge {pair} is not between existing indices"));
            }
            if entry.chks.is_empty() || entry.chks.len() > MAX_ORDINALS {
                return invariant(format!("edge {pair} has {} copies", entry.chks.len()));
            }
        }
        Ok(())
    }

    pub(crate) fn from_parts(indices: BTreeMap<IndexId, IndexEntry>, edges: BTreeMap<IndexPair, EdgeEntry>) -> Self {
        Self { indices, edges }
    }
}
