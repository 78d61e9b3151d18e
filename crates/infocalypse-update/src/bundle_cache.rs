//! On-disk cache of bundles keyed by index pair.
//!
//! Files live in a private temporary directory that is removed when the
//! cache is dropped. Both bundles generated from the local repository and
//! bundles fetched from the store are kept here.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use bytes::Bytes;
use snafu::ResultExt;
use tempfile::TempDir;
use tracing::debug;

use crate::constants::BLOCK_LEN;
use crate::constants::FIRST_INDEX;
use crate::constants::MAX_REDUNDANT_LENGTH;
use crate::constants::PAD_BYTE;
use crate::error::IoSnafu;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::graph::UpdateGraph;
use crate::graph::VersionTable;
use crate::repo::RepoBackend;
use crate::types::IndexId;
use crate::types::IndexPair;

/// A bundle file for one index pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub pair: IndexPair,
    pub length: u64,
    pub path: PathBuf,
}

/// Memoizing bundle cache.
#[derive(Debug)]
pub struct BundleCache {
    dir: TempDir,
    bundles: HashMap<IndexPair, BundleFile>,
}

impl BundleCache {
    /// Create a cache under `parent`, or the system temp dir.
    pub fn new(parent: Option<&Path>) -> UpdateResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("infocalypse-");
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
                builder.tempdir_in(parent).context(IoSnafu { path: parent })?
            }
            None => builder.tempdir().context(IoSnafu {
                path: std::env::temp_dir(),
            })?,
        };
        Ok(Self {
            dir,
            bundles: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn get(&self, pair: IndexPair) -> Option<&BundleFile> {
        self.bundles.get(&pair)
    }

    fn path_for(&self, pair: IndexPair, suffix: &str) -> PathBuf {
        self.dir.path().join(format!("{}_{}{suffix}.bundle", pair.from, pair.to))
    }

    /// Bundle of the changesets in indices `from+1..=to`.
    pub fn make_bundle<R: RepoBackend + ?Sized>(
        &mut self,
        graph: &UpdateGraph,
        repo: &R,
        table: &VersionTable,
        pair: IndexPair,
    ) -> UpdateResult<BundleFile> {
        if let Some(bundle) = self.bundles.get(&pair) {
            return Ok(bundle.clone());
        }
        let (bases, heads) = graph.get_rollup_bounds(repo, table, pair.from + 1, pair.to)?;
        let path = self.path_for(pair, "");
        let length = repo.make_bundle(&bases, &heads, &path)?;
        debug!(pair = %pair, length, "made bundle");

        let bundle = BundleFile { pair, length, path };
        self.bundles.insert(pair, bundle.clone());
        Ok(bundle)
    }

    /// The widest bundle ending at `last` that still makes good use of
    /// store blocks.
    ///
    /// Walks `earliest` down from `last - 1` and stops on an exact block
    /// multiple, on the first bundle over [`MAX_REDUNDANT_LENGTH`], or when
    /// a bundle grows past the block boundary of the first candidate, in
    /// which case the previous candidate is returned.
    pub fn make_redundant_bundle<R: RepoBackend + ?Sized>(
        &mut self,
        graph: &UpdateGraph,
        repo: &R,
        table: &VersionTable,
        last: IndexId,
    ) -> UpdateResult<BundleFile> {
        let block = BLOCK_LEN as u64;
        let mut previous: Option<BundleFile> = None;
        let mut boundary: Option<u64> = None;

        for earliest in (FIRST_INDEX..last).rev() {
            let bundle = self.make_bundle(graph, repo, table, IndexPair::new(earliest, last))?;
            if bundle.length > 0 && bundle.length % block == 0 {
                return Ok(bundle);
            }
            match boundary {
                None => {
                    if bundle.length > MAX_REDUNDANT_LENGTH {
                        return Ok(bundle);
                    }
                    boundary = Some((bundle.length / block + 1) * block);
                }
                Some(limit) if bundle.length > limit || bundle.length > MAX_REDUNDANT_LENGTH => {
                    if let Some(previous) = previous {
                        return Ok(previous);
                    }
                }
                Some(_) => {}
            }
            previous = Some(bundle);
        }

        previous.ok_or(UpdateError::NoPath {
            from: FIRST_INDEX,
            to: last,
        })
    }

    /// Keep a bundle fetched from the store.
    pub fn store_fetched(&mut self, pair: IndexPair, data: &[u8]) -> UpdateResult<BundleFile> {
        let path = self.path_for(pair, "_fetched");
        std::fs::write(&path, data).context(IoSnafu { path: &path })?;
        let bundle = BundleFile {
            pair,
            length: data.len() as u64,
            path,
        };
        self.bundles.insert(pair, bundle.clone());
        Ok(bundle)
    }

    /// Write bundle data not yet tied to a graph pair.
    pub fn scratch_file(&self, label: &str, data: &[u8]) -> UpdateResult<PathBuf> {
        let path = self.dir.path().join(format!("{label}.bundle"));
        std::fs::write(&path, data).context(IoSnafu { path: &path })?;
        Ok(path)
    }

    /// Drop a cached bundle, deleting its file.
    pub fn remove(&mut self, pair: IndexPair) {
        if let Some(bundle) = self.bundles.remove(&pair) {
            let _ = std::fs::remove_file(&bundle.path);
        }
    }

    pub fn bundle_bytes(&self, bundle: &BundleFile) -> UpdateResult<Bytes> {
        let data = std::fs::read(&bundle.path).context(IoSnafu { path: &bundle.path })?;
        Ok(Bytes::from(data))
    }

    /// The bundle plus one pad byte, so it lands at a different CHK.
    pub fn padded_bytes(&self, bundle: &BundleFile) -> UpdateResult<Bytes> {
        let mut data = std::fs::read(&bundle.path).context(IoSnafu { path: &bundle.path })?;
        data.push(PAD_BYTE);
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_version_table;
    use crate::repo::MemoryRepo;
    use crate::types::NULL_REV;

    /// One index per changeset of `payloads`, linear history.
    fn linear(payloads: &[usize]) -> (MemoryRepo, UpdateGraph) {
        let mut repo = MemoryRepo::new();
        let mut graph = UpdateGraph::new();
        let mut parent = None;
        let mut base = NULL_REV;
        for len in payloads {
            let parents: Vec<_> = parent.into_iter().collect();
            let rev = repo.commit(&parents, *len).unwrap();
            graph.add_index([base], [rev]);
            parent = Some(rev);
            base = rev;
        }
        (repo, graph)
    }

    #[test]
    fn test_make_bundle_memoizes() {
        let (repo, graph) = linear(&[100, 200]);
        let table = build_version_table(&graph, &repo).unwrap();
        let mut cache = BundleCache::new(None).unwrap();

        let first = cache.make_bundle(&graph, &repo, &table, IndexPair::new(0, 1)).unwrap();
        let again = cache.make_bundle(&graph, &repo, &table, IndexPair::new(0, 1)).unwrap();
        assert_eq!(first, again);
        assert!(first.path.starts_with(cache.dir()));

        let padded = cache.padded_bytes(&first).unwrap();
        assert_eq!(padded.len() as u64, first.length + 1);
        assert_eq!(padded.last(), Some(&PAD_BYTE));
    }

    #[test]
    fn test_redundant_bundle_spans_small_history() {
        let (repo, graph) = linear(&[1000, 1000, 1000]);
        let table = build_version_table(&graph, &repo).unwrap();
        let mut cache = BundleCache::new(None).unwrap();

        let bundle = cache.make_redundant_bundle(&graph, &repo, &table, 2).unwrap();
        assert_eq!(bundle.pair, IndexPair::new(-1, 2));
    }

    #[test]
    fn test_redundant_bundle_stops_at_block_boundary() {
        let (repo, graph) = linear(&[20_000, 20_000, 1000]);
        let table = build_version_table(&graph, &repo).unwrap();
        let mut cache = BundleCache::new(None).unwrap();

        // (1, 2) is small, (0, 2) fits in one block, (-1, 2) needs two.
        let bundle = cache.make_redundant_bundle(&graph, &repo, &table, 2).unwrap();
        assert_eq!(bundle.pair, IndexPair::new(0, 2));
        assert!(bundle.length <= BLOCK_LEN as u64);
    }

    #[test]
    fn test_redundant_bundle_large_first_candidate() {
        let (repo, graph) = linear(&[100, 200_000]);
        let table = build_version_table(&graph, &repo).unwrap();
        let mut cache = BundleCache::new(None).unwrap();

        let bundle = cache.make_redundant_bundle(&graph, &repo, &table, 1).unwrap();
        assert_eq!(bundle.pair, IndexPair::new(0, 1));
        assert!(bundle.length > MAX_REDUNDANT_LENGTH);
    }

    #[test]
    fn test_store_fetched_and_remove() {
        let mut cache = BundleCache::new(None).unwrap();
        let pair = IndexPair::new(-1, 0);
        let bundle = cache.store_fetched(pair, b"data").unwrap();
        assert_eq!(cache.bundle_bytes(&bundle).unwrap().as_ref(), b"data");
        cache.remove(pair);
        assert!(cache.get(pair).is_none());
        assert!(!bundle.path.exists());
    }

    #[test]
    fn test_cache_dir_removed_on_drop() {
        let cache = BundleCache::new(None).unwrap();
        let dir = cache.dir().to_path_buf();
        assert!(dir.exists());
        drop(cache);
        assert!(!dir.exists());
    }
}
