//! In-memory repository with a simple bundle format.
//!
//! Changesets carry a synthetic payload of chosen size so tests can steer
//! bundle lengths around block boundaries.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io::BufRead;
use std::io::Read;
use std::path::Path;

use sha1::Digest;
use sha1::Sha1;
use snafu::ResultExt;

use super::RepoBackend;
use crate::error::BundleCorruptSnafu;
use crate::error::IoSnafu;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::types::ChangesetId;

const BUNDLE_HEADER: &[u8] = b"HG10MEM\n";

#[derive(Debug, Clone)]
struct MemoryChangeset {
    parents: Vec<ChangesetId>,
    payload_len: usize,
}

/// In-memory changeset DAG.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepo {
    changesets: BTreeMap<ChangesetId, MemoryChangeset>,
    /// Insertion order; always topological.
    order: Vec<ChangesetId>,
}

fn payload(id: &ChangesetId, len: usize) -> Vec<u8> {
    (0..len).map(|i| id.0[i % id.0.len()] ^ (i as u8)).collect()
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a changeset with `payload_len` bytes of content.
    pub fn commit(&mut self, parents: &[ChangesetId], payload_len: usize) -> UpdateResult<ChangesetId> {
        for parent in parents {
            if !self.changesets.contains_key(parent) {
                return Err(UpdateError::Repo {
                    message: format!("unknown parent {parent}"),
                });
            }
        }
        let mut hasher = Sha1::new();
        for parent in parents {
            hasher.update(parent.as_bytes());
        }
        hasher.update((self.order.len() as u64).to_be_bytes());
        hasher.update((payload_len as u64).to_be_bytes());
        let id = ChangesetId(hasher.finalize().into());
        self.insert(id, parents.to_vec(), payload_len);
        Ok(id)
    }

    /// Commit a linear chain on top of `parent` (or a new root).
    pub fn commit_chain(
        &mut self,
        parent: Option<ChangesetId>,
        count: usize,
        payload_len: usize,
    ) -> UpdateResult<Vec<ChangesetId>> {
        let mut tip = parent;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let parents: Vec<ChangesetId> = tip.into_iter().collect();
            let id = self.commit(&parents, payload_len)?;
            out.push(id);
            tip = Some(id);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Size a bundle holding exactly `revs` would have.
    pub fn bundle_len_of(&self, revs: &[ChangesetId]) -> u64 {
        let body: usize = revs
            .iter()
            .filter_map(|rev| self.changesets.get(rev).map(|cs| Self::entry_header(rev, cs).len() + cs.payload_len))
            .sum();
        (BUNDLE_HEADER.len() + body) as u64
    }

    fn insert(&mut self, id: ChangesetId, parents: Vec<ChangesetId>, payload_len: usize) {
        if self.changesets.insert(id, MemoryChangeset { parents, payload_len }).is_none() {
            self.order.push(id);
        }
    }

    fn entry_header(id: &ChangesetId, cs: &MemoryChangeset) -> String {
        let parents = if cs.parents.is_empty() {
            "-".to_string()
        } else {
            cs.parents.iter().map(ChangesetId::to_hex).collect::<Vec<_>>().join(",")
        };
        format!("C {id} {parents} {}\n", cs.payload_len)
    }

    fn reachable(&self, from: &[ChangesetId]) -> UpdateResult<BTreeSet<ChangesetId>> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<ChangesetId> = from.iter().filter(|rev| !rev.is_null()).copied().collect();
        while let Some(rev) = stack.pop() {
            if !seen.insert(rev) {
                continue;
            }
            let cs = self.changesets.get(&rev).ok_or_else(|| UpdateError::Repo {
                message: format!("unknown revision {rev}"),
            })?;
            stack.extend(cs.parents.iter().copied());
        }
        Ok(seen)
    }
}

impl RepoBackend for MemoryRepo {
    fn heads(&self) -> UpdateResult<Vec<ChangesetId>> {
        let parents: BTreeSet<ChangesetId> =
            self.changesets.values().flat_map(|cs| cs.parents.iter().copied()).collect();
        Ok(self.order.iter().filter(|id| !parents.contains(id)).copied().collect())
    }

    fn has(&self, rev: &ChangesetId) -> UpdateResult<bool> {
        Ok(self.changesets.contains_key(rev))
    }

    fn parents(&self, rev: &ChangesetId) -> UpdateResult<Vec<ChangesetId>> {
        self.changesets.get(rev).map(|cs| cs.parents.clone()).ok_or_else(|| UpdateError::Repo {
            message: format!("unknown revision {rev}"),
        })
    }

    fn children(&self, rev: &ChangesetId) -> UpdateResult<Vec<ChangesetId>> {
        Ok(self
            .order
            .iter()
            .filter(|id| self.changesets.get(*id).is_some_and(|cs| cs.parents.contains(rev)))
            .copied()
            .collect())
    }

    fn make_bundle(&self, bases: &[ChangesetId], heads: &[ChangesetId], out: &Path) -> UpdateResult<u64> {
        let exclude = self.reachable(bases)?;
        let include = self.reachable(heads)?;

        let mut data = BUNDLE_HEADER.to_vec();
        for id in self.order.iter().filter(|id| include.contains(*id) && !exclude.contains(*id)) {
            let cs = &self.changesets[id];
            data.extend_from_slice(Self::entry_header(id, cs).as_bytes());
            data.extend_from_slice(&payload(id, cs.payload_len));
        }
        std::fs::write(out, &data).context(IoSnafu { path: out })?;
        Ok(data.len() as u64)
    }

    fn apply_bundle(&mut self, bundle: &Path) -> UpdateResult<()> {
        let file = std::fs::File::open(bundle).context(IoSnafu { path: bundle })?;
        let mut reader = std::io::BufReader::new(file);

        let mut header = vec![0u8; BUNDLE_HEADER.len()];
        reader.read_exact(&mut header).context(IoSnafu { path: bundle })?;
        if header != BUNDLE_HEADER {
            return BundleCorruptSnafu {
                message: "bad bundle header",
            }
            .fail();
        }

        let mut staged: Vec<(ChangesetId, Vec<ChangesetId>, usize)> = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).context(IoSnafu { path: bundle })? == 0 {
                break;
            }
            let corrupt = || UpdateError::BundleCorrupt {
                message: format!("bad changeset line: {}", line.trim_end()),
            };
            let mut fields = line.trim_end().split(' ');
            let (Some("C"), Some(id), Some(parents), Some(len), None) =
                (fields.next(), fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Err(corrupt());
            };
            let id = ChangesetId::from_hex(id)?;
            let parents = match parents {
                "-" => Vec::new(),
                list => list.split(',').map(ChangesetId::from_hex).collect::<UpdateResult<Vec<_>>>()?,
            };
            let len: usize = len.parse().map_err(|_| corrupt())?;

            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).map_err(|_| UpdateError::BundleCorrupt {
                message: format!("truncated payload for {id}"),
            })?;
            if body != payload(&id, len) {
                return BundleCorruptSnafu {
                    message: format!("payload mismatch for {id}"),
                }
                .fail();
            }
            staged.push((id, parents, len));
        }

        // Validate before mutating so a bad bundle leaves the repo untouched.
        let mut known: BTreeSet<ChangesetId> = self.changesets.keys().copied().collect();
        for (id, parents, _) in &staged {
            if let Some(missing) = parents.iter().find(|parent| !known.contains(*parent)) {
                return Err(UpdateError::Repo {
                    message: format!("bundle changeset {id} has missing parent {missing}"),
                });
            }
            known.insert(*id);
        }
        for (id, parents, len) in staged {
            self.insert(id, parents, len);
        }
        Ok(())
    }

    fn hex_of(&self, rev_spec: &str) -> UpdateResult<ChangesetId> {
        let rev = match rev_spec {
            "tip" => self.order.last().copied(),
            "null" => Some(crate::types::NULL_REV),
            spec => ChangesetId::from_hex(spec).ok().filter(|id| self.changesets.contains_key(id)),
        };
        rev.ok_or_else(|| UpdateError::Repo {
            message: format!("unknown revision {rev_spec}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_heads_and_ancestry() {
        let mut repo = MemoryRepo::new();
        let chain = repo.commit_chain(None, 3, 10).unwrap();
        let branch = repo.commit(&[chain[0]], 5).unwrap();

        let heads: BTreeSet<_> = repo.heads().unwrap().into_iter().collect();
        assert_eq!(heads, BTreeSet::from([chain[2], branch]));
        assert_eq!(repo.ancestors(&chain[2]).unwrap().len(), 2);
        assert_eq!(repo.children(&chain[0]).unwrap(), vec![chain[1], branch]);
        assert_eq!(repo.hex_of("tip").unwrap(), branch);
    }

    #[test]
    fn test_bundle_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut source = MemoryRepo::new();
        let chain = source.commit_chain(None, 4, 100).unwrap();

        let full = dir.path().join("full.bundle");
        let len = source.make_bundle(&[], &[chain[1]], &full).unwrap();
        assert_eq!(len, source.bundle_len_of(&chain[..2]));

        let mut target = MemoryRepo::new();
        target.apply_bundle(&full).unwrap();
        assert_eq!(target.heads().unwrap(), vec![chain[1]]);

        let incremental = dir.path().join("inc.bundle");
        source.make_bundle(&[chain[1]], &[chain[3]], &incremental).unwrap();
        target.apply_bundle(&incremental).unwrap();
        assert_eq!(target.heads().unwrap(), vec![chain[3]]);
        assert_eq!(target.len(), 4);
    }

    #[test]
    fn test_apply_rejects_missing_parents() {
        let dir = TempDir::new().unwrap();
        let mut source = MemoryRepo::new();
        let chain = source.commit_chain(None, 3, 10).unwrap();
        let path = dir.path().join("tail.bundle");
        source.make_bundle(&[chain[0]], &[chain[2]], &path).unwrap();

        let mut target = MemoryRepo::new();
        assert!(matches!(target.apply_bundle(&path), Err(UpdateError::Repo { .. })));
        assert!(target.is_empty());
    }

    #[test]
    fn test_apply_rejects_corruption() {
        let dir = TempDir::new().unwrap();
        let mut source = MemoryRepo::new();
        let chain = source.commit_chain(None, 1, 10).unwrap();
        let path = dir.path().join("bad.bundle");
        source.make_bundle(&[], &chain, &path).unwrap();
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        let err = MemoryRepo::new().apply_bundle(&path).unwrap_err();
        assert!(err.is_corruption());
    }
}
