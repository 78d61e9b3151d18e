//! End-to-end runs of the operations against the in-memory store.

use std::path::Path;
use std::sync::Arc;

use infocalypse_keys::Usk;
use infocalypse_store::GetOptions;
use infocalypse_store::InMemoryObjectStore;
use infocalypse_store::ObjectRead;
use infocalypse_store::RequestContext;
use infocalypse_store::StoreError;
use tempfile::TempDir;

use crate::config::Config;
use crate::constants::BLOCK_LEN;
use crate::error::UpdateError;
use crate::ops;
use crate::ops::Session;
use crate::repo::MemoryRepo;
use crate::repo::RepoBackend;
use crate::sm::InsertOutcome;
use crate::sm::PullOutcome;
use crate::types::ChangesetId;
use crate::types::IndexPair;
use crate::types::InsertType;
use crate::types::NULL_REV;

struct Fixture {
    store: InMemoryObjectStore,
    session: Session<InMemoryObjectStore>,
    insert: Usk,
    request: Usk,
    _dir: TempDir,
}

async fn fixture() -> Fixture {
    let store = InMemoryObjectStore::new();
    let keys = ops::genkey(&store).await.unwrap();
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.default.tmp_dir = Some(dir.path().join("tmp"));
    let mut session = Session::new(Arc::new(store.clone()), config);
    session.config_path = Some(dir.path().join("config.toml"));
    Fixture {
        store,
        session,
        insert: keys.insert.to_usk("repo.R1", 0),
        request: keys.request.to_usk("repo.R1", 0),
        _dir: dir,
    }
}

/// A fresh session sharing the store, as a different user would have.
fn other_session(fx: &Fixture) -> Session<InMemoryObjectStore> {
    Session::new(Arc::new(fx.store.clone()), Config::default())
}

fn sorted(mut revs: Vec<ChangesetId>) -> Vec<ChangesetId> {
    revs.sort();
    revs
}

#[tokio::test]
async fn test_first_publish_of_single_changeset() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    let h1 = repo.commit(&[], 500).unwrap();

    let report = ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();
    assert_eq!(report.outcome, InsertOutcome::Inserted);
    assert_eq!(report.version, 0);
    assert_eq!(report.request_uri, fx.request);

    let graph = report.graph.expect("graph published");
    assert_eq!(graph.latest_index(), 0);
    let index = graph.index(0).unwrap();
    assert_eq!(index.bases.iter().copied().collect::<Vec<_>>(), vec![NULL_REV]);
    assert_eq!(index.heads.iter().copied().collect::<Vec<_>>(), vec![h1]);
    let edges: Vec<_> = graph.triples();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].pair(), IndexPair::new(-1, 0));
    let length = graph.edge_length(IndexPair::new(-1, 0)).unwrap();
    assert_eq!(length, repo.bundle_len_of(&[h1]));

    let top_key = report.top_key.expect("top key published");
    assert_eq!(top_key.graph_chks.len(), 2);
    assert_eq!(top_key.updates.len(), 1);
    let update = &top_key.updates[0];
    assert_eq!(update.length, length);
    assert_eq!(update.parents, vec![NULL_REV]);
    assert_eq!(update.heads, vec![h1]);
    assert_eq!(update.chks.len(), 1);
    assert!(update.parents_complete && update.heads_complete);

    assert_eq!(fx.store.latest_edition(&fx.request), Some(0));
    assert_eq!(fx.store.latest_edition(&fx.request.with_name("repo.R0")), Some(0));
}

#[tokio::test]
async fn test_published_graph_round_trips_through_store() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    repo.commit_chain(None, 3, 200).unwrap();

    let report = ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();
    let info = ops::info(&other_session(&fx), &fx.request, true).await.unwrap();
    assert_eq!(info.version, 0);
    assert_eq!(info.graph, report.graph);
    assert_eq!(Some(info.top_key), report.top_key);
}

#[tokio::test]
async fn test_create_saves_config() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    repo.commit(&[], 100).unwrap();

    ops::create(&mut fx.session, &repo, Some(Path::new("/work/repo")), &fx.insert).await.unwrap();
    let path = fx.session.config_path.clone().unwrap();
    let saved = Config::from_toml_file(&path).unwrap();
    assert_eq!(saved.get_index(&fx.request), Some(0));
    assert_eq!(saved.get_request_usk(Path::new("/work/repo")), Some(fx.request.to_string().as_str()));
    assert_eq!(saved.get_insert_usk(&fx.request), Some(fx.insert.to_string().as_str()));
}

#[tokio::test]
async fn test_create_requires_redundant_name() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    repo.commit(&[], 100).unwrap();
    let plain = fx.insert.with_name("repo");
    let err = ops::create(&mut fx.session, &repo, None, &plain).await.unwrap_err();
    assert!(matches!(err, UpdateError::ConfigValidation { .. }));
}

#[tokio::test]
async fn test_push_then_pull_into_empty_repo() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    let first = repo.commit_chain(None, 2, 100).unwrap();
    ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    repo.commit_chain(first.last().copied(), 2, 150).unwrap();
    let report = ops::push(&mut fx.session, &repo, None, &fx.insert).await.unwrap();
    assert_eq!(report.outcome, InsertOutcome::Inserted);
    assert_eq!(report.version, 1);
    assert!(!report.new_edges.is_empty());
    assert_eq!(fx.store.latest_edition(&fx.request), Some(1));

    let mut clone = MemoryRepo::new();
    let mut puller = other_session(&fx);
    let pulled = ops::pull(&mut puller, &mut clone, None, &fx.request).await.unwrap();
    assert_eq!(pulled.version, 1);
    assert!(matches!(pulled.outcome, PullOutcome::Updated { .. }));
    assert_eq!(sorted(clone.heads().unwrap()), sorted(repo.heads().unwrap()));
    assert_eq!(clone.len(), repo.len());
}

#[tokio::test]
async fn test_pull_incremental_update() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    let first = repo.commit_chain(None, 3, 120).unwrap();
    ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    let mut clone = MemoryRepo::new();
    let mut puller = other_session(&fx);
    ops::pull(&mut puller, &mut clone, None, &fx.request).await.unwrap();
    assert_eq!(clone.heads().unwrap(), vec![first[2]]);

    let second = repo.commit_chain(Some(first[2]), 2, 300).unwrap();
    ops::push(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    let pulled = ops::pull(&mut puller, &mut clone, None, &fx.request).await.unwrap();
    assert_eq!(pulled.version, 1);
    assert_eq!(pulled.outcome, PullOutcome::Updated { bundles_applied: 1 });
    assert_eq!(clone.heads().unwrap(), vec![second[1]]);
}

#[tokio::test]
async fn test_push_without_changes_is_up_to_date() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    repo.commit_chain(None, 2, 100).unwrap();
    ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    let report = ops::push(&mut fx.session, &repo, None, &fx.insert).await.unwrap();
    assert_eq!(report.outcome, InsertOutcome::UpToDate);
    assert_eq!(report.version, 0);
    assert_eq!(fx.store.latest_edition(&fx.request), Some(0));
}

#[tokio::test]
async fn test_pull_when_all_heads_present() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    repo.commit(&[], 100).unwrap();
    ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    let mut clone = repo.clone();
    let report = ops::pull(&mut other_session(&fx), &mut clone, None, &fx.request).await.unwrap();
    assert_eq!(report.outcome, PullOutcome::AllHeadsPresent);
    assert_eq!(clone.len(), repo.len());
}

#[tokio::test]
async fn test_pull_falls_back_to_salted_copy() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    let h1 = repo.commit(&[], BLOCK_LEN + 8_000).unwrap();
    let report = ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    let graph = report.graph.unwrap();
    let pair = IndexPair::new(-1, 0);
    assert_eq!(graph.redundancy(pair), 2);
    let primary = graph.get_chk(pair.triple(0)).unwrap().chk().cloned().unwrap();
    fx.store.fail_uri(primary.to_string(), StoreError::NotFound {
        uri: primary.to_string(),
    });

    let mut clone = MemoryRepo::new();
    let pulled = ops::pull(&mut other_session(&fx), &mut clone, None, &fx.request).await.unwrap();
    assert_eq!(pulled.outcome, PullOutcome::Updated { bundles_applied: 1 });
    assert_eq!(clone.heads().unwrap(), vec![h1]);
}

#[tokio::test]
async fn test_pull_falls_back_to_alternate_graph_edge() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    let h0 = repo.commit(&[], BLOCK_LEN + 8_000).unwrap();
    ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();
    let h1 = repo.commit(&[h0], 100).unwrap();
    let report = ops::push(&mut fx.session, &repo, None, &fx.insert).await.unwrap();
    assert_eq!(report.version, 1);

    // The newest update needs h0, so an empty clone has to go through the
    // graph and fetch (-1, 0) as a graph edge.
    let graph = report.graph.unwrap();
    let pair = IndexPair::new(-1, 0);
    assert_eq!(graph.redundancy(pair), 2);
    let primary = graph.get_chk(pair.triple(0)).unwrap().chk().cloned().unwrap();
    fx.store.fail_uri(primary.to_string(), StoreError::NotFound {
        uri: primary.to_string(),
    });

    let mut clone = MemoryRepo::new();
    let pulled = ops::pull(&mut other_session(&fx), &mut clone, None, &fx.request).await.unwrap();
    assert_eq!(pulled.version, 1);
    assert_eq!(pulled.outcome, PullOutcome::Updated { bundles_applied: 2 });
    assert!(pulled.graph.is_some());
    assert_eq!(clone.heads().unwrap(), vec![h1]);
    assert_eq!(clone.len(), repo.len());
}

#[tokio::test]
async fn test_pull_trims_padded_copy_of_block_sized_bundle() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    let h0 = repo.commit(&[], 40_000).unwrap();
    ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    let mut clone = MemoryRepo::new();
    let mut puller = other_session(&fx);
    ops::pull(&mut puller, &mut clone, None, &fx.request).await.unwrap();
    assert_eq!(clone.heads().unwrap(), vec![h0]);

    let h1 = repo.commit(&[h0], BLOCK_LEN - 98).unwrap();
    assert_eq!(repo.bundle_len_of(&[h1]), BLOCK_LEN as u64);
    let report = ops::push(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    let graph = report.graph.unwrap();
    let pair = IndexPair::new(0, 1);
    assert_eq!(graph.edge_length(pair).unwrap(), BLOCK_LEN as u64);
    assert_eq!(graph.insert_type(pair.triple(1)).unwrap(), InsertType::Padded);
    let primary = graph.get_chk(pair.triple(0)).unwrap().chk().cloned().unwrap();
    let padded = graph.get_chk(pair.triple(1)).unwrap().chk().cloned().unwrap();
    let ctx = RequestContext::detached("test-get");
    let stored = fx.store.get(&ctx, &padded.to_string(), &GetOptions::default()).await.unwrap();
    assert_eq!(stored.data.len(), BLOCK_LEN + 1);

    fx.store.fail_uri(primary.to_string(), StoreError::NotFound {
        uri: primary.to_string(),
    });
    let pulled = ops::pull(&mut puller, &mut clone, None, &fx.request).await.unwrap();
    assert_eq!(pulled.version, 1);
    assert_eq!(pulled.outcome, PullOutcome::Updated { bundles_applied: 1 });
    assert_eq!(clone.heads().unwrap(), vec![h1]);
    assert_eq!(clone.len(), repo.len());
}

#[tokio::test]
async fn test_pull_fails_when_every_copy_is_gone() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    repo.commit(&[], 300).unwrap();
    let report = ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();
    let graph = report.graph.unwrap();
    for edge in graph.triples() {
        let chk = graph.get_chk(edge).unwrap().chk().cloned().unwrap();
        assert!(fx.store.forget(&chk));
    }

    let mut clone = MemoryRepo::new();
    let err = ops::pull(&mut other_session(&fx), &mut clone, None, &fx.request).await.unwrap_err();
    assert_eq!(err.stage(), Some("RequestingBundles"));
    assert!(clone.is_empty());
}

#[tokio::test]
async fn test_salted_copy_shares_data_blocks() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    repo.commit(&[], 64 * 1024).unwrap();
    let report = ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    let graph = report.graph.unwrap();
    let pair = IndexPair::new(-1, 0);
    let primary = graph.get_chk(pair.triple(0)).unwrap().chk().cloned().unwrap();
    let salted = graph.get_chk(pair.triple(1)).unwrap().chk().cloned().unwrap();
    assert_ne!(primary, salted);
    assert!(salted.is_control_document());

    let a = fx.store.raw_block(&primary.raw_metadata()).unwrap();
    let b = fx.store.raw_block(&salted.raw_metadata()).unwrap();
    assert_eq!(a.len(), b.len());
    assert_eq!(a.iter().zip(b.iter()).filter(|(x, y)| x != y).count(), 1);

    let before = fx.store.stats().blocks;
    let info = ops::info(&other_session(&fx), &fx.request, false).await.unwrap();
    assert_eq!(info.top_key.updates[0].chks, vec![primary, salted]);
    assert_eq!(fx.store.stats().blocks, before);
}

#[tokio::test]
async fn test_reinsert_keeps_version() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    repo.commit_chain(None, 2, 100).unwrap();
    ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    for level in [1, 2, 3, 5] {
        let report = ops::reinsert(&mut fx.session, &repo, &fx.insert, level).await.unwrap();
        assert_eq!(report.outcome, InsertOutcome::Reinserted, "level {level}");
        assert_eq!(report.version, 0, "level {level}");
    }
    assert_eq!(fx.store.latest_edition(&fx.request), Some(0));
}

#[tokio::test]
async fn test_reinsert_level_four_adds_redundancy() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    repo.commit(&[], 500).unwrap();
    ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();

    let report = ops::reinsert(&mut fx.session, &repo, &fx.insert, 4).await.unwrap();
    assert_eq!(report.version, 1);
    assert_eq!(report.new_edges.len(), 1);
    let graph = report.graph.unwrap();
    assert_eq!(graph.redundancy(IndexPair::new(-1, 0)), 2);
    assert!(graph.pending_edges().is_empty());
}

#[tokio::test]
async fn test_reinsert_rejects_bad_level() {
    let mut fx = fixture().await;
    let repo = MemoryRepo::new();
    let err = ops::reinsert(&mut fx.session, &repo, &fx.insert, 6).await.unwrap_err();
    assert!(matches!(err, UpdateError::ConfigValidation { .. }));
}

#[tokio::test]
async fn test_failed_push_leaves_config_alone() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    let first = repo.commit(&[], 100).unwrap();
    ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap();
    let path = fx.session.config_path.clone().unwrap();
    let saved = std::fs::read_to_string(&path).unwrap();

    repo.commit(&[first], 100).unwrap();
    let graph_chks = ops::info(&fx.session, &fx.request, false).await.unwrap().top_key.graph_chks;
    for chk in &graph_chks {
        assert!(fx.store.forget(chk));
    }
    let err = ops::push(&mut fx.session, &repo, None, &fx.insert).await.unwrap_err();
    assert_eq!(err.stage(), Some("RequestingPrevGraph"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), saved);
}

#[tokio::test]
async fn test_shutdown_interrupts_insert() {
    let mut fx = fixture().await;
    let mut repo = MemoryRepo::new();
    repo.commit(&[], 100).unwrap();
    fx.session.shutdown.cancel();

    let err = ops::create(&mut fx.session, &repo, None, &fx.insert).await.unwrap_err();
    assert!(matches!(err, UpdateError::Interrupted { .. }));
    assert_eq!(fx.store.latest_edition(&fx.request), None);
}
