//! Property-based tests for the update graph.
//!
//! Graphs are grown the way publishing grows them: a run of pushes of
//! random sizes, each followed by `update` and CHKs for the new edges.

use infocalypse_keys::Chk;
use infocalypse_keys::chk::DEFAULT_EXTRA;
use infocalypse_update::bundle_cache::BundleCache;
use infocalypse_update::constants::MAX_PATH_LEN;
use infocalypse_update::graph::GraphUpdate;
use infocalypse_update::repo::MemoryRepo;
use infocalypse_update::repo::RepoBackend;
use infocalypse_update::types::ChangesetId;
use infocalypse_update::types::ChkSlot;
use infocalypse_update::UpdateGraph;
use proptest::prelude::*;

fn fake_chk(n: u32) -> Chk {
    let mut routing = [0u8; 32];
    routing[..4].copy_from_slice(&n.to_be_bytes());
    Chk::from_parts(routing, [7u8; 32], DEFAULT_EXTRA)
}

/// Commit `pushes` (changeset sizes per push) and publish each one.
fn published(pushes: &[Vec<usize>]) -> (MemoryRepo, UpdateGraph) {
    let mut repo = MemoryRepo::new();
    let mut graph = UpdateGraph::new();
    let mut cache = BundleCache::new(None).unwrap();
    let mut tip: Option<ChangesetId> = None;
    let mut next_chk = 0;

    for push in pushes {
        for size in push {
            let parents: Vec<ChangesetId> = tip.into_iter().collect();
            tip = Some(repo.commit(&parents, *size).unwrap());
        }
        let heads = repo.heads().unwrap();
        match graph.update(&repo, &heads, &mut cache).unwrap() {
            GraphUpdate::UpToDate => panic!("new changesets must produce an update"),
            GraphUpdate::Updated(edges) => assert!(!edges.is_empty()),
        }
        for edge in graph.pending_edges() {
            let length = graph.edge_length(edge.pair()).unwrap();
            next_chk += 1;
            graph.set_chk(edge, length, fake_chk(next_chk)).unwrap();
        }
    }
    (repo, graph)
}

fn arb_pushes() -> impl Strategy<Value = Vec<Vec<usize>>> {
    let size = prop_oneof![4 => 1usize..3_000, 1 => 20_000usize..70_000];
    prop::collection::vec(prop::collection::vec(size, 1..3), 1..9)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn text_round_trip((_, graph) in arb_pushes().prop_map(|p| published(&p))) {
        let parsed = UpdateGraph::parse(&graph.to_text()).unwrap();
        prop_assert_eq!(&parsed, &graph);
        prop_assert_eq!(parsed.serialized_len(), graph.serialized_len());
    }

    #[test]
    fn canonical_path_is_short((_, graph) in arb_pushes().prop_map(|p| published(&p))) {
        let path = graph.canonical_path(graph.latest_index(), MAX_PATH_LEN).unwrap();
        prop_assert!(!path.is_empty());
        prop_assert!(path.len() <= MAX_PATH_LEN);
        prop_assert_eq!(path.last().unwrap().to, graph.latest_index());
    }

    #[test]
    fn published_slots_hold_chks((_, graph) in arb_pushes().prop_map(|p| published(&p))) {
        graph.validate().unwrap();
        for edge in graph.triples() {
            let slot = graph.get_chk(edge).unwrap();
            prop_assert!(matches!(slot, ChkSlot::Chk(_)), "edge {} still pending", edge);
        }
    }

    #[test]
    fn update_is_idempotent((repo, graph) in arb_pushes().prop_map(|p| published(&p))) {
        let mut again = graph.clone();
        let mut cache = BundleCache::new(None).unwrap();
        let heads = repo.heads().unwrap();
        prop_assert_eq!(again.update(&repo, &heads, &mut cache).unwrap(), GraphUpdate::UpToDate);
        prop_assert_eq!(again, graph);
    }

    #[test]
    fn minimize_fits_and_keeps_top_key_edges(
        (repo, graph) in arb_pushes().prop_map(|p| published(&p)),
        fraction in 0.0f64..1.0,
    ) {
        let floor = graph.minimize(&repo, 0).unwrap().serialized_len();
        let full = graph.serialized_len();
        let budget = floor + ((full.saturating_sub(floor)) as f64 * fraction) as usize;

        let small = graph.minimize(&repo, budget).unwrap();
        prop_assert!(small.serialized_len() <= budget.max(floor));
        small.validate().unwrap();
        prop_assert_eq!(UpdateGraph::parse(&small.to_text()).unwrap(), small.clone());
        prop_assert_eq!(small.latest_heads(), graph.latest_heads());

        for edge in small.get_top_key_edges().unwrap() {
            let chk = small.get_chk(edge).unwrap().chk().cloned().unwrap();
            let original = graph.find_chk(&chk).expect("top key edge comes from the full graph");
            prop_assert_eq!(
                graph.edge_length(original.pair()).unwrap(),
                small.edge_length(edge.pair()).unwrap()
            );
        }
    }
}
