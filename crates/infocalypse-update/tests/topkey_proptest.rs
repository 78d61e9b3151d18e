//! Property-based tests for the top-key codec.

use infocalypse_keys::Chk;
use infocalypse_update::constants::MAX_TOP_KEY_LEN;
use infocalypse_update::constants::TOP_KEY_SALTS;
use infocalypse_update::types::ChangesetId;
use infocalypse_update::TopKey;
use infocalypse_update::TopKeyUpdate;
use proptest::prelude::*;

fn arb_chk() -> impl Strategy<Value = Chk> {
    (
        prop::array::uniform32(any::<u8>()),
        prop::array::uniform32(any::<u8>()),
        prop::array::uniform5(any::<u8>()),
    )
        .prop_map(|(routing, crypto, extra)| Chk::from_parts(routing, crypto, extra))
}

fn arb_rev() -> impl Strategy<Value = ChangesetId> {
    prop::array::uniform20(any::<u8>()).prop_map(ChangesetId)
}

fn arb_update() -> impl Strategy<Value = TopKeyUpdate> {
    (
        0u64..(1 << 40),
        prop::collection::vec(arb_rev(), 1..3),
        prop::collection::vec(arb_rev(), 1..3),
        prop::collection::vec(arb_chk(), 1..3),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(length, parents, heads, chks, parents_complete, heads_complete)| TopKeyUpdate {
            length,
            parents,
            heads,
            chks,
            parents_complete,
            heads_complete,
        })
}

fn arb_top_key() -> impl Strategy<Value = TopKey> {
    (prop::collection::vec(arb_chk(), 0..=2), prop::collection::vec(arb_update(), 0..12))
        .prop_map(|(graph_chks, updates)| TopKey { graph_chks, updates })
}

proptest! {
    #[test]
    fn encode_fits_and_decodes(top_key in arb_top_key(), salt_index in 0usize..2) {
        let salt = TOP_KEY_SALTS[salt_index];
        let bytes = top_key.encode(salt).unwrap();
        prop_assert!(bytes.len() <= MAX_TOP_KEY_LEN);

        let (decoded, decoded_salt) = TopKey::decode(&bytes).unwrap();
        prop_assert_eq!(decoded_salt, salt);
        prop_assert_eq!(&decoded.graph_chks, &top_key.graph_chks);
        prop_assert!(decoded.updates.len() <= top_key.updates.len());

        for (got, sent) in decoded.updates.iter().zip(&top_key.updates) {
            prop_assert_eq!(got.length, sent.length);
            prop_assert_eq!(&got.chks, &sent.chks);
            prop_assert_eq!(got.parents.as_slice(), &sent.parents[..1]);
            prop_assert_eq!(got.heads.as_slice(), &sent.heads[..1]);
            prop_assert_eq!(got.parents_complete, sent.parents_complete && sent.parents.len() == 1);
            prop_assert_eq!(got.heads_complete, sent.heads_complete && sent.heads.len() == 1);
        }
    }

    #[test]
    fn salts_differ_only_in_salt_byte(top_key in arb_top_key()) {
        let a = top_key.encode(TOP_KEY_SALTS[0]).unwrap();
        let b = top_key.encode(TOP_KEY_SALTS[1]).unwrap();
        prop_assert_eq!(a.len(), b.len());
        let diffs = a.iter().zip(b.iter()).filter(|(x, y)| x != y).count();
        prop_assert_eq!(diffs, 1);
    }

    #[test]
    fn decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..1100)) {
        let _ = TopKey::decode(&data);
    }
}
