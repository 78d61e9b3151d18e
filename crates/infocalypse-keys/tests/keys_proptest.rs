//! Property-based tests for key codecs.

use infocalypse_keys::Chk;
use infocalypse_keys::Usk;
use infocalypse_keys::chk::CRYPTO_KEY_LEN;
use infocalypse_keys::chk::EXTRA_LEN;
use infocalypse_keys::chk::ROUTING_KEY_LEN;
use proptest::prelude::*;

fn arb_chk() -> impl Strategy<Value = Chk> {
    (
        prop::array::uniform32(any::<u8>()),
        prop::array::uniform32(any::<u8>()),
        prop::array::uniform5(any::<u8>()),
    )
        .prop_map(|(routing, crypto, extra)| Chk::from_parts(routing, crypto, extra))
}

proptest! {
    #[test]
    fn chk_text_round_trip(chk in arb_chk()) {
        let text = chk.to_string();
        prop_assert!(!text.contains('+') && !text.contains('/') && !text.contains('='));
        prop_assert_eq!(Chk::parse(&text).unwrap(), chk);
    }

    #[test]
    fn chk_binary_round_trip(chk in arb_chk()) {
        let bytes = chk.to_bytes();
        prop_assert_eq!(bytes.len(), ROUTING_KEY_LEN + CRYPTO_KEY_LEN + EXTRA_LEN);
        prop_assert_eq!(Chk::from_bytes(&bytes).unwrap(), chk);
    }

    #[test]
    fn raw_metadata_only_touches_control_byte(chk in arb_chk()) {
        let raw = chk.raw_metadata();
        prop_assert!(!raw.is_control_document());
        prop_assert_eq!(raw.routing_key(), chk.routing_key());
        prop_assert_eq!(raw.crypto_key(), chk.crypto_key());
        prop_assert_eq!(&raw.extra()[3..], &chk.extra()[3..]);
    }

    #[test]
    fn usk_round_trip(name in "[a-z][a-z0-9_.]{0,20}", version in -100i64..100_000) {
        let usk = Usk::new("AAAA,BBBB,AQACAAE", name, version);
        prop_assert_eq!(Usk::parse(&usk.to_string()).unwrap(), usk);
    }
}
