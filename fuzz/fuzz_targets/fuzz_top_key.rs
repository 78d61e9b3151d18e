//! Fuzz target for the binary top-key decoder.
//!
//! Top keys are the first thing fetched from an untrusted USK.

use bolero::check;
use infocalypse_update::TopKey;

#[test]
fn fuzz_top_key() {
    check!().with_type::<Vec<u8>>().for_each(|data| {
        if let Ok((top_key, salt)) = TopKey::decode(data) {
            // Decoded updates are single-head, so re-encoding is lossless.
            let bytes = top_key.encode(salt).expect("decoded top key must encode");
            assert_eq!(TopKey::decode(&bytes).expect("re-encoded top key must decode").0, top_key);
        }
    });
}
