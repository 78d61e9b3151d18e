//! Fuzz target for key URI parsing.

use bolero::check;
use infocalypse_keys::Chk;
use infocalypse_keys::Usk;

#[test]
fn fuzz_keys() {
    check!().with_type::<String>().for_each(|text| {
        if let Ok(usk) = Usk::parse(text) {
            assert_eq!(Usk::parse(&usk.to_string()).expect("printed USK must parse"), usk);
            let _ = usk.usk_hash();
        }
        if let Ok(chk) = Chk::parse(text) {
            let _ = chk.to_bytes();
            let _ = chk.is_control_document();
        }
    });
}
