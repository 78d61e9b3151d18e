//! Fuzz target for the FCP frame decoder.
//!
//! Everything the node sends is decoded here, including trailing data
//! whose length comes from a header field.
//!
//! Attack vectors tested:
//! - Oversized or non-numeric `DataLength`
//! - Messages split at arbitrary byte boundaries
//! - Missing `EndMessage`/`Data` terminators

use bolero::check;
use bytes::BytesMut;
use infocalypse_store::fcp::FcpCodec;
use tokio_util::codec::Decoder;

#[test]
fn fuzz_fcp_codec() {
    check!().with_type::<(Vec<u8>, u8)>().for_each(|(data, split)| {
        let mut codec = FcpCodec::new();
        let mut buf = BytesMut::new();
        let split = (*split as usize).min(data.len());

        for chunk in [&data[..split], &data[split..]] {
            buf.extend_from_slice(chunk);
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        }
    });
}
