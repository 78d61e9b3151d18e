//! Object store traits following the Interface Segregation Principle.
//!
//! - [`ObjectRead`]: fetch blocks and named records
//! - [`ObjectWrite`]: insert CHK blocks and SSK/USK records
//! - [`KeyOps`]: key inversion and keypair generation
//! - [`RequestControl`]: connection state used by the scheduler
//!
//! The composite [`ObjectStore`] trait requires all sub-traits.

mod control;
mod keys;
mod read;
mod write;

pub use control::RequestControl;
pub use keys::KeyOps;
pub use read::ObjectRead;
pub use write::ObjectWrite;

use crate::error::StoreResult;
use crate::types::RequestContext;
use crate::types::RequestKind;
use crate::types::StoreResponse;

/// Composite trait for full object store functionality.
///
/// Automatically implemented for any type implementing all four sub-traits.
pub trait ObjectStore: ObjectRead + ObjectWrite + KeyOps + RequestControl {}

impl<T: ObjectRead + ObjectWrite + KeyOps + RequestControl> ObjectStore for T {}

/// Dispatch a [`RequestKind`] to the matching trait method.
pub async fn execute<S>(store: &S, ctx: &RequestContext, kind: &RequestKind) -> StoreResult<StoreResponse>
where S: ObjectStore + ?Sized {
    match kind {
        RequestKind::Get { uri, options } => store.get(ctx, uri, options).await.map(StoreResponse::Got),
        RequestKind::PutChk {
            data,
            mime,
            dont_compress,
        } => store.put_chk(ctx, data.clone(), mime.as_deref(), *dont_compress).await.map(StoreResponse::PutChk),
        RequestKind::PutSsk { uri, data } => store.put_ssk(ctx, uri, data.clone()).await.map(StoreResponse::PutSsk),
        RequestKind::InvertKey { insert_uri } => {
            store.invert_key(ctx, insert_uri).await.map(StoreResponse::InvertedKey)
        }
        RequestKind::GenerateKeypair => store.generate_ssk_keypair(ctx).await.map(StoreResponse::Keypair),
    }
}
