//! Write operations.

use async_trait::async_trait;
use bytes::Bytes;
use infocalypse_keys::Chk;

use crate::error::StoreResult;
use crate::types::RequestContext;

/// Insert immutable blocks and signed records.
#[async_trait]
pub trait ObjectWrite: Send + Sync {
    /// Insert `data` under its content hash key.
    ///
    /// Content must come back bit-exact. Data larger than one block is
    /// stored as a splitfile and the returned key has its control flag set.
    async fn put_chk(
        &self,
        ctx: &RequestContext,
        data: Bytes,
        mime: Option<&str>,
        dont_compress: bool,
    ) -> StoreResult<Chk>;

    /// Publish `data` at an SSK or USK insert URI, returning the request URI.
    ///
    /// Fails with `Collision` if different data already lives there.
    async fn put_ssk(&self, ctx: &RequestContext, uri: &str, data: Bytes) -> StoreResult<String>;
}
