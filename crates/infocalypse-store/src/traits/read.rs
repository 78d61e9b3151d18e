//! Read operations.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::GetOptions;
use crate::types::GetResult;
use crate::types::RequestContext;

/// Fetch content by URI.
#[async_trait]
pub trait ObjectRead: Send + Sync {
    /// Fetch `uri` (CHK, SSK or USK).
    ///
    /// For USKs the returned [`GetResult::uri`] names the edition actually
    /// found, so callers learn the latest version.
    async fn get(&self, ctx: &RequestContext, uri: &str, options: &GetOptions) -> StoreResult<GetResult>;
}
