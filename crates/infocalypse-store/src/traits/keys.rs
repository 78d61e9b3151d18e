//! Key management operations.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::RequestContext;
use crate::types::SskKeypair;

#[async_trait]
pub trait KeyOps: Send + Sync {
    /// Derive the public request URI of an insert URI.
    async fn invert_key(&self, ctx: &RequestContext, insert_uri: &str) -> StoreResult<String>;

    /// Create a fresh SSK keypair.
    async fn generate_ssk_keypair(&self, ctx: &RequestContext) -> StoreResult<SskKeypair>;
}
