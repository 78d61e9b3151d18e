//! In-memory object store for testing.
//!
//! Behaves like a tiny single-node store: CHKs are derived from content
//! with BLAKE3, data larger than one block becomes a splitfile with a text
//! metadata block, and USK editions collide when republished with
//! different data. Faults and latency can be injected per test.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use bytes::BytesMut;
use infocalypse_keys::Chk;
use infocalypse_keys::Ssk;
use infocalypse_keys::Usk;
use infocalypse_keys::chk::DEFAULT_EXTRA;
use infocalypse_keys::encoding;
use parking_lot::RwLock;
use tracing::debug;

use crate::constants::BLOCK_LEN;
use crate::constants::MAX_PUT_LEN;
use crate::error::StoreError;
use crate::error::StoreResult;
use crate::traits::KeyOps;
use crate::traits::ObjectRead;
use crate::traits::ObjectWrite;
use crate::traits::RequestControl;
use crate::types::ConnectionState;
use crate::types::GetOptions;
use crate::types::GetResult;
use crate::types::Progress;
use crate::types::RequestContext;
use crate::types::SskKeypair;

/// First line of a splitfile metadata block.
pub const SPLITFILE_MAGIC: &str = "infocalypse-splitfile-v1";

const INSERT_EXTRA: &str = "AQECAAE";
const REQUEST_EXTRA: &str = "AQACAAE";

/// Counters for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub gets: u64,
    pub chk_puts: u64,
    pub ssk_puts: u64,
    pub blocks: u64,
}

#[derive(Debug, Clone)]
struct StoredBlock {
    crypto: [u8; 32],
    data: Bytes,
    mime: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Blocks keyed by routing key.
    blocks: HashMap<[u8; 32], StoredBlock>,
    /// USK editions keyed by (request key, name).
    usks: HashMap<(String, String), BTreeMap<i64, Bytes>>,
    /// SSK records keyed by request URI.
    ssks: HashMap<String, Bytes>,
    /// Errors returned by the next requests, in order.
    queued_faults: VecDeque<StoreError>,
    /// Errors returned for every get of a URI.
    failing_uris: HashMap<String, StoreError>,
    latency: Option<Duration>,
    connection_state: Option<ConnectionState>,
    stats: MemoryStoreStats,
}

/// In-memory object store. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    inner: Arc<RwLock<MemoryState>>,
}

/// Split splitfile metadata into its mime type, length and block keys.
pub fn parse_splitfile_metadata(data: &[u8]) -> Option<(Option<String>, u64, Vec<Chk>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();
    if lines.next()? != SPLITFILE_MAGIC {
        return None;
    }
    let mut mime = None;
    let mut length = None;
    let mut blocks = Vec::new();
    for line in lines {
        let (field, value) = line.split_once('=')?;
        match field {
            "content-type" => mime = Some(value.to_string()),
            "length" => length = Some(value.parse().ok()?),
            "block" => blocks.push(Chk::parse(value).ok()?),
            _ => return None,
        }
    }
    Some((mime, length?, blocks))
}

fn block_chk(data: &[u8], mime: Option<&str>) -> Chk {
    let mut hasher = blake3::Hasher::new();
    hasher.update(mime.unwrap_or_default().as_bytes());
    hasher.update(&[0]);
    hasher.update(data);
    let crypto = *hasher.finalize().as_bytes();
    let routing = *blake3::hash(&crypto).as_bytes();
    Chk::from_parts(routing, crypto, DEFAULT_EXTRA)
}

fn public_routing(insert_routing: &str) -> String {
    encoding::encode(blake3::hash(insert_routing.as_bytes()).as_bytes())
}

/// Map an insert key (`routing,crypto,extra`) to its request key.
fn invert_key_material(key: &str) -> StoreResult<String> {
    let mut fields = key.splitn(3, ',');
    match (fields.next(), fields.next(), fields.next()) {
        (Some(routing), Some(crypto), Some(_)) => Ok(format!("{},{crypto},{REQUEST_EXTRA}", public_routing(routing))),
        _ => Err(StoreError::Failed {
            code: 20,
            description: format!("invalid insert key: {key}"),
        }),
    }
}

enum NamedKey {
    Usk(Usk),
    Ssk(Ssk),
}

fn parse_named(uri: &str) -> StoreResult<NamedKey> {
    if uri.starts_with("USK@") {
        Ok(NamedKey::Usk(Usk::parse(uri)?))
    } else {
        Ok(NamedKey::Ssk(Ssk::parse(uri)?))
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counters.
    pub fn stats(&self) -> MemoryStoreStats {
        let state = self.inner.read();
        MemoryStoreStats {
            blocks: state.blocks.len() as u64,
            ..state.stats
        }
    }

    /// Make the next request fail with `error`.
    pub fn fail_next(&self, error: StoreError) {
        self.inner.write().queued_faults.push_back(error);
    }

    /// Make every get of exactly `uri` fail with `error`.
    pub fn fail_uri(&self, uri: impl Into<String>, error: StoreError) {
        self.inner.write().failing_uris.insert(uri.into(), error);
    }

    /// Drop a block so later gets report `NotFound`.
    pub fn forget(&self, chk: &Chk) -> bool {
        self.inner.write().blocks.remove(chk.routing_key()).is_some()
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.write().latency = Some(latency);
    }

    /// Override the reported connection state.
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.inner.write().connection_state = Some(state);
    }

    /// Raw block content without metadata interpretation.
    pub fn raw_block(&self, chk: &Chk) -> Option<Bytes> {
        self.inner.read().blocks.get(chk.routing_key()).map(|block| block.data.clone())
    }

    /// Latest published edition of a request USK, if any.
    pub fn latest_edition(&self, usk: &Usk) -> Option<i64> {
        let state = self.inner.read();
        let editions = state.usks.get(&(usk.key().to_string(), usk.name().to_string()))?;
        editions.keys().next_back().copied()
    }

    async fn begin(&self, ctx: &RequestContext) -> StoreResult<()> {
        let latency = self.inner.read().latency;
        if let Some(latency) = latency {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(StoreError::Cancelled { tag: ctx.tag.to_string() });
                }
                _ = tokio::time::sleep(latency) => {}
            }
        }
        if ctx.cancel.is_cancelled() {
            return Err(StoreError::Cancelled {
                tag: ctx.tag.to_string(),
            });
        }
        match self.inner.write().queued_faults.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn store_block(state: &mut MemoryState, data: Bytes, mime: Option<&str>) -> Chk {
        let chk = block_chk(&data, mime);
        state.blocks.insert(*chk.routing_key(), StoredBlock {
            crypto: *chk.crypto_key(),
            data,
            mime: mime.map(str::to_string),
        });
        chk
    }

    fn load_block(state: &MemoryState, chk: &Chk) -> Option<StoredBlock> {
        state.blocks.get(chk.routing_key()).filter(|block| &block.crypto == chk.crypto_key()).cloned()
    }

    fn get_chk(state: &MemoryState, uri: &str, chk: &Chk) -> StoreResult<(Option<String>, Bytes)> {
        let not_found = || StoreError::NotFound { uri: uri.to_string() };
        let block = Self::load_block(state, chk).ok_or_else(not_found)?;
        if !chk.is_control_document() {
            return Ok((block.mime, block.data));
        }

        let (mime, length, keys) = parse_splitfile_metadata(&block.data).ok_or_else(|| StoreError::Failed {
            code: 4,
            description: "invalid splitfile metadata".to_string(),
        })?;
        let mut data = BytesMut::with_capacity(length as usize);
        for key in &keys {
            let part = Self::load_block(state, key).ok_or_else(not_found)?;
            data.extend_from_slice(&part.data);
        }
        if data.len() as u64 != length {
            return Err(StoreError::Failed {
                code: 4,
                description: format!("splitfile length mismatch: {} != {length}", data.len()),
            });
        }
        Ok((mime, data.freeze()))
    }

    fn get_usk(state: &MemoryState, uri: &str, usk: &Usk, options: &GetOptions) -> StoreResult<GetResult> {
        let not_found = || StoreError::NotFound { uri: uri.to_string() };
        let editions = state.usks.get(&(usk.key().to_string(), usk.name().to_string())).ok_or_else(not_found)?;
        let wanted = usk.version().max(0);
        let (&found, data) = editions.range(wanted..).next_back().ok_or_else(not_found)?;
        let final_uri = usk.with_version(found).to_string();
        if found != usk.version() && usk.version() >= 0 && options.max_redirects == 0 {
            return Err(StoreError::Redirect { uri: final_uri });
        }
        Ok(GetResult {
            uri: final_uri,
            mime: None,
            data: data.clone(),
        })
    }
}

#[async_trait]
impl ObjectRead for InMemoryObjectStore {
    async fn get(&self, ctx: &RequestContext, uri: &str, options: &GetOptions) -> StoreResult<GetResult> {
        self.begin(ctx).await?;
        let mut state = self.inner.write();
        state.stats.gets += 1;
        if let Some(error) = state.failing_uris.get(uri) {
            return Err(error.clone());
        }

        let result = if uri.starts_with("CHK@") {
            let chk = Chk::parse(uri)?;
            let (mime, data) = Self::get_chk(&state, uri, &chk)?;
            GetResult {
                uri: uri.to_string(),
                mime,
                data,
            }
        } else {
            match parse_named(uri)? {
                NamedKey::Usk(usk) => Self::get_usk(&state, uri, &usk, options)?,
                NamedKey::Ssk(ssk) => {
                    let data = state.ssks.get(&ssk.to_string()).cloned().ok_or_else(|| StoreError::NotFound {
                        uri: uri.to_string(),
                    })?;
                    GetResult {
                        uri: uri.to_string(),
                        mime: None,
                        data,
                    }
                }
            }
        };

        if let Some(max) = options.max_size
            && result.data.len() as u64 > max
        {
            return Err(StoreError::TooLarge {
                size: result.data.len() as u64,
                max,
            });
        }
        debug!(tag = %ctx.tag, uri, len = result.data.len(), "memory get");
        ctx.report_progress(Progress {
            succeeded: 1,
            required: 1,
            total: 1,
            final_total: true,
        });
        Ok(result)
    }
}

#[async_trait]
impl ObjectWrite for InMemoryObjectStore {
    async fn put_chk(
        &self,
        ctx: &RequestContext,
        data: Bytes,
        mime: Option<&str>,
        _dont_compress: bool,
    ) -> StoreResult<Chk> {
        self.begin(ctx).await?;
        if data.len() > MAX_PUT_LEN {
            return Err(StoreError::TooLarge {
                size: data.len() as u64,
                max: MAX_PUT_LEN as u64,
            });
        }
        let mut state = self.inner.write();
        state.stats.chk_puts += 1;

        if data.len() <= BLOCK_LEN {
            let chk = Self::store_block(&mut state, data, mime);
            debug!(tag = %ctx.tag, chk = %chk, "memory put single block");
            return Ok(chk);
        }

        let mut metadata = format!("{SPLITFILE_MAGIC}\n");
        if let Some(mime) = mime {
            metadata.push_str(&format!("content-type={mime}\n"));
        }
        metadata.push_str(&format!("length={}\n", data.len()));
        for part in data.chunks(BLOCK_LEN) {
            let part_chk = Self::store_block(&mut state, data.slice_ref(part), None);
            metadata.push_str(&format!("block={part_chk}\n"));
        }
        let chk = Self::store_block(&mut state, Bytes::from(metadata), None).as_control_document();
        debug!(tag = %ctx.tag, chk = %chk, len = data.len(), "memory put splitfile");
        Ok(chk)
    }

    async fn put_ssk(&self, ctx: &RequestContext, uri: &str, data: Bytes) -> StoreResult<String> {
        self.begin(ctx).await?;
        let mut state = self.inner.write();
        state.stats.ssk_puts += 1;

        match parse_named(uri)? {
            NamedKey::Usk(usk) => {
                let public = usk.with_key(invert_key_material(usk.key())?);
                let editions = state.usks.entry((public.key().to_string(), public.name().to_string())).or_default();
                match editions.get(&usk.version()) {
                    Some(existing) if existing != &data => {
                        return Err(StoreError::Collision { uri: public.to_string() });
                    }
                    Some(_) => {}
                    None => {
                        editions.insert(usk.version(), data);
                    }
                }
                debug!(tag = %ctx.tag, uri = %public, "memory put usk");
                Ok(public.to_string())
            }
            NamedKey::Ssk(ssk) => {
                let public = Ssk::new(invert_key_material(ssk.key())?, ssk.docname()).to_string();
                match state.ssks.get(&public) {
                    Some(existing) if existing != &data => return Err(StoreError::Collision { uri: public }),
                    Some(_) => {}
                    None => {
                        state.ssks.insert(public.clone(), data);
                    }
                }
                Ok(public)
            }
        }
    }
}

#[async_trait]
impl KeyOps for InMemoryObjectStore {
    async fn invert_key(&self, ctx: &RequestContext, insert_uri: &str) -> StoreResult<String> {
        self.begin(ctx).await?;
        match parse_named(insert_uri)? {
            NamedKey::Usk(usk) => Ok(usk.with_key(invert_key_material(usk.key())?).to_string()),
            NamedKey::Ssk(ssk) => Ok(Ssk::new(invert_key_material(ssk.key())?, ssk.docname()).to_string()),
        }
    }

    async fn generate_ssk_keypair(&self, ctx: &RequestContext) -> StoreResult<SskKeypair> {
        self.begin(ctx).await?;
        let private: [u8; 32] = rand::random();
        let crypto: [u8; 32] = rand::random();
        let insert_key = format!(
            "{},{},{INSERT_EXTRA}",
            encoding::encode(&private),
            encoding::encode(&crypto)
        );
        let request_key = invert_key_material(&insert_key)?;
        Ok(SskKeypair {
            insert: Ssk::new(insert_key, ""),
            request: Ssk::new(request_key, ""),
        })
    }
}

impl RequestControl for InMemoryObjectStore {
    fn connection_state(&self) -> ConnectionState {
        self.inner.read().connection_state.unwrap_or(ConnectionState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::detached("test")
    }

    async fn get(store: &InMemoryObjectStore, uri: &str) -> StoreResult<GetResult> {
        store.get(&ctx(), uri, &GetOptions::default()).await
    }

    #[tokio::test]
    async fn test_small_put_round_trip() {
        let store = InMemoryObjectStore::new();
        let chk = store.put_chk(&ctx(), Bytes::from_static(b"hello"), None, true).await.unwrap();
        assert!(!chk.is_control_document());
        let got = get(&store, &chk.to_string()).await.unwrap();
        assert_eq!(&got.data[..], b"hello");
    }

    #[tokio::test]
    async fn test_same_content_same_key() {
        let store = InMemoryObjectStore::new();
        let a = store.put_chk(&ctx(), Bytes::from_static(b"x"), Some("text/plain"), true).await.unwrap();
        let b = store.put_chk(&ctx(), Bytes::from_static(b"x"), Some("text/plain"), true).await.unwrap();
        let c = store.put_chk(&ctx(), Bytes::from_static(b"x"), None, true).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_large_put_becomes_splitfile() {
        let store = InMemoryObjectStore::new();
        let data = Bytes::from(vec![7u8; BLOCK_LEN * 2 + 10]);
        let chk = store.put_chk(&ctx(), data.clone(), Some("application/x-test;0"), true).await.unwrap();
        assert!(chk.is_control_document());

        let got = get(&store, &chk.to_string()).await.unwrap();
        assert_eq!(got.data, data);
        assert_eq!(got.mime.as_deref(), Some("application/x-test;0"));

        let raw = get(&store, &chk.raw_metadata().to_string()).await.unwrap();
        let (mime, length, blocks) = parse_splitfile_metadata(&raw.data).expect("should be metadata");
        assert_eq!(mime.as_deref(), Some("application/x-test;0"));
        assert_eq!(length, data.len() as u64);
        assert_eq!(blocks.len(), 3);
    }

    #[tokio::test]
    async fn test_modified_metadata_aliases_same_blocks() {
        let store = InMemoryObjectStore::new();
        let data = Bytes::from(vec![1u8; BLOCK_LEN + 1]);
        let chk = store.put_chk(&ctx(), data.clone(), Some("application/x-test;0"), true).await.unwrap();
        let raw = store.raw_block(&chk.raw_metadata()).expect("metadata stored");

        let salted = String::from_utf8(raw.to_vec()).unwrap().replace(";0", ";1");
        let alias = store.put_chk(&ctx(), Bytes::from(salted), None, true).await.unwrap().as_control_document();
        assert_ne!(alias, chk);

        let got = get(&store, &alias.to_string()).await.unwrap();
        assert_eq!(got.data, data);
        assert_eq!(got.mime.as_deref(), Some("application/x-test;1"));
    }

    #[tokio::test]
    async fn test_forget_reports_not_found() {
        let store = InMemoryObjectStore::new();
        let chk = store.put_chk(&ctx(), Bytes::from_static(b"gone"), None, true).await.unwrap();
        assert!(store.forget(&chk));
        let err = get(&store, &chk.to_string()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_max_size_enforced() {
        let store = InMemoryObjectStore::new();
        let chk = store.put_chk(&ctx(), Bytes::from(vec![0u8; 100]), None, true).await.unwrap();
        let err = store.get(&ctx(), &chk.to_string(), &GetOptions::max_size(10)).await.unwrap_err();
        assert_eq!(err, StoreError::TooLarge { size: 100, max: 10 });
    }

    #[tokio::test]
    async fn test_usk_publish_and_resolve_latest() {
        let store = InMemoryObjectStore::new();
        let keys = store.generate_ssk_keypair(&ctx()).await.unwrap();
        let insert = keys.insert.to_usk("repo.R1", 0);

        let public = store.put_ssk(&ctx(), &insert.to_string(), Bytes::from_static(b"v0")).await.unwrap();
        assert_eq!(public, keys.request.to_usk("repo.R1", 0).to_string());
        store.put_ssk(&ctx(), &insert.with_version(1).to_string(), Bytes::from_static(b"v1")).await.unwrap();

        let got = get(&store, &keys.request.to_usk("repo.R1", 0).to_string()).await.unwrap();
        assert_eq!(&got.data[..], b"v1");
        assert_eq!(got.uri, keys.request.to_usk("repo.R1", 1).to_string());

        let hint = store
            .get(&ctx(), &keys.request.to_usk("repo.R1", 0).to_string(), &GetOptions {
                max_size: None,
                max_redirects: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(hint, StoreError::Redirect { .. }));
    }

    #[tokio::test]
    async fn test_usk_collision_on_different_data() {
        let store = InMemoryObjectStore::new();
        let keys = store.generate_ssk_keypair(&ctx()).await.unwrap();
        let insert = keys.insert.to_usk("repo", 3).to_string();
        store.put_ssk(&ctx(), &insert, Bytes::from_static(b"a")).await.unwrap();
        store.put_ssk(&ctx(), &insert, Bytes::from_static(b"a")).await.expect("identical data is not a collision");
        let err = store.put_ssk(&ctx(), &insert, Bytes::from_static(b"b")).await.unwrap_err();
        assert_eq!(err.code(), Some(crate::constants::FCP_CODE_COLLISION));
    }

    #[tokio::test]
    async fn test_invert_key_matches_generated_pair() {
        let store = InMemoryObjectStore::new();
        let keys = store.generate_ssk_keypair(&ctx()).await.unwrap();
        let insert = keys.insert.to_usk("repo.R1", 4).to_string();
        let request = store.invert_key(&ctx(), &insert).await.unwrap();
        assert_eq!(request, keys.request.to_usk("repo.R1", 4).to_string());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = InMemoryObjectStore::new();
        store.fail_next(StoreError::Network {
            message: "boom".to_string(),
        });
        assert!(store.put_chk(&ctx(), Bytes::from_static(b"a"), None, true).await.is_err());
        assert!(store.put_chk(&ctx(), Bytes::from_static(b"a"), None, true).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_respects_cancellation() {
        let store = InMemoryObjectStore::new();
        store.set_latency(Duration::from_secs(60));
        let ctx = ctx();
        let token = ctx.cancel.clone();
        let handle = {
            let store = store.clone();
            tokio::spawn(async move { store.get(&ctx, "CHK@x,y,z", &GetOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { .. }));
    }
}
