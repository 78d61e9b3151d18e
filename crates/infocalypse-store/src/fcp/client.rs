//! Multiplexed FCP client implementing the object store traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use infocalypse_keys::Chk;
use infocalypse_keys::Ssk;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::codec::FcpCodec;
use super::message::FcpMessage;
use crate::constants::DEFAULT_FCP_HOST;
use crate::constants::DEFAULT_FCP_PORT;
use crate::constants::FCP_HELLO_TIMEOUT;
use crate::constants::FCP_MAX_RETRIES;
use crate::constants::FCP_PRIORITY_CLASS;
use crate::constants::FCP_VERSION;
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

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<FcpMessage>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection settings for an FCP node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcpConfig {
    pub host: String,
    pub port: u16,
    /// Name announced in ClientHello. Must be unique per node.
    pub client_name: String,
}

impl Default for FcpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_FCP_HOST.to_string(),
            port: DEFAULT_FCP_PORT,
            client_name: format!("infocalypse-{}", std::process::id()),
        }
    }
}

/// What a request handler decided about one reply.
enum Step<T> {
    Continue,
    Done(StoreResult<T>),
}

/// Removes a route when the request future finishes or is dropped.
struct RouteGuard {
    routes: Routes,
    id: String,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.routes.lock().remove(&self.id);
    }
}

/// Object store backed by a Freenet node over FCP.
pub struct FcpObjectStore {
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, FcpCodec>>,
    routes: Routes,
    state: Arc<Mutex<ConnectionState>>,
    node_hello: FcpMessage,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for FcpObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcpObjectStore")
            .field("state", &*self.state.lock())
            .field("pending", &self.routes.lock().len())
            .finish()
    }
}

impl Drop for FcpObjectStore {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl FcpObjectStore {
    /// Connect to a node and perform the hello handshake.
    #[instrument(skip(config), fields(host = %config.host, port = config.port))]
    pub async fn connect(config: &FcpConfig) -> StoreResult<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await.map_err(|err| {
            StoreError::Network {
                message: format!("connect to {}:{} failed: {err}", config.host, config.port),
            }
        })?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, &config.client_name).await
    }

    /// Run the handshake over an arbitrary duplex stream.
    pub async fn handshake<T>(stream: T, client_name: &str) -> StoreResult<Self>
    where T: AsyncRead + AsyncWrite + Send + 'static {
        let (read, write) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read, FcpCodec::new());
        let mut writer = FramedWrite::new(Box::new(write) as BoxedWriter, FcpCodec::new());

        writer
            .send(FcpMessage::new("ClientHello").field("Name", client_name).field("ExpectedVersion", FCP_VERSION))
            .await?;

        let node_hello = match tokio::time::timeout(FCP_HELLO_TIMEOUT, reader.next()).await {
            Err(_) => {
                return Err(StoreError::Network {
                    message: "timed out waiting for NodeHello".to_string(),
                });
            }
            Ok(None) => return Err(StoreError::socket_closed()),
            Ok(Some(frame)) => frame?,
        };
        if node_hello.name != "NodeHello" {
            return Err(node_hello.to_error(""));
        }
        info!(
            node = node_hello.get("Node").unwrap_or("unknown"),
            version = node_hello.get("Version").unwrap_or("unknown"),
            "connected to FCP node"
        );

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(Mutex::new(ConnectionState::Connected));
        let reader = tokio::spawn(read_loop(reader, routes.clone(), state.clone()));

        Ok(Self {
            writer: tokio::sync::Mutex::new(writer),
            routes,
            state,
            node_hello,
            reader,
        })
    }

    /// The node's hello message.
    pub fn node_hello(&self) -> &FcpMessage {
        &self.node_hello
    }

    async fn send(&self, msg: FcpMessage) -> StoreResult<()> {
        let mut writer = self.writer.lock().await;
        let uploading = msg.data.is_some();
        if uploading {
            self.set_state(ConnectionState::Uploading);
        }
        let result = writer.send(msg).await;
        if uploading {
            self.set_state(ConnectionState::Connected);
        }
        result.map_err(StoreError::from)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    /// Send `msg` and feed replies for `id` to `on_reply` until it finishes.
    async fn transact<T, F>(&self, ctx: &RequestContext, id: &str, msg: FcpMessage, mut on_reply: F) -> StoreResult<T>
    where
        T: Send,
        F: FnMut(FcpMessage) -> Step<T> + Send,
    {
        if self.connection_state() == ConnectionState::Closed {
            return Err(StoreError::socket_closed());
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(id.to_string(), tx);
        let _guard = RouteGuard {
            routes: self.routes.clone(),
            id: id.to_string(),
        };

        self.send(msg).await?;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    debug!(tag = %ctx.tag, id, "cancelling FCP request");
                    let remove = FcpMessage::new("RemoveRequest").field("Identifier", id).field("Global", "false");
                    if let Err(err) = self.send(remove).await {
                        warn!(id, error = %err, "failed to send RemoveRequest");
                    }
                    return Err(StoreError::Cancelled { tag: ctx.tag.to_string() });
                }
                reply = rx.recv() => {
                    let Some(reply) = reply else {
                        return Err(StoreError::socket_closed());
                    };
                    match reply.name.as_str() {
                        "SimpleProgress" => ctx.report_progress(Progress {
                            succeeded: reply.get_u32("Succeeded").unwrap_or(0),
                            required: reply.get_u32("Required").unwrap_or(0),
                            total: reply.get_u32("Total").unwrap_or(0),
                            final_total: reply.get_bool("FinalizedTotal"),
                        }),
                        "ProtocolError" => return Err(reply.to_error("")),
                        _ => {
                            if let Step::Done(result) = on_reply(reply) {
                                return result;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn get_once(&self, ctx: &RequestContext, id: &str, uri: &str, options: &GetOptions) -> StoreResult<GetResult> {
        let mut msg = FcpMessage::new("ClientGet")
            .field("URI", uri)
            .field("Identifier", id)
            .field("ReturnType", "direct")
            .field("Verbosity", 1)
            .field("MaxRetries", FCP_MAX_RETRIES)
            .field("PriorityClass", FCP_PRIORITY_CLASS)
            .field("Persistence", "connection")
            .field("Global", "false");
        if let Some(max) = options.max_size {
            msg.set("MaxSize", max);
        }

        let mut mime = None;
        self.transact(ctx, id, msg, |reply| match reply.name.as_str() {
            "DataFound" => {
                mime = reply.get("Metadata.ContentType").map(str::to_string);
                Step::Continue
            }
            "AllData" => Step::Done(Ok(GetResult {
                uri: uri.to_string(),
                mime: reply.get("Metadata.ContentType").map(str::to_string).or_else(|| mime.take()),
                data: reply.data.clone().unwrap_or_default(),
            })),
            "GetFailed" => Step::Done(Err(reply.to_error(uri))),
            _ => Step::Continue,
        })
        .await
    }

    async fn put(&self, ctx: &RequestContext, msg: FcpMessage, uri: &str) -> StoreResult<String> {
        let id = ctx.tag.to_string();
        self.transact(ctx, &id, msg, |reply| match reply.name.as_str() {
            "PutSuccessful" => match reply.get("URI") {
                Some(uri) => Step::Done(Ok(uri.trim_end_matches('/').to_string())),
                None => Step::Done(Err(StoreError::Protocol {
                    message: "PutSuccessful without URI".to_string(),
                })),
            },
            "PutFailed" => Step::Done(Err(reply.to_error(uri))),
            _ => Step::Continue,
        })
        .await
    }
}

async fn read_loop<R>(mut reader: FramedRead<R, FcpCodec>, routes: Routes, state: Arc<Mutex<ConnectionState>>)
where R: AsyncRead + Unpin {
    while let Some(frame) = reader.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "FCP read failed");
                break;
            }
        };
        let Some(id) = msg.identifier().map(str::to_string) else {
            warn!(message = %msg.name, "FCP message without identifier");
            continue;
        };
        let route = routes.lock().get(&id).cloned();
        match route {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => debug!(id, message = %msg.name, "reply for unknown request"),
        }
    }

    *state.lock() = ConnectionState::Closed;
    // Dropping the senders wakes every waiter with a closed channel, which
    // `transact` reports as "Socket closed".
    let pending = routes.lock().drain().count();
    if pending > 0 {
        warn!(pending, "FCP socket closed with requests in flight");
    }
}

#[async_trait]
impl ObjectRead for FcpObjectStore {
    #[instrument(skip(self, ctx, options), fields(tag = %ctx.tag))]
    async fn get(&self, ctx: &RequestContext, uri: &str, options: &GetOptions) -> StoreResult<GetResult> {
        let mut uri = uri.to_string();
        let mut redirects_left = options.max_redirects;
        let mut attempt = 0u32;
        loop {
            let id = if attempt == 0 {
                ctx.tag.to_string()
            } else {
                format!("{}:{attempt}", ctx.tag)
            };
            match self.get_once(ctx, &id, &uri, options).await {
                Err(StoreError::Redirect { uri: next }) if redirects_left > 0 && next != uri => {
                    debug!(from = %uri, to = %next, "following redirect");
                    uri = next;
                    redirects_left -= 1;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl ObjectWrite for FcpObjectStore {
    #[instrument(skip(self, ctx, data), fields(tag = %ctx.tag, len = data.len()))]
    async fn put_chk(
        &self,
        ctx: &RequestContext,
        data: Bytes,
        mime: Option<&str>,
        dont_compress: bool,
    ) -> StoreResult<Chk> {
        let mut msg = FcpMessage::new("ClientPut")
            .field("URI", "CHK@")
            .field("Identifier", &ctx.tag)
            .field("Verbosity", 1)
            .field("MaxRetries", FCP_MAX_RETRIES)
            .field("PriorityClass", FCP_PRIORITY_CLASS)
            .field("DontCompress", dont_compress)
            .field("GetCHKOnly", "false")
            .field("UploadFrom", "direct")
            .field("Persistence", "connection")
            .field("Global", "false");
        if let Some(mime) = mime {
            msg.set("Metadata.ContentType", mime);
        }
        let uri = self.put(ctx, msg.with_data(data), "CHK@").await?;
        Ok(Chk::parse(&uri)?.without_filename())
    }

    #[instrument(skip(self, ctx, data), fields(tag = %ctx.tag, len = data.len()))]
    async fn put_ssk(&self, ctx: &RequestContext, uri: &str, data: Bytes) -> StoreResult<String> {
        let msg = FcpMessage::new("ClientPut")
            .field("URI", uri)
            .field("Identifier", &ctx.tag)
            .field("Verbosity", 1)
            .field("MaxRetries", FCP_MAX_RETRIES)
            .field("PriorityClass", FCP_PRIORITY_CLASS)
            .field("DontCompress", "true")
            .field("UploadFrom", "direct")
            .field("Persistence", "connection")
            .field("Global", "false")
            .with_data(data);
        self.put(ctx, msg, uri).await
    }
}

#[async_trait]
impl KeyOps for FcpObjectStore {
    async fn invert_key(&self, ctx: &RequestContext, insert_uri: &str) -> StoreResult<String> {
        // GetCHKOnly computes the request URI without touching the network.
        let msg = FcpMessage::new("ClientPut")
            .field("URI", insert_uri)
            .field("Identifier", &ctx.tag)
            .field("GetCHKOnly", "true")
            .field("UploadFrom", "direct")
            .field("Persistence", "connection")
            .field("Global", "false")
            .with_data(Bytes::from_static(b"infocalypse"));
        self.put(ctx, msg, insert_uri).await
    }

    async fn generate_ssk_keypair(&self, ctx: &RequestContext) -> StoreResult<SskKeypair> {
        let id = ctx.tag.to_string();
        let msg = FcpMessage::new("GenerateSSK").field("Identifier", &id);
        self.transact(ctx, &id, msg, |reply| {
            if reply.name != "SSKKeypair" {
                return Step::Continue;
            }
            let keys = match (reply.get("InsertURI"), reply.get("RequestURI")) {
                (Some(insert), Some(request)) => Ssk::parse(insert)
                    .and_then(|insert| Ok(SskKeypair {
                        insert,
                        request: Ssk::parse(request)?,
                    }))
                    .map_err(StoreError::from),
                _ => Err(StoreError::Protocol {
                    message: "SSKKeypair missing keys".to_string(),
                }),
            };
            Step::Done(keys)
        })
        .await
    }
}

impl RequestControl for FcpObjectStore {
    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;

    /// Fake node: answers the handshake, then hands each request to `respond`.
    fn spawn_node<F>(stream: DuplexStream, mut respond: F) -> JoinHandle<Vec<FcpMessage>>
    where F: FnMut(&FcpMessage) -> Vec<FcpMessage> + Send + 'static {
        tokio::spawn(async move {
            let mut framed = tokio_util::codec::Framed::new(stream, FcpCodec::new());
            let mut seen = Vec::new();
            while let Some(Ok(msg)) = framed.next().await {
                let replies = if msg.name == "ClientHello" {
                    vec![FcpMessage::new("NodeHello").field("FCPVersion", "2.0").field("Node", "Fred")]
                } else {
                    respond(&msg)
                };
                seen.push(msg);
                for reply in replies {
                    if reply.name == "Hangup" {
                        return seen;
                    }
                    if framed.send(reply).await.is_err() {
                        return seen;
                    }
                }
            }
            seen
        })
    }

    async fn connect(respond: impl FnMut(&FcpMessage) -> Vec<FcpMessage> + Send + 'static) -> (FcpObjectStore, JoinHandle<Vec<FcpMessage>>) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let node = spawn_node(server, respond);
        let store = FcpObjectStore::handshake(client, "test-client").await.expect("handshake should succeed");
        (store, node)
    }

    fn id_of(msg: &FcpMessage) -> String {
        msg.identifier().unwrap_or_default().to_string()
    }

    const CHK: &str = "CHK@4E2BANwYJXWPrqn~bnu9KwETk~QHkwIKO5E6ygoLYqw,6R8IaBcigOxCuMFjLCLGBSJ4oYPgMsJ8w9FdHzAQ5ws,AAMC--8";

    #[tokio::test]
    async fn test_handshake_records_node_hello() {
        let (store, _node) = connect(|_| Vec::new()).await;
        assert_eq!(store.node_hello().get("Node"), Some("Fred"));
        assert_eq!(store.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_put_chk_returns_key_and_sends_data() {
        let (store, node) = connect(|msg| {
            if msg.name != "ClientPut" {
                return Vec::new();
            }
            vec![
                FcpMessage::new("URIGenerated").field("Identifier", id_of(msg)).field("URI", CHK),
                FcpMessage::new("SimpleProgress").field("Identifier", id_of(msg)).field("Succeeded", 1),
                FcpMessage::new("PutSuccessful").field("Identifier", id_of(msg)).field("URI", format!("{CHK}/")),
            ]
        })
        .await;

        let ctx = RequestContext::detached("put");
        let chk = store
            .put_chk(&ctx, Bytes::from_static(b"bundle"), Some("application/mercurial-bundle;0"), true)
            .await
            .expect("put should succeed");
        assert_eq!(chk.to_string(), CHK);
        drop(store);

        let seen = node.await.unwrap();
        let put = seen.iter().find(|m| m.name == "ClientPut").expect("ClientPut sent");
        assert_eq!(put.get("Metadata.ContentType"), Some("application/mercurial-bundle;0"));
        assert_eq!(put.get("DataLength"), Some("6"));
        assert_eq!(put.data.as_deref(), Some(&b"bundle"[..]));
    }

    #[tokio::test]
    async fn test_put_collision_surfaces_distinctly() {
        let (store, _node) = connect(|msg| {
            vec![FcpMessage::new("PutFailed").field("Identifier", id_of(msg)).field("Code", 9)]
        })
        .await;
        let ctx = RequestContext::detached("put");
        let err = store.put_ssk(&ctx, "USK@a,b,c/repo/1", Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, StoreError::Collision { .. }));
    }

    #[tokio::test]
    async fn test_get_follows_redirect() {
        let (store, _node) = connect(|msg| {
            let id = id_of(msg);
            if msg.get("URI") == Some("USK@a,b,c/repo/1") {
                vec![FcpMessage::new("GetFailed").field("Identifier", id).field("Code", 27).field("RedirectURI", "USK@a,b,c/repo/4")]
            } else {
                vec![
                    FcpMessage::new("DataFound").field("Identifier", id.clone()).field("Metadata.ContentType", "text/plain"),
                    FcpMessage::new("AllData").field("Identifier", id).with_data(Bytes::from_static(b"top")),
                ]
            }
        })
        .await;

        let ctx = RequestContext::detached("get");
        let got = store.get(&ctx, "USK@a,b,c/repo/1", &GetOptions::default()).await.expect("get should succeed");
        assert_eq!(got.uri, "USK@a,b,c/repo/4");
        assert_eq!(got.mime.as_deref(), Some("text/plain"));
        assert_eq!(&got.data[..], b"top");
    }

    #[tokio::test]
    async fn test_socket_close_fails_pending_requests() {
        let (store, _node) = connect(|_| vec![FcpMessage::new("Hangup")]).await;
        let ctx = RequestContext::detached("get");
        let err = store.get(&ctx, CHK, &GetOptions::default()).await.unwrap_err();
        assert_eq!(err, StoreError::socket_closed());
        assert_eq!(store.connection_state(), ConnectionState::Closed);

        let again = store.get(&RequestContext::detached("get"), CHK, &GetOptions::default()).await.unwrap_err();
        assert_eq!(again, StoreError::socket_closed());
    }

    #[tokio::test]
    async fn test_cancel_sends_remove_request() {
        let (store, node) = connect(|_| Vec::new()).await;
        let ctx = RequestContext::detached("get");
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = store.get(&ctx, CHK, &GetOptions::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { .. }));
        drop(store);

        let seen = node.await.unwrap();
        let remove = seen.iter().find(|m| m.name == "RemoveRequest").expect("RemoveRequest sent");
        assert_eq!(remove.identifier(), Some(ctx.tag.as_str()));
    }

    #[tokio::test]
    async fn test_generate_keypair() {
        let (store, _node) = connect(|msg| {
            vec![FcpMessage::new("SSKKeypair")
                .field("Identifier", id_of(msg))
                .field("InsertURI", "SSK@priv,crypt,AQECAAE/")
                .field("RequestURI", "SSK@pub,crypt,AQACAAE/")]
        })
        .await;
        let keys = store.generate_ssk_keypair(&RequestContext::detached("keys")).await.expect("keypair");
        assert_eq!(keys.insert.key(), "priv,crypt,AQECAAE");
        assert_eq!(keys.request.to_usk("repo.R1", 0).to_string(), "USK@pub,crypt,AQACAAE/repo.R1/0");
    }
}
