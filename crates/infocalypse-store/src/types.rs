//! Request and response types shared by store implementations and the
//! scheduler.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use infocalypse_keys::Chk;
use infocalypse_keys::Ssk;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::DEFAULT_MAX_REDIRECTS;

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of one outstanding request.
///
/// Doubles as the FCP `Identifier`, so replies are routed back by tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestTag(String);

impl RequestTag {
    /// Allocate a process-unique tag with a readable label.
    pub fn next(label: &str) -> Self {
        let n = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        Self(format!("{label}-{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Socket state of a store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Trailing data is being written; the socket is busy.
    Uploading,
    Closed,
}

/// Progress report for a running request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub succeeded: u32,
    pub required: u32,
    pub total: u32,
    pub final_total: bool,
}

/// Per-request plumbing handed to store operations.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tag: RequestTag,
    /// Fires when the scheduler gives up on the request.
    pub cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<(RequestTag, Progress)>>,
}

impl RequestContext {
    pub fn new(tag: RequestTag) -> Self {
        Self {
            tag,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Context for a one-off request outside the scheduler.
    pub fn detached(label: &str) -> Self {
        Self::new(RequestTag::next(label))
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<(RequestTag, Progress)>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Forward a progress report to whoever is listening.
    pub fn report_progress(&self, progress: Progress) {
        if let Some(tx) = &self.progress {
            // Receiver gone means the scheduler finished; nothing to do.
            let _ = tx.send((self.tag.clone(), progress));
        }
    }
}

/// Options for a get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOptions {
    /// Fail with `TooLarge` instead of fetching more than this.
    pub max_size: Option<u64>,
    /// Redirects (for example newer USK editions) to follow.
    pub max_redirects: u32,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            max_size: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl GetOptions {
    pub fn max_size(max_size: u64) -> Self {
        Self {
            max_size: Some(max_size),
            ..Self::default()
        }
    }
}

/// Successful get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    /// URI the data was found at, after redirects.
    pub uri: String,
    pub mime: Option<String>,
    pub data: Bytes,
}

/// Generated SSK keypair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SskKeypair {
    pub insert: Ssk,
    pub request: Ssk,
}

/// A unit of work for the scheduler.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Get {
        uri: String,
        options: GetOptions,
    },
    PutChk {
        data: Bytes,
        mime: Option<String>,
        dont_compress: bool,
    },
    PutSsk {
        uri: String,
        data: Bytes,
    },
    InvertKey {
        insert_uri: String,
    },
    GenerateKeypair,
}

impl RequestKind {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Get { .. } => "get",
            RequestKind::PutChk { .. } => "put_chk",
            RequestKind::PutSsk { .. } => "put_ssk",
            RequestKind::InvertKey { .. } => "invert_key",
            RequestKind::GenerateKeypair => "generate_keypair",
        }
    }
}

/// A tagged request produced by a queue.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub tag: RequestTag,
    pub kind: RequestKind,
}

impl StoreRequest {
    pub fn new(label: &str, kind: RequestKind) -> Self {
        Self {
            tag: RequestTag::next(label),
            kind,
        }
    }
}

/// Result payload of a finished request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreResponse {
    Got(GetResult),
    PutChk(Chk),
    /// Request URI of a published SSK/USK.
    PutSsk(String),
    InvertedKey(String),
    Keypair(SskKeypair),
}
