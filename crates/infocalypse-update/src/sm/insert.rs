//! Insert state machine.
//!
//! Publishes new changesets: extends the graph, inserts the new bundles,
//! then the graph, then the top-key under every name variant. Reinserts
//! walk the same states with a chosen subset of bundles.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use infocalypse_keys::Chk;
use infocalypse_keys::Usk;
use infocalypse_store::GetOptions;
use infocalypse_store::RequestKind;
use infocalypse_store::RequestQueue;
use infocalypse_store::RequestTag;
use infocalypse_store::RunOutcome;
use infocalypse_store::StoreError;
use infocalypse_store::StoreRequest;
use infocalypse_store::StoreResponse;
use infocalypse_store::StoreResult;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::SmContext;
use super::requests::RequestSet;
use super::top_key_uris;
use crate::bundle_cache::BundleCache;
use crate::bundle_cache::BundleFile;
use crate::constants::BLOCK_LEN;
use crate::constants::BUNDLE_MIME;
use crate::constants::GRAPH_COPY_PREFIXES;
use crate::constants::GRAPH_INSERT_LEN;
use crate::constants::GRAPH_MIME;
use crate::constants::MAX_RETRIES;
use crate::constants::SALTED_BUNDLE_MIME;
use crate::constants::TOP_KEY_SALTS;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::graph::GraphUpdate;
use crate::graph::UpdateGraph;
use crate::graph::VersionTable;
use crate::graph::build_version_table;
use crate::repo::RepoBackend;
use crate::topkey::TopKey;
use crate::types::ChangesetId;
use crate::types::EdgeTriple;
use crate::types::IndexPair;
use crate::types::InsertType;

/// What an insert publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// First publish; no previous top-key is fetched.
    Create,
    /// Publish new changesets on top of the previous version.
    Push,
    /// Re-insert existing data at level 1 to 5.
    ///
    /// | Level | Re-inserts | Bumps version |
    /// |---|---|---|
    /// | 1 | top-keys and graphs | no |
    /// | 2 | + bundles of the top-key edges | no |
    /// | 3 | + bundles on the canonical path | no |
    /// | 4 | adds missing redundancy for the latest update | yes |
    /// | 5 | + redundant copies of large updates | no |
    Reinsert(u8),
}

impl InsertMode {
    fn bumps_version(self) -> bool {
        matches!(self, InsertMode::Push | InsertMode::Reinsert(4))
    }
}

/// Inputs of an insert.
#[derive(Debug, Clone)]
pub struct InsertParams {
    /// Insert USK. Its version is the create version, or the lowest
    /// version to look for the previous top-key at.
    pub insert_uri: Usk,
    pub mode: InsertMode,
    /// Heads to publish. Ignored by reinserts.
    pub targets: Vec<ChangesetId>,
    /// Parent of the bundle cache directory.
    pub tmp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Reinserted,
    /// Every target was already published; nothing was inserted.
    UpToDate,
}

/// Result of a finished insert.
#[derive(Debug, Clone)]
pub struct InsertReport {
    pub outcome: InsertOutcome,
    /// Insert USK at the published version.
    pub insert_uri: Usk,
    /// Request USK at the published version.
    pub request_uri: Usk,
    pub version: i64,
    pub new_edges: Vec<EdgeTriple>,
    /// The graph as published, if one was inserted.
    pub graph: Option<UpdateGraph>,
    pub graph_chks: Vec<Chk>,
    pub top_key: Option<TopKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertState {
    Quiescent,
    InvertingKey,
    RequestingPrevTopKey,
    RequestingPrevGraph,
    InsertingBundles,
    InsertingGraph,
    InsertingTopKey,
    Failing,
    Canceling,
    Finishing,
}

impl InsertState {
    fn name(self) -> &'static str {
        match self {
            InsertState::Quiescent => "Quiescent",
            InsertState::InvertingKey => "InvertingKey",
            InsertState::RequestingPrevTopKey => "RequestingPrevTopKey",
            InsertState::RequestingPrevGraph => "RequestingPrevGraph",
            InsertState::InsertingBundles => "InsertingBundles",
            InsertState::InsertingGraph => "InsertingGraph",
            InsertState::InsertingTopKey => "InsertingTopKey",
            InsertState::Failing => "Failing",
            InsertState::Canceling => "Canceling",
            InsertState::Finishing => "Finishing",
        }
    }

    fn is_draining(self) -> bool {
        matches!(self, InsertState::Failing | InsertState::Canceling | InsertState::Finishing)
    }
}

impl fmt::Display for InsertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
enum InsertCandidate {
    InvertKey,
    PrevTopKey { uri: Usk },
    PrevGraph { chk: Chk, tries: u32 },
    Bundle { edge: EdgeTriple, tries: u32 },
    /// Read back the primary's splitfile metadata for a salted copy.
    SaltedRead { edge: EdgeTriple, tries: u32 },
    SaltedWrite { edge: EdgeTriple, tries: u32 },
    Graph { copy: usize, tries: u32 },
    TopKey { uri: Usk, salt: u8, tries: u32 },
}

impl InsertCandidate {
    fn label(&self) -> &'static str {
        match self {
            InsertCandidate::InvertKey => "invert",
            InsertCandidate::PrevTopKey { .. } => "topkey-get",
            InsertCandidate::PrevGraph { .. } => "graph-get",
            InsertCandidate::Bundle { .. } => "bundle-put",
            InsertCandidate::SaltedRead { .. } => "salted-get",
            InsertCandidate::SaltedWrite { .. } => "salted-put",
            InsertCandidate::Graph { .. } => "graph-put",
            InsertCandidate::TopKey { .. } => "topkey-put",
        }
    }

    /// The same candidate with one more try, or `None` when out of tries.
    fn retried(&self) -> Option<Self> {
        let mut next = self.clone();
        let tries = match &mut next {
            InsertCandidate::PrevGraph { tries, .. }
            | InsertCandidate::Bundle { tries, .. }
            | InsertCandidate::SaltedRead { tries, .. }
            | InsertCandidate::SaltedWrite { tries, .. }
            | InsertCandidate::Graph { tries, .. }
            | InsertCandidate::TopKey { tries, .. } => tries,
            InsertCandidate::InvertKey | InsertCandidate::PrevTopKey { .. } => return None,
        };
        if *tries >= MAX_RETRIES {
            return None;
        }
        *tries += 1;
        Some(next)
    }
}

/// The insert state machine.
pub struct InsertMachine<'a, R: RepoBackend + ?Sized> {
    repo: &'a R,
    params: InsertParams,
    cache: BundleCache,
    state: InsertState,
    ctx: SmContext,
    requests: RequestSet<InsertCandidate>,

    request_uri: Option<Usk>,
    prev_version: Option<i64>,
    version: i64,
    graph: UpdateGraph,
    table: Option<VersionTable>,
    new_edges: Vec<EdgeTriple>,
    /// Edges that already have a CHK; results are compared, not stored.
    reinserting: BTreeSet<EdgeTriple>,
    /// Salted copies waiting for their primary to finish.
    waiting_salted: Vec<EdgeTriple>,
    primaries_in_flight: BTreeSet<IndexPair>,
    salted_metadata: HashMap<EdgeTriple, Bytes>,
    published: Option<UpdateGraph>,
    graph_chks: Vec<Option<Chk>>,
    top_key: Option<TopKey>,

    outcome: Option<InsertOutcome>,
    error: Option<UpdateError>,
}

impl<'a, R: RepoBackend + ?Sized> InsertMachine<'a, R> {
    pub fn new(repo: &'a R, params: InsertParams) -> UpdateResult<Self> {
        Self::with_shutdown(repo, params, CancellationToken::new())
    }

    /// Like [`InsertMachine::new`], stopping when `shutdown` is cancelled.
    pub fn with_shutdown(repo: &'a R, params: InsertParams, shutdown: CancellationToken) -> UpdateResult<Self> {
        if let InsertMode::Reinsert(level) = params.mode
            && !(1..=5).contains(&level)
        {
            return Err(UpdateError::ConfigValidation {
                message: format!("reinsert level must be 1 to 5, not {level}"),
            });
        }
        let cache = BundleCache::new(params.tmp_dir.as_deref())?;
        let version = params.insert_uri.version();
        let mut machine = Self {
            repo,
            params,
            cache,
            state: InsertState::Quiescent,
            ctx: SmContext::new(shutdown),
            requests: RequestSet::new(),
            request_uri: None,
            prev_version: None,
            version,
            graph: UpdateGraph::new(),
            table: None,
            new_edges: Vec::new(),
            reinserting: BTreeSet::new(),
            waiting_salted: Vec::new(),
            primaries_in_flight: BTreeSet::new(),
            salted_metadata: HashMap::new(),
            published: None,
            graph_chks: Vec::new(),
            top_key: None,
            outcome: None,
            error: None,
        };
        machine.transition(InsertState::InvertingKey);
        machine.requests.push(InsertCandidate::InvertKey);
        Ok(machine)
    }

    /// Name of the current state, for status lines.
    pub fn stage(&self) -> &'static str {
        self.state.name()
    }

    /// Consume the machine after the runner returns.
    pub fn into_report(self, run: RunOutcome) -> UpdateResult<InsertReport> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let (Some(outcome), Some(request_uri)) = (self.outcome, self.request_uri) else {
            let stage = self.state.name();
            return Err(match run {
                RunOutcome::Stalled => UpdateError::Stalled { stage },
                RunOutcome::Finished => UpdateError::Invariant {
                    message: format!("insert ended in {stage} without a result"),
                },
            });
        };
        Ok(InsertReport {
            outcome,
            insert_uri: self.params.insert_uri.with_version(self.version),
            request_uri: request_uri.with_version(self.version),
            version: self.version,
            new_edges: self.new_edges,
            graph: self.published,
            graph_chks: self.graph_chks.into_iter().flatten().collect(),
            top_key: self.top_key,
        })
    }

    fn transition(&mut self, next: InsertState) {
        info!(from = %self.state, to = %next, "insert state");
        self.state = next;
    }

    // ========================================================================
    // Terminal transitions
    // ========================================================================

    fn fail(&mut self, err: UpdateError) {
        let stage = self.state.name();
        error!(stage, error = %err, "insert failed");
        self.error = Some(err.in_stage(stage));
        let running = self.requests.clear();
        self.ctx.cancel(running);
        self.waiting_salted.clear();
        self.transition(InsertState::Failing);
    }

    fn interrupt(&mut self) {
        let stage = self.state.name();
        warn!(stage, "insert interrupted");
        self.error = Some(UpdateError::Interrupted { stage });
        let running = self.requests.clear();
        self.ctx.cancel(running);
        self.transition(InsertState::Canceling);
    }

    fn finish(&mut self, outcome: InsertOutcome) {
        self.outcome = Some(outcome);
        let running = self.requests.clear();
        self.ctx.orphan(running);
        self.transition(InsertState::Finishing);
    }

    // ========================================================================
    // State entry
    // ========================================================================

    fn enter_requesting_prev_top_key(&mut self) -> UpdateResult<()> {
        let request_uri = self.request_uri.clone().ok_or_else(|| UpdateError::Invariant {
            message: "no request uri after key inversion".to_string(),
        })?;
        self.transition(InsertState::RequestingPrevTopKey);
        for uri in top_key_uris(&request_uri, self.params.insert_uri.version()) {
            self.requests.push(InsertCandidate::PrevTopKey { uri });
        }
        Ok(())
    }

    fn enter_requesting_prev_graph(&mut self, top_key: &TopKey) -> UpdateResult<()> {
        if top_key.graph_chks.is_empty() {
            return Err(UpdateError::TopKeyParse {
                message: "top key has no graph CHKs".to_string(),
            });
        }
        self.transition(InsertState::RequestingPrevGraph);
        for chk in &top_key.graph_chks {
            self.requests.push(InsertCandidate::PrevGraph {
                chk: chk.clone(),
                tries: 0,
            });
        }
        Ok(())
    }

    fn enter_inserting_bundles(&mut self) -> UpdateResult<()> {
        self.transition(InsertState::InsertingBundles);
        let prev = self.prev_version.unwrap_or(self.params.insert_uri.version());

        let edges = match self.params.mode {
            InsertMode::Create | InsertMode::Push => {
                let mut working = self.graph.clone();
                match working.update(self.repo, &self.params.targets, &mut self.cache)? {
                    GraphUpdate::UpToDate => {
                        info!(version = prev, "repository already published");
                        self.version = prev;
                        self.finish(InsertOutcome::UpToDate);
                        return Ok(());
                    }
                    GraphUpdate::Updated(edges) => {
                        self.graph = working;
                        self.table = None;
                        self.new_edges = edges.clone();
                        edges
                    }
                }
            }
            InsertMode::Reinsert(level) => self.reinsert_edges(level)?,
        };

        self.version = match self.params.mode {
            InsertMode::Create => self.params.insert_uri.version(),
            mode if mode.bumps_version() => prev + 1,
            _ => prev,
        };
        info!(edges = edges.len(), version = self.version, "inserting bundles");
        self.queue_edges(edges)?;
        self.check_bundles_done()
    }

    fn reinsert_edges(&mut self, level: u8) -> UpdateResult<Vec<EdgeTriple>> {
        let mut edges: Vec<EdgeTriple> = Vec::new();
        let add = |edge: EdgeTriple, edges: &mut Vec<EdgeTriple>| {
            if !edges.contains(&edge) {
                edges.push(edge);
            }
        };
        if level == 4 {
            let added = self.graph.add_latest_redundancy()?;
            self.new_edges = added.clone();
            return Ok(added);
        }
        if level >= 2 {
            for edge in self.graph.get_top_key_edges()? {
                add(edge, &mut edges);
            }
        }
        if level >= 3 {
            let latest = self.graph.latest_index();
            for step in self.graph.canonical_path(latest, usize::MAX)? {
                for ordinal in 0..self.graph.redundancy(step.pair()) {
                    add(step.pair().triple(ordinal as u8), &mut edges);
                }
            }
        }
        if level == 5 {
            for edge in self.graph.triples() {
                if edge.ordinal == 1 && self.graph.edge_length(edge.pair())? > BLOCK_LEN as u64 {
                    add(edge, &mut edges);
                }
            }
        }
        for edge in &edges {
            if !self.graph.get_chk(*edge)?.is_pending() {
                self.reinserting.insert(*edge);
            }
        }
        Ok(edges)
    }

    fn queue_edges(&mut self, edges: Vec<EdgeTriple>) -> UpdateResult<()> {
        for edge in edges {
            match self.graph.insert_type(edge)? {
                InsertType::SaltedMetadata => self.waiting_salted.push(edge),
                insert_type => {
                    if insert_type == InsertType::Huge {
                        warn!(
                            edge = %edge,
                            error = %UpdateError::BundleTooLargeForSalt {
                                length: self.graph.edge_length(edge.pair())?
                            },
                            "inserting padded copy instead"
                        );
                    }
                    if edge.ordinal == 0 {
                        self.primaries_in_flight.insert(edge.pair());
                    }
                    self.requests.push(InsertCandidate::Bundle { edge, tries: 0 });
                }
            }
        }
        self.release_salted()
    }

    /// Queue salted copies whose primary has a CHK and is not being inserted.
    fn release_salted(&mut self) -> UpdateResult<()> {
        let waiting = std::mem::take(&mut self.waiting_salted);
        for edge in waiting {
            let primary = edge.pair().triple(0);
            let ready = !self.primaries_in_flight.contains(&edge.pair())
                && !self.graph.get_chk(primary)?.is_pending();
            if !ready {
                self.waiting_salted.push(edge);
            } else if self.salted_metadata.contains_key(&edge) {
                self.requests.push(InsertCandidate::SaltedWrite { edge, tries: 0 });
            } else {
                self.requests.push(InsertCandidate::SaltedRead { edge, tries: 0 });
            }
        }
        Ok(())
    }

    fn check_bundles_done(&mut self) -> UpdateResult<()> {
        if self.state != InsertState::InsertingBundles || !self.requests.is_idle() {
            return Ok(());
        }
        if !self.waiting_salted.is_empty() {
            return Err(UpdateError::Invariant {
                message: format!("{} salted copies have no primary", self.waiting_salted.len()),
            });
        }
        self.enter_inserting_graph()
    }

    fn enter_inserting_graph(&mut self) -> UpdateResult<()> {
        self.transition(InsertState::InsertingGraph);
        let pending = self.graph.pending_edges();
        if !pending.is_empty() {
            return Err(UpdateError::Invariant {
                message: format!("{} edges still pending before graph insert", pending.len()),
            });
        }
        let published = self.graph.minimize(self.repo, GRAPH_INSERT_LEN)?;
        let len = published.serialized_len();
        if len > GRAPH_INSERT_LEN {
            return Err(UpdateError::Invariant {
                message: format!("minimized graph is {len} bytes"),
            });
        }
        debug!(len, indices = published.latest_index() + 2, "publishing graph");
        self.published = Some(published);
        self.graph_chks = vec![None; GRAPH_COPY_PREFIXES.len()];
        for copy in 0..GRAPH_COPY_PREFIXES.len() {
            self.requests.push(InsertCandidate::Graph { copy, tries: 0 });
        }
        Ok(())
    }

    fn enter_inserting_top_key(&mut self) -> UpdateResult<()> {
        self.transition(InsertState::InsertingTopKey);
        let published = self.published.as_ref().ok_or_else(|| UpdateError::Invariant {
            message: "no graph to advertise".to_string(),
        })?;
        let top_key = TopKey {
            graph_chks: self.graph_chks.iter().flatten().cloned().collect(),
            updates: published.get_top_key_updates(self.repo)?,
        };
        self.top_key = Some(top_key);
        for (uri, salt) in top_key_uris(&self.params.insert_uri, self.version).into_iter().zip(TOP_KEY_SALTS) {
            self.requests.push(InsertCandidate::TopKey { uri, salt, tries: 0 });
        }
        Ok(())
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn bundle_file(&mut self, pair: IndexPair) -> UpdateResult<BundleFile> {
        if self.table.is_none() {
            self.table = Some(build_version_table(&self.graph, self.repo)?);
        }
        let table = self.table.as_ref().ok_or_else(|| UpdateError::Invariant {
            message: "version table missing".to_string(),
        })?;
        self.cache.make_bundle(&self.graph, self.repo, table, pair)
    }

    fn build_request(&mut self, candidate: &InsertCandidate) -> UpdateResult<RequestKind> {
        Ok(match candidate {
            InsertCandidate::InvertKey => RequestKind::InvertKey {
                insert_uri: self.params.insert_uri.to_string(),
            },
            InsertCandidate::PrevTopKey { uri } => RequestKind::Get {
                uri: uri.to_string(),
                options: GetOptions::max_size(BLOCK_LEN as u64),
            },
            InsertCandidate::PrevGraph { chk, .. } => RequestKind::Get {
                uri: chk.to_string(),
                options: GetOptions::max_size(BLOCK_LEN as u64),
            },
            InsertCandidate::Bundle { edge, .. } => {
                let bundle = self.bundle_file(edge.pair())?;
                let data = match self.graph.insert_type(*edge)? {
                    InsertType::Normal => self.cache.bundle_bytes(&bundle)?,
                    _ => self.cache.padded_bytes(&bundle)?,
                };
                let expected = self.graph.edge_length(edge.pair())?;
                if bundle.length != expected {
                    return Err(UpdateError::BundleCorrupt {
                        message: format!("bundle for {edge} is {} bytes, graph says {expected}", bundle.length),
                    });
                }
                RequestKind::PutChk {
                    data,
                    mime: Some(BUNDLE_MIME.to_string()),
                    dont_compress: true,
                }
            }
            InsertCandidate::SaltedRead { edge, .. } => {
                let primary = self.graph.get_chk(edge.pair().triple(0))?.chk().cloned().ok_or_else(|| {
                    UpdateError::Invariant {
                        message: format!("primary of {edge} has no CHK"),
                    }
                })?;
                RequestKind::Get {
                    uri: primary.raw_metadata().to_string(),
                    options: GetOptions::max_size(BLOCK_LEN as u64),
                }
            }
            InsertCandidate::SaltedWrite { edge, .. } => {
                let data = self.salted_metadata.get(edge).cloned().ok_or_else(|| UpdateError::Invariant {
                    message: format!("no salted metadata for {edge}"),
                })?;
                RequestKind::PutChk {
                    data,
                    mime: None,
                    dont_compress: true,
                }
            }
            InsertCandidate::Graph { copy, .. } => {
                let published = self.published.as_ref().ok_or_else(|| UpdateError::Invariant {
                    message: "no graph to insert".to_string(),
                })?;
                let mut text = GRAPH_COPY_PREFIXES[*copy].to_string();
                text.push_str(&published.to_text());
                RequestKind::PutChk {
                    data: Bytes::from(text),
                    mime: Some(GRAPH_MIME.to_string()),
                    dont_compress: false,
                }
            }
            InsertCandidate::TopKey { uri, salt, .. } => {
                let top_key = self.top_key.as_ref().ok_or_else(|| UpdateError::Invariant {
                    message: "no top key to insert".to_string(),
                })?;
                RequestKind::PutSsk {
                    uri: uri.to_string(),
                    data: top_key.encode(*salt)?,
                }
            }
        })
    }

    /// Store a bundle's CHK, or compare it when reinserting.
    fn resolve(&mut self, edge: EdgeTriple, chk: Chk) -> UpdateResult<()> {
        if self.reinserting.contains(&edge) {
            let expected = self.graph.get_chk(edge)?;
            if expected.chk() != Some(&chk.without_filename()) {
                warn!(edge = %edge, got = %chk, "reinserted bundle landed at a different CHK, keeping the original");
            }
            return Ok(());
        }
        let length = self.graph.edge_length(edge.pair())?;
        debug!(edge = %edge, chk = %chk, "bundle inserted");
        self.graph.set_chk(edge, length, chk)
    }

    fn on_success(&mut self, candidate: InsertCandidate, response: StoreResponse) -> UpdateResult<()> {
        match (candidate, response) {
            (InsertCandidate::InvertKey, StoreResponse::InvertedKey(uri)) => {
                self.request_uri = Some(Usk::parse(&uri)?);
                match self.params.mode {
                    InsertMode::Create => self.enter_inserting_bundles(),
                    _ => self.enter_requesting_prev_top_key(),
                }
            }
            (candidate @ InsertCandidate::PrevTopKey { .. }, StoreResponse::Got(got)) => {
                let top_key = match TopKey::decode(&got.data) {
                    Ok((top_key, _salt)) => top_key,
                    Err(err) => return self.on_failure(candidate, err),
                };
                let version = Usk::parse(&got.uri)?.version();
                info!(uri = %got.uri, version, "found previous top key");
                self.prev_version = Some(version);
                let running = self.requests.clear();
                self.ctx.orphan(running);
                self.enter_requesting_prev_graph(&top_key)
            }
            (candidate @ InsertCandidate::PrevGraph { .. }, StoreResponse::Got(got)) => {
                let parsed = std::str::from_utf8(&got.data)
                    .map_err(|err| UpdateError::GraphParse {
                        line: 0,
                        message: err.to_string(),
                    })
                    .and_then(UpdateGraph::parse);
                let graph = match parsed {
                    Ok(graph) => graph,
                    Err(err) => return self.on_failure(candidate, err),
                };
                let running = self.requests.clear();
                self.ctx.orphan(running);
                self.graph = graph;
                self.table = None;
                self.enter_inserting_bundles()
            }
            (InsertCandidate::Bundle { edge, .. }, StoreResponse::PutChk(chk)) => {
                self.resolve(edge, chk)?;
                if edge.ordinal == 0 {
                    self.primaries_in_flight.remove(&edge.pair());
                    self.release_salted()?;
                }
                self.check_bundles_done()
            }
            (InsertCandidate::SaltedRead { edge, .. }, StoreResponse::Got(got)) => {
                let salted = salt_metadata(&got.data).ok_or_else(|| UpdateError::BundleCorrupt {
                    message: format!("metadata of {edge} has no bundle mime marker"),
                })?;
                self.salted_metadata.insert(edge, salted);
                self.requests.push(InsertCandidate::SaltedWrite { edge, tries: 0 });
                Ok(())
            }
            (InsertCandidate::SaltedWrite { edge, .. }, StoreResponse::PutChk(chk)) => {
                self.resolve(edge, chk.as_control_document())?;
                self.check_bundles_done()
            }
            (InsertCandidate::Graph { copy, .. }, StoreResponse::PutChk(chk)) => {
                debug!(copy, chk = %chk, "graph inserted");
                if let Some(slot) = self.graph_chks.get_mut(copy) {
                    *slot = Some(chk.without_filename());
                }
                if self.graph_chks.iter().all(Option::is_some) {
                    self.enter_inserting_top_key()?;
                }
                Ok(())
            }
            (InsertCandidate::TopKey { .. }, StoreResponse::PutSsk(uri)) => {
                info!(uri = %uri, "top key inserted");
                self.top_key_inserted();
                Ok(())
            }
            (candidate, response) => Err(UpdateError::Invariant {
                message: format!("unexpected response {response:?} to {}", candidate.label()),
            }),
        }
    }

    fn top_key_inserted(&mut self) {
        if self.requests.is_idle() {
            let outcome = match self.params.mode {
                InsertMode::Reinsert(_) => InsertOutcome::Reinserted,
                _ => InsertOutcome::Inserted,
            };
            self.finish(outcome);
        }
    }

    fn on_failure(&mut self, candidate: InsertCandidate, err: UpdateError) -> UpdateResult<()> {
        warn!(request = candidate.label(), error = %err, "insert request failed");

        if let InsertCandidate::TopKey { uri, .. } = &candidate
            && matches!(err, UpdateError::Store { source: StoreError::Collision { .. } })
        {
            if !self.params.mode.bumps_version() && self.params.mode != InsertMode::Create {
                info!(uri = %uri, "top key already present at this version");
                self.top_key_inserted();
                return Ok(());
            }
            return Err(err);
        }

        match &candidate {
            InsertCandidate::PrevTopKey { .. } | InsertCandidate::PrevGraph { .. } => {
                if let Some(retry) = candidate.retried() {
                    self.requests.push(retry);
                    return Ok(());
                }
                let same_kind = |c: &InsertCandidate| std::mem::discriminant(c) == std::mem::discriminant(&candidate);
                if self.requests.in_play().any(same_kind) {
                    return Ok(());
                }
                let what = match candidate {
                    InsertCandidate::PrevTopKey { .. } => "previous top key",
                    _ => "previous graph",
                };
                Err(UpdateError::Exhausted {
                    what,
                    message: err.to_string(),
                })
            }
            _ => match candidate.retried() {
                Some(retry) => {
                    self.requests.push(retry);
                    Ok(())
                }
                None => Err(err),
            },
        }
    }
}

/// Flip the salt digit of the bundle mime marker in splitfile metadata.
fn salt_metadata(metadata: &[u8]) -> Option<Bytes> {
    let marker = BUNDLE_MIME.as_bytes();
    let pos = metadata.windows(marker.len()).position(|window| window == marker)?;
    let mut salted = metadata.to_vec();
    salted[pos..pos + marker.len()].copy_from_slice(SALTED_BUNDLE_MIME.as_bytes());
    Some(Bytes::from(salted))
}

impl<R: RepoBackend + ?Sized> RequestQueue for InsertMachine<'_, R> {
    fn next_runnable(&mut self) -> Option<StoreRequest> {
        if self.state == InsertState::Quiescent || self.state.is_draining() {
            return None;
        }
        if self.ctx.shutdown_requested() {
            self.interrupt();
            return None;
        }
        let candidate = self.requests.pop()?;
        match self.build_request(&candidate) {
            Ok(kind) => {
                let request = StoreRequest::new(candidate.label(), kind);
                self.requests.start(request.tag.clone(), candidate);
                Some(request)
            }
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    fn request_done(&mut self, tag: &RequestTag, result: StoreResult<StoreResponse>) {
        if self.ctx.take_orphan(tag) {
            debug!(tag = %tag, "dropping orphaned result");
            return;
        }
        let Some(candidate) = self.requests.complete(tag) else {
            return;
        };
        if self.state == InsertState::Quiescent || self.state.is_draining() {
            return;
        }
        let step = match result {
            Ok(response) => self.on_success(candidate, response),
            Err(err) => self.on_failure(candidate, err.into()),
        };
        if let Err(err) = step {
            self.fail(err);
        }
    }

    fn drain_cancellations(&mut self) -> Vec<RequestTag> {
        if self.ctx.shutdown_requested() && self.state != InsertState::Quiescent && !self.state.is_draining() {
            self.interrupt();
        }
        let tags = self.ctx.drain_cancellations();
        if self.state.is_draining() {
            self.transition(InsertState::Quiescent);
        }
        tags
    }

    fn is_finished(&self) -> bool {
        self.state == InsertState::Quiescent
    }
}
