//! Pull state machine.
//!
//! Fetches the top-key, then the bundles needed to reach the advertised
//! heads. The newest top-key update is tried first so a small push can be
//! pulled with a single request; otherwise the graph is fetched and the
//! cheapest paths from the local repository to the latest index are
//! requested a few edges at a time.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
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
use infocalypse_store::StoreRequest;
use infocalypse_store::StoreResponse;
use infocalypse_store::StoreResult;
use rand::SeedableRng;
use rand::rngs::StdRng;
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
use crate::constants::FIRST_INDEX;
use crate::constants::MAX_RETRIES;
use crate::constants::PULL_REDUNDANCY;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::graph::UpdateGraph;
use crate::repo::RepoBackend;
use crate::topkey::TopKey;
use crate::types::ChangesetId;
use crate::types::EdgeTriple;
use crate::types::IndexId;
use crate::types::IndexPair;
use crate::types::InsertType;

/// Inputs of a pull.
#[derive(Debug, Clone)]
pub struct PullParams {
    /// Request USK; its version is the lowest edition to look for.
    pub request_uri: Usk,
    /// Parent of the bundle cache directory.
    pub tmp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The local repository already had every advertised head.
    AllHeadsPresent,
    Updated { bundles_applied: usize },
}

/// Result of a finished pull.
#[derive(Debug, Clone)]
pub struct PullReport {
    pub outcome: PullOutcome,
    /// Request USK at the version that was found.
    pub request_uri: Usk,
    pub version: i64,
    /// Heads the repository now holds.
    pub heads: Vec<ChangesetId>,
    pub top_key: TopKey,
    pub graph: Option<UpdateGraph>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullState {
    Quiescent,
    RequestingTopKey,
    RequiresGraph,
    RequestingGraph,
    RequestingBundles,
    Failing,
    Canceling,
    Finishing,
}

impl PullState {
    fn name(self) -> &'static str {
        match self {
            PullState::Quiescent => "Quiescent",
            PullState::RequestingTopKey => "RequestingTopKey",
            PullState::RequiresGraph => "RequiresGraph",
            PullState::RequestingGraph => "RequestingGraph",
            PullState::RequestingBundles => "RequestingBundles",
            PullState::Failing => "Failing",
            PullState::Canceling => "Canceling",
            PullState::Finishing => "Finishing",
        }
    }

    fn is_draining(self) -> bool {
        matches!(self, PullState::Failing | PullState::Canceling | PullState::Finishing)
    }
}

impl fmt::Display for PullState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PullCandidate {
    TopKey {
        uri: Usk,
    },
    GraphProbe {
        chk: Chk,
        tries: u32,
    },
    /// A top-key update fetched before the graph is known.
    TopKeyBundle {
        update: usize,
        alt: usize,
        tries: u32,
    },
    GraphEdge {
        edge: EdgeTriple,
        tries: u32,
        /// Only fetch the top metadata block to see if the copy is alive.
        single_block: bool,
    },
}

impl PullCandidate {
    fn label(&self) -> &'static str {
        match self {
            PullCandidate::TopKey { .. } => "topkey-get",
            PullCandidate::GraphProbe { .. } => "graph-get",
            PullCandidate::TopKeyBundle { .. } => "update-get",
            PullCandidate::GraphEdge { single_block: true, .. } => "probe-get",
            PullCandidate::GraphEdge { .. } => "bundle-get",
        }
    }

    /// True for requests that download a whole bundle.
    fn is_full_fetch(&self) -> bool {
        matches!(
            self,
            PullCandidate::TopKeyBundle { .. } | PullCandidate::GraphEdge { single_block: false, .. }
        )
    }

    fn edge(&self) -> Option<EdgeTriple> {
        match self {
            PullCandidate::GraphEdge { edge, .. } => Some(*edge),
            _ => None,
        }
    }
}

/// The pull state machine.
pub struct PullMachine<'a, R: RepoBackend + ?Sized> {
    repo: &'a mut R,
    params: PullParams,
    cache: BundleCache,
    state: PullState,
    ctx: SmContext,
    requests: RequestSet<PullCandidate>,
    rng: StdRng,

    version: i64,
    top_key: Option<TopKey>,
    graph: Option<UpdateGraph>,
    targets: Vec<ChangesetId>,
    /// Edges already requested, so re-evaluation skips them.
    known: BTreeSet<EdgeTriple>,
    /// Fetched graph bundles whose base index is not yet applied.
    unapplied: BTreeMap<IndexPair, BundleFile>,
    /// Fetched top-key bundles waiting for their parents.
    unapplied_updates: Vec<(usize, PathBuf)>,
    bundles_applied: usize,

    outcome: Option<PullOutcome>,
    error: Option<UpdateError>,
}

impl<'a, R: RepoBackend + ?Sized> PullMachine<'a, R> {
    pub fn new(repo: &'a mut R, params: PullParams) -> UpdateResult<Self> {
        Self::with_rng(repo, params, CancellationToken::new(), StdRng::from_os_rng())
    }

    /// Like [`PullMachine::new`] with an explicit shutdown token and
    /// ordinal shuffling source.
    pub fn with_rng(
        repo: &'a mut R,
        params: PullParams,
        shutdown: CancellationToken,
        rng: StdRng,
    ) -> UpdateResult<Self> {
        let cache = BundleCache::new(params.tmp_dir.as_deref())?;
        let version = params.request_uri.version();
        let mut machine = Self {
            repo,
            params,
            cache,
            state: PullState::Quiescent,
            ctx: SmContext::new(shutdown),
            requests: RequestSet::new(),
            rng,
            version,
            top_key: None,
            graph: None,
            targets: Vec::new(),
            known: BTreeSet::new(),
            unapplied: BTreeMap::new(),
            unapplied_updates: Vec::new(),
            bundles_applied: 0,
            outcome: None,
            error: None,
        };
        machine.transition(PullState::RequestingTopKey);
        for uri in top_key_uris(&machine.params.request_uri, version) {
            machine.requests.push(PullCandidate::TopKey { uri });
        }
        Ok(machine)
    }

    pub fn stage(&self) -> &'static str {
        self.state.name()
    }

    pub fn into_report(self, run: RunOutcome) -> UpdateResult<PullReport> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let (Some(outcome), Some(top_key)) = (self.outcome, self.top_key) else {
            let stage = self.state.name();
            return Err(match run {
                RunOutcome::Stalled => UpdateError::Stalled { stage },
                RunOutcome::Finished => UpdateError::Invariant {
                    message: format!("pull ended in {stage} without a result"),
                },
            });
        };
        Ok(PullReport {
            outcome,
            request_uri: self.params.request_uri.with_version(self.version),
            version: self.version,
            heads: self.targets,
            top_key,
            graph: self.graph,
        })
    }

    fn transition(&mut self, next: PullState) {
        info!(from = %self.state, to = %next, "pull state");
        self.state = next;
    }

    fn fail(&mut self, err: UpdateError) {
        let stage = self.state.name();
        error!(stage, error = %err, "pull failed");
        self.error = Some(err.in_stage(stage));
        let running = self.requests.clear();
        self.ctx.cancel(running);
        self.transition(PullState::Failing);
    }

    fn interrupt(&mut self) {
        let stage = self.state.name();
        warn!(stage, "pull interrupted");
        self.error = Some(UpdateError::Interrupted { stage });
        let running = self.requests.clear();
        self.ctx.cancel(running);
        self.transition(PullState::Canceling);
    }

    fn finish(&mut self, outcome: PullOutcome) {
        info!(?outcome, heads = self.targets.len(), "pull finished");
        self.outcome = Some(outcome);
        let running = self.requests.clear();
        self.ctx.orphan(running);
        self.transition(PullState::Finishing);
    }

    fn top_key(&self) -> UpdateResult<&TopKey> {
        self.top_key.as_ref().ok_or_else(|| UpdateError::Invariant {
            message: "no top key".to_string(),
        })
    }

    // ========================================================================
    // State entry
    // ========================================================================

    fn enter_requires_graph(&mut self) -> UpdateResult<()> {
        self.transition(PullState::RequiresGraph);
        let newest = self.top_key()?.updates.first().filter(|update| update.heads_complete).cloned();
        match newest {
            Some(update) => {
                self.targets = update.heads;
                if self.repo.has_all(&self.targets)? {
                    self.finish(PullOutcome::AllHeadsPresent);
                    return Ok(());
                }
                self.enter_requesting_bundles()
            }
            None => {
                self.transition(PullState::RequestingGraph);
                self.queue_graph_probes()
            }
        }
    }

    fn queue_graph_probes(&mut self) -> UpdateResult<()> {
        let chks = self.top_key()?.graph_chks.clone();
        if chks.is_empty() && self.state == PullState::RequestingGraph {
            return Err(UpdateError::TopKeyParse {
                message: "top key has no graph CHKs".to_string(),
            });
        }
        for chk in chks {
            self.requests.push(PullCandidate::GraphProbe { chk, tries: 0 });
        }
        Ok(())
    }

    /// Queue the single-request fast path, the graph, then the other
    /// top-key updates in a later wave.
    fn enter_requesting_bundles(&mut self) -> UpdateResult<()> {
        self.transition(PullState::RequestingBundles);
        if self.graph.is_some() {
            return self.reevaluate();
        }

        let updates = self.top_key()?.updates.clone();
        let targets: BTreeSet<ChangesetId> = self.targets.iter().copied().collect();
        let mut fast = None;
        for (index, update) in updates.iter().enumerate() {
            let heads: BTreeSet<ChangesetId> = update.heads.iter().copied().collect();
            if update.heads_complete
                && update.parents_complete
                && heads == targets
                && self.repo.has_all(&update.parents)?
            {
                fast = Some(index);
                break;
            }
        }
        if let Some(index) = fast {
            debug!(update = index, "queueing single update fast path");
            self.requests.push(PullCandidate::TopKeyBundle {
                update: index,
                alt: 0,
                tries: 0,
            });
        }

        self.queue_graph_probes()?;

        for (index, update) in updates.iter().enumerate() {
            if Some(index) != fast && update.parents_complete && self.repo.has_all(&update.parents)? {
                self.requests.defer(PullCandidate::TopKeyBundle {
                    update: index,
                    alt: 0,
                    tries: 0,
                });
            }
        }
        Ok(())
    }

    // ========================================================================
    // Graph arrival
    // ========================================================================

    fn on_graph(&mut self, graph: UpdateGraph) -> UpdateResult<()> {
        info!(latest = graph.latest_index(), edges = graph.edges().count(), "fetched graph");
        let orphans = self.requests.detach_running(|c| matches!(c, PullCandidate::GraphProbe { .. }));
        self.ctx.orphan(orphans);
        self.requests.retain_queued(|c| !matches!(c, PullCandidate::GraphProbe { .. }));

        // Blind top-key fetches become graph edges.
        let updates = self.top_key()?.updates.clone();
        for candidate in self.requests.in_play_mut() {
            if let PullCandidate::TopKeyBundle { update, alt, tries } = *candidate
                && let Some(chk) = updates.get(update).and_then(|u| u.chks.get(alt))
                && let Some(edge) = graph.find_chk(chk)
            {
                *candidate = PullCandidate::GraphEdge {
                    edge,
                    tries,
                    single_block: false,
                };
                self.known.insert(edge);
            }
        }
        for (update, path) in std::mem::take(&mut self.unapplied_updates) {
            let found = updates.get(update).and_then(|u| u.chks.iter().find_map(|chk| graph.find_chk(chk)));
            match found {
                Some(edge) => {
                    let data = std::fs::read(&path).map_err(|source| UpdateError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    let bundle = self.cache.store_fetched(edge.pair(), &data)?;
                    self.unapplied.insert(edge.pair(), bundle);
                }
                None => self.unapplied_updates.push((update, path)),
            }
        }

        self.graph = Some(graph);
        match self.state {
            PullState::RequestingGraph => {
                self.targets = self.graph.as_ref().map(UpdateGraph::latest_heads).unwrap_or_default();
                if self.repo.has_all(&self.targets)? {
                    self.finish(PullOutcome::AllHeadsPresent);
                    return Ok(());
                }
                self.enter_requesting_bundles()
            }
            _ => self.apply_and_continue(),
        }
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Largest index whose heads, and those of every earlier index, are
    /// all in the repository.
    fn latest_applied(&self) -> UpdateResult<IndexId> {
        let Some(graph) = &self.graph else {
            return Ok(FIRST_INDEX);
        };
        let mut latest = FIRST_INDEX;
        for (index, entry) in graph.indices() {
            let heads: Vec<ChangesetId> = entry.heads.iter().copied().collect();
            if !self.repo.has_all(&heads)? {
                break;
            }
            latest = index;
        }
        Ok(latest)
    }

    fn edge_candidate(graph: &UpdateGraph, edge: EdgeTriple) -> UpdateResult<PullCandidate> {
        let single_block = graph.insert_type(edge)? == InsertType::SaltedMetadata;
        Ok(PullCandidate::GraphEdge {
            edge,
            tries: 0,
            single_block,
        })
    }

    /// Queue more edges toward the latest index.
    fn reevaluate(&mut self) -> UpdateResult<()> {
        let Some(graph) = &self.graph else {
            return Ok(());
        };
        let in_flight = self.requests.in_play().filter(|c| c.is_full_fetch()).count();
        let budget = PULL_REDUNDANCY.saturating_sub(in_flight);
        if budget == 0 {
            return Ok(());
        }
        let from = self.latest_applied()?;
        let (first, second) = graph.get_update_edges(from, budget, &self.known, &mut self.rng)?;
        debug!(from, first = first.len(), second = second.len(), "re-evaluated update edges");

        let mut queued = Vec::with_capacity(first.len() + second.len());
        for edge in &first {
            queued.push((true, Self::edge_candidate(graph, *edge)?));
        }
        for edge in &second {
            queued.push((false, Self::edge_candidate(graph, *edge)?));
        }
        for (now, candidate) in queued {
            if let Some(edge) = candidate.edge() {
                self.known.insert(edge);
            }
            if now {
                self.requests.push(candidate);
            } else {
                self.requests.defer(candidate);
            }
        }
        Ok(())
    }

    fn check_exhausted(&mut self) -> UpdateResult<()> {
        if self.state == PullState::RequestingBundles && self.requests.is_idle() {
            self.reevaluate()?;
            if self.requests.is_idle() {
                return Err(UpdateError::Exhausted {
                    what: "bundles",
                    message: format!("no remaining way to reach {} heads", self.targets.len()),
                });
            }
        }
        Ok(())
    }

    // ========================================================================
    // Applying
    // ========================================================================

    fn apply_ready(&mut self) -> UpdateResult<()> {
        loop {
            let mut progressed = false;

            let latest = self.latest_applied()?;
            let ready: Vec<IndexPair> = self.unapplied.keys().filter(|pair| pair.from <= latest).copied().collect();
            for pair in ready {
                let Some(bundle) = self.unapplied.remove(&pair) else {
                    continue;
                };
                if pair.to > self.latest_applied()? {
                    info!(pair = %pair, length = bundle.length, "applying bundle");
                    self.repo.apply_bundle(&bundle.path)?;
                    self.bundles_applied += 1;
                    progressed = true;
                }
                self.cache.remove(pair);
            }

            let waiting = std::mem::take(&mut self.unapplied_updates);
            let updates = self.top_key()?.updates.clone();
            for (index, path) in waiting {
                let Some(update) = updates.get(index) else {
                    continue;
                };
                if self.repo.has_all(&update.heads)? {
                    continue;
                }
                if update.parents_complete && self.repo.has_all(&update.parents)? {
                    info!(update = index, length = update.length, "applying top key bundle");
                    self.repo.apply_bundle(&path)?;
                    self.bundles_applied += 1;
                    progressed = true;
                } else {
                    self.unapplied_updates.push((index, path));
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn apply_and_continue(&mut self) -> UpdateResult<()> {
        self.apply_ready()?;
        if self.repo.has_all(&self.targets)? {
            self.finish(PullOutcome::Updated {
                bundles_applied: self.bundles_applied,
            });
            return Ok(());
        }
        self.reevaluate()?;
        self.check_exhausted()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn build_request(&self, candidate: &PullCandidate) -> UpdateResult<RequestKind> {
        Ok(match candidate {
            PullCandidate::TopKey { uri } => RequestKind::Get {
                uri: uri.to_string(),
                options: GetOptions::max_size(BLOCK_LEN as u64),
            },
            PullCandidate::GraphProbe { chk, .. } => RequestKind::Get {
                uri: chk.to_string(),
                options: GetOptions::max_size(BLOCK_LEN as u64),
            },
            PullCandidate::TopKeyBundle { update, alt, .. } => {
                let chk = self.top_key()?.updates.get(*update).and_then(|u| u.chks.get(*alt)).ok_or_else(|| {
                    UpdateError::Invariant {
                        message: format!("top key has no CHK {alt} for update {update}"),
                    }
                })?;
                RequestKind::Get {
                    uri: chk.to_string(),
                    options: GetOptions::default(),
                }
            }
            PullCandidate::GraphEdge { edge, single_block, .. } => {
                let graph = self.graph.as_ref().ok_or_else(|| UpdateError::Invariant {
                    message: "edge request without a graph".to_string(),
                })?;
                let chk = graph.get_chk(*edge)?.chk().cloned().ok_or_else(|| UpdateError::Invariant {
                    message: format!("published graph has a pending edge {edge}"),
                })?;
                if *single_block {
                    RequestKind::Get {
                        uri: chk.raw_metadata().to_string(),
                        options: GetOptions::max_size(BLOCK_LEN as u64),
                    }
                } else {
                    RequestKind::Get {
                        uri: chk.to_string(),
                        options: GetOptions::default(),
                    }
                }
            }
        })
    }

    fn on_success(&mut self, candidate: PullCandidate, response: StoreResponse) -> UpdateResult<()> {
        let StoreResponse::Got(got) = response else {
            return Err(UpdateError::Invariant {
                message: format!("unexpected response to {}", candidate.label()),
            });
        };
        match candidate {
            PullCandidate::TopKey { .. } => {
                let top_key = match TopKey::decode(&got.data) {
                    Ok((top_key, _salt)) => top_key,
                    Err(err) => return self.on_failure(candidate, err),
                };
                self.version = Usk::parse(&got.uri)?.version();
                info!(uri = %got.uri, updates = top_key.updates.len(), "fetched top key");
                let running = self.requests.clear();
                self.ctx.orphan(running);
                self.top_key = Some(top_key);
                self.enter_requires_graph()
            }
            PullCandidate::GraphProbe { .. } => {
                let parsed = std::str::from_utf8(&got.data)
                    .map_err(|err| UpdateError::GraphParse {
                        line: 0,
                        message: err.to_string(),
                    })
                    .and_then(UpdateGraph::parse);
                match parsed {
                    Ok(graph) => self.on_graph(graph),
                    Err(err) => self.on_failure(candidate, err),
                }
            }
            PullCandidate::TopKeyBundle { update, alt, .. } => {
                let length = self.top_key()?.updates.get(update).map(|u| u.length).unwrap_or_default();
                let data = trim_padding(got.data, length, "top key bundle")?;
                let path = self.cache.scratch_file(&format!("update_{update}_{alt}"), &data)?;
                self.unapplied_updates.push((update, path));
                self.apply_and_continue()
            }
            PullCandidate::GraphEdge {
                edge,
                tries,
                single_block: true,
            } => {
                let full_running = self.requests.in_play().any(|c| {
                    c.is_full_fetch() && c.edge().is_some_and(|other| other.pair() == edge.pair())
                });
                if !full_running {
                    debug!(edge = %edge, "salted copy is alive, fetching");
                    self.requests.push_front(PullCandidate::GraphEdge {
                        edge,
                        tries,
                        single_block: false,
                    });
                }
                Ok(())
            }
            PullCandidate::GraphEdge { edge, .. } => {
                let graph = self.graph.as_ref().ok_or_else(|| UpdateError::Invariant {
                    message: "edge result without a graph".to_string(),
                })?;
                let length = graph.edge_length(edge.pair())?;
                let data = trim_padding(got.data, length, "bundle")?;
                debug!(edge = %edge, length, "fetched bundle");
                if !self.unapplied.contains_key(&edge.pair()) {
                    let bundle = self.cache.store_fetched(edge.pair(), &data)?;
                    self.unapplied.insert(edge.pair(), bundle);
                }
                self.apply_and_continue()
            }
        }
    }

    fn on_failure(&mut self, candidate: PullCandidate, err: UpdateError) -> UpdateResult<()> {
        warn!(request = candidate.label(), error = %err, "pull request failed");
        let next = match &candidate {
            PullCandidate::TopKey { .. } => None,
            PullCandidate::GraphProbe { chk, tries } => (*tries < MAX_RETRIES).then(|| PullCandidate::GraphProbe {
                chk: chk.clone(),
                tries: tries + 1,
            }),
            PullCandidate::TopKeyBundle { update, alt, tries } => {
                let alternates = self.top_key()?.updates.get(*update).map_or(0, |u| u.chks.len());
                if alt + 1 < alternates {
                    Some(PullCandidate::TopKeyBundle {
                        update: *update,
                        alt: alt + 1,
                        tries: *tries,
                    })
                } else if *tries < MAX_RETRIES {
                    Some(PullCandidate::TopKeyBundle {
                        update: *update,
                        alt: 0,
                        tries: tries + 1,
                    })
                } else {
                    None
                }
            }
            PullCandidate::GraphEdge { edge, tries, .. } => self.edge_fallback(*edge, *tries)?,
        };
        if let Some(next) = next {
            if let Some(edge) = next.edge() {
                self.known.insert(edge);
            }
            self.requests.push(next);
        }

        match candidate {
            PullCandidate::TopKey { .. } if !self.requests.in_play().any(|c| matches!(c, PullCandidate::TopKey { .. })) => {
                Err(UpdateError::Exhausted {
                    what: "top key",
                    message: err.to_string(),
                })
            }
            PullCandidate::GraphProbe { .. }
                if self.state == PullState::RequestingGraph
                    && !self.requests.in_play().any(|c| matches!(c, PullCandidate::GraphProbe { .. })) =>
            {
                Err(UpdateError::Exhausted {
                    what: "graph",
                    message: err.to_string(),
                })
            }
            _ => self.check_exhausted(),
        }
    }

    /// The untried redundant copy of `edge` as a full fetch, or a retry of
    /// `edge` itself.
    fn edge_fallback(&self, edge: EdgeTriple, tries: u32) -> UpdateResult<Option<PullCandidate>> {
        let Some(graph) = &self.graph else {
            return Ok(None);
        };
        for ordinal in 0..graph.redundancy(edge.pair()) as u8 {
            let alternate = edge.pair().triple(ordinal);
            if alternate != edge && !self.known.contains(&alternate) {
                return Ok(Some(PullCandidate::GraphEdge {
                    edge: alternate,
                    tries,
                    single_block: false,
                }));
            }
        }
        Ok((tries < MAX_RETRIES).then(|| PullCandidate::GraphEdge {
            edge,
            tries: tries + 1,
            single_block: false,
        }))
    }
}

/// Strip the pad byte of a padded copy.
fn trim_padding(data: Bytes, expected: u64, what: &str) -> UpdateResult<Bytes> {
    let expected = expected as usize;
    if data.len() < expected {
        return Err(UpdateError::BundleCorrupt {
            message: format!("{what} is {} bytes, expected {expected}", data.len()),
        });
    }
    Ok(data.slice(..expected))
}

impl<R: RepoBackend + ?Sized> RequestQueue for PullMachine<'_, R> {
    fn next_runnable(&mut self) -> Option<StoreRequest> {
        if self.state == PullState::Quiescent || self.state.is_draining() {
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
        if self.state == PullState::Quiescent || self.state.is_draining() {
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
        if self.ctx.shutdown_requested() && self.state != PullState::Quiescent && !self.state.is_draining() {
            self.interrupt();
        }
        let tags = self.ctx.drain_cancellations();
        if self.state.is_draining() {
            self.transition(PullState::Quiescent);
        }
        tags
    }

    fn is_finished(&self) -> bool {
        self.state == PullState::Quiescent
    }
}
