//! Top-level operations: the state machines driven against a store.
//!
//! Each operation runs to completion on the [`RequestRunner`] and saves the
//! config only after it succeeds.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use infocalypse_keys::Usk;
use infocalypse_store::GetOptions;
use infocalypse_store::KeyOps;
use infocalypse_store::ObjectRead;
use infocalypse_store::ObjectStore;
use infocalypse_store::RequestContext;
use infocalypse_store::RequestRunner;
use infocalypse_store::RunnerConfig;
use infocalypse_store::SskKeypair;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::Config;
use crate::constants::BLOCK_LEN;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::graph::UpdateGraph;
use crate::repo::RepoBackend;
use crate::sm::InsertMachine;
use crate::sm::InsertMode;
use crate::sm::InsertOutcome;
use crate::sm::InsertParams;
use crate::sm::InsertReport;
use crate::sm::PullMachine;
use crate::sm::PullParams;
use crate::sm::PullReport;
use crate::sm::top_key_uris;
use crate::topkey::TopKey;

/// A store connection plus the persisted config.
pub struct Session<S: ObjectStore + ?Sized + 'static> {
    runner: RequestRunner<S>,
    pub config: Config,
    /// Where to save `config`; nothing is saved when `None`.
    pub config_path: Option<PathBuf>,
    pub shutdown: CancellationToken,
}

impl<S: ObjectStore + ?Sized + 'static> Session<S> {
    pub fn new(store: Arc<S>, config: Config) -> Self {
        Self::with_runner_config(store, config, RunnerConfig::default())
    }

    pub fn with_runner_config(store: Arc<S>, config: Config, runner: RunnerConfig) -> Self {
        Self {
            runner: RequestRunner::with_config(store, runner),
            config,
            config_path: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        self.runner.store()
    }

    fn save_config(&self) -> UpdateResult<()> {
        match &self.config_path {
            Some(path) => self.config.save(path),
            None => Ok(()),
        }
    }

    fn tmp_dir(&self) -> Option<PathBuf> {
        self.config.default.tmp_dir.clone()
    }

    async fn run_insert<R: RepoBackend + ?Sized>(&mut self, repo: &R, params: InsertParams) -> UpdateResult<InsertReport> {
        let mut machine = InsertMachine::with_shutdown(repo, params, self.shutdown.clone())?;
        let run = self.runner.run(&mut [&mut machine]).await;
        machine.into_report(run)
    }

    /// Record a finished insert in the config and save it.
    fn remember_insert(&mut self, repo_root: Option<&Path>, report: &InsertReport) -> UpdateResult<()> {
        self.config.update_index(&report.request_uri, report.version);
        self.config.set_insert_usk(&report.request_uri, &report.insert_uri);
        if let Some(root) = repo_root {
            self.config.set_request_usk(root, &report.request_uri);
        }
        self.save_config()
    }
}

fn require_redundant(uri: &Usk) -> UpdateResult<()> {
    if !uri.is_redundant() {
        return Err(UpdateError::ConfigValidation {
            message: format!("repository name must end in .R1: {}", uri.name()),
        });
    }
    Ok(())
}

/// Generate a fresh SSK keypair.
#[instrument(skip(store))]
pub async fn genkey<S: ObjectStore + ?Sized>(store: &S) -> UpdateResult<SskKeypair> {
    let ctx = RequestContext::detached("genkey");
    Ok(store.generate_ssk_keypair(&ctx).await?)
}

/// First publish of a repository at `insert_uri`'s version.
#[instrument(skip(session, repo), fields(uri = %insert_uri))]
pub async fn create<S, R>(
    session: &mut Session<S>,
    repo: &R,
    repo_root: Option<&Path>,
    insert_uri: &Usk,
) -> UpdateResult<InsertReport>
where
    S: ObjectStore + ?Sized + 'static,
    R: RepoBackend + ?Sized,
{
    require_redundant(insert_uri)?;
    let params = InsertParams {
        insert_uri: insert_uri.clone(),
        mode: InsertMode::Create,
        targets: repo.heads()?,
        tmp_dir: session.tmp_dir(),
    };
    let report = session.run_insert(repo, params).await?;
    info!(uri = %report.request_uri, "created repository");
    session.remember_insert(repo_root, &report)?;
    Ok(report)
}

/// Publish the repository's current heads on top of the latest version.
#[instrument(skip(session, repo), fields(uri = %insert_uri))]
pub async fn push<S, R>(
    session: &mut Session<S>,
    repo: &R,
    repo_root: Option<&Path>,
    insert_uri: &Usk,
) -> UpdateResult<InsertReport>
where
    S: ObjectStore + ?Sized + 'static,
    R: RepoBackend + ?Sized,
{
    require_redundant(insert_uri)?;
    let hint = session.config.index_for_insert(insert_uri).unwrap_or(0).max(insert_uri.version());
    let params = InsertParams {
        insert_uri: insert_uri.with_version(hint),
        mode: InsertMode::Push,
        targets: repo.heads()?,
        tmp_dir: session.tmp_dir(),
    };
    let report = session.run_insert(repo, params).await?;
    match report.outcome {
        InsertOutcome::UpToDate => info!(version = report.version, "nothing new to push"),
        _ => info!(version = report.version, edges = report.new_edges.len(), "pushed"),
    }
    session.remember_insert(repo_root, &report)?;
    Ok(report)
}

/// Re-insert published data at `level` (1 to 5).
#[instrument(skip(session, repo), fields(uri = %insert_uri))]
pub async fn reinsert<S, R>(session: &mut Session<S>, repo: &R, insert_uri: &Usk, level: u8) -> UpdateResult<InsertReport>
where
    S: ObjectStore + ?Sized + 'static,
    R: RepoBackend + ?Sized,
{
    require_redundant(insert_uri)?;
    let hint = session.config.index_for_insert(insert_uri).unwrap_or(0).max(insert_uri.version());
    let params = InsertParams {
        insert_uri: insert_uri.with_version(hint),
        mode: InsertMode::Reinsert(level),
        targets: Vec::new(),
        tmp_dir: session.tmp_dir(),
    };
    let report = session.run_insert(repo, params).await?;
    info!(level, version = report.version, "reinserted");
    session.remember_insert(None, &report)?;
    Ok(report)
}

/// Bring `repo` up to the latest published heads.
#[instrument(skip(session, repo), fields(uri = %request_uri))]
pub async fn pull<S, R>(
    session: &mut Session<S>,
    repo: &mut R,
    repo_root: Option<&Path>,
    request_uri: &Usk,
) -> UpdateResult<PullReport>
where
    S: ObjectStore + ?Sized + 'static,
    R: RepoBackend + ?Sized,
{
    let hint = session.config.get_index(request_uri).unwrap_or(0).max(request_uri.version());
    let params = PullParams {
        request_uri: request_uri.with_version(hint),
        tmp_dir: session.tmp_dir(),
    };
    let report = {
        let mut machine =
            PullMachine::with_rng(repo, params, session.shutdown.clone(), StdRng::from_os_rng())?;
        let run = session.runner.run(&mut [&mut machine]).await;
        machine.into_report(run)?
    };
    info!(version = report.version, outcome = ?report.outcome, "pulled");
    session.config.update_index(&report.request_uri, report.version);
    if let Some(root) = repo_root {
        session.config.set_request_usk(root, &report.request_uri);
    }
    session.save_config()?;
    Ok(report)
}

/// What a repository USK currently advertises.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub request_uri: Usk,
    pub version: i64,
    pub top_key: TopKey,
    pub graph: Option<UpdateGraph>,
}

/// Fetch and decode the top-key, and the graph when `with_graph` is set.
///
/// Read-only; the config is not touched.
#[instrument(skip(session), fields(uri = %request_uri))]
pub async fn info<S>(session: &Session<S>, request_uri: &Usk, with_graph: bool) -> UpdateResult<RepoInfo>
where
    S: ObjectStore + ?Sized + 'static,
{
    let store = session.store();
    let hint = session.config.get_index(request_uri).unwrap_or(0).max(request_uri.version());
    let options = GetOptions::max_size(BLOCK_LEN as u64);

    let mut last_error = None;
    let mut found = None;
    for uri in top_key_uris(request_uri, hint) {
        let ctx = RequestContext::detached("info-topkey");
        let decoded = match store.get(&ctx, &uri.to_string(), &options).await {
            Ok(got) => TopKey::decode(&got.data).and_then(|(top_key, _)| Ok((Usk::parse(&got.uri)?, top_key))),
            Err(err) => Err(err.into()),
        };
        match decoded {
            Ok(hit) => {
                found = Some(hit);
                break;
            }
            Err(err) => {
                warn!(uri = %uri, error = %err, "top key fetch failed");
                last_error = Some(err);
            }
        }
    }
    let (uri, top_key) = match (found, last_error) {
        (Some(hit), _) => hit,
        (None, Some(err)) => {
            return Err(UpdateError::Exhausted {
                what: "top key",
                message: err.to_string(),
            });
        }
        (None, None) => {
            return Err(UpdateError::Invariant {
                message: "no top key uris to try".to_string(),
            });
        }
    };

    let mut graph = None;
    if with_graph {
        for chk in &top_key.graph_chks {
            let ctx = RequestContext::detached("info-graph");
            let parsed = match store.get(&ctx, &chk.to_string(), &options).await {
                Ok(got) => std::str::from_utf8(&got.data)
                    .map_err(|err| UpdateError::GraphParse {
                        line: 0,
                        message: err.to_string(),
                    })
                    .and_then(UpdateGraph::parse),
                Err(err) => Err(err.into()),
            };
            match parsed {
                Ok(parsed) => {
                    graph = Some(parsed);
                    break;
                }
                Err(err) => warn!(chk = %chk, error = %err, "graph fetch failed"),
            }
        }
        if graph.is_none() {
            return Err(UpdateError::Exhausted {
                what: "graph",
                message: format!("none of {} copies could be fetched", top_key.graph_chks.len()),
            });
        }
    }

    Ok(RepoInfo {
        version: uri.version(),
        request_uri: uri,
        top_key,
        graph,
    })
}
