//! Shared state for one CLI invocation: config, FCP session and the
//! local repository path.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use infocalypse_keys::Ssk;
use infocalypse_keys::Usk;
use infocalypse_store::FcpConfig;
use infocalypse_store::FcpObjectStore;
use infocalypse_update::Config;
use infocalypse_update::Session;
use infocalypse_update::repo::MercurialRepo;
use tracing::debug;
use tracing::warn;

use crate::cli::GlobalOptions;

pub struct CommandContext {
    pub session: Session<FcpObjectStore>,
    pub repo_path: PathBuf,
    pub is_json: bool,
}

impl CommandContext {
    /// Load the config, apply overrides and connect to the node.
    pub async fn connect(global: &GlobalOptions) -> Result<Self> {
        let path = match &global.config {
            Some(path) => path.clone(),
            None => Config::default_path().context("no config path: set --config or HOME")?,
        };
        let config = load_config(&path, global)?;

        let fcp = FcpConfig {
            host: config.default.host.clone(),
            port: config.default.port,
            ..FcpConfig::default()
        };
        let store = FcpObjectStore::connect(&fcp)
            .await
            .with_context(|| format!("failed to connect to FCP at {}:{}", fcp.host, fcp.port))?;
        debug!(host = %fcp.host, port = fcp.port, "connected");

        let mut session = Session::new(Arc::new(store), config);
        session.config_path = Some(path);

        let shutdown = session.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling outstanding requests");
                shutdown.cancel();
            }
        });

        Ok(Self {
            session,
            repo_path: global.repo.clone(),
            is_json: global.is_json,
        })
    }

    pub fn open_repo(&self) -> Result<MercurialRepo> {
        let root = self
            .repo_path
            .canonicalize()
            .with_context(|| format!("no repository at {}", self.repo_path.display()))?;
        Ok(MercurialRepo::open(root)?)
    }
}

/// Defaults, then the file, then `INFOCALYPSE_*`, then flags.
pub fn load_config(path: &Path, global: &GlobalOptions) -> Result<Config> {
    let mut config =
        Config::load_or_default(path).with_context(|| format!("failed to load config {}", path.display()))?;
    config.apply_env();
    if let Some(host) = &global.host {
        config.default.host = host.clone();
    }
    if let Some(port) = global.port {
        config.default.port = port;
    }
    config.validate()?;
    Ok(config)
}

fn parse_usk(text: &str) -> Result<Usk> {
    Usk::parse(text).with_context(|| format!("not a USK: {text}"))
}

/// Insert URI for `create`: the argument, else the default private key
/// under `name`.
pub fn create_insert_uri(config: &Config, given: Option<&str>, name: &str) -> Result<Usk> {
    if let Some(text) = given {
        return parse_usk(text);
    }
    let Some(key) = &config.default.default_private_key else {
        bail!("no insert URI given and no default_private_key in the config");
    };
    let ssk = Ssk::parse(key).with_context(|| format!("default_private_key is not an SSK: {key}"))?;
    Ok(ssk.to_usk(name, 0))
}

/// Insert URI for `push` and `reinsert`: the argument, else the one
/// remembered for the repository at `root`.
pub fn stored_insert_uri(config: &Config, root: &Path, given: Option<&str>) -> Result<Usk> {
    if let Some(text) = given {
        return parse_usk(text);
    }
    let request = stored_request_uri(config, root, None)?;
    match config.get_insert_usk(&request) {
        Some(text) => parse_usk(text),
        None => bail!("no insert URI known for {request}; pass one explicitly"),
    }
}

/// Request URI for `pull`: the argument, else the one remembered for the
/// repository at `root`.
pub fn stored_request_uri(config: &Config, root: &Path, given: Option<&str>) -> Result<Usk> {
    if let Some(text) = given {
        return parse_usk(text);
    }
    match config.get_request_usk(root) {
        Some(text) => parse_usk(text),
        None => bail!("no request URI known for {}; pass one explicitly", root.display()),
    }
}

/// `<dir name>.R1` for the repository at `root`.
pub fn default_repo_name(root: &Path) -> String {
    let stem = root.file_name().and_then(|name| name.to_str()).unwrap_or("repo");
    format!("{stem}.R1")
}
