//! Persisted configuration.
//!
//! One TOML file holds connection defaults plus what earlier runs learned:
//! the latest version seen for each repository USK, and which USKs each
//! local repository pushes to and pulls from.
//!
//! Loading is layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. The TOML file
//! 3. Environment variables (`INFOCALYPSE_*`)
//! 4. Command-line arguments, applied by the caller

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use infocalypse_keys::Usk;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tracing::debug;

use crate::error::ConfigValidationSnafu;
use crate::error::ParseConfigSnafu;
use crate::error::ReadConfigSnafu;
use crate::error::SerializeConfigSnafu;
use crate::error::UpdateResult;
use crate::error::WriteConfigSnafu;

const CONFIG_DIR: &str = "infocalypse";
const CONFIG_FILE: &str = "config.toml";

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9481
}

/// Connection and scratch-space defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultSection {
    /// FCP host.
    #[serde(default = "default_host")]
    pub host: String,

    /// FCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Parent directory for bundle caches. System temp dir if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmp_dir: Option<PathBuf>,

    /// Insert key used by `create` when none is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_private_key: Option<String>,
}

impl Default for DefaultSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tmp_dir: None,
            default_private_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultSection,

    /// USK hash to latest known version.
    #[serde(default)]
    pub index_values: BTreeMap<String, i64>,

    /// Repository root to request URI.
    #[serde(default)]
    pub request_usks: BTreeMap<String, String>,

    /// USK hash to insert URI.
    #[serde(default)]
    pub insert_usks: BTreeMap<String, String>,
}

impl Config {
    /// `$XDG_CONFIG_HOME/infocalypse/config.toml`, else under `$HOME/.config`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|dir| !dir.is_empty()) {
            return Some(PathBuf::from(dir).join(CONFIG_DIR).join(CONFIG_FILE));
        }
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn from_toml_file(path: &Path) -> UpdateResult<Self> {
        let content = std::fs::read_to_string(path).context(ReadConfigSnafu { path })?;
        toml::from_str(&content).context(ParseConfigSnafu { path })
    }

    /// Load `path`, or defaults when it does not exist yet.
    pub fn load_or_default(path: &Path) -> UpdateResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::from_toml_file(path)
    }

    /// Apply `INFOCALYPSE_HOST`, `INFOCALYPSE_PORT` and `INFOCALYPSE_TMP_DIR`.
    pub fn apply_env(&mut self) {
        if let Some(host) = parse_env::<String>("INFOCALYPSE_HOST") {
            self.default.host = host;
        }
        if let Some(port) = parse_env("INFOCALYPSE_PORT") {
            self.default.port = port;
        }
        if let Some(tmp_dir) = parse_env::<PathBuf>("INFOCALYPSE_TMP_DIR") {
            self.default.tmp_dir = Some(tmp_dir);
        }
    }

    pub fn validate(&self) -> UpdateResult<()> {
        if self.default.host.trim().is_empty() {
            return ConfigValidationSnafu {
                message: "host must not be empty",
            }
            .fail();
        }
        if self.default.port == 0 {
            return ConfigValidationSnafu {
                message: "port must be non-zero",
            }
            .fail();
        }
        if let Some((hash, version)) = self.index_values.iter().find(|(_, version)| **version < 0) {
            return ConfigValidationSnafu {
                message: format!("negative version {version} for {hash}"),
            }
            .fail();
        }
        for (root, uri) in &self.request_usks {
            Usk::parse(uri).map_err(|err| {
                ConfigValidationSnafu {
                    message: format!("bad request uri for {root}: {err}"),
                }
                .build()
            })?;
        }
        Ok(())
    }

    /// Write atomically: a temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> UpdateResult<()> {
        let text = toml::to_string_pretty(self).context(SerializeConfigSnafu)?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).context(WriteConfigSnafu { path: dir })?;
        let mut file = tempfile::NamedTempFile::new_in(dir).context(WriteConfigSnafu { path: dir })?;
        file.write_all(text.as_bytes()).context(WriteConfigSnafu { path })?;
        file.as_file().sync_all().context(WriteConfigSnafu { path })?;
        file.persist(path).map_err(|err| err.error).context(WriteConfigSnafu { path })?;
        debug!(path = %path.display(), "saved config");
        Ok(())
    }

    /// Remember `version` for `usk` if it is newer than what is known.
    pub fn update_index(&mut self, usk: &Usk, version: i64) {
        let entry = self.index_values.entry(usk.usk_hash()).or_insert(version);
        if *entry < version {
            *entry = version;
        }
    }

    /// Latest known version of `usk`.
    pub fn get_index(&self, usk: &Usk) -> Option<i64> {
        self.index_values.get(&usk.usk_hash()).copied()
    }

    pub fn set_request_usk(&mut self, repo_root: &Path, usk: &Usk) {
        self.request_usks.insert(repo_root.display().to_string(), usk.with_version(0).to_string());
    }

    pub fn get_request_usk(&self, repo_root: &Path) -> Option<&str> {
        self.request_usks.get(&repo_root.display().to_string()).map(String::as_str)
    }

    /// Remember the insert URI for the repository whose request URI is
    /// `request`.
    pub fn set_insert_usk(&mut self, request: &Usk, insert: &Usk) {
        self.insert_usks.insert(request.usk_hash(), insert.with_version(0).to_string());
    }

    pub fn get_insert_usk(&self, request: &Usk) -> Option<&str> {
        self.insert_usks.get(&request.usk_hash()).map(String::as_str)
    }

    /// Latest known version of the repository `insert` publishes to.
    pub fn index_for_insert(&self, insert: &Usk) -> Option<i64> {
        let wanted = insert.with_version(0).to_string();
        let (hash, _) = self.insert_usks.iter().find(|(_, uri)| **uri == wanted)?;
        self.index_values.get(hash).copied()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}
