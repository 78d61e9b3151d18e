//! Error types for the update engine.
//!
//! Uses `snafu` for structured error handling with context.

use std::path::PathBuf;

use infocalypse_keys::KeyError;
use infocalypse_store::StoreError;
use snafu::Snafu;

use crate::types::IndexId;

/// Errors that can occur while updating, inserting or pulling.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum UpdateError {
    // ========================================================================
    // Corruption
    // ========================================================================
    /// The graph text could not be parsed.
    #[snafu(display("corrupt graph at line {line}: {message}"))]
    GraphParse { line: usize, message: String },

    /// The top-key could not be decoded.
    #[snafu(display("corrupt top key: {message}"))]
    TopKeyParse { message: String },

    /// A bundle could not be applied or decoded.
    #[snafu(display("corrupt bundle: {message}"))]
    BundleCorrupt { message: String },

    /// A changeset id was not 40 hex digits.
    #[snafu(display("invalid changeset id: {value}"))]
    InvalidChangeset { value: String },

    // ========================================================================
    // Graph
    // ========================================================================
    /// A graph invariant was violated.
    #[snafu(display("graph invariant violated: {message}"))]
    Invariant { message: String },

    /// No edge path connects the indices.
    #[snafu(display("no update path from {from} to {to}"))]
    NoPath { from: IndexId, to: IndexId },

    /// A bundle is too large for a salted-metadata copy.
    #[snafu(display("bundle of {length} bytes is too large to salt"))]
    BundleTooLargeForSalt { length: u64 },

    // ========================================================================
    // Collaborators
    // ========================================================================
    /// A key failed to parse.
    #[snafu(display("key error: {source}"))]
    Key { source: KeyError },

    /// A store request failed.
    #[snafu(display("store error: {source}"))]
    Store { source: StoreError },

    /// The repository backend failed.
    #[snafu(display("repository error: {message}"))]
    Repo { message: String },

    /// A VCS command could not be spawned.
    #[snafu(display("failed to run {command}: {source}"))]
    CommandSpawn { command: String, source: std::io::Error },

    /// A VCS command exited unsuccessfully.
    #[snafu(display("{command} failed ({status}): {stderr}"))]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// Filesystem error.
    #[snafu(display("I/O error on {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },

    // ========================================================================
    // Operations
    // ========================================================================
    /// A state machine gave up in the named stage.
    #[snafu(display("{stage} failed: {source}"))]
    StageFailed {
        stage: &'static str,
        source: Box<UpdateError>,
    },

    /// The operation was interrupted by a shutdown request.
    #[snafu(display("interrupted during {stage}"))]
    Interrupted { stage: &'static str },

    /// Every candidate request of a stage failed.
    #[snafu(display("no {what} could be fetched: {message}"))]
    Exhausted { what: &'static str, message: String },

    /// The scheduler ran out of work before the operation finished.
    #[snafu(display("{stage} stalled with no requests left to run"))]
    Stalled { stage: &'static str },

    // ========================================================================
    // Configuration
    // ========================================================================
    /// Failed to read a config file.
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadConfig { path: PathBuf, source: std::io::Error },

    /// Failed to parse a config file.
    #[snafu(display("failed to parse config file {}: {source}", path.display()))]
    ParseConfig { path: PathBuf, source: toml::de::Error },

    /// Failed to serialize the config.
    #[snafu(display("failed to serialize config: {source}"))]
    SerializeConfig { source: toml::ser::Error },

    /// Failed to write a config file.
    #[snafu(display("failed to write config file {}: {source}", path.display()))]
    WriteConfig { path: PathBuf, source: std::io::Error },

    /// Config validation failed.
    #[snafu(display("invalid configuration: {message}"))]
    ConfigValidation { message: String },
}

impl From<KeyError> for UpdateError {
    fn from(source: KeyError) -> Self {
        UpdateError::Key { source }
    }
}

impl From<StoreError> for UpdateError {
    fn from(source: StoreError) -> Self {
        UpdateError::Store { source }
    }
}

impl UpdateError {
    /// True for errors caused by bad data rather than failed requests.
    pub fn is_corruption(&self) -> bool {
        match self {
            UpdateError::StageFailed { source, .. } => source.is_corruption(),
            other => matches!(
                other,
                UpdateError::GraphParse { .. }
                    | UpdateError::TopKeyParse { .. }
                    | UpdateError::BundleCorrupt { .. }
                    | UpdateError::InvalidChangeset { .. }
            ),
        }
    }

    /// Name the stage an error happened in.
    pub fn in_stage(self, stage: &'static str) -> Self {
        match self {
            UpdateError::StageFailed { .. } | UpdateError::Interrupted { .. } => self,
            source => UpdateError::StageFailed {
                stage,
                source: Box::new(source),
            },
        }
    }

    /// The stage a state machine failed in, if known.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            UpdateError::StageFailed { stage, .. }
            | UpdateError::Interrupted { stage }
            | UpdateError::Stalled { stage } => Some(*stage),
            _ => None,
        }
    }

    /// The error under any stage wrapper.
    pub fn root(&self) -> &UpdateError {
        match self {
            UpdateError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type for update operations.
pub type UpdateResult<T> = Result<T, UpdateError>;
