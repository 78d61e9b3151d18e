//! Mercurial backend driven through the `hg` command line.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use snafu::ResultExt;
use tracing::debug;

use super::RepoBackend;
use crate::error::CommandSpawnSnafu;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::types::ChangesetId;

const NODE_TEMPLATE: &str = "{node}\\n";

/// A local Mercurial repository.
#[derive(Debug, Clone)]
pub struct MercurialRepo {
    root: PathBuf,
    hg: String,
}

impl MercurialRepo {
    pub fn open(root: impl Into<PathBuf>) -> UpdateResult<Self> {
        let root = root.into();
        if !root.join(".hg").is_dir() {
            return Err(UpdateError::Repo {
                message: format!("{} is not a mercurial repository", root.display()),
            });
        }
        Ok(Self {
            root,
            hg: "hg".to_string(),
        })
    }

    /// Use a specific `hg` executable.
    pub fn with_command(mut self, hg: impl Into<String>) -> Self {
        self.hg = hg.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run(&self, args: &[&str]) -> UpdateResult<String> {
        let command = format!("{} {}", self.hg, args.join(" "));
        debug!(command = %command, "running hg");
        let output = Command::new(&self.hg)
            .args(args)
            .current_dir(&self.root)
            .env("HGPLAIN", "1")
            .output()
            .context(CommandSpawnSnafu { command: command.clone() })?;
        // `hg heads` exits 1 on an empty repository.
        if !output.status.success() && !(args.first() == Some(&"heads") && output.status.code() == Some(1)) {
            return Err(UpdateError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn nodes(&self, args: &[&str]) -> UpdateResult<Vec<ChangesetId>> {
        self.run(args)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ChangesetId::from_hex)
            .filter(|id| !matches!(id, Ok(id) if id.is_null()))
            .collect()
    }

    fn log(&self, revset: &str) -> UpdateResult<Vec<ChangesetId>> {
        self.nodes(&["log", "-r", revset, "--template", NODE_TEMPLATE])
    }
}

impl RepoBackend for MercurialRepo {
    fn heads(&self) -> UpdateResult<Vec<ChangesetId>> {
        self.nodes(&["heads", "--template", NODE_TEMPLATE])
    }

    fn has(&self, rev: &ChangesetId) -> UpdateResult<bool> {
        let revset = format!("present({rev})");
        Ok(!self.log(&revset)?.is_empty())
    }

    fn parents(&self, rev: &ChangesetId) -> UpdateResult<Vec<ChangesetId>> {
        self.log(&format!("parents({rev})"))
    }

    fn children(&self, rev: &ChangesetId) -> UpdateResult<Vec<ChangesetId>> {
        self.log(&format!("children({rev})"))
    }

    fn ancestors(&self, rev: &ChangesetId) -> UpdateResult<Vec<ChangesetId>> {
        self.log(&format!("ancestors({rev}) - {rev}"))
    }

    fn make_bundle(&self, bases: &[ChangesetId], heads: &[ChangesetId], out: &Path) -> UpdateResult<u64> {
        let out_str = out.to_string_lossy().into_owned();
        let base_hex: Vec<String> = bases.iter().filter(|b| !b.is_null()).map(ChangesetId::to_hex).collect();
        let head_hex: Vec<String> = heads.iter().map(ChangesetId::to_hex).collect();

        let mut args: Vec<&str> = vec!["bundle", "--force"];
        if base_hex.is_empty() {
            args.extend(["--base", "null"]);
        }
        for base in &base_hex {
            args.extend(["--base", base.as_str()]);
        }
        for head in &head_hex {
            args.extend(["-r", head.as_str()]);
        }
        args.push(&out_str);

        self.run(&args)?;
        let meta = std::fs::metadata(out).context(crate::error::IoSnafu { path: out })?;
        Ok(meta.len())
    }

    fn apply_bundle(&mut self, bundle: &Path) -> UpdateResult<()> {
        let path = bundle.to_string_lossy().into_owned();
        self.run(&["unbundle", &path])?;
        Ok(())
    }

    fn hex_of(&self, rev_spec: &str) -> UpdateResult<ChangesetId> {
        if rev_spec == "null" {
            return Ok(crate::types::NULL_REV);
        }
        self.log(rev_spec)?.into_iter().next().ok_or_else(|| UpdateError::Repo {
            message: format!("unknown revision {rev_spec}"),
        })
    }
}
