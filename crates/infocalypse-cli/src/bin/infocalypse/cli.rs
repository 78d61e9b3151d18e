//! CLI argument parsing and command dispatch.
//!
//! Uses clap derive macros for declarative argument definition with
//! support for environment variables and global options.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use clap::Parser;
use clap::Subcommand;

use crate::commands::genkey::GenkeyArgs;
use crate::commands::info::InfoArgs;
use crate::commands::publish::CreateArgs;
use crate::commands::publish::PushArgs;
use crate::commands::publish::ReinsertArgs;
use crate::commands::pull::PullArgs;
use crate::context::CommandContext;

/// Command-line interface for Infocalypse.
#[derive(Parser)]
#[command(name = "infocalypse")]
#[command(version)]
#[command(about = "Publish and fetch Mercurial repositories on Freenet")]
#[command(long_about = "Publishes Mercurial repositories as bundles under a USK and keeps \
    local clones up to date from them, through a Freenet node's FCP port.")]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Commands,
}

/// Global options available to all commands.
#[derive(Args, Clone)]
pub struct GlobalOptions {
    /// Local Mercurial repository.
    #[arg(short = 'R', long = "repo", default_value = ".", global = true)]
    pub repo: PathBuf,

    /// Config file.
    ///
    /// Defaults to `$XDG_CONFIG_HOME/infocalypse/config.toml`.
    #[arg(long, env = "INFOCALYPSE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// FCP host, overriding the config file.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// FCP port, overriding the config file.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Output JSON instead of human-readable format.
    #[arg(long = "json", global = true)]
    pub is_json: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub is_verbose: bool,

    /// Suppress all logging output.
    #[arg(short = 'q', long = "quiet", global = true)]
    pub is_quiet: bool,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Generate a fresh SSK keypair.
    Genkey(GenkeyArgs),

    /// Publish a repository for the first time.
    Create(CreateArgs),

    /// Publish new changesets on top of the latest version.
    Push(PushArgs),

    /// Fetch and apply published changesets.
    Pull(PullArgs),

    /// Re-insert already published data so it stays retrievable.
    Reinsert(ReinsertArgs),

    /// Show what a repository USK currently advertises.
    Info(InfoArgs),
}

impl Cli {
    /// Run the selected command.
    pub async fn run(self) -> Result<()> {
        let mut ctx = CommandContext::connect(&self.global).await?;
        match self.command {
            Commands::Genkey(args) => args.run(&ctx).await,
            Commands::Create(args) => args.run(&mut ctx).await,
            Commands::Push(args) => args.run(&mut ctx).await,
            Commands::Pull(args) => args.run(&mut ctx).await,
            Commands::Reinsert(args) => args.run(&mut ctx).await,
            Commands::Info(args) => args.run(&ctx).await,
        }
    }
}
