//! Infocalypse CLI - publish and fetch Mercurial repositories on Freenet.
//!
//! Talks FCP 2.0 to a local Freenet node and keeps what it learns (latest
//! versions, which USKs a repository pushes to) in a TOML config file.
//!
//! # Usage
//!
//! ```bash
//! # Make a keypair and publish a repository for the first time
//! infocalypse genkey
//! infocalypse --repo ~/src/project create USK@<insert key>/project.R1/0
//!
//! # Later pushes and pulls find their USKs in the config
//! infocalypse --repo ~/src/project push
//! infocalypse --repo ~/src/clone pull USK@<request key>/project.R1/4
//!
//! # Inspect what a repository advertises
//! infocalypse --json info USK@<request key>/project.R1/4 --graph | jq '.heads'
//! ```

mod cli;
mod commands;
mod context;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

/// Initialize tracing subscriber with environment-based filtering.
///
/// - `quiet`: Suppress all logging output (for scripting)
/// - `verbose`: Enable debug-level logging
fn init_tracing(quiet: bool, verbose: bool) {
    let filter = if quiet {
        EnvFilter::new("off")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.global.is_quiet, cli.global.is_verbose);

    cli.run().await
}
