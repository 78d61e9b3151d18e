//! Fetch published changesets into the local repository.

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use infocalypse_update::ops;

use crate::context::CommandContext;
use crate::context::stored_request_uri;
use crate::output::PullOutput;
use crate::output::print_output;

#[derive(Args)]
pub struct PullArgs {
    /// Request USK. Defaults to the one this repository last used.
    pub uri: Option<String>,
}

impl PullArgs {
    pub async fn run(self, ctx: &mut CommandContext) -> Result<()> {
        let mut repo = ctx.open_repo()?;
        let root = repo.root().to_path_buf();
        let request_uri = stored_request_uri(&ctx.session.config, &root, self.uri.as_deref())?;
        let report = ops::pull(&mut ctx.session, &mut repo, Some(&root), &request_uri)
            .await
            .context("pull failed")?;
        print_output(&PullOutput { report }, ctx.is_json);
        Ok(())
    }
}
