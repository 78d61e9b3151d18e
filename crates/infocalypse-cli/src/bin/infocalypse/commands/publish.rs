//! Commands that insert: `create`, `push` and `reinsert`.

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use infocalypse_update::ops;

use crate::context::CommandContext;
use crate::context::create_insert_uri;
use crate::context::default_repo_name;
use crate::context::stored_insert_uri;
use crate::output::InsertOutput;
use crate::output::print_output;

#[derive(Args)]
pub struct CreateArgs {
    /// Insert USK. Defaults to `default_private_key` from the config.
    pub uri: Option<String>,

    /// Repository name used with the default key. Defaults to the
    /// directory name plus `.R1`.
    #[arg(long)]
    pub name: Option<String>,
}

impl CreateArgs {
    pub async fn run(self, ctx: &mut CommandContext) -> Result<()> {
        let repo = ctx.open_repo()?;
        let name = self.name.unwrap_or_else(|| default_repo_name(repo.root()));
        let insert_uri = create_insert_uri(&ctx.session.config, self.uri.as_deref(), &name)?;
        let report = ops::create(&mut ctx.session, &repo, Some(repo.root()), &insert_uri)
            .await
            .context("create failed")?;
        print_output(&InsertOutput { report }, ctx.is_json);
        Ok(())
    }
}

#[derive(Args)]
pub struct PushArgs {
    /// Insert USK. Defaults to the one this repository last pushed to.
    pub uri: Option<String>,
}

impl PushArgs {
    pub async fn run(self, ctx: &mut CommandContext) -> Result<()> {
        let repo = ctx.open_repo()?;
        let insert_uri = stored_insert_uri(&ctx.session.config, repo.root(), self.uri.as_deref())?;
        let report = ops::push(&mut ctx.session, &repo, Some(repo.root()), &insert_uri)
            .await
            .context("push failed")?;
        print_output(&InsertOutput { report }, ctx.is_json);
        Ok(())
    }
}

#[derive(Args)]
pub struct ReinsertArgs {
    /// Insert USK. Defaults to the one this repository last pushed to.
    pub uri: Option<String>,

    /// How much to re-insert, from 1 (top key only) to 5 (everything,
    /// including the salted copies).
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u8).range(1..=5))]
    pub level: u8,
}

impl ReinsertArgs {
    pub async fn run(self, ctx: &mut CommandContext) -> Result<()> {
        let repo = ctx.open_repo()?;
        let insert_uri = stored_insert_uri(&ctx.session.config, repo.root(), self.uri.as_deref())?;
        let report = ops::reinsert(&mut ctx.session, &repo, &insert_uri, self.level)
            .await
            .context("reinsert failed")?;
        print_output(&InsertOutput { report }, ctx.is_json);
        Ok(())
    }
}
