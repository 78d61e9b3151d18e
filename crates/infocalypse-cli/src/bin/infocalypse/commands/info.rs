//! Top-key inspection.

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use infocalypse_keys::Usk;
use infocalypse_update::ops;

use crate::context::CommandContext;
use crate::output::InfoOutput;
use crate::output::print_output;

#[derive(Args)]
pub struct InfoArgs {
    /// Request USK of the repository.
    pub uri: String,

    /// Also fetch the update graph.
    #[arg(long)]
    pub graph: bool,
}

impl InfoArgs {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let request_uri = Usk::parse(&self.uri).with_context(|| format!("not a USK: {}", self.uri))?;
        let info = ops::info(&ctx.session, &request_uri, self.graph).await?;
        print_output(&InfoOutput { info }, ctx.is_json);
        Ok(())
    }
}
