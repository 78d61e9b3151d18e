//! Keypair generation.

use anyhow::Result;
use clap::Args;
use infocalypse_update::ops;

use crate::context::CommandContext;
use crate::output::KeypairOutput;
use crate::output::print_output;

#[derive(Args)]
pub struct GenkeyArgs {
    /// Repository name to show the keys under. Must end in `.R1`.
    #[arg(long, default_value = "repo.R1")]
    pub name: String,
}

impl GenkeyArgs {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let keypair = ops::genkey(ctx.session.store().as_ref()).await?;
        print_output(&KeypairOutput { keypair, name: self.name }, ctx.is_json);
        Ok(())
    }
}
