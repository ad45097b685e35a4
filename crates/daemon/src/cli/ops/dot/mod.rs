use clap::{Args, Subcommand};

pub mod cat;
pub mod create;
pub mod delete;
pub mod handoff;
pub mod list;
pub mod master;
pub mod put;
pub mod snapshot;
pub mod snapshots;

use crate::cli::op::Op;

crate::command_enum! {
    (Create, create::Create),
    (List, list::List),
    (Put, put::Put),
    (Cat, cat::Cat),
    (Snapshot, snapshot::Snapshot),
    (Snapshots, snapshots::Snapshots),
    (Master, master::Master),
    (Handoff, handoff::Handoff),
    (Delete, delete::Delete),
}

// Rename the generated Command to DotCommand for clarity
pub type DotCommand = Command;

#[derive(Args, Debug, Clone)]
pub struct Dot {
    #[command(subcommand)]
    pub command: DotCommand,
}

#[async_trait::async_trait]
impl Op for Dot {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}
