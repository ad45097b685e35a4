use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use url::Url;

mod cli;

use cli::op::{Op, OpContext};
use cli::ops::{Daemon, Dot, Health, Version};
use dots_daemon::config::{default_config_path, DEFAULT_API_LISTEN_ADDR};
use dots_daemon::http_server::api::client::ApiClient;

crate::command_enum! {
    (Daemon, Daemon),
    (Dot, Dot),
    (Health, Health),
    (Version, Version),
}

#[derive(Debug, Parser)]
#[command(name = "dots", version, about = "Replicated, snapshot-able volumes for containers")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Node API to talk to
    #[arg(long, global = true, env = "DOTS_REMOTE")]
    remote: Option<Url>,

    /// Config file (defaults to the per-user config dir)
    #[arg(long, global = true, env = "DOTS_CONFIG")]
    config: Option<PathBuf>,

    /// User to authenticate as
    #[arg(long, global = true, env = "DOTS_USER", default_value = "admin")]
    user: String,

    /// Password or API key for --user
    #[arg(long, global = true, env = "DOTS_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

async fn run(args: Cli) -> anyhow::Result<OpOutput> {
    let remote = match args.remote {
        Some(remote) => remote,
        None => Url::parse(&format!("http://{}", DEFAULT_API_LISTEN_ADDR))
            .context("invalid default remote")?,
    };
    let credentials = args
        .password
        .as_deref()
        .map(|password| (args.user.as_str(), password));
    let client = ApiClient::new(&remote, credentials).context("failed to build api client")?;

    let ctx = OpContext {
        client,
        config_path: args.config.or_else(default_config_path),
    };
    Ok(args.command.execute(&ctx).await?)
}

#[tokio::main]
async fn main() {
    match run(Cli::parse()).await {
        Ok(output) => {
            println!("{}", output);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
