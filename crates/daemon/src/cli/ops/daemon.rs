use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;

use dots_daemon::config::ConfigError;
use dots_daemon::{spawn_service, Config, ServiceError};

#[derive(Args, Debug, Clone)]
pub struct Daemon {
    /// Identity of this node (defaults to the config, then the hostname)
    #[arg(long)]
    pub node_id: Option<String>,

    /// Override the API listen address
    #[arg(long)]
    pub api_listen_addr: Option<SocketAddr>,

    /// Override the volume plugin listen address
    #[arg(long)]
    pub plugin_listen_addr: Option<SocketAddr>,

    /// Override the directory the plugin spec file is written to
    #[arg(long)]
    pub plugin_spec_dir: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("daemon failed: {0}")]
    Service(#[from] ServiceError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Daemon {
    type Error = DaemonError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut config = Config::load_or_default(ctx.config_path.as_deref())?;
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(addr) = self.api_listen_addr {
            config.api_listen_addr = addr;
        }
        if let Some(addr) = self.plugin_listen_addr {
            config.plugin_listen_addr = addr;
        }
        if let Some(dir) = &self.plugin_spec_dir {
            config.plugin_spec_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }

        spawn_service(&config).await?;
        Ok("daemon ended".to_string())
    }
}
