use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use dots_daemon::http_server::api::client::ApiError;
use dots_daemon::http_server::health::liveness::LivezRequest;
use dots_daemon::Config;

#[derive(Args, Debug, Clone)]
pub struct Health;

#[derive(Debug)]
pub struct ConfigInfo {
    pub node_id: String,
    pub data_dir: String,
    pub api_listen_addr: String,
    pub plugin_listen_addr: String,
}

#[derive(Debug)]
pub enum EndpointStatus {
    Ok { node_id: String, machines: usize },
    Unhealthy(String),
    NotReachable,
}

#[derive(Debug)]
pub struct HealthOutput {
    pub config: Option<ConfigInfo>,
    pub config_error: Option<String>,
    pub url: String,
    pub livez: EndpointStatus,
}

impl fmt::Display for HealthOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", "Config".bold())?;
        match &self.config {
            Some(info) => {
                writeln!(f, "  {} {}", "node_id:".dimmed(), info.node_id)?;
                writeln!(f, "  {} {}", "data_dir:".dimmed(), info.data_dir)?;
                writeln!(f, "  {} {}", "api:".dimmed(), info.api_listen_addr)?;
                writeln!(f, "  {} {}", "plugin:".dimmed(), info.plugin_listen_addr)?;
            }
            None => {
                if let Some(err) = &self.config_error {
                    writeln!(f, "  {} {}", "error:".red(), err)?;
                }
            }
        }

        writeln!(f)?;
        writeln!(f, "{} ({}):", "Node".bold(), self.url)?;
        let status = match &self.livez {
            EndpointStatus::Ok { node_id, machines } => format!(
                "{} (node {}, {} machines running)",
                "OK".green(),
                node_id,
                machines
            ),
            EndpointStatus::Unhealthy(code) => format!("{} ({})", "UNHEALTHY".red(), code),
            EndpointStatus::NotReachable => "NOT REACHABLE".red().to_string(),
        };
        write!(f, "  {} {}", "livez:".dimmed(), status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Health check failed: {0}")]
    Failed(String),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Health {
    type Error = HealthError;
    type Output = HealthOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let (config, config_error) = match Config::load_or_default(ctx.config_path.as_deref()) {
            Ok(config) => (
                Some(ConfigInfo {
                    node_id: config.node_id.clone(),
                    data_dir: config.data_dir.display().to_string(),
                    api_listen_addr: config.api_listen_addr.to_string(),
                    plugin_listen_addr: config.plugin_listen_addr.to_string(),
                }),
                None,
            ),
            Err(e) => (None, Some(e.to_string())),
        };

        let livez = match ctx.client.call(LivezRequest {}).await {
            Ok(livez) => EndpointStatus::Ok {
                node_id: livez.node_id.to_string(),
                machines: livez.machines,
            },
            Err(ApiError::HttpStatus(status, _)) => EndpointStatus::Unhealthy(status.to_string()),
            Err(_) => EndpointStatus::NotReachable,
        };

        Ok(HealthOutput {
            config,
            config_error,
            url: ctx.client.base_url().to_string(),
            livez,
        })
    }
}
