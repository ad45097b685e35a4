use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, ConfigError};
use crate::http_server;
use crate::plugin;
use crate::state::{State, StateSetupError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("state setup failed: {0}")]
    State(#[from] StateSetupError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("failed to write plugin spec file: {0}")]
    SpecFile(std::io::Error),
}

/// Handle on a running node. Dropping it does not stop anything.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
    state: State,
    servers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    api_addr: SocketAddr,
    plugin_addr: SocketAddr,
}

impl ShutdownHandle {
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn plugin_addr(&self) -> SocketAddr {
        self.plugin_addr
    }

    /// Ask both servers to stop accepting and drain
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Block until ctrl-c or [`ShutdownHandle::shutdown`], then stop the
    ///  servers and every filesystem machine
    pub async fn wait(self) {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, shutting down");
            }
            _ = rx.wait_for(|stop| *stop) => {
                tracing::info!("shutdown requested");
            }
        }
        self.tx.send_replace(true);

        for server in self.servers {
            if let Err(e) = server.await {
                tracing::error!(error = %e, "server task failed");
            }
        }
        for task in self.background {
            task.abort();
        }
        self.state.registry().shutdown();
        tracing::info!("node stopped");
    }
}

fn init_tracing(config: &Config) -> Result<(), ConfigError> {
    let level = config.log_level()?;
    // a subscriber may already be installed, e.g. by an embedding process
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .try_init();
    Ok(())
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServiceError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServiceError::Bind { addr, source })
}

fn shutdown_signal(tx: &watch::Sender<bool>) -> impl Future<Output = ()> + Send + 'static {
    let mut rx = tx.subscribe();
    async move {
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Bring a node up: state, both listeners, the plugin spec file, and the
///  master watchers. Returns once everything is accepting.
pub async fn start_service(config: &Config) -> Result<(State, ShutdownHandle), ServiceError> {
    init_tracing(config)?;
    let state = State::from_config(config).await?;

    // symlinks left behind by dots deleted while this node was down
    match state
        .mounts()
        .cleanup_stale(&state.registry().context().masters)
        .await
    {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "removed stale container mounts"),
        Err(e) => tracing::warn!(error = %e, "container mount cleanup failed"),
    }

    let background = vec![
        state.registry().watch_masters(),
        state
            .registry()
            .poll_masters(config.master_poll_interval()),
    ];

    let api_listener = bind(config.api_listen_addr).await?;
    let plugin_listener = bind(config.plugin_listen_addr).await?;
    let api_addr = api_listener
        .local_addr()
        .map_err(|source| ServiceError::Bind {
            addr: config.api_listen_addr,
            source,
        })?;
    let plugin_addr = plugin_listener
        .local_addr()
        .map_err(|source| ServiceError::Bind {
            addr: config.plugin_listen_addr,
            source,
        })?;

    if let Some(dir) = &config.plugin_spec_dir {
        plugin::write_spec_file(dir, plugin_addr)
            .await
            .map_err(ServiceError::SpecFile)?;
    }

    let (tx, _) = watch::channel(false);
    let api = {
        let app = http_server::api_router(state.clone());
        let shutdown = shutdown_signal(&tx);
        tokio::spawn(async move {
            if let Err(e) = http_server::serve("api", api_listener, app, shutdown).await {
                tracing::error!(error = %e, "api server failed");
            }
        })
    };
    let plugin = {
        let app = http_server::plugin_router(state.clone());
        let shutdown = shutdown_signal(&tx);
        tokio::spawn(async move {
            if let Err(e) = http_server::serve("plugin", plugin_listener, app, shutdown).await {
                tracing::error!(error = %e, "plugin server failed");
            }
        })
    };

    tracing::info!(
        node_id = %state.registry().node_id(),
        api = %api_addr,
        plugin = %plugin_addr,
        "node started"
    );

    let handle = ShutdownHandle {
        tx,
        state: state.clone(),
        servers: vec![api, plugin],
        background,
        api_addr,
        plugin_addr,
    };
    Ok((state, handle))
}

/// Run a node until ctrl-c
pub async fn spawn_service(config: &Config) -> Result<(), ServiceError> {
    let (_state, handle) = start_service(config).await?;
    handle.wait().await;
    Ok(())
}
