//! The two HTTP surfaces a node serves: the operator API (plus health
//! checks) and the docker volume plugin.

use std::future::Future;
use std::io;

use axum::routing::get;
use axum::Router;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::ServiceState;

pub mod api;
pub mod health;

/// Operator API under `/api`, health checks under `/_status`
pub fn api_router(state: ServiceState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([ACCEPT, AUTHORIZATION, CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .nest("/api", api::router(state.clone()))
        .route("/_status/livez", get(health::liveness::handler))
        .route("/_status/version", get(health::version::handler))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(trace_layer()).layer(cors))
}

pub fn plugin_router(state: ServiceState) -> Router {
    crate::plugin::router(state.clone())
        .with_state(state)
        .layer(trace_layer())
}

fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().include_headers(false))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG))
}

/// Serve `app` on `listener` until `shutdown` resolves
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(server = name, addr = %addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!(server = name, "stopped");
    Ok(())
}
