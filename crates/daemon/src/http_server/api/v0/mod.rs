use axum::Router;

use crate::ServiceState;

pub mod dots;

pub fn router(state: ServiceState) -> Router<ServiceState> {
    Router::new()
        .nest("/dots", dots::router(state.clone()))
        .with_state(state)
}
