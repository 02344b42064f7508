use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::forest::NamespaceSummary;
use crate::validators::{self, ValidatorState};

#[derive(Serialize)]
struct HealthCheck {
    message: String,
}

pub async fn new_router(state: ValidatorState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/forest", get(forest))
        .route("/validators/hierarchy", post(validators::hierarchy::handle))
        .route("/validators/anchors", post(validators::anchor::handle))
        .route("/validators/namespaces", post(validators::namespace::handle))
        .route(
            "/validators/configuration",
            post(validators::typeconfig::handle),
        )
        .route("/validators/objects", post(validators::object::handle))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Debug view of the in-memory forest.
async fn forest(State(state): State<ValidatorState>) -> Json<Vec<NamespaceSummary>> {
    let snapshot = state.forest.lock().unwrap().snapshot();
    Json(snapshot)
}

async fn healthz() -> Json<HealthCheck> {
    Json(HealthCheck {
        message: "ok".into(),
    })
}
