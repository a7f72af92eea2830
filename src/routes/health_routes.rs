use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::models::{ApiOk, AppState};

#[derive(Debug, Serialize)]
pub struct HealthData {
    pub status: &'static str,
    pub version: &'static str,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Liveness only; does not touch the database.
pub async fn health() -> Json<ApiOk<HealthData>> {
    Json(ApiOk::new(HealthData {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}
