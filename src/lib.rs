pub mod audit;
pub mod auth;
pub mod checkout;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod models;
pub mod order_state;
pub mod pagination;
pub mod partner;
pub mod pricing;
pub mod referral;
pub mod routes;
pub mod settings;
pub mod signature;
pub mod validation;
pub mod wallet;

use axum::{Router, http::header};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::models::AppState;

/// Full application with CORS and request tracing.
pub fn build_app(state: AppState) -> Router {
    // Mobile web views and the admin console call from other origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
