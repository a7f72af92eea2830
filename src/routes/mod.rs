use crate::models::AppState;
use axum::Router;

pub mod admin_routes;
pub mod auth_routes;
pub mod cart_routes;
pub mod catalog_routes;
pub mod health_routes;
pub mod manager_routes;
pub mod order_routes;
pub mod payment_routes;
pub mod profile_routes;
pub mod promo_routes;
pub mod slot_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/auth", auth_routes::router())
        .nest("/api/v1/manager", manager_routes::router())
        .nest("/api/v1/admin", admin_routes::router())
        .nest(
            "/api/v1",
            Router::new()
                .merge(catalog_routes::router())
                .merge(cart_routes::router())
                .merge(profile_routes::router())
                .merge(promo_routes::router())
                .merge(slot_routes::router())
                .merge(payment_routes::router())
                .merge(order_routes::router()),
        )
        .merge(health_routes::router())
        .with_state(state)
}
