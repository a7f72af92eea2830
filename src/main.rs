use docnow_server::{build_app, config::Config, db, models::AppState};

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url).await?;
    db::migrate(&pool).await?;

    if cfg.otp_dev_echo {
        tracing::warn!("OTP_DEV_ECHO is on: OTP codes are returned in API responses");
    }

    let bind_addr = cfg.bind_addr.clone();
    let state = AppState::new(pool, cfg)?;
    let app = build_app(state);

    tracing::info!("Listening on http://{bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
