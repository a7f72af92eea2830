//! OTP and staff login against a real Postgres. Skipped when DATABASE_URL
//! is unset.

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use docnow_server::{auth, build_app, db, models::AppState};

mod common;
use common::test_config;

async fn app() -> Option<(Router, AppState)> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let pool = db::connect_pg(&url).await.expect("connect");
    db::migrate(&pool).await.expect("migrate");
    let mut cfg = test_config(&url);
    cfg.otp_dev_echo = true;
    let state = AppState::new(pool, cfg).expect("state");
    Some((build_app(state.clone()), state))
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), 64 * 1024).await.expect("body");
    (status, serde_json::from_slice(&bytes).expect("json body"))
}

fn post(path: &str, body: Value) -> Request<Body> {
    Request::post(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str, token: &str) -> Request<Body> {
    Request::get(path)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn otp_login_creates_customer_and_session() {
    let Some((app, _)) = app().await else { return };
    let phone = format!("9{:09}", Uuid::new_v4().as_u128() % 1_000_000_000);

    let (status, body) = call(&app, post("/api/v1/auth/otp/request", json!({"phone": phone}))).await;
    assert_eq!(status, StatusCode::OK);
    let code = body["data"]["dev_code"].as_str().expect("dev code").to_string();

    let (status, body) = call(
        &app,
        post("/api/v1/auth/otp/verify", json!({"phone": phone, "code": code})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_new_user"], true);
    let token = body["data"]["access_token"].as_str().expect("token").to_string();

    let (status, me) = call(&app, get("/api/v1/auth/me", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["data"]["user"]["phone"], phone.as_str());
    assert_eq!(me["data"]["session"]["expires_at"], body["data"]["expires_at"]);

    // A used code does not log in twice.
    let (status, body) = call(
        &app,
        post("/api/v1/auth/otp/verify", json!({"phone": phone, "code": code})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "OTP_EXPIRED");

    let (status, _) = call(&app, get("/api/v1/wallet", &token)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn staff_login_accepts_managers_only() {
    let Some((app, state)) = app().await else { return };
    let tag = Uuid::new_v4().simple().to_string();
    let hash = auth::hash_password("correct horse").expect("hash");

    for (role, expected) in [(2_i16, StatusCode::OK), (0_i16, StatusCode::FORBIDDEN)] {
        let email = format!("staff{role}-{tag}@docnow.test");
        sqlx::query(
            "INSERT INTO app_user (email, display_name, password_hash, roles, referral_code) VALUES ($1, 'Staff', $2, $3, $4)",
        )
        .bind(&email)
        .bind(&hash)
        .bind(role)
        .bind(format!("S{}{}", role, &tag[..9].to_uppercase()))
        .execute(&state.db)
        .await
        .expect("staff user");

        let (status, _) = call(
            &app,
            post(
                "/api/v1/auth/staff/login",
                json!({"email": email, "password": "correct horse"}),
            ),
        )
        .await;
        assert_eq!(status, expected, "role {role}");
    }
}
