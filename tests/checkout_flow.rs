//! Checkout against a real Postgres. Each test builds its own customer,
//! so they can share one database. Skipped when DATABASE_URL is unset.

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use chrono::{Duration, NaiveDate, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use docnow_server::{
    auth, build_app,
    checkout::{self, InitiateRequest, OrderRow, SUPERSEDED_REASON},
    db,
    models::AppState,
    order_state::OrderStatus,
    partner::{SandboxPartner, local_date},
    routes::cart_routes,
    signature, wallet,
};

mod common;
use common::{WEBHOOK_SECRET, test_config};

const PRICE: i64 = 45_000;

async fn state() -> Option<AppState> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let pool = db::connect_pg(&url).await.expect("connect");
    db::migrate(&pool).await.expect("migrate");
    Some(AppState::new(pool, test_config(&url)).expect("state"))
}

fn tag() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_uppercase()
}

/// A customer with one address, one patient and one test in the cart.
struct Customer {
    user_id: Uuid,
    address_id: Uuid,
    patient_id: Uuid,
}

async fn customer(db: &PgPool) -> Customer {
    let phone = format!("9{:09}", Uuid::new_v4().as_u128() % 1_000_000_000);
    let user_id: Uuid = sqlx::query_scalar(
        "INSERT INTO app_user (phone, display_name, roles, referral_code) VALUES ($1, 'Test', 0, $2) RETURNING user_id",
    )
    .bind(&phone)
    .bind(format!("T{}", tag()))
    .fetch_one(db)
    .await
    .expect("user");

    let mut conn = db.acquire().await.expect("conn");
    wallet::ensure_wallet(&mut conn, user_id).await.expect("wallet");

    let address_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO address (user_id, line1, city, state, pincode, is_default)
        VALUES ($1, '12 MG Road', 'Bengaluru', 'Karnataka', '560001', TRUE)
        RETURNING address_id
        "#,
    )
    .bind(user_id)
    .fetch_one(db)
    .await
    .expect("address");

    let patient_id: Uuid = sqlx::query_scalar(
        "INSERT INTO patient (user_id, full_name, gender, date_of_birth) VALUES ($1, 'Asha Rao', 0, $2) RETURNING patient_id",
    )
    .bind(user_id)
    .bind(NaiveDate::from_ymd_opt(1990, 5, 17).unwrap())
    .fetch_one(db)
    .await
    .expect("patient");

    let t = tag();
    let product_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO product (partner_code, name, slug, mrp_paise, price_paise)
        VALUES ($1, 'Complete Blood Count', $2, $3, $3)
        RETURNING product_id
        "#,
    )
    .bind(format!("TST-{t}"))
    .bind(format!("cbc-{}", t.to_lowercase()))
    .bind(PRICE)
    .fetch_one(db)
    .await
    .expect("product");

    sqlx::query("INSERT INTO cart_item (user_id, product_id, patient_id) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(product_id)
        .bind(patient_id)
        .execute(db)
        .await
        .expect("cart");

    Customer {
        user_id,
        address_id,
        patient_id,
    }
}

async fn slot_lock(db: &PgPool, c: &Customer, expires_in: Duration) -> Uuid {
    let start = Utc::now() + Duration::days(1);
    sqlx::query_scalar(
        r#"
        INSERT INTO slot_lock (user_id, address_id, partner_slot_id, slot_start, slot_end, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING slot_lock_id
        "#,
    )
    .bind(c.user_id)
    .bind(c.address_id)
    .bind(format!("sbx-{}", tag()))
    .bind(start)
    .bind(start + Duration::hours(1))
    .bind(Utc::now() + expires_in)
    .fetch_one(db)
    .await
    .expect("slot lock")
}

async fn flat_promo(db: &PgPool, amount: i64, usage_limit: Option<i32>) -> (Uuid, String) {
    let code = format!("T{}", tag());
    let id = sqlx::query_scalar(
        "INSERT INTO promo_code (code, discount_type, discount_value, usage_limit) VALUES ($1, 1, $2, $3) RETURNING promo_id",
    )
    .bind(&code)
    .bind(amount)
    .bind(usage_limit)
    .fetch_one(db)
    .await
    .expect("promo");
    (id, code)
}

async fn top_up(db: &PgPool, user_id: Uuid, amount: i64) {
    let mut conn = db.acquire().await.expect("conn");
    wallet::credit(&mut conn, user_id, amount, wallet::REASON_ADMIN_ADJUSTMENT, None, None)
        .await
        .expect("credit");
}

async fn order(db: &PgPool, order_id: Uuid) -> OrderRow {
    let mut conn = db.acquire().await.expect("conn");
    checkout::load_order(&mut conn, order_id, false)
        .await
        .expect("load")
        .expect("order exists")
}

async fn used_count(db: &PgPool, promo_id: Uuid) -> i32 {
    sqlx::query_scalar("SELECT used_count FROM promo_code WHERE promo_id = $1")
        .bind(promo_id)
        .fetch_one(db)
        .await
        .expect("promo")
}

async fn open_orders(db: &PgPool, user_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM booking_order WHERE user_id = $1 AND status = $2")
        .bind(user_id)
        .bind(OrderStatus::Created)
        .fetch_one(db)
        .await
        .expect("count")
}

fn request(c: &Customer, slot_lock_id: Uuid) -> InitiateRequest {
    InitiateRequest {
        address_id: c.address_id,
        slot_lock_id,
        promo_code: None,
        use_wallet: false,
    }
}

#[tokio::test]
async fn initiate_twice_on_one_lock_returns_the_same_order() {
    let Some(state) = state().await else { return };
    let c = customer(&state.db).await;
    top_up(&state.db, c.user_id, 1_000).await;
    let lock = slot_lock(&state.db, &c, Duration::minutes(15)).await;

    let mut req = request(&c, lock);
    req.use_wallet = true;
    let first = checkout::initiate(&state, c.user_id, &req).await.unwrap();
    assert!(!first.resumed);
    assert_eq!(first.order.status, OrderStatus::Created);
    assert!(first.order.wallet_paise > 0);
    assert!(first.gateway.is_some());

    let second = checkout::initiate(&state, c.user_id, &req).await.unwrap();
    assert!(second.resumed);
    assert_eq!(second.order.order_id, first.order.order_id);
    assert_eq!(
        second.gateway.map(|g| g.gateway_order_id),
        first.order.gateway_order_id
    );

    // Debited once.
    let balance = wallet::balance(&state.db, c.user_id).await.unwrap();
    assert_eq!(balance, 1_000 - first.order.wallet_paise);
}

#[tokio::test]
async fn mark_paid_is_idempotent_per_payment_id() {
    let Some(state) = state().await else { return };
    let c = customer(&state.db).await;
    let lock = slot_lock(&state.db, &c, Duration::minutes(15)).await;
    let created = checkout::initiate(&state, c.user_id, &request(&c, lock)).await.unwrap();
    let order_id = created.order.order_id;
    let gw_order = created.order.gateway_order_id.clone().expect("gateway order");
    let payment = format!("pay_{}", tag());

    let (paid, newly) = checkout::mark_paid(&state, order_id, Some(c.user_id), Some((gw_order.as_str(), payment.as_str())))
        .await
        .unwrap();
    assert!(newly);
    assert_eq!(paid.status, OrderStatus::Paid);

    let (again, newly) = checkout::mark_paid(&state, order_id, None, Some((gw_order.as_str(), payment.as_str())))
        .await
        .unwrap();
    assert!(!newly);
    assert_eq!(again.gateway_payment_id.as_deref(), Some(payment.as_str()));

    let err = checkout::mark_paid(&state, order_id, None, Some((gw_order.as_str(), "pay_other")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ORDER_ALREADY_PAID");

    let err = checkout::mark_paid(&state, order_id, None, Some(("order_other", payment.as_str())))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "GATEWAY_ORDER_MISMATCH");

    let done = checkout::finalize_booking(&state, order_id).await.unwrap();
    assert_eq!(done.status, OrderStatus::Confirmed);
    assert!(done.partner_booking_id.is_some());

    // Finalizing again leaves the confirmed order as is.
    let again = checkout::finalize_booking(&state, order_id).await.unwrap();
    assert_eq!(again.partner_booking_id, done.partner_booking_id);

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cart_item WHERE user_id = $1")
        .bind(c.user_id)
        .fetch_one(&state.db)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn failed_payment_returns_wallet_promo_and_slot() {
    let Some(state) = state().await else { return };
    let c = customer(&state.db).await;
    top_up(&state.db, c.user_id, 2_000).await;
    let (promo_id, code) = flat_promo(&state.db, 5_000, Some(10)).await;
    let lock = slot_lock(&state.db, &c, Duration::minutes(15)).await;

    let mut req = request(&c, lock);
    req.promo_code = Some(code);
    req.use_wallet = true;
    let created = checkout::initiate(&state, c.user_id, &req).await.unwrap();
    assert_eq!(created.order.discount_paise, 5_000);
    assert_eq!(used_count(&state.db, promo_id).await, 1);

    let failed = checkout::fail_payment(&state, created.order.order_id, Some(c.user_id), "cancelled by user")
        .await
        .unwrap();
    assert_eq!(failed.status, OrderStatus::PaymentFailed);
    assert_eq!(used_count(&state.db, promo_id).await, 0);
    assert_eq!(wallet::balance(&state.db, c.user_id).await.unwrap(), 2_000);

    let mut conn = state.db.acquire().await.unwrap();
    let released = checkout::load_slot_lock(&mut conn, lock).await.unwrap().unwrap();
    assert!(released.released_at.is_some());
    drop(conn);

    // Repeating changes nothing.
    checkout::fail_payment(&state, created.order.order_id, Some(c.user_id), "again")
        .await
        .unwrap();
    assert_eq!(wallet::balance(&state.db, c.user_id).await.unwrap(), 2_000);
    assert_eq!(used_count(&state.db, promo_id).await, 0);
}

#[tokio::test]
async fn fully_discounted_order_confirms_without_gateway() {
    let Some(state) = state().await else { return };
    let c = customer(&state.db).await;
    let (promo_id, code) = flat_promo(&state.db, PRICE, None).await;
    let lock = slot_lock(&state.db, &c, Duration::minutes(15)).await;

    let mut req = request(&c, lock);
    req.promo_code = Some(code);
    let done = checkout::initiate(&state, c.user_id, &req).await.unwrap();
    assert!(done.gateway.is_none());
    assert_eq!(done.order.payable_paise, 0);
    assert_eq!(done.order.status, OrderStatus::Confirmed);
    assert!(done.order.gateway_order_id.is_none());
    assert_eq!(used_count(&state.db, promo_id).await, 1);
}

#[tokio::test]
async fn exhausted_promo_is_not_claimed() {
    let Some(state) = state().await else { return };
    let (promo_id, code) = flat_promo(&state.db, 1_000, Some(1)).await;
    sqlx::query("UPDATE promo_code SET used_count = 1 WHERE promo_id = $1")
        .bind(promo_id)
        .execute(&state.db)
        .await
        .unwrap();

    let c = customer(&state.db).await;
    let lock = slot_lock(&state.db, &c, Duration::minutes(15)).await;
    let mut req = request(&c, lock);
    req.promo_code = Some(code);
    assert!(checkout::initiate(&state, c.user_id, &req).await.is_err());
    assert_eq!(used_count(&state.db, promo_id).await, 1);
    assert_eq!(open_orders(&state.db, c.user_id).await, 0);
}

fn webhook(event: &str, gw_order: &str, payment_id: &str) -> Request<Body> {
    let body = serde_json::json!({
        "event": event,
        "payload": {"payment": {"entity": {
            "id": payment_id,
            "order_id": gw_order,
            "amount": PRICE,
            "error_description": "card declined"
        }}}
    })
    .to_string();
    Request::post("/api/v1/payments/webhook")
        .header("content-type", "application/json")
        .header("x-razorpay-signature", signature::sign(WEBHOOK_SECRET, body.as_bytes()))
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn capture_after_failed_attempt_still_books() {
    let Some(state) = state().await else { return };
    let c = customer(&state.db).await;
    let lock = slot_lock(&state.db, &c, Duration::minutes(15)).await;
    let created = checkout::initiate(&state, c.user_id, &request(&c, lock)).await.unwrap();
    let order_id = created.order.order_id;
    let gw_order = created.order.gateway_order_id.clone().expect("gateway order");
    let app: Router = build_app(state.clone());

    let res = app
        .clone()
        .oneshot(webhook("payment.failed", &gw_order, "pay_declined"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let after_failure = order(&state.db, order_id).await;
    assert_eq!(after_failure.status, OrderStatus::Created);
    assert!(after_failure.failure_reason.is_some());

    let retry = format!("pay_{}", tag());
    let res = app
        .oneshot(webhook("payment.captured", &gw_order, &retry))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let booked = order(&state.db, order_id).await;
    assert_eq!(booked.status, OrderStatus::Confirmed);
    assert_eq!(booked.gateway_payment_id.as_deref(), Some(retry.as_str()));
}

#[tokio::test]
async fn new_checkout_supersedes_the_open_order() {
    let Some(state) = state().await else { return };
    let c = customer(&state.db).await;
    top_up(&state.db, c.user_id, 1_000).await;

    let first_lock = slot_lock(&state.db, &c, Duration::minutes(15)).await;
    let mut req = request(&c, first_lock);
    req.use_wallet = true;
    let first = checkout::initiate(&state, c.user_id, &req).await.unwrap();

    let second_lock = slot_lock(&state.db, &c, Duration::minutes(15)).await;
    let mut req = request(&c, second_lock);
    req.use_wallet = true;
    let second = checkout::initiate(&state, c.user_id, &req).await.unwrap();
    assert_ne!(second.order.order_id, first.order.order_id);
    // The first hold came back and was spent again.
    assert_eq!(second.order.wallet_paise, first.order.wallet_paise);

    assert_eq!(open_orders(&state.db, c.user_id).await, 1);
    let superseded = order(&state.db, first.order.order_id).await;
    assert_eq!(superseded.status, OrderStatus::PaymentFailed);
    assert_eq!(superseded.failure_reason.as_deref(), Some(SUPERSEDED_REASON));
    assert_eq!(
        wallet::balance(&state.db, c.user_id).await.unwrap(),
        1_000 - second.order.wallet_paise
    );

    // A late capture of the superseded order is refused.
    let gw_order = superseded.gateway_order_id.clone().expect("gateway order");
    let err = checkout::mark_paid(&state, superseded.order_id, None, Some((gw_order.as_str(), "pay_late")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ORDER_CLOSED");
}

#[tokio::test]
async fn resuming_after_lock_expiry_is_refused() {
    let Some(state) = state().await else { return };
    let c = customer(&state.db).await;
    top_up(&state.db, c.user_id, 1_000).await;
    let lock = slot_lock(&state.db, &c, Duration::minutes(15)).await;
    let mut req = request(&c, lock);
    req.use_wallet = true;
    let created = checkout::initiate(&state, c.user_id, &req).await.unwrap();

    sqlx::query("UPDATE slot_lock SET expires_at = now() - interval '1 minute' WHERE slot_lock_id = $1")
        .bind(lock)
        .execute(&state.db)
        .await
        .unwrap();

    let err = checkout::initiate(&state, c.user_id, &req).await.unwrap_err();
    assert_eq!(err.code(), "SLOT_LOCK_EXPIRED");

    let expired = order(&state.db, created.order.order_id).await;
    assert_eq!(expired.status, OrderStatus::PaymentFailed);
    assert_eq!(wallet::balance(&state.db, c.user_id).await.unwrap(), 1_000);
}

#[tokio::test]
async fn viewing_the_wallet_releases_stale_holds() {
    let Some(state) = state().await else { return };
    let c = customer(&state.db).await;
    top_up(&state.db, c.user_id, 1_000).await;
    let lock = slot_lock(&state.db, &c, Duration::minutes(15)).await;
    let mut req = request(&c, lock);
    req.use_wallet = true;
    let created = checkout::initiate(&state, c.user_id, &req).await.unwrap();

    sqlx::query("UPDATE slot_lock SET expires_at = now() - interval '1 minute' WHERE slot_lock_id = $1")
        .bind(lock)
        .execute(&state.db)
        .await
        .unwrap();

    let (app, token) = signed_in(&state, c.user_id).await;
    let res = app
        .oneshot(
            Request::get("/api/v1/wallet")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        order(&state.db, created.order.order_id).await.status,
        OrderStatus::PaymentFailed
    );
    assert_eq!(wallet::balance(&state.db, c.user_id).await.unwrap(), 1_000);
}

async fn signed_in(state: &AppState, user_id: Uuid) -> (Router, String) {
    let token = auth::generate_access_token();
    sqlx::query("INSERT INTO session_token (user_id, session_token_hash, expires_at) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(auth::hash_access_token(&token))
        .bind(Utc::now() + Duration::hours(1))
        .execute(&state.db)
        .await
        .expect("session");
    (build_app(state.clone()), token)
}

async fn body_json(res: axum::response::Response) -> Value {
    let bytes = to_bytes(res.into_body(), 64 * 1024).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn freezing_a_new_slot_releases_the_previous_lock() {
    let Some(state) = state().await else { return };
    let c = customer(&state.db).await;
    let (app, token) = signed_in(&state, c.user_id).await;
    let tomorrow = local_date(Utc::now()) + Duration::days(1);

    let mut locks = Vec::new();
    for hour in [8, 9] {
        let slot_id = SandboxPartner::slot_id(tomorrow.and_hms_opt(hour, 0, 0).unwrap());
        let body = serde_json::json!({
            "address_id": c.address_id,
            "partner_slot_id": slot_id,
            "date": tomorrow,
        });
        let res = app
            .clone()
            .oneshot(
                Request::post("/api/v1/slots/freeze")
                    .header("authorization", format!("Bearer {token}"))
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        locks.push(json["data"]["slot_lock_id"].as_str().unwrap().to_string());
    }
    assert_ne!(locks[0], locks[1]);

    let open: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT slot_lock_id FROM slot_lock
        WHERE user_id = $1 AND order_id IS NULL AND released_at IS NULL AND expires_at > now()
        "#,
    )
    .bind(c.user_id)
    .fetch_all(&state.db)
    .await
    .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].to_string(), locks[1]);
}

#[tokio::test]
async fn lines_of_removed_patients_are_purged() {
    let Some(state) = state().await else { return };
    let c = customer(&state.db).await;
    sqlx::query("UPDATE patient SET deleted_at = now() WHERE patient_id = $1")
        .bind(c.patient_id)
        .execute(&state.db)
        .await
        .unwrap();

    let mut conn = state.db.acquire().await.unwrap();
    assert_eq!(cart_routes::purge_orphaned_lines(&mut conn, c.user_id).await.unwrap(), 1);
    assert_eq!(cart_routes::purge_orphaned_lines(&mut conn, c.user_id).await.unwrap(), 0);
    let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cart_item WHERE user_id = $1")
        .bind(c.user_id)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
    assert_eq!(left, 0);
}
