// src/routes/order_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    checkout::{ORDER_COLUMNS, OrderRow},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    pagination::{PageQuery, Paged},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/{order_id}", get(get_order))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct OrderSummaryRow {
    pub order_id: Uuid,
    pub status: crate::order_state::OrderStatus,
    pub payable_paise: i64,
    pub subtotal_paise: i64,
    pub item_count: i64,
    pub slot_start: DateTime<Utc>,
    pub partner_booking_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const ORDER_SUMMARY_SELECT: &str = r#"
    SELECT o.order_id, o.status, o.payable_paise, o.subtotal_paise,
           (SELECT COUNT(*) FROM order_item oi WHERE oi.order_id = o.order_id) AS item_count,
           sl.slot_start, o.partner_booking_id, o.created_at
    FROM booking_order o
    JOIN slot_lock sl ON sl.slot_lock_id = o.slot_lock_id
"#;

pub async fn list_orders(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiOk<Paged<OrderSummaryRow>>>, ApiError> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM booking_order WHERE user_id = $1")
        .bind(auth.user_id)
        .fetch_one(&state.db)
        .await?;

    let sql = format!(
        "{ORDER_SUMMARY_SELECT} WHERE o.user_id = $1 ORDER BY o.created_at DESC LIMIT $2 OFFSET $3"
    );
    let items = sqlx::query_as::<_, OrderSummaryRow>(&sql)
        .bind(auth.user_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&state.db)
        .await?;

    Ok(Json(ApiOk::new(Paged::new(items, &page, total))))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct OrderItemView {
    pub order_item_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub partner_code: String,
    pub price_paise: i64,
    pub patient_id: Uuid,
    pub patient_name: String,
    pub patient_gender: i16,
    pub patient_dob: NaiveDate,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct OrderSlotView {
    pub partner_slot_id: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub label: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub pincode: String,
}

#[derive(Debug, Serialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: OrderRow,
    pub promo_code: Option<String>,
    pub slot: OrderSlotView,
    pub items: Vec<OrderItemView>,
}

/// Full order view. `owner` restricts to one customer; consoles pass None.
pub async fn order_detail(
    state: &AppState,
    order_id: Uuid,
    owner: Option<Uuid>,
) -> Result<OrderDetail, ApiError> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM booking_order WHERE order_id = $1");
    let order = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(order_id)
        .fetch_optional(&state.db)
        .await?
        .filter(|o| owner.is_none_or(|u| u == o.user_id))
        .ok_or_else(|| ApiError::not_found("order"))?;

    let promo_code: Option<String> = match order.promo_id {
        Some(pid) => sqlx::query_scalar("SELECT code FROM promo_code WHERE promo_id = $1")
            .bind(pid)
            .fetch_optional(&state.db)
            .await?,
        None => None,
    };

    let slot = sqlx::query_as::<_, OrderSlotView>(
        r#"
        SELECT sl.partner_slot_id, sl.slot_start, sl.slot_end,
               a.label, a.line1, a.line2, a.city, a.state, a.pincode
        FROM slot_lock sl
        JOIN address a ON a.address_id = $2
        WHERE sl.slot_lock_id = $1
        "#,
    )
    .bind(order.slot_lock_id)
    .bind(order.address_id)
    .fetch_one(&state.db)
    .await?;

    let items = sqlx::query_as::<_, OrderItemView>(
        r#"
        SELECT oi.order_item_id, oi.product_id, oi.product_name, oi.partner_code, oi.price_paise,
               pt.patient_id, pt.full_name AS patient_name,
               pt.gender AS patient_gender, pt.date_of_birth AS patient_dob
        FROM order_item oi
        JOIN patient pt ON pt.patient_id = oi.patient_id
        WHERE oi.order_id = $1
        ORDER BY pt.full_name, oi.product_name
        "#,
    )
    .bind(order_id)
    .fetch_all(&state.db)
    .await?;

    Ok(OrderDetail {
        order,
        promo_code,
        slot,
        items,
    })
}

pub async fn get_order(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiOk<OrderDetail>>, ApiError> {
    Ok(Json(ApiOk::new(
        order_detail(&state, order_id, Some(auth.user_id)).await?,
    )))
}
