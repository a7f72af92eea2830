// src/routes/cart_routes.rs

use axum::{
    extract::{Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    checkout::{self, CartLine},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, OkResponse},
};

const MAX_CART_LINES: i64 = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cart", get(get_cart).delete(clear_cart))
        .route("/cart/items", post(add_items))
        .route("/cart/items/{cart_item_id}", delete(remove_item))
}

#[derive(Debug, Serialize)]
pub struct CartView {
    pub items: Vec<CartLine>,
    pub item_count: usize,
    pub subtotal_paise: i64,
    pub mrp_total_paise: i64,
    /// Lines whose product was deactivated after being added.
    pub unavailable_count: usize,
}

impl CartView {
    pub fn from_lines(items: Vec<CartLine>) -> Self {
        let active = items.iter().filter(|l| l.is_active);
        let mrp_total_paise = active.clone().map(|l| l.mrp_paise).sum();
        let unavailable_count = items.iter().filter(|l| !l.is_active).count();
        CartView {
            subtotal_paise: checkout::subtotal(&items),
            mrp_total_paise,
            item_count: items.len(),
            unavailable_count,
            items,
        }
    }
}

/// Drops lines whose patient was removed; they never show in the cart and
/// must not count towards its size.
pub async fn purge_orphaned_lines(conn: &mut PgConnection, user_id: Uuid) -> Result<u64, ApiError> {
    let res = sqlx::query(
        r#"
        DELETE FROM cart_item ci
        USING patient pt
        WHERE ci.patient_id = pt.patient_id
          AND ci.user_id = $1
          AND pt.deleted_at IS NOT NULL
        "#,
    )
    .bind(user_id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected())
}

async fn load_cart(state: &AppState, user_id: Uuid) -> Result<CartView, ApiError> {
    let mut conn = state.db.acquire().await?;
    let lines = checkout::cart_lines(&mut conn, user_id).await?;
    Ok(CartView::from_lines(lines))
}

pub async fn get_cart(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<CartView>>, ApiError> {
    Ok(Json(ApiOk::new(load_cart(&state, auth.user_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct AddItemsRequest {
    pub product_id: Uuid,
    pub patient_ids: Vec<Uuid>,
}

pub async fn add_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<AddItemsRequest>,
) -> Result<Json<ApiOk<CartView>>, ApiError> {
    if req.patient_ids.is_empty() {
        return Err(ApiError::validation("select at least one patient"));
    }

    let mut tx = state.db.begin().await?;

    let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM product WHERE product_id = $1")
        .bind(req.product_id)
        .fetch_optional(&mut *tx)
        .await?;
    match active {
        None => return Err(ApiError::not_found("product")),
        Some(false) => {
            return Err(ApiError::Conflict(
                "PRODUCT_UNAVAILABLE",
                "product is not available".into(),
            ))
        }
        Some(true) => {}
    }

    let owned: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM patient
        WHERE patient_id = ANY($1) AND user_id = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(&req.patient_ids)
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await?;
    let mut distinct = req.patient_ids.clone();
    distinct.sort();
    distinct.dedup();
    if owned != distinct.len() as i64 {
        return Err(ApiError::not_found("patient"));
    }

    purge_orphaned_lines(&mut tx, auth.user_id).await?;
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cart_item WHERE user_id = $1")
        .bind(auth.user_id)
        .fetch_one(&mut *tx)
        .await?;
    if existing + distinct.len() as i64 > MAX_CART_LINES {
        return Err(ApiError::validation(format!(
            "cart cannot hold more than {MAX_CART_LINES} tests"
        )));
    }

    for patient_id in &distinct {
        sqlx::query(
            r#"
            INSERT INTO cart_item (user_id, product_id, patient_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, product_id, patient_id) DO NOTHING
            "#,
        )
        .bind(auth.user_id)
        .bind(req.product_id)
        .bind(patient_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    Ok(Json(ApiOk::new(load_cart(&state, auth.user_id).await?)))
}

pub async fn remove_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(cart_item_id): Path<Uuid>,
) -> Result<Json<ApiOk<CartView>>, ApiError> {
    let res = sqlx::query("DELETE FROM cart_item WHERE cart_item_id = $1 AND user_id = $2")
        .bind(cart_item_id)
        .bind(auth.user_id)
        .execute(&state.db)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("cart item"));
    }
    Ok(Json(ApiOk::new(load_cart(&state, auth.user_id).await?)))
}

pub async fn clear_cart(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<OkResponse>, ApiError> {
    sqlx::query("DELETE FROM cart_item WHERE user_id = $1")
        .bind(auth.user_id)
        .execute(&state.db)
        .await?;
    Ok(Json(OkResponse::ok()))
}
