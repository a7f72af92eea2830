// src/routes/manager_routes.rs
//
// Manager console: catalog, promos, orders and stats. Every mutation writes
// an audit entry in the same transaction.

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    audit,
    checkout::{PROMO_COLUMNS, PromoRow},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    order_state::OrderStatus,
    pagination::{PageQuery, Paged},
    partner::PartnerProduct,
    pricing::DiscountType,
    routes::{
        catalog_routes::{CategoryRow, PRODUCT_COLUMNS, ProductRow, ProductSearchQuery, query_products},
        order_routes::{ORDER_SUMMARY_SELECT, OrderDetail, OrderSummaryRow, order_detail},
    },
    validation::{double_option, required, slugify},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/products", get(list_products).post(create_product))
        .route("/products/{product_id}", patch(update_product))
        .route("/products/{product_id}/activate", post(activate_product))
        .route("/products/{product_id}/deactivate", post(deactivate_product))
        .route("/categories", get(list_categories).post(create_category))
        .route("/categories/{category_id}", patch(update_category))
        .route("/promos", get(list_promos).post(create_promo))
        .route("/promos/{promo_id}", patch(update_promo))
        .route("/promos/{promo_id}/deactivate", post(deactivate_promo))
        .route("/catalog/sync", post(sync_catalog))
        .route("/orders", get(list_orders))
        .route("/orders/{order_id}", get(get_order))
        .route("/stats", get(stats))
}

/* -------------------------
   Products
--------------------------*/

/// Selling price must be positive and not above MRP.
pub fn validate_pricing(price_paise: i64, mrp_paise: i64) -> Result<(), ApiError> {
    if price_paise <= 0 || mrp_paise <= 0 {
        return Err(ApiError::validation("price and mrp must be positive"));
    }
    if price_paise > mrp_paise {
        return Err(ApiError::validation("price cannot exceed mrp"));
    }
    Ok(())
}

fn validate_product_type(t: i16) -> Result<(), ApiError> {
    if matches!(t, 0 | 1) {
        Ok(())
    } else {
        Err(ApiError::validation("product_type must be 0 (test) or 1 (package)"))
    }
}

async fn load_product(conn: &mut PgConnection, product_id: Uuid) -> Result<ProductRow, ApiError> {
    let sql = format!(
        r#"
        SELECT {PRODUCT_COLUMNS}
        FROM product p
        LEFT JOIN category c ON c.category_id = p.category_id
        WHERE p.product_id = $1
        "#
    );
    sqlx::query_as::<_, ProductRow>(&sql)
        .bind(product_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| ApiError::not_found("product"))
}

async fn ensure_category(conn: &mut PgConnection, category_id: Option<Uuid>) -> Result<(), ApiError> {
    let Some(id) = category_id else {
        return Ok(());
    };
    let found: Option<Uuid> = sqlx::query_scalar("SELECT category_id FROM category WHERE category_id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    found.map(|_| ()).ok_or_else(|| ApiError::not_found("category"))
}

pub async fn list_products(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ProductSearchQuery>,
) -> Result<Json<ApiOk<Paged<ProductRow>>>, ApiError> {
    auth.ensure_manager()?;
    Ok(Json(ApiOk::new(query_products(&state, &q, true).await?)))
}

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    pub partner_code: String,
    pub name: String,
    pub slug: Option<String>,
    #[serde(default)]
    pub product_type: i16,
    pub category_id: Option<Uuid>,
    pub description: Option<String>,
    pub sample_type: Option<String>,
    #[serde(default)]
    pub fasting_required: bool,
    pub report_tat_hours: Option<i32>,
    pub mrp_paise: i64,
    pub price_paise: i64,
    #[serde(default)]
    pub is_popular: bool,
}

pub async fn create_product(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateProductRequest>,
) -> Result<Json<ApiOk<ProductRow>>, ApiError> {
    auth.ensure_manager()?;
    let partner_code = required(&req.partner_code, "partner_code")?.to_ascii_uppercase();
    let name = required(&req.name, "name")?;
    let slug = slugify(req.slug.as_deref().unwrap_or(name));
    if slug.is_empty() {
        return Err(ApiError::validation("slug is empty"));
    }
    validate_product_type(req.product_type)?;
    validate_pricing(req.price_paise, req.mrp_paise)?;

    let mut tx = state.db.begin().await?;
    ensure_category(&mut tx, req.category_id).await?;

    let product_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO product
            (partner_code, name, slug, product_type, category_id, description, sample_type,
             fasting_required, report_tat_hours, mrp_paise, price_paise, is_popular)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING product_id
        "#,
    )
    .bind(&partner_code)
    .bind(name)
    .bind(&slug)
    .bind(req.product_type)
    .bind(req.category_id)
    .bind(req.description.as_deref())
    .bind(req.sample_type.as_deref())
    .bind(req.fasting_required)
    .bind(req.report_tat_hours)
    .bind(req.mrp_paise)
    .bind(req.price_paise)
    .bind(req.is_popular)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| ApiError::unique_or_db(e, "PRODUCT_EXISTS", "partner_code or slug already exists"))?;

    audit::record(
        &mut tx,
        Some(auth.user_id),
        "product.create",
        "product",
        Some(product_id.to_string()),
        json!({ "partner_code": partner_code, "price_paise": req.price_paise, "mrp_paise": req.mrp_paise }),
    )
    .await?;

    let row = load_product(&mut tx, product_id).await?;
    tx.commit().await?;
    tracing::info!(%product_id, "product created");
    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProductRequest {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub product_type: Option<i16>,
    #[serde(default, deserialize_with = "double_option")]
    pub category_id: Option<Option<Uuid>>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub sample_type: Option<Option<String>>,
    pub fasting_required: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub report_tat_hours: Option<Option<i32>>,
    pub mrp_paise: Option<i64>,
    pub price_paise: Option<i64>,
    pub is_popular: Option<bool>,
}

pub async fn update_product(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(product_id): Path<Uuid>,
    Json(req): Json<UpdateProductRequest>,
) -> Result<Json<ApiOk<ProductRow>>, ApiError> {
    auth.ensure_manager()?;
    let mut tx = state.db.begin().await?;
    let sql = format!(
        "SELECT {PRODUCT_COLUMNS} FROM product p LEFT JOIN category c ON c.category_id = p.category_id \
         WHERE p.product_id = $1 FOR UPDATE OF p"
    );
    let cur = sqlx::query_as::<_, ProductRow>(&sql)
        .bind(product_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::not_found("product"))?;

    let name = match req.name.as_deref() {
        Some(n) => required(n, "name")?.to_string(),
        None => cur.name.clone(),
    };
    let slug = match req.slug.as_deref() {
        Some(s) => {
            let s = slugify(s);
            if s.is_empty() {
                return Err(ApiError::validation("slug is empty"));
            }
            s
        }
        None => cur.slug.clone(),
    };
    let product_type = req.product_type.unwrap_or(cur.product_type);
    validate_product_type(product_type)?;
    let category_id = req.category_id.unwrap_or(cur.category_id);
    ensure_category(&mut tx, category_id).await?;
    let mrp = req.mrp_paise.unwrap_or(cur.mrp_paise);
    let price = req.price_paise.unwrap_or(cur.price_paise);
    if req.mrp_paise.is_some() || req.price_paise.is_some() || cur.is_active {
        validate_pricing(price, mrp)?;
    }

    sqlx::query(
        r#"
        UPDATE product SET
            name = $2, slug = $3, product_type = $4, category_id = $5,
            description = $6, sample_type = $7, fasting_required = $8,
            report_tat_hours = $9, mrp_paise = $10, price_paise = $11,
            is_popular = $12, updated_at = now()
        WHERE product_id = $1
        "#,
    )
    .bind(product_id)
    .bind(&name)
    .bind(&slug)
    .bind(product_type)
    .bind(category_id)
    .bind(req.description.clone().unwrap_or(cur.description.clone()))
    .bind(req.sample_type.clone().unwrap_or(cur.sample_type.clone()))
    .bind(req.fasting_required.unwrap_or(cur.fasting_required))
    .bind(req.report_tat_hours.unwrap_or(cur.report_tat_hours))
    .bind(mrp)
    .bind(price)
    .bind(req.is_popular.unwrap_or(cur.is_popular))
    .execute(&mut *tx)
    .await
    .map_err(|e| ApiError::unique_or_db(e, "PRODUCT_EXISTS", "slug already exists"))?;

    audit::record(
        &mut tx,
        Some(auth.user_id),
        "product.update",
        "product",
        Some(product_id.to_string()),
        json!({
            "before": { "price_paise": cur.price_paise, "mrp_paise": cur.mrp_paise, "name": cur.name },
            "after": { "price_paise": price, "mrp_paise": mrp, "name": name },
        }),
    )
    .await?;

    let row = load_product(&mut tx, product_id).await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(row)))
}

async fn set_product_active(
    state: &AppState,
    auth: &AuthContext,
    product_id: Uuid,
    active: bool,
) -> Result<ProductRow, ApiError> {
    auth.ensure_manager()?;
    let mut tx = state.db.begin().await?;
    let cur = load_product(&mut tx, product_id).await?;
    if active {
        validate_pricing(cur.price_paise, cur.mrp_paise)?;
    }
    sqlx::query("UPDATE product SET is_active = $2, updated_at = now() WHERE product_id = $1")
        .bind(product_id)
        .bind(active)
        .execute(&mut *tx)
        .await?;
    audit::record(
        &mut tx,
        Some(auth.user_id),
        if active { "product.activate" } else { "product.deactivate" },
        "product",
        Some(product_id.to_string()),
        json!({ "was_active": cur.is_active }),
    )
    .await?;
    let row = load_product(&mut tx, product_id).await?;
    tx.commit().await?;
    Ok(row)
}

pub async fn activate_product(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ApiOk<ProductRow>>, ApiError> {
    Ok(Json(ApiOk::new(set_product_active(&state, &auth, product_id, true).await?)))
}

pub async fn deactivate_product(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ApiOk<ProductRow>>, ApiError> {
    Ok(Json(ApiOk::new(set_product_active(&state, &auth, product_id, false).await?)))
}

/* -------------------------
   Categories
--------------------------*/

const CATEGORY_COLUMNS: &str = "category_id, name, slug, sort_order, is_active";

pub async fn list_categories(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<CategoryRow>>>, ApiError> {
    auth.ensure_manager()?;
    let sql = format!("SELECT {CATEGORY_COLUMNS} FROM category ORDER BY sort_order ASC, name ASC");
    let rows = sqlx::query_as::<_, CategoryRow>(&sql)
        .fetch_all(&state.db)
        .await?;
    Ok(Json(ApiOk::new(rows)))
}

#[derive(Debug, Deserialize)]
pub struct CreateCategoryRequest {
    pub name: String,
    pub slug: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
}

pub async fn create_category(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateCategoryRequest>,
) -> Result<Json<ApiOk<CategoryRow>>, ApiError> {
    auth.ensure_manager()?;
    let name = required(&req.name, "name")?;
    let slug = slugify(req.slug.as_deref().unwrap_or(name));
    if slug.is_empty() {
        return Err(ApiError::validation("slug is empty"));
    }

    let mut tx = state.db.begin().await?;
    let sql = format!(
        "INSERT INTO category (name, slug, sort_order) VALUES ($1, $2, $3) RETURNING {CATEGORY_COLUMNS}"
    );
    let row = sqlx::query_as::<_, CategoryRow>(&sql)
        .bind(name)
        .bind(&slug)
        .bind(req.sort_order)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ApiError::unique_or_db(e, "CATEGORY_EXISTS", "category slug already exists"))?;
    audit::record(
        &mut tx,
        Some(auth.user_id),
        "category.create",
        "category",
        Some(row.category_id.to_string()),
        json!({ "name": row.name, "slug": row.slug }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateCategoryRequest {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub sort_order: Option<i32>,
    pub is_active: Option<bool>,
}

pub async fn update_category(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(category_id): Path<Uuid>,
    Json(req): Json<UpdateCategoryRequest>,
) -> Result<Json<ApiOk<CategoryRow>>, ApiError> {
    auth.ensure_manager()?;
    let name = match req.name.as_deref() {
        Some(n) => Some(required(n, "name")?.to_string()),
        None => None,
    };
    let slug = match req.slug.as_deref().map(slugify) {
        Some(s) if s.is_empty() => return Err(ApiError::validation("slug is empty")),
        other => other,
    };

    let mut tx = state.db.begin().await?;
    let sql = format!(
        r#"
        UPDATE category SET
            name = COALESCE($2, name),
            slug = COALESCE($3, slug),
            sort_order = COALESCE($4, sort_order),
            is_active = COALESCE($5, is_active)
        WHERE category_id = $1
        RETURNING {CATEGORY_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, CategoryRow>(&sql)
        .bind(category_id)
        .bind(name)
        .bind(slug)
        .bind(req.sort_order)
        .bind(req.is_active)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ApiError::unique_or_db(e, "CATEGORY_EXISTS", "category slug already exists"))?
        .ok_or_else(|| ApiError::not_found("category"))?;
    audit::record(
        &mut tx,
        Some(auth.user_id),
        "category.update",
        "category",
        Some(category_id.to_string()),
        json!({ "name": row.name, "slug": row.slug, "is_active": row.is_active }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(row)))
}

/* -------------------------
   Promos
--------------------------*/

#[derive(Debug, Clone, Deserialize)]
pub struct PromoInput {
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub max_discount_paise: Option<i64>,
    #[serde(default)]
    pub min_order_paise: i64,
    pub usage_limit: Option<i32>,
    pub per_user_limit: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PromoInput {
    fn from_row(r: &PromoRow) -> Self {
        PromoInput {
            code: r.code.clone(),
            description: r.description.clone(),
            discount_type: r.discount_type,
            discount_value: r.discount_value,
            max_discount_paise: r.max_discount_paise,
            min_order_paise: r.min_order_paise,
            usage_limit: r.usage_limit,
            per_user_limit: r.per_user_limit,
            starts_at: r.starts_at,
            expires_at: r.expires_at,
        }
    }

    /// Normalizes the code to upper case and checks every rule.
    pub fn validate(mut self) -> Result<Self, ApiError> {
        self.code = self.code.trim().to_ascii_uppercase();
        let len_ok = (3..=20).contains(&self.code.len());
        if !len_ok || !self.code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ApiError::validation("code must be 3-20 letters or digits"));
        }
        if self.discount_value <= 0 {
            return Err(ApiError::validation("discount_value must be positive"));
        }
        if self.discount_type == DiscountType::Percentage && self.discount_value > 100 {
            return Err(ApiError::validation("percentage discount cannot exceed 100"));
        }
        if self.max_discount_paise.is_some_and(|m| m <= 0) {
            return Err(ApiError::validation("max_discount_paise must be positive"));
        }
        if self.min_order_paise < 0 {
            return Err(ApiError::validation("min_order_paise cannot be negative"));
        }
        if self.usage_limit.is_some_and(|l| l <= 0) || self.per_user_limit.is_some_and(|l| l <= 0) {
            return Err(ApiError::validation("usage limits must be positive"));
        }
        if let (Some(s), Some(e)) = (self.starts_at, self.expires_at) {
            if s >= e {
                return Err(ApiError::validation("starts_at must be before expires_at"));
            }
        }
        Ok(self)
    }
}

async fn load_promo(conn: &mut PgConnection, promo_id: Uuid, for_update: bool) -> Result<PromoRow, ApiError> {
    let sql = format!(
        "SELECT {PROMO_COLUMNS} FROM promo_code WHERE promo_id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, PromoRow>(&sql)
        .bind(promo_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| ApiError::not_found("promo"))
}

#[derive(Debug, Default, Deserialize)]
pub struct PromoListQuery {
    pub active: Option<bool>,
    pub q: Option<String>,
}

pub async fn list_promos(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(filter): Query<PromoListQuery>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiOk<Paged<PromoRow>>>, ApiError> {
    auth.ensure_manager()?;

    fn filters(qb: &mut QueryBuilder<'_, Postgres>, f: &PromoListQuery) {
        qb.push(" WHERE 1=1");
        if let Some(active) = f.active {
            qb.push(" AND is_active = ").push_bind(active);
        }
        if let Some(term) = f.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            qb.push(" AND code ILIKE ").push_bind(format!("%{term}%"));
        }
    }

    let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM promo_code");
    filters(&mut count_qb, &filter);
    let total: i64 = count_qb.build_query_scalar().fetch_one(&state.db).await?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT {PROMO_COLUMNS} FROM promo_code"));
    filters(&mut qb, &filter);
    qb.push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(page.limit())
        .push(" OFFSET ")
        .push_bind(page.offset());
    let items = qb.build_query_as::<PromoRow>().fetch_all(&state.db).await?;

    Ok(Json(ApiOk::new(Paged::new(items, &page, total))))
}

pub async fn create_promo(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(input): Json<PromoInput>,
) -> Result<Json<ApiOk<PromoRow>>, ApiError> {
    auth.ensure_manager()?;
    let p = input.validate()?;

    let mut tx = state.db.begin().await?;
    let sql = format!(
        r#"
        INSERT INTO promo_code
            (code, description, discount_type, discount_value, max_discount_paise, min_order_paise,
             usage_limit, per_user_limit, starts_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {PROMO_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, PromoRow>(&sql)
        .bind(&p.code)
        .bind(p.description.trim())
        .bind(p.discount_type)
        .bind(p.discount_value)
        .bind(p.max_discount_paise)
        .bind(p.min_order_paise)
        .bind(p.usage_limit)
        .bind(p.per_user_limit)
        .bind(p.starts_at)
        .bind(p.expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ApiError::unique_or_db(e, "PROMO_EXISTS", "promo code already exists"))?;

    audit::record(
        &mut tx,
        Some(auth.user_id),
        "promo.create",
        "promo_code",
        Some(row.promo_id.to_string()),
        json!({ "code": row.code, "discount_type": row.discount_type, "discount_value": row.discount_value }),
    )
    .await?;
    tx.commit().await?;
    tracing::info!(code = %row.code, "promo created");
    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePromoRequest {
    pub description: Option<String>,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Option<i64>,
    #[serde(default, deserialize_with = "double_option")]
    pub max_discount_paise: Option<Option<i64>>,
    pub min_order_paise: Option<i64>,
    #[serde(default, deserialize_with = "double_option")]
    pub usage_limit: Option<Option<i32>>,
    #[serde(default, deserialize_with = "double_option")]
    pub per_user_limit: Option<Option<i32>>,
    #[serde(default, deserialize_with = "double_option")]
    pub starts_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "double_option")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub is_active: Option<bool>,
}

impl UpdatePromoRequest {
    fn merge(&self, mut base: PromoInput) -> PromoInput {
        if let Some(d) = &self.description {
            base.description = d.trim().to_string();
        }
        if let Some(t) = self.discount_type {
            base.discount_type = t;
        }
        if let Some(v) = self.discount_value {
            base.discount_value = v;
        }
        if let Some(v) = self.max_discount_paise {
            base.max_discount_paise = v;
        }
        if let Some(v) = self.min_order_paise {
            base.min_order_paise = v;
        }
        if let Some(v) = self.usage_limit {
            base.usage_limit = v;
        }
        if let Some(v) = self.per_user_limit {
            base.per_user_limit = v;
        }
        if let Some(v) = self.starts_at {
            base.starts_at = v;
        }
        if let Some(v) = self.expires_at {
            base.expires_at = v;
        }
        base
    }
}

/// The code itself is immutable; redemptions reference it.
pub async fn update_promo(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(promo_id): Path<Uuid>,
    Json(req): Json<UpdatePromoRequest>,
) -> Result<Json<ApiOk<PromoRow>>, ApiError> {
    auth.ensure_manager()?;
    let mut tx = state.db.begin().await?;
    let cur = load_promo(&mut tx, promo_id, true).await?;
    let p = req.merge(PromoInput::from_row(&cur)).validate()?;

    let sql = format!(
        r#"
        UPDATE promo_code SET
            description = $2, discount_type = $3, discount_value = $4, max_discount_paise = $5,
            min_order_paise = $6, usage_limit = $7, per_user_limit = $8, starts_at = $9,
            expires_at = $10, is_active = $11, updated_at = now()
        WHERE promo_id = $1
        RETURNING {PROMO_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, PromoRow>(&sql)
        .bind(promo_id)
        .bind(&p.description)
        .bind(p.discount_type)
        .bind(p.discount_value)
        .bind(p.max_discount_paise)
        .bind(p.min_order_paise)
        .bind(p.usage_limit)
        .bind(p.per_user_limit)
        .bind(p.starts_at)
        .bind(p.expires_at)
        .bind(req.is_active.unwrap_or(cur.is_active))
        .fetch_one(&mut *tx)
        .await?;

    audit::record(
        &mut tx,
        Some(auth.user_id),
        "promo.update",
        "promo_code",
        Some(promo_id.to_string()),
        json!({
            "code": row.code,
            "before": { "discount_value": cur.discount_value, "is_active": cur.is_active },
            "after": { "discount_value": row.discount_value, "is_active": row.is_active },
        }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(row)))
}

pub async fn deactivate_promo(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(promo_id): Path<Uuid>,
) -> Result<Json<ApiOk<PromoRow>>, ApiError> {
    auth.ensure_manager()?;
    let mut tx = state.db.begin().await?;
    load_promo(&mut tx, promo_id, true).await?;
    let sql = format!(
        "UPDATE promo_code SET is_active = false, updated_at = now() WHERE promo_id = $1 RETURNING {PROMO_COLUMNS}"
    );
    let row = sqlx::query_as::<_, PromoRow>(&sql)
        .bind(promo_id)
        .fetch_one(&mut *tx)
        .await?;
    audit::record(
        &mut tx,
        Some(auth.user_id),
        "promo.deactivate",
        "promo_code",
        Some(promo_id.to_string()),
        json!({ "code": row.code }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(row)))
}

/* -------------------------
   Catalog sync
--------------------------*/

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct SyncReport {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

fn usable(p: &PartnerProduct) -> bool {
    !p.partner_code.trim().is_empty()
        && !p.name.trim().is_empty()
        && p.mrp_paise > 0
        && matches!(p.product_type, 0 | 1)
}

/// Slug for a newly synced product; `taken` means the plain name slug
/// already belongs to another product.
pub fn synced_slug(name: &str, partner_code: &str, taken: bool) -> String {
    let base = slugify(name);
    if taken || base.is_empty() {
        slugify(&format!("{name} {partner_code}"))
    } else {
        base
    }
}

/// Upserts partner products by `partner_code`. New products arrive
/// inactive at MRP; existing ones keep their price unless MRP drops below it.
pub async fn sync_catalog(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<SyncReport>>, ApiError> {
    auth.ensure_manager()?;
    let products = state.partner.fetch_catalog().await?;
    let mut report = SyncReport {
        fetched: products.len(),
        ..Default::default()
    };

    let mut tx = state.db.begin().await?;
    for p in &products {
        if !usable(p) {
            report.skipped += 1;
            continue;
        }
        let code = p.partner_code.trim().to_ascii_uppercase();

        let existing: Option<Uuid> = sqlx::query_scalar("SELECT product_id FROM product WHERE partner_code = $1")
            .bind(&code)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(product_id) = existing {
            sqlx::query(
                r#"
                UPDATE product SET
                    name = $2, product_type = $3, mrp_paise = $4,
                    price_paise = LEAST(price_paise, $4),
                    sample_type = $5, fasting_required = $6, report_tat_hours = $7,
                    updated_at = now()
                WHERE product_id = $1
                "#,
            )
            .bind(product_id)
            .bind(p.name.trim())
            .bind(p.product_type)
            .bind(p.mrp_paise)
            .bind(p.sample_type.as_deref())
            .bind(p.fasting_required)
            .bind(p.report_tat_hours)
            .execute(&mut *tx)
            .await?;
            report.updated += 1;
        } else {
            let plain = slugify(&p.name);
            let taken: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM product WHERE slug = $1)")
                .bind(&plain)
                .fetch_one(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO product
                    (partner_code, name, slug, product_type, sample_type, fasting_required,
                     report_tat_hours, mrp_paise, price_paise, is_active)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, false)
                "#,
            )
            .bind(&code)
            .bind(p.name.trim())
            .bind(synced_slug(&p.name, &code, taken))
            .bind(p.product_type)
            .bind(p.sample_type.as_deref())
            .bind(p.fasting_required)
            .bind(p.report_tat_hours)
            .bind(p.mrp_paise)
            .execute(&mut *tx)
            .await?;
            report.created += 1;
        }
    }

    audit::record(
        &mut tx,
        Some(auth.user_id),
        "catalog.sync",
        "product",
        None,
        json!(report),
    )
    .await?;
    tx.commit().await?;
    tracing::info!(
        fetched = report.fetched,
        created = report.created,
        updated = report.updated,
        skipped = report.skipped,
        "partner catalog synced"
    );
    Ok(Json(ApiOk::new(report)))
}

/* -------------------------
   Orders & stats
--------------------------*/

#[derive(Debug, Default, Deserialize)]
pub struct OrderListQuery {
    pub status: Option<OrderStatus>,
    pub user_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub fn push_order_filters(qb: &mut QueryBuilder<'_, Postgres>, f: &OrderListQuery) {
    qb.push(" WHERE 1=1");
    if let Some(s) = f.status {
        qb.push(" AND o.status = ").push_bind(s);
    }
    if let Some(u) = f.user_id {
        qb.push(" AND o.user_id = ").push_bind(u);
    }
    if let Some(from) = f.from {
        qb.push(" AND o.created_at >= ").push_bind(from);
    }
    if let Some(to) = f.to {
        qb.push(" AND o.created_at < ").push_bind(to);
    }
}

pub async fn list_orders(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(filter): Query<OrderListQuery>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiOk<Paged<OrderSummaryRow>>>, ApiError> {
    auth.ensure_manager()?;

    let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM booking_order o");
    push_order_filters(&mut count_qb, &filter);
    let total: i64 = count_qb.build_query_scalar().fetch_one(&state.db).await?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(ORDER_SUMMARY_SELECT);
    push_order_filters(&mut qb, &filter);
    qb.push(" ORDER BY o.created_at DESC LIMIT ")
        .push_bind(page.limit())
        .push(" OFFSET ")
        .push_bind(page.offset());
    let items = qb.build_query_as::<OrderSummaryRow>().fetch_all(&state.db).await?;

    Ok(Json(ApiOk::new(Paged::new(items, &page, total))))
}

pub async fn get_order(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiOk<OrderDetail>>, ApiError> {
    auth.ensure_manager()?;
    Ok(Json(ApiOk::new(order_detail(&state, order_id, None).await?)))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ManagerStats {
    pub orders_today: i64,
    pub confirmed_today: i64,
    pub revenue_30d_paise: i64,
    pub booking_failed_open: i64,
    pub active_products: i64,
    pub inactive_products: i64,
    pub active_promos: i64,
}

pub async fn stats(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<ManagerStats>>, ApiError> {
    auth.ensure_manager()?;
    let row = sqlx::query_as::<_, ManagerStats>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM booking_order WHERE created_at >= date_trunc('day', now())) AS orders_today,
            (SELECT COUNT(*) FROM booking_order
               WHERE status = $1 AND updated_at >= date_trunc('day', now())) AS confirmed_today,
            (SELECT COALESCE(SUM(payable_paise + wallet_paise), 0)::BIGINT FROM booking_order
               WHERE status = $1 AND created_at >= now() - interval '30 days') AS revenue_30d_paise,
            (SELECT COUNT(*) FROM booking_order WHERE status = $2) AS booking_failed_open,
            (SELECT COUNT(*) FROM product WHERE is_active) AS active_products,
            (SELECT COUNT(*) FROM product WHERE NOT is_active) AS inactive_products,
            (SELECT COUNT(*) FROM promo_code
               WHERE is_active AND (expires_at IS NULL OR expires_at > now())) AS active_promos
        "#,
    )
    .bind(OrderStatus::Confirmed)
    .bind(OrderStatus::BookingFailed)
    .fetch_one(&state.db)
    .await?;
    Ok(Json(ApiOk::new(row)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn promo_input() -> PromoInput {
        PromoInput {
            code: " save10 ".into(),
            description: String::new(),
            discount_type: DiscountType::Percentage,
            discount_value: 10,
            max_discount_paise: None,
            min_order_paise: 0,
            usage_limit: None,
            per_user_limit: None,
            starts_at: None,
            expires_at: None,
        }
    }

    #[test]
    fn pricing_rules() {
        assert!(validate_pricing(500, 900).is_ok());
        assert!(validate_pricing(900, 900).is_ok());
        assert!(validate_pricing(901, 900).is_err());
        assert!(validate_pricing(0, 900).is_err());
    }

    #[test]
    fn promo_code_is_normalized() {
        assert_eq!(promo_input().validate().unwrap().code, "SAVE10");
    }

    #[test]
    fn promo_rules_are_checked() {
        let mut p = promo_input();
        p.discount_value = 101;
        assert!(p.validate().is_err());

        let mut p = promo_input();
        p.code = "NO SPACES".into();
        assert!(p.validate().is_err());

        let mut p = promo_input();
        let now = Utc::now();
        p.starts_at = Some(now);
        p.expires_at = Some(now);
        assert!(p.validate().is_err());

        let mut p = promo_input();
        p.discount_type = DiscountType::Flat;
        p.discount_value = 50_000;
        p.per_user_limit = Some(0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn patch_merge_can_clear_caps() {
        let mut base = promo_input();
        base.max_discount_paise = Some(10_000);
        let req: UpdatePromoRequest =
            serde_json::from_str(r#"{"max_discount_paise": null, "discount_value": 15}"#).unwrap();
        let merged = req.merge(base);
        assert_eq!(merged.max_discount_paise, None);
        assert_eq!(merged.discount_value, 15);
    }

    #[test]
    fn synced_slug_disambiguates() {
        assert_eq!(synced_slug("Lipid Profile", "HX-LIPID", false), "lipid-profile");
        assert_eq!(synced_slug("Lipid Profile", "HX-LIPID", true), "lipid-profile-hx-lipid");
        assert_eq!(synced_slug("***", "HX-9", false), "hx-9");
    }

    #[test]
    fn unusable_partner_rows_are_skipped() {
        let p = PartnerProduct {
            partner_code: "X1".into(),
            name: "Test".into(),
            product_type: 0,
            mrp_paise: 0,
            sample_type: None,
            fasting_required: false,
            report_tat_hours: None,
        };
        assert!(!usable(&p));
    }

    #[test]
    fn order_filters_bind_in_order() {
        let f = OrderListQuery {
            status: Some(OrderStatus::Paid),
            user_id: Some(Uuid::nil()),
            ..Default::default()
        };
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT 1 FROM booking_order o");
        push_order_filters(&mut qb, &f);
        assert_eq!(
            qb.sql(),
            "SELECT 1 FROM booking_order o WHERE 1=1 AND o.status = $1 AND o.user_id = $2"
        );
    }
}
