// src/routes/catalog_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{ApiOk, AppState},
    pagination::{PageQuery, Paged},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/categories", get(list_categories))
        .route("/products", get(search_products))
        .route("/products/{slug}", get(get_product))
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CategoryRow {
    pub category_id: Uuid,
    pub name: String,
    pub slug: String,
    pub sort_order: i32,
    pub is_active: bool,
}

pub const PRODUCT_COLUMNS: &str = "p.product_id, p.partner_code, p.name, p.slug, p.product_type, \
     p.category_id, c.name AS category_name, p.description, p.sample_type, p.fasting_required, \
     p.report_tat_hours, p.mrp_paise, p.price_paise, p.is_active, p.is_popular, \
     p.created_at, p.updated_at";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProductRow {
    pub product_id: Uuid,
    pub partner_code: String,
    pub name: String,
    pub slug: String,
    pub product_type: i16,
    pub category_id: Option<Uuid>,
    pub category_name: Option<String>,
    pub description: Option<String>,
    pub sample_type: Option<String>,
    pub fasting_required: bool,
    pub report_tat_hours: Option<i32>,
    pub mrp_paise: i64,
    pub price_paise: i64,
    pub is_active: bool,
    pub is_popular: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn list_categories(
    State(state): State<AppState>,
) -> Result<Json<ApiOk<Vec<CategoryRow>>>, ApiError> {
    let rows = sqlx::query_as::<_, CategoryRow>(
        r#"
        SELECT category_id, name, slug, sort_order, is_active
        FROM category
        WHERE is_active = true
        ORDER BY sort_order ASC, name ASC
        "#,
    )
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiOk::new(rows)))
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductSort {
    #[default]
    Popular,
    PriceAsc,
    PriceDesc,
    Name,
}

impl ProductSort {
    fn order_by(self) -> &'static str {
        match self {
            ProductSort::Popular => " ORDER BY p.is_popular DESC, p.name ASC",
            ProductSort::PriceAsc => " ORDER BY p.price_paise ASC, p.name ASC",
            ProductSort::PriceDesc => " ORDER BY p.price_paise DESC, p.name ASC",
            ProductSort::Name => " ORDER BY p.name ASC",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProductSearchQuery {
    pub q: Option<String>,
    /// category slug
    pub category: Option<String>,
    pub product_type: Option<i16>,
    pub popular: Option<bool>,
    #[serde(default)]
    pub sort: ProductSort,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// Appends WHERE clauses shared by the count and page queries.
/// `include_inactive` is for the manager console.
pub fn push_product_filters(
    qb: &mut QueryBuilder<'_, Postgres>,
    q: &ProductSearchQuery,
    include_inactive: bool,
) {
    qb.push(" WHERE 1=1");
    if !include_inactive {
        qb.push(" AND p.is_active = true");
    }
    if let Some(term) = q.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let like = format!("%{term}%");
        qb.push(" AND (p.name ILIKE ")
            .push_bind(like.clone())
            .push(" OR p.partner_code ILIKE ")
            .push_bind(like)
            .push(")");
    }
    if let Some(cat) = q.category.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND c.slug = ").push_bind(cat.to_string());
    }
    if let Some(t) = q.product_type {
        qb.push(" AND p.product_type = ").push_bind(t);
    }
    if q.popular == Some(true) {
        qb.push(" AND p.is_popular = true");
    }
}

pub async fn query_products(
    state: &AppState,
    q: &ProductSearchQuery,
    include_inactive: bool,
) -> Result<Paged<ProductRow>, ApiError> {
    let page = PageQuery {
        page: q.page,
        per_page: q.per_page,
    };

    let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT COUNT(*) FROM product p LEFT JOIN category c ON c.category_id = p.category_id",
    );
    push_product_filters(&mut count_qb, q, include_inactive);
    let total: i64 = count_qb.build_query_scalar().fetch_one(&state.db).await?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "SELECT {PRODUCT_COLUMNS} FROM product p LEFT JOIN category c ON c.category_id = p.category_id"
    ));
    push_product_filters(&mut qb, q, include_inactive);
    qb.push(q.sort.order_by());
    qb.push(" LIMIT ").push_bind(page.limit());
    qb.push(" OFFSET ").push_bind(page.offset());

    let rows = qb
        .build_query_as::<ProductRow>()
        .fetch_all(&state.db)
        .await?;

    Ok(Paged::new(rows, &page, total))
}

pub async fn search_products(
    State(state): State<AppState>,
    Query(q): Query<ProductSearchQuery>,
) -> Result<Json<ApiOk<Paged<ProductRow>>>, ApiError> {
    Ok(Json(ApiOk::new(query_products(&state, &q, false).await?)))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<ApiOk<ProductRow>>, ApiError> {
    let sql = format!(
        r#"
        SELECT {PRODUCT_COLUMNS}
        FROM product p
        LEFT JOIN category c ON c.category_id = p.category_id
        WHERE p.slug = $1 AND p.is_active = true
        "#
    );
    let row = sqlx::query_as::<_, ProductRow>(&sql)
        .bind(slug.trim())
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("product"))?;
    Ok(Json(ApiOk::new(row)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_render_in_order() {
        let q = ProductSearchQuery {
            q: Some(" thyroid ".into()),
            category: Some("hormones".into()),
            product_type: Some(0),
            popular: Some(true),
            ..Default::default()
        };
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT 1 FROM product p");
        push_product_filters(&mut qb, &q, false);
        assert_eq!(
            qb.sql(),
            "SELECT 1 FROM product p WHERE 1=1 AND p.is_active = true \
             AND (p.name ILIKE $1 OR p.partner_code ILIKE $2) AND c.slug = $3 \
             AND p.product_type = $4 AND p.is_popular = true"
        );
    }

    #[test]
    fn manager_view_skips_active_filter() {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT 1 FROM product p");
        push_product_filters(&mut qb, &ProductSearchQuery::default(), true);
        assert_eq!(qb.sql(), "SELECT 1 FROM product p WHERE 1=1");
    }

    #[test]
    fn sort_defaults_to_popular() {
        assert_eq!(ProductSort::default(), ProductSort::Popular);
        assert!(ProductSort::PriceAsc.order_by().contains("price_paise ASC"));
    }
}
