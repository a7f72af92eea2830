// src/routes/promo_routes.rs

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    checkout::{self, PROMO_COLUMNS, PromoRow},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    pricing::{DiscountType, evaluate_promo},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/promos", get(list_promos))
        .route("/promos/validate", post(validate_promo))
}

#[derive(Debug, Serialize)]
pub struct PromoOffer {
    pub code: String,
    pub description: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub max_discount_paise: Option<i64>,
    pub min_order_paise: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub eligible: bool,
    /// Discount on the current cart when eligible.
    pub discount_paise: i64,
    /// Machine code of the rejection when not eligible.
    pub reason: Option<&'static str>,
}

fn offer(promo: PromoRow, subtotal: i64, redemptions: i64, now: DateTime<Utc>) -> PromoOffer {
    let outcome = evaluate_promo(&promo.rule(), subtotal, redemptions, now);
    let (eligible, discount_paise, reason) = match outcome {
        Ok(d) => (true, d, None),
        Err(r) => (false, 0, Some(r.code())),
    };
    PromoOffer {
        code: promo.code,
        description: promo.description,
        discount_type: promo.discount_type,
        discount_value: promo.discount_value,
        max_discount_paise: promo.max_discount_paise,
        min_order_paise: promo.min_order_paise,
        expires_at: promo.expires_at,
        eligible,
        discount_paise,
        reason,
    }
}

/// Live promos annotated against the caller's cart.
pub async fn list_promos(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<PromoOffer>>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    let lines = checkout::cart_lines(&mut conn, auth.user_id).await?;
    let subtotal = checkout::subtotal(&lines);

    let sql = format!(
        r#"
        SELECT {PROMO_COLUMNS}
        FROM promo_code
        WHERE is_active = true
          AND (starts_at IS NULL OR starts_at <= now())
          AND (expires_at IS NULL OR expires_at > now())
        ORDER BY created_at DESC
        "#
    );
    let promos = sqlx::query_as::<_, PromoRow>(&sql)
        .fetch_all(&mut *conn)
        .await?;

    let now = Utc::now();
    let mut offers = Vec::with_capacity(promos.len());
    for promo in promos {
        let used = checkout::user_redemptions(&mut conn, promo.promo_id, auth.user_id).await?;
        offers.push(offer(promo, subtotal, used, now));
    }
    // Eligible first, biggest saving first.
    offers.sort_by(|a, b| {
        b.eligible
            .cmp(&a.eligible)
            .then(b.discount_paise.cmp(&a.discount_paise))
    });
    Ok(Json(ApiOk::new(offers)))
}

#[derive(Debug, Deserialize)]
pub struct ValidatePromoRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ValidatePromoResponse {
    pub code: String,
    pub subtotal_paise: i64,
    pub discount_paise: i64,
}

/// Errors carry the rejection code so the client can show why.
pub async fn validate_promo(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ValidatePromoRequest>,
) -> Result<Json<ApiOk<ValidatePromoResponse>>, ApiError> {
    let code = req.code.trim();
    if code.is_empty() {
        return Err(ApiError::validation("code is required"));
    }

    let mut conn = state.db.acquire().await?;
    let lines = checkout::cart_lines(&mut conn, auth.user_id).await?;
    let subtotal = checkout::subtotal(&lines);

    let promo = checkout::find_promo(&mut conn, code)
        .await?
        .ok_or_else(|| ApiError::NotFound("PROMO_NOT_FOUND", "promo code not found".into()))?;
    let used = checkout::user_redemptions(&mut conn, promo.promo_id, auth.user_id).await?;
    let discount_paise = evaluate_promo(&promo.rule(), subtotal, used, Utc::now())?;

    Ok(Json(ApiOk::new(ValidatePromoResponse {
        code: promo.code,
        subtotal_paise: subtotal,
        discount_paise,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn promo(min_order: i64) -> PromoRow {
        let now = Utc::now();
        PromoRow {
            promo_id: Uuid::new_v4(),
            code: "FIRST20".into(),
            description: "20% off your first booking".into(),
            discount_type: DiscountType::Percentage,
            discount_value: 20,
            max_discount_paise: Some(30_000),
            min_order_paise: min_order,
            usage_limit: None,
            per_user_limit: Some(1),
            used_count: 0,
            starts_at: None,
            expires_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn eligible_offer_carries_discount() {
        let o = offer(promo(0), 100_000, 0, Utc::now());
        assert!(o.eligible);
        assert_eq!(o.discount_paise, 20_000);
        assert_eq!(o.reason, None);
    }

    #[test]
    fn ineligible_offer_carries_reason() {
        let o = offer(promo(200_000), 100_000, 0, Utc::now());
        assert!(!o.eligible);
        assert_eq!(o.discount_paise, 0);
        assert_eq!(o.reason, Some("PROMO_MIN_ORDER"));

        let used = offer(promo(0), 100_000, 1, Utc::now());
        assert_eq!(used.reason, Some("PROMO_ALREADY_USED"));
    }
}
