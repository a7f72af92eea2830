//! Cart pricing: promo evaluation and wallet application.
//!
//! All amounts are integer paise. Percentage discounts round down so the
//! customer is never charged a fraction of a paisa.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

pub type Paise = i64;

/// Default share of the post-promo amount that wallet credit may cover.
pub const DEFAULT_MAX_WALLET_USAGE_PERCENT: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum DiscountType {
    Percentage = 0,
    Flat = 1,
}

#[derive(Debug, Clone)]
pub struct PromoRule {
    pub discount_type: DiscountType,
    /// Percent (1..=100) for `Percentage`, paise for `Flat`.
    pub discount_value: i64,
    pub max_discount_paise: Option<Paise>,
    pub min_order_paise: Paise,
    pub usage_limit: Option<i32>,
    pub per_user_limit: Option<i32>,
    pub used_count: i32,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromoRejection {
    #[error("promo code is not active")]
    Inactive,
    #[error("promo code is not valid yet")]
    NotStarted,
    #[error("promo code has expired")]
    Expired,
    #[error("cart is empty")]
    EmptyCart,
    #[error("minimum order value is {min_order_paise} paise")]
    BelowMinimum { min_order_paise: Paise },
    #[error("promo code usage limit reached")]
    UsageExhausted,
    #[error("you have already used this promo code")]
    PerUserExhausted,
}

impl PromoRejection {
    pub fn code(&self) -> &'static str {
        match self {
            PromoRejection::Inactive => "PROMO_INACTIVE",
            PromoRejection::NotStarted => "PROMO_NOT_STARTED",
            PromoRejection::Expired => "PROMO_EXPIRED",
            PromoRejection::EmptyCart => "CART_EMPTY",
            PromoRejection::BelowMinimum { .. } => "PROMO_MIN_ORDER",
            PromoRejection::UsageExhausted => "PROMO_EXHAUSTED",
            PromoRejection::PerUserExhausted => "PROMO_ALREADY_USED",
        }
    }
}

impl From<PromoRejection> for ApiError {
    fn from(r: PromoRejection) -> Self {
        ApiError::BadRequest(r.code(), r.to_string())
    }
}

/// Discount in paise for `subtotal`, or the reason the promo does not apply.
/// `user_redemptions` counts this user's orders holding the promo, open ones included.
pub fn evaluate_promo(
    rule: &PromoRule,
    subtotal: Paise,
    user_redemptions: i64,
    now: DateTime<Utc>,
) -> Result<Paise, PromoRejection> {
    if !rule.is_active {
        return Err(PromoRejection::Inactive);
    }
    if rule.starts_at.is_some_and(|s| now < s) {
        return Err(PromoRejection::NotStarted);
    }
    if rule.expires_at.is_some_and(|e| now >= e) {
        return Err(PromoRejection::Expired);
    }
    if subtotal <= 0 {
        return Err(PromoRejection::EmptyCart);
    }
    if subtotal < rule.min_order_paise {
        return Err(PromoRejection::BelowMinimum {
            min_order_paise: rule.min_order_paise,
        });
    }
    if rule.usage_limit.is_some_and(|limit| rule.used_count >= limit) {
        return Err(PromoRejection::UsageExhausted);
    }
    if rule
        .per_user_limit
        .is_some_and(|limit| user_redemptions >= i64::from(limit))
    {
        return Err(PromoRejection::PerUserExhausted);
    }

    let raw = match rule.discount_type {
        DiscountType::Percentage => subtotal * rule.discount_value.clamp(0, 100) / 100,
        DiscountType::Flat => rule.discount_value.max(0),
    };
    let capped = match rule.max_discount_paise {
        Some(cap) => raw.min(cap),
        None => raw,
    };
    Ok(capped.min(subtotal))
}

/// Wallet credit usable against `amount`, bounded by the balance and by
/// `max_usage_percent` of the amount.
pub fn wallet_applicable(balance: Paise, amount: Paise, max_usage_percent: u8) -> Paise {
    if balance <= 0 || amount <= 0 {
        return 0;
    }
    let ceiling = amount * i64::from(max_usage_percent.min(100)) / 100;
    balance.min(ceiling)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceBreakdown {
    pub subtotal_paise: Paise,
    pub discount_paise: Paise,
    pub wallet_paise: Paise,
    pub payable_paise: Paise,
}

impl PriceBreakdown {
    /// `wallet_balance` is None when the customer opted out of wallet use.
    pub fn compute(
        subtotal: Paise,
        discount: Paise,
        wallet_balance: Option<Paise>,
        max_wallet_usage_percent: u8,
    ) -> Self {
        let discount = discount.clamp(0, subtotal.max(0));
        let after_promo = subtotal - discount;
        let wallet = wallet_balance
            .map(|b| wallet_applicable(b, after_promo, max_wallet_usage_percent))
            .unwrap_or(0);
        PriceBreakdown {
            subtotal_paise: subtotal,
            discount_paise: discount,
            wallet_paise: wallet,
            payable_paise: after_promo - wallet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn rule(discount_type: DiscountType, value: i64) -> PromoRule {
        PromoRule {
            discount_type,
            discount_value: value,
            max_discount_paise: None,
            min_order_paise: 0,
            usage_limit: None,
            per_user_limit: None,
            used_count: 0,
            starts_at: None,
            expires_at: None,
            is_active: true,
        }
    }

    #[test]
    fn percentage_rounds_down_and_respects_cap() {
        let now = Utc::now();
        let mut r = rule(DiscountType::Percentage, 15);
        assert_eq!(evaluate_promo(&r, 99_999, 0, now), Ok(14_999));

        r.max_discount_paise = Some(10_000);
        assert_eq!(evaluate_promo(&r, 99_999, 0, now), Ok(10_000));
    }

    #[test]
    fn flat_discount_never_exceeds_subtotal() {
        let now = Utc::now();
        let r = rule(DiscountType::Flat, 50_000);
        assert_eq!(evaluate_promo(&r, 30_000, 0, now), Ok(30_000));
        assert_eq!(evaluate_promo(&r, 80_000, 0, now), Ok(50_000));
    }

    #[test]
    fn minimum_order_is_enforced() {
        let mut r = rule(DiscountType::Flat, 10_000);
        r.min_order_paise = 100_000;
        assert_eq!(
            evaluate_promo(&r, 99_999, 0, Utc::now()),
            Err(PromoRejection::BelowMinimum {
                min_order_paise: 100_000
            })
        );
        assert_eq!(evaluate_promo(&r, 100_000, 0, Utc::now()), Ok(10_000));
    }

    #[test]
    fn validity_window_is_half_open() {
        let now = Utc::now();
        let mut r = rule(DiscountType::Flat, 100);
        r.starts_at = Some(now + Duration::minutes(1));
        assert_eq!(evaluate_promo(&r, 1_000, 0, now), Err(PromoRejection::NotStarted));

        r.starts_at = Some(now);
        r.expires_at = Some(now);
        assert_eq!(evaluate_promo(&r, 1_000, 0, now), Err(PromoRejection::Expired));

        r.expires_at = Some(now + Duration::seconds(1));
        assert_eq!(evaluate_promo(&r, 1_000, 0, now), Ok(100));
    }

    #[test]
    fn usage_caps_apply_globally_and_per_user() {
        let now = Utc::now();
        let mut r = rule(DiscountType::Flat, 100);
        r.usage_limit = Some(10);
        r.used_count = 10;
        assert_eq!(evaluate_promo(&r, 1_000, 0, now), Err(PromoRejection::UsageExhausted));

        r.used_count = 9;
        r.per_user_limit = Some(1);
        assert_eq!(evaluate_promo(&r, 1_000, 1, now), Err(PromoRejection::PerUserExhausted));
        assert_eq!(evaluate_promo(&r, 1_000, 0, now), Ok(100));
    }

    #[test]
    fn inactive_and_empty_cart_are_rejected() {
        let now = Utc::now();
        let mut r = rule(DiscountType::Percentage, 10);
        assert_eq!(evaluate_promo(&r, 0, 0, now), Err(PromoRejection::EmptyCart));
        r.is_active = false;
        assert_eq!(evaluate_promo(&r, 1_000, 0, now), Err(PromoRejection::Inactive));
    }

    #[test]
    fn wallet_is_bounded_by_balance_and_share() {
        assert_eq!(wallet_applicable(5_000, 20_000, 100), 5_000);
        assert_eq!(wallet_applicable(50_000, 20_000, 100), 20_000);
        assert_eq!(wallet_applicable(50_000, 20_000, 25), 5_000);
        assert_eq!(wallet_applicable(0, 20_000, 100), 0);
        assert_eq!(wallet_applicable(-5, 20_000, 100), 0);
        assert_eq!(wallet_applicable(100, 20_000, 250), 100);
    }

    #[test]
    fn breakdown_applies_promo_before_wallet() {
        let b = PriceBreakdown::compute(100_000, 20_000, Some(90_000), 100);
        assert_eq!(b.discount_paise, 20_000);
        assert_eq!(b.wallet_paise, 80_000);
        assert_eq!(b.payable_paise, 0);

        let b = PriceBreakdown::compute(100_000, 20_000, None, 100);
        assert_eq!(b.wallet_paise, 0);
        assert_eq!(b.payable_paise, 80_000);
    }

    #[test]
    fn breakdown_clamps_out_of_range_discount() {
        let b = PriceBreakdown::compute(1_000, 5_000, None, 100);
        assert_eq!(b.discount_paise, 1_000);
        assert_eq!(b.payable_paise, 0);
    }

    #[test]
    fn rejection_maps_to_bad_request_code() {
        let err: ApiError = PromoRejection::UsageExhausted.into();
        assert_eq!(err.code(), "PROMO_EXHAUSTED");
    }
}
