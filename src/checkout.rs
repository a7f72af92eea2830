//! Checkout and order finalization.
//!
//! `initiate` reserves everything the order consumes (slot lock, promo
//! usage, wallet credit) in one transaction together with the order row and
//! the gateway order. `mark_paid` and `finalize_booking` are idempotent and
//! run under a row lock on the order, so a retried verify, a concurrent
//! webhook, or a double click cannot charge or book twice. `fail_payment`
//! releases the reservations of an unpaid order.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    error::ApiError,
    gateway::CURRENCY,
    models::AppState,
    order_state::OrderStatus,
    partner::{BookingItem, BookingRequest},
    pricing::{DiscountType, Paise, PriceBreakdown, PromoRejection, PromoRule, evaluate_promo},
    referral,
    settings::PlatformSettings,
    validation::age_in_years,
    wallet,
};

/* -------------------------
   Rows
--------------------------*/

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CartLine {
    pub cart_item_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub slug: String,
    pub partner_code: String,
    pub price_paise: i64,
    pub mrp_paise: i64,
    pub is_active: bool,
    pub patient_id: Uuid,
    pub patient_name: String,
    pub patient_gender: i16,
    pub patient_dob: NaiveDate,
}

pub const PROMO_COLUMNS: &str = "promo_id, code, description, discount_type, discount_value, \
     max_discount_paise, min_order_paise, usage_limit, per_user_limit, used_count, \
     starts_at, expires_at, is_active, created_at, updated_at";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PromoRow {
    pub promo_id: Uuid,
    pub code: String,
    pub description: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub max_discount_paise: Option<i64>,
    pub min_order_paise: i64,
    pub usage_limit: Option<i32>,
    pub per_user_limit: Option<i32>,
    pub used_count: i32,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PromoRow {
    pub fn rule(&self) -> PromoRule {
        PromoRule {
            discount_type: self.discount_type,
            discount_value: self.discount_value,
            max_discount_paise: self.max_discount_paise,
            min_order_paise: self.min_order_paise,
            usage_limit: self.usage_limit,
            per_user_limit: self.per_user_limit,
            used_count: self.used_count,
            starts_at: self.starts_at,
            expires_at: self.expires_at,
            is_active: self.is_active,
        }
    }
}

pub const ORDER_COLUMNS: &str = "order_id, user_id, address_id, slot_lock_id, status, \
     subtotal_paise, discount_paise, wallet_paise, payable_paise, promo_id, \
     gateway_order_id, gateway_payment_id, partner_booking_id, failure_reason, \
     created_at, updated_at";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OrderRow {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub address_id: Uuid,
    pub slot_lock_id: Uuid,
    pub status: OrderStatus,
    pub subtotal_paise: i64,
    pub discount_paise: i64,
    pub wallet_paise: i64,
    pub payable_paise: i64,
    pub promo_id: Option<Uuid>,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub partner_booking_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const SLOT_LOCK_COLUMNS: &str = "slot_lock_id, user_id, address_id, partner_slot_id, \
     slot_start, slot_end, expires_at, order_id, released_at, created_at";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SlotLockRow {
    pub slot_lock_id: Uuid,
    pub user_id: Uuid,
    pub address_id: Uuid,
    pub partner_slot_id: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub order_id: Option<Uuid>,
    pub released_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SlotLockRow {
    /// Frozen with the partner, not yet bound to an order, not expired.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.order_id.is_none() && self.released_at.is_none() && self.expires_at > now
    }
}

/* -------------------------
   Cart & quote
--------------------------*/

pub async fn cart_lines(conn: &mut PgConnection, user_id: Uuid) -> Result<Vec<CartLine>, ApiError> {
    let rows = sqlx::query_as::<_, CartLine>(
        r#"
        SELECT ci.cart_item_id,
               p.product_id, p.name AS product_name, p.slug, p.partner_code,
               p.price_paise, p.mrp_paise, p.is_active,
               pt.patient_id, pt.full_name AS patient_name,
               pt.gender AS patient_gender, pt.date_of_birth AS patient_dob
        FROM cart_item ci
        JOIN product p ON p.product_id = ci.product_id
        JOIN patient pt ON pt.patient_id = ci.patient_id
        WHERE ci.user_id = $1
          AND pt.deleted_at IS NULL
        ORDER BY ci.created_at ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// Sum of active lines.
pub fn subtotal(lines: &[CartLine]) -> Paise {
    lines.iter().filter(|l| l.is_active).map(|l| l.price_paise).sum()
}

pub fn ensure_purchasable(lines: &[CartLine]) -> Result<(), ApiError> {
    if lines.is_empty() {
        return Err(ApiError::BadRequest("CART_EMPTY", "cart is empty".into()));
    }
    if let Some(l) = lines.iter().find(|l| !l.is_active) {
        return Err(ApiError::Conflict(
            "PRODUCT_UNAVAILABLE",
            format!("{} is no longer available, remove it from the cart", l.product_name),
        ));
    }
    Ok(())
}

pub async fn find_promo(conn: &mut PgConnection, code: &str) -> Result<Option<PromoRow>, ApiError> {
    let sql = format!("SELECT {PROMO_COLUMNS} FROM promo_code WHERE code = $1");
    let row = sqlx::query_as::<_, PromoRow>(&sql)
        .bind(code.trim().to_ascii_uppercase())
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

pub async fn user_redemptions(conn: &mut PgConnection, promo_id: Uuid, user_id: Uuid) -> Result<i64, ApiError> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM promo_redemption WHERE promo_id = $1 AND user_id = $2",
    )
    .bind(promo_id)
    .bind(user_id)
    .fetch_one(conn)
    .await?;
    Ok(n)
}

#[derive(Debug, Serialize)]
pub struct Quote {
    pub lines: Vec<CartLine>,
    #[serde(flatten)]
    pub breakdown: PriceBreakdown,
    pub promo_code: Option<String>,
    #[serde(skip)]
    pub promo_id: Option<Uuid>,
}

/// Prices the current cart. Reads only; `initiate` re-checks the promo
/// cap and the wallet balance when it reserves them.
pub async fn quote(
    conn: &mut PgConnection,
    user_id: Uuid,
    promo_code: Option<&str>,
    use_wallet: bool,
    settings: &PlatformSettings,
) -> Result<Quote, ApiError> {
    let lines = cart_lines(&mut *conn, user_id).await?;
    ensure_purchasable(&lines)?;
    let subtotal = subtotal(&lines);

    let mut discount = 0;
    let mut promo_id = None;
    let mut applied_code = None;
    if let Some(code) = promo_code.map(str::trim).filter(|c| !c.is_empty()) {
        let promo = find_promo(&mut *conn, code)
            .await?
            .ok_or_else(|| ApiError::NotFound("PROMO_NOT_FOUND", "promo code not found".into()))?;
        let used = user_redemptions(&mut *conn, promo.promo_id, user_id).await?;
        discount = evaluate_promo(&promo.rule(), subtotal, used, Utc::now())?;
        promo_id = Some(promo.promo_id);
        applied_code = Some(promo.code);
    }

    let wallet_balance = if use_wallet {
        let b: Option<i64> = sqlx::query_scalar("SELECT balance_paise FROM wallet WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;
        Some(b.unwrap_or(0))
    } else {
        None
    };

    Ok(Quote {
        breakdown: PriceBreakdown::compute(
            subtotal,
            discount,
            wallet_balance,
            settings.max_wallet_usage_percent,
        ),
        lines,
        promo_code: applied_code,
        promo_id,
    })
}

/* -------------------------
   Loading
--------------------------*/

pub async fn load_order(
    conn: &mut PgConnection,
    order_id: Uuid,
    for_update: bool,
) -> Result<Option<OrderRow>, ApiError> {
    let sql = format!(
        "SELECT {ORDER_COLUMNS} FROM booking_order WHERE order_id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(order_id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

async fn load_owned_order_for_update(
    conn: &mut PgConnection,
    order_id: Uuid,
    user_id: Option<Uuid>,
) -> Result<OrderRow, ApiError> {
    let order = load_order(conn, order_id, true)
        .await?
        .ok_or_else(|| ApiError::not_found("order"))?;
    if user_id.is_some_and(|u| u != order.user_id) {
        return Err(ApiError::not_found("order"));
    }
    Ok(order)
}

pub async fn load_slot_lock(
    conn: &mut PgConnection,
    slot_lock_id: Uuid,
) -> Result<Option<SlotLockRow>, ApiError> {
    let sql = format!("SELECT {SLOT_LOCK_COLUMNS} FROM slot_lock WHERE slot_lock_id = $1");
    let row = sqlx::query_as::<_, SlotLockRow>(&sql)
        .bind(slot_lock_id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

async fn set_status(
    conn: &mut PgConnection,
    order: &OrderRow,
    to: OrderStatus,
    failure_reason: Option<&str>,
) -> Result<(), ApiError> {
    order.status.transition(to)?;
    sqlx::query(
        r#"
        UPDATE booking_order
        SET status = $2, failure_reason = COALESCE($3, failure_reason), updated_at = now()
        WHERE order_id = $1
        "#,
    )
    .bind(order.order_id)
    .bind(to)
    .bind(failure_reason)
    .execute(conn)
    .await?;
    tracing::info!(order_id = %order.order_id, from = order.status.as_str(), to = to.as_str(), "order status changed");
    Ok(())
}

/* -------------------------
   Initiate
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub address_id: Uuid,
    pub slot_lock_id: Uuid,
    pub promo_code: Option<String>,
    #[serde(default)]
    pub use_wallet: bool,
}

/// What the client-side checkout widget needs.
#[derive(Debug, Serialize)]
pub struct GatewayCheckout {
    pub key_id: String,
    pub gateway_order_id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct InitiateResult {
    pub order: OrderRow,
    /// None when wallet and promo covered the whole amount.
    pub gateway: Option<GatewayCheckout>,
    /// True when an existing open order for this slot lock was returned.
    pub resumed: bool,
}

fn gateway_checkout(state: &AppState, order: &OrderRow) -> Option<GatewayCheckout> {
    let id = order.gateway_order_id.clone()?;
    Some(GatewayCheckout {
        key_id: state.gateway.key_id().to_string(),
        gateway_order_id: id,
        amount: order.payable_paise,
        currency: CURRENCY.to_string(),
    })
}

pub const SUPERSEDED_REASON: &str = "superseded by a newer checkout";
const EXPIRED_REASON: &str = "abandoned: slot reservation expired";

fn slot_lock_expired() -> ApiError {
    ApiError::Conflict(
        "SLOT_LOCK_EXPIRED",
        "slot reservation expired, select the slot again".into(),
    )
}

/// Fails every other unpaid order of the user inside `conn`'s transaction
/// and returns the partner slots to release once it commits. A cart backs
/// at most one open order.
async fn supersede_open_orders(conn: &mut PgConnection, user_id: Uuid) -> Result<Vec<String>, ApiError> {
    let sql = format!(
        "SELECT {ORDER_COLUMNS} FROM booking_order WHERE user_id = $1 AND status = $2 FOR UPDATE"
    );
    let open = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(user_id)
        .bind(OrderStatus::Created)
        .fetch_all(&mut *conn)
        .await?;

    let mut slots = Vec::with_capacity(open.len());
    for order in &open {
        set_status(&mut *conn, order, OrderStatus::PaymentFailed, Some(SUPERSEDED_REASON)).await?;
        release_reservations(&mut *conn, order).await?;
        let slot_id: String = sqlx::query_scalar("SELECT partner_slot_id FROM slot_lock WHERE slot_lock_id = $1")
            .bind(order.slot_lock_id)
            .fetch_one(&mut *conn)
            .await?;
        tracing::info!(order_id = %order.order_id, "unpaid order superseded");
        slots.push(slot_id);
    }
    Ok(slots)
}

/// Counts one use of the promo unless its global cap is already reached.
async fn claim_promo(conn: &mut PgConnection, promo_id: Uuid, user_id: Uuid, order_id: Uuid) -> Result<(), ApiError> {
    let claimed = sqlx::query(
        r#"
        UPDATE promo_code SET used_count = used_count + 1, updated_at = now()
        WHERE promo_id = $1 AND (usage_limit IS NULL OR used_count < usage_limit)
        "#,
    )
    .bind(promo_id)
    .execute(&mut *conn)
    .await?;
    if claimed.rows_affected() == 0 {
        return Err(PromoRejection::UsageExhausted.into());
    }
    sqlx::query("INSERT INTO promo_redemption (promo_id, user_id, order_id) VALUES ($1, $2, $3)")
        .bind(promo_id)
        .bind(user_id)
        .bind(order_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn initiate(
    state: &AppState,
    user_id: Uuid,
    req: &InitiateRequest,
) -> Result<InitiateResult, ApiError> {
    abandon_stale_orders(state, user_id).await?;

    let mut tx = state.db.begin().await?;
    let now = Utc::now();

    // Serializes checkouts of one user; shared with slot freezing.
    sqlx::query("SELECT user_id FROM app_user WHERE user_id = $1 FOR UPDATE")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    let sql = format!(
        "SELECT {SLOT_LOCK_COLUMNS} FROM slot_lock WHERE slot_lock_id = $1 AND user_id = $2 FOR UPDATE"
    );
    let lock = sqlx::query_as::<_, SlotLockRow>(&sql)
        .bind(req.slot_lock_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::not_found("slot lock"))?;

    if let Some(existing_id) = lock.order_id {
        let existing = load_order(&mut tx, existing_id, false)
            .await?
            .ok_or_else(|| ApiError::Internal(format!("slot lock bound to missing order {existing_id}")))?;
        tx.rollback().await?;
        return match existing.status {
            OrderStatus::Created if lock.expires_at <= now => {
                fail_payment(state, existing.order_id, Some(user_id), EXPIRED_REASON).await?;
                Err(slot_lock_expired())
            }
            OrderStatus::Created => {
                tracing::info!(order_id = %existing.order_id, "initiate resumed existing order");
                Ok(InitiateResult {
                    gateway: gateway_checkout(state, &existing),
                    order: existing,
                    resumed: true,
                })
            }
            s if s.is_paid() => Err(ApiError::Conflict(
                "ORDER_ALREADY_PAID",
                "this slot is already booked and paid".into(),
            )),
            _ if lock.expires_at <= now => Err(slot_lock_expired()),
            _ => Err(ApiError::Conflict(
                "SLOT_LOCK_CONSUMED",
                "slot lock was used by a closed order, select the slot again".into(),
            )),
        };
    }

    if lock.released_at.is_some() || lock.expires_at <= now {
        return Err(slot_lock_expired());
    }
    if lock.address_id != req.address_id {
        return Err(ApiError::validation("address does not match the reserved slot"));
    }

    let address_ok: Option<Uuid> = sqlx::query_scalar(
        "SELECT address_id FROM address WHERE address_id = $1 AND user_id = $2 AND deleted_at IS NULL",
    )
    .bind(req.address_id)
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await?;
    if address_ok.is_none() {
        return Err(ApiError::not_found("address"));
    }

    // Before pricing, so returned wallet holds count towards this order.
    let superseded_slots = supersede_open_orders(&mut tx, user_id).await?;

    let settings = PlatformSettings::load(&mut tx).await?;
    let q = quote(
        &mut tx,
        user_id,
        req.promo_code.as_deref(),
        req.use_wallet,
        &settings,
    )
    .await?;
    let b = q.breakdown;

    // No promo or wallet row is locked yet; only this user's rows wait on
    // the gateway round trip.
    let order_id = Uuid::new_v4();
    let gateway_order = if b.payable_paise > 0 {
        Some(
            state
                .gateway
                .create_order(b.payable_paise, &order_id.to_string())
                .await?,
        )
    } else {
        None
    };

    let sql = format!(
        r#"
        INSERT INTO booking_order
            (order_id, user_id, address_id, slot_lock_id, status,
             subtotal_paise, discount_paise, wallet_paise, payable_paise,
             promo_id, gateway_order_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING {ORDER_COLUMNS}
        "#
    );
    let order = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(order_id)
        .bind(user_id)
        .bind(req.address_id)
        .bind(lock.slot_lock_id)
        .bind(OrderStatus::Created)
        .bind(b.subtotal_paise)
        .bind(b.discount_paise)
        .bind(b.wallet_paise)
        .bind(b.payable_paise)
        .bind(q.promo_id)
        .bind(gateway_order.as_ref().map(|g| g.id.clone()))
        .fetch_one(&mut *tx)
        .await?;

    for line in &q.lines {
        sqlx::query(
            r#"
            INSERT INTO order_item (order_id, product_id, patient_id, product_name, partner_code, price_paise)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(order_id)
        .bind(line.product_id)
        .bind(line.patient_id)
        .bind(&line.product_name)
        .bind(&line.partner_code)
        .bind(line.price_paise)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE slot_lock SET order_id = $2 WHERE slot_lock_id = $1")
        .bind(lock.slot_lock_id)
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

    if let Some(promo_id) = q.promo_id {
        claim_promo(&mut tx, promo_id, user_id, order_id).await?;
    }

    if b.wallet_paise > 0 {
        // Fails on overdraw if the balance moved since pricing.
        wallet::debit(
            &mut tx,
            user_id,
            b.wallet_paise,
            wallet::REASON_ORDER_PAYMENT,
            Some(order_id),
            None,
        )
        .await?;
    }

    tx.commit().await?;
    tracing::info!(
        %order_id,
        subtotal = b.subtotal_paise,
        discount = b.discount_paise,
        wallet = b.wallet_paise,
        payable = b.payable_paise,
        "order created"
    );

    for slot_id in superseded_slots {
        if let Err(e) = state.partner.release_slot(&slot_id).await {
            tracing::warn!("could not release partner slot {slot_id}: {e}");
        }
    }

    if gateway_order.is_none() {
        // Fully covered by promo and wallet: nothing to collect.
        let (paid, _) = mark_paid(state, order_id, None, None).await?;
        let done = finalize_booking(state, paid.order_id).await?;
        return Ok(InitiateResult {
            order: done,
            gateway: None,
            resumed: false,
        });
    }

    Ok(InitiateResult {
        gateway: gateway_checkout(state, &order),
        order,
        resumed: false,
    })
}

/* -------------------------
   Payment confirmation
--------------------------*/

/// Moves `created -> paid`. Returns the order and whether this call made
/// the transition. Repeating with the same payment id is a no-op.
///
/// `gateway` is `(gateway_order_id, gateway_payment_id)`; None only for
/// orders with nothing to collect.
pub async fn mark_paid(
    state: &AppState,
    order_id: Uuid,
    user_id: Option<Uuid>,
    gateway: Option<(&str, &str)>,
) -> Result<(OrderRow, bool), ApiError> {
    let mut tx = state.db.begin().await?;
    let order = load_owned_order_for_update(&mut tx, order_id, user_id).await?;

    match gateway {
        Some((gw_order, _)) if order.gateway_order_id.as_deref() != Some(gw_order) => {
            return Err(ApiError::BadRequest(
                "GATEWAY_ORDER_MISMATCH",
                "payment does not belong to this order".into(),
            ));
        }
        None if order.payable_paise > 0 => {
            return Err(ApiError::BadRequest(
                "PAYMENT_REQUIRED",
                "order has an outstanding amount".into(),
            ));
        }
        _ => {}
    }
    let payment_id = gateway.map(|(_, p)| p);

    if order.status.is_paid() {
        return if order.gateway_payment_id.as_deref() == payment_id {
            Ok((order, false))
        } else {
            Err(ApiError::Conflict(
                "ORDER_ALREADY_PAID",
                "order was paid with a different payment".into(),
            ))
        };
    }
    if order.status != OrderStatus::Created {
        tracing::error!(
            %order_id,
            status = order.status.as_str(),
            payment_id = payment_id.unwrap_or(""),
            "payment received for closed order, needs manual refund"
        );
        return Err(ApiError::Conflict(
            "ORDER_CLOSED",
            "order is closed, contact support for a refund".into(),
        ));
    }

    set_status(&mut tx, &order, OrderStatus::Paid, None).await?;
    sqlx::query("UPDATE booking_order SET gateway_payment_id = $2 WHERE order_id = $1")
        .bind(order_id)
        .bind(payment_id)
        .execute(&mut *tx)
        .await?;

    let paid = load_order(&mut tx, order_id, false)
        .await?
        .ok_or_else(|| ApiError::not_found("order"))?;
    tx.commit().await?;
    Ok((paid, true))
}

#[derive(Debug, sqlx::FromRow)]
struct BookingContext {
    partner_slot_id: String,
    phone: Option<String>,
    line1: String,
    line2: Option<String>,
    city: String,
    state: String,
    pincode: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
struct BookingLine {
    partner_code: String,
    full_name: String,
    gender: i16,
    date_of_birth: NaiveDate,
}

async fn booking_request(conn: &mut PgConnection, order: &OrderRow) -> Result<BookingRequest, ApiError> {
    let ctx = sqlx::query_as::<_, BookingContext>(
        r#"
        SELECT sl.partner_slot_id, u.phone,
               a.line1, a.line2, a.city, a.state, a.pincode, a.latitude, a.longitude
        FROM booking_order o
        JOIN slot_lock sl ON sl.slot_lock_id = o.slot_lock_id
        JOIN app_user u ON u.user_id = o.user_id
        JOIN address a ON a.address_id = o.address_id
        WHERE o.order_id = $1
        "#,
    )
    .bind(order.order_id)
    .fetch_one(&mut *conn)
    .await?;

    let lines = sqlx::query_as::<_, BookingLine>(
        r#"
        SELECT oi.partner_code, pt.full_name, pt.gender, pt.date_of_birth
        FROM order_item oi
        JOIN patient pt ON pt.patient_id = oi.patient_id
        WHERE oi.order_id = $1
        ORDER BY pt.full_name, oi.partner_code
        "#,
    )
    .bind(order.order_id)
    .fetch_all(conn)
    .await?;

    let today = Utc::now().date_naive();
    let address_line = [Some(ctx.line1), ctx.line2, Some(ctx.city), Some(ctx.state)]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join(", ");

    Ok(BookingRequest {
        order_id: order.order_id,
        slot_id: ctx.partner_slot_id,
        customer_phone: ctx.phone.unwrap_or_default(),
        address_line,
        pincode: ctx.pincode,
        latitude: ctx.latitude,
        longitude: ctx.longitude,
        amount_paise: order.subtotal_paise,
        items: lines
            .into_iter()
            .map(|l| BookingItem {
                partner_code: l.partner_code,
                patient_name: l.full_name,
                gender: l.gender,
                age: age_in_years(l.date_of_birth, today),
            })
            .collect(),
    })
}

/// Places the partner booking for a paid order: `paid -> confirmed`, or
/// `paid -> booking_failed` when the partner refuses. The order row stays
/// locked for the duration of the partner call so concurrent finalizers
/// wait and then observe the outcome.
pub async fn finalize_booking(state: &AppState, order_id: Uuid) -> Result<OrderRow, ApiError> {
    let mut tx = state.db.begin().await?;
    let order = load_order(&mut tx, order_id, true)
        .await?
        .ok_or_else(|| ApiError::not_found("order"))?;

    if order.status != OrderStatus::Paid {
        tx.rollback().await?;
        return Ok(order);
    }

    let req = booking_request(&mut tx, &order).await?;
    match state.partner.create_booking(&req).await {
        Ok(booking_id) => {
            set_status(&mut tx, &order, OrderStatus::Confirmed, None).await?;
            sqlx::query("UPDATE booking_order SET partner_booking_id = $2 WHERE order_id = $1")
                .bind(order_id)
                .bind(&booking_id)
                .execute(&mut *tx)
                .await?;

            // Only the lines that were ordered; items added since stay.
            sqlx::query(
                r#"
                DELETE FROM cart_item ci
                USING order_item oi
                WHERE oi.order_id = $1
                  AND ci.user_id = $2
                  AND ci.product_id = oi.product_id
                  AND ci.patient_id = oi.patient_id
                "#,
            )
            .bind(order_id)
            .bind(order.user_id)
            .execute(&mut *tx)
            .await?;

            let settings = PlatformSettings::load(&mut tx).await?;
            referral::reward_if_pending(&mut tx, order.user_id, order_id, &settings).await?;
            tracing::info!(%order_id, %booking_id, "booking confirmed with partner");
        }
        Err(e) => {
            tracing::error!(%order_id, "partner booking failed after payment: {e}");
            set_status(&mut tx, &order, OrderStatus::BookingFailed, Some(&e.to_string())).await?;
        }
    }

    let done = load_order(&mut tx, order_id, false)
        .await?
        .ok_or_else(|| ApiError::not_found("order"))?;
    tx.commit().await?;
    Ok(done)
}

/* -------------------------
   Failure & compensation
--------------------------*/

/// Returns the wallet hold, promo usage and slot lock of an unpaid order.
async fn release_reservations(conn: &mut PgConnection, order: &OrderRow) -> Result<(), ApiError> {
    if order.wallet_paise > 0 {
        wallet::credit(
            &mut *conn,
            order.user_id,
            order.wallet_paise,
            wallet::REASON_ORDER_REFUND,
            Some(order.order_id),
            None,
        )
        .await?;
    }
    if let Some(promo_id) = order.promo_id {
        let removed = sqlx::query("DELETE FROM promo_redemption WHERE order_id = $1")
            .bind(order.order_id)
            .execute(&mut *conn)
            .await?;
        if removed.rows_affected() > 0 {
            sqlx::query(
                "UPDATE promo_code SET used_count = GREATEST(used_count - 1, 0), updated_at = now() WHERE promo_id = $1",
            )
            .bind(promo_id)
            .execute(&mut *conn)
            .await?;
        }
    }
    sqlx::query("UPDATE slot_lock SET released_at = now() WHERE slot_lock_id = $1 AND released_at IS NULL")
        .bind(order.slot_lock_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// A failed attempt at the gateway. The gateway order stays payable, so a
/// retry can still capture; the order stays `created` and only the reason
/// is kept.
pub async fn note_payment_attempt_failed(state: &AppState, order_id: Uuid, reason: &str) -> Result<bool, ApiError> {
    let res = sqlx::query(
        r#"
        UPDATE booking_order SET failure_reason = $3, updated_at = now()
        WHERE order_id = $1 AND status = $2
        "#,
    )
    .bind(order_id)
    .bind(OrderStatus::Created)
    .bind(reason)
    .execute(&state.db)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `created -> payment_failed` with compensation. Repeating is a no-op.
pub async fn fail_payment(
    state: &AppState,
    order_id: Uuid,
    user_id: Option<Uuid>,
    reason: &str,
) -> Result<OrderRow, ApiError> {
    let mut tx = state.db.begin().await?;
    let order = load_owned_order_for_update(&mut tx, order_id, user_id).await?;
    if order.status == OrderStatus::PaymentFailed {
        tx.rollback().await?;
        return Ok(order);
    }

    set_status(&mut tx, &order, OrderStatus::PaymentFailed, Some(reason)).await?;
    release_reservations(&mut tx, &order).await?;

    let slot_id: String = sqlx::query_scalar("SELECT partner_slot_id FROM slot_lock WHERE slot_lock_id = $1")
        .bind(order.slot_lock_id)
        .fetch_one(&mut *tx)
        .await?;
    let failed = load_order(&mut tx, order_id, false)
        .await?
        .ok_or_else(|| ApiError::not_found("order"))?;
    tx.commit().await?;

    if let Err(e) = state.partner.release_slot(&slot_id).await {
        tracing::warn!(%order_id, "could not release partner slot {slot_id}: {e}");
    }
    Ok(failed)
}

/// Fails this user's unpaid orders whose slot reservation has lapsed, so
/// their wallet and promo holds come back.
pub async fn abandon_stale_orders(state: &AppState, user_id: Uuid) -> Result<usize, ApiError> {
    let stale: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT o.order_id
        FROM booking_order o
        JOIN slot_lock sl ON sl.slot_lock_id = o.slot_lock_id
        WHERE o.user_id = $1
          AND o.status = $2
          AND sl.expires_at <= now()
        "#,
    )
    .bind(user_id)
    .bind(OrderStatus::Created)
    .fetch_all(&state.db)
    .await?;

    let mut n = 0;
    for order_id in stale {
        match fail_payment(state, order_id, Some(user_id), EXPIRED_REASON).await {
            Ok(_) => n += 1,
            // Paid in the meantime.
            Err(ApiError::Conflict(..)) => {}
            Err(e) => return Err(e),
        }
    }
    if n > 0 {
        tracing::info!(%user_id, abandoned = n, "released stale unpaid orders");
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn line(price: i64, active: bool) -> CartLine {
        CartLine {
            cart_item_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            product_name: "CBC".into(),
            slug: "cbc".into(),
            partner_code: "HX-CBC".into(),
            price_paise: price,
            mrp_paise: price,
            is_active: active,
            patient_id: Uuid::new_v4(),
            patient_name: "A".into(),
            patient_gender: 0,
            patient_dob: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
        }
    }

    fn lock(now: DateTime<Utc>) -> SlotLockRow {
        SlotLockRow {
            slot_lock_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            address_id: Uuid::new_v4(),
            partner_slot_id: "sbx-203001010700".into(),
            slot_start: now + Duration::days(1),
            slot_end: now + Duration::days(1) + Duration::hours(1),
            expires_at: now + Duration::minutes(15),
            order_id: None,
            released_at: None,
            created_at: now,
        }
    }

    #[test]
    fn subtotal_ignores_inactive_lines() {
        let lines = vec![line(45_000, true), line(90_000, true), line(10_000, false)];
        assert_eq!(subtotal(&lines), 135_000);
    }

    #[test]
    fn empty_or_stale_cart_is_not_purchasable() {
        assert_eq!(ensure_purchasable(&[]).unwrap_err().code(), "CART_EMPTY");
        let lines = vec![line(100, true), line(100, false)];
        assert_eq!(ensure_purchasable(&lines).unwrap_err().code(), "PRODUCT_UNAVAILABLE");
        assert!(ensure_purchasable(&[line(100, true)]).is_ok());
    }

    #[test]
    fn slot_lock_open_only_while_unbound_and_fresh() {
        let now = Utc::now();
        let l = lock(now);
        assert!(l.is_open(now));
        assert!(!l.is_open(now + Duration::minutes(15)));

        let mut bound = lock(now);
        bound.order_id = Some(Uuid::new_v4());
        assert!(!bound.is_open(now));

        let mut released = lock(now);
        released.released_at = Some(now);
        assert!(!released.is_open(now));
    }

    #[test]
    fn quote_serializes_breakdown_inline() {
        let q = Quote {
            lines: vec![],
            breakdown: PriceBreakdown::compute(1_000, 100, None, 100),
            promo_code: Some("SAVE10".into()),
            promo_id: Some(Uuid::nil()),
        };
        let v = serde_json::to_value(&q).unwrap();
        assert_eq!(v["payable_paise"], 900);
        assert_eq!(v["promo_code"], "SAVE10");
        assert!(v.get("promo_id").is_none());
    }
}
