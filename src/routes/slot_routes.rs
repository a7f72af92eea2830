// src/routes/slot_routes.rs

use axum::{extract::State, routing::post, Json, Router};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    checkout::{self, SLOT_LOCK_COLUMNS, SlotLockRow},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    partner::{DiagnosticsPartner, PartnerSlot, SlotQuery, local_date},
    routes::profile_routes::{AddressRow, load_address},
};

/// Furthest day ahead a collection can be booked.
pub const BOOKING_HORIZON_DAYS: i64 = 14;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/slots/availability", post(availability))
        .route("/slots/freeze", post(freeze))
}

fn slot_query(address: &AddressRow, date: NaiveDate) -> SlotQuery {
    SlotQuery {
        pincode: address.pincode.clone(),
        latitude: address.latitude,
        longitude: address.longitude,
        date,
    }
}

/// `date` must fall within today..=today+horizon, in partner local time.
pub fn ensure_bookable_date(date: NaiveDate, today: NaiveDate) -> Result<(), ApiError> {
    if date < today {
        return Err(ApiError::validation("date is in the past"));
    }
    if date > today + Duration::days(BOOKING_HORIZON_DAYS) {
        return Err(ApiError::validation(format!(
            "bookings open at most {BOOKING_HORIZON_DAYS} days ahead"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    pub address_id: Uuid,
    pub date: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub date: NaiveDate,
    pub slots: Vec<PartnerSlot>,
}

pub async fn availability(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<AvailabilityRequest>,
) -> Result<Json<ApiOk<AvailabilityResponse>>, ApiError> {
    ensure_bookable_date(req.date, local_date(Utc::now()))?;
    let address = {
        let mut conn = state.db.acquire().await?;
        load_address(&mut conn, req.address_id, auth.user_id).await?
    };

    let now = Utc::now();
    let mut slots = state
        .partner
        .available_slots(&slot_query(&address, req.date))
        .await?;
    for s in &mut slots {
        if s.start <= now {
            s.available = false;
        }
    }
    slots.sort_by_key(|s| s.start);

    Ok(Json(ApiOk::new(AvailabilityResponse {
        date: req.date,
        slots,
    })))
}

#[derive(Debug, Deserialize)]
pub struct FreezeRequest {
    pub address_id: Uuid,
    pub partner_slot_id: String,
    /// Slot date; defaults to today.
    pub date: Option<NaiveDate>,
}

/// Freezes the slot with the partner and records a lock valid for the
/// configured number of minutes. Any earlier unconsumed lock of the user
/// is released, so at most one stays open.
pub async fn freeze(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<FreezeRequest>,
) -> Result<Json<ApiOk<SlotLockRow>>, ApiError> {
    let slot_id = req.partner_slot_id.trim();
    if slot_id.is_empty() {
        return Err(ApiError::validation("partner_slot_id is required"));
    }
    let now = Utc::now();
    let date = req.date.unwrap_or_else(|| local_date(now));
    ensure_bookable_date(date, local_date(now))?;

    checkout::abandon_stale_orders(&state, auth.user_id).await?;

    let address = {
        let mut conn = state.db.acquire().await?;
        load_address(&mut conn, req.address_id, auth.user_id).await?
    };

    // Same slot and address still held: hand back the existing lock.
    let sql = format!(
        r#"
        SELECT {SLOT_LOCK_COLUMNS}
        FROM slot_lock
        WHERE user_id = $1 AND address_id = $2 AND partner_slot_id = $3
          AND order_id IS NULL AND released_at IS NULL AND expires_at > now()
        "#
    );
    let held = sqlx::query_as::<_, SlotLockRow>(&sql)
        .bind(auth.user_id)
        .bind(address.address_id)
        .bind(slot_id)
        .fetch_optional(&state.db)
        .await?;
    if let Some(lock) = held {
        return Ok(Json(ApiOk::new(lock)));
    }

    let slot = hold_partner_slot(state.partner.as_ref(), slot_id, &slot_query(&address, date), now).await?;

    let expires_at = now + Duration::minutes(state.config.slot_lock_minutes);
    let stored = store_lock(&state, auth.user_id, address.address_id, &slot, expires_at).await;
    let (lock, previous) = match stored {
        Ok(v) => v,
        Err(e) => {
            if let Err(re) = state.partner.release_slot(&slot.slot_id).await {
                tracing::warn!("could not release partner slot {}: {re}", slot.slot_id);
            }
            return Err(e);
        }
    };

    for old in previous {
        if let Err(e) = state.partner.release_slot(&old).await {
            tracing::warn!("could not release partner slot {old}: {e}");
        }
    }
    tracing::info!(
        user_id = %auth.user_id,
        slot_lock_id = %lock.slot_lock_id,
        slot = %lock.partner_slot_id,
        "slot frozen"
    );
    Ok(Json(ApiOk::new(lock)))
}

/// Freezes with the partner and hands the slot straight back when it has
/// already started.
async fn hold_partner_slot(
    partner: &dyn DiagnosticsPartner,
    slot_id: &str,
    q: &SlotQuery,
    now: DateTime<Utc>,
) -> Result<PartnerSlot, ApiError> {
    let slot = partner.freeze_slot(slot_id, q).await?;
    if slot.start <= now {
        if let Err(e) = partner.release_slot(&slot.slot_id).await {
            tracing::warn!("could not release partner slot {}: {e}", slot.slot_id);
        }
        return Err(ApiError::Conflict(
            "SLOT_UNAVAILABLE",
            "slot has already started".into(),
        ));
    }
    Ok(slot)
}

/// Inserts the new lock and releases the user's other open locks in one
/// transaction. Returns the new lock and the partner ids released.
async fn store_lock(
    state: &AppState,
    user_id: Uuid,
    address_id: Uuid,
    slot: &PartnerSlot,
    expires_at: DateTime<Utc>,
) -> Result<(SlotLockRow, Vec<String>), ApiError> {
    let mut tx = state.db.begin().await?;

    // Serializes concurrent freezes of the same user.
    sqlx::query("SELECT user_id FROM app_user WHERE user_id = $1 FOR UPDATE")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    let previous: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE slot_lock SET released_at = now()
        WHERE user_id = $1 AND order_id IS NULL AND released_at IS NULL
        RETURNING partner_slot_id
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut *tx)
    .await?;

    let sql = format!(
        r#"
        INSERT INTO slot_lock (user_id, address_id, partner_slot_id, slot_start, slot_end, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {SLOT_LOCK_COLUMNS}
        "#
    );
    let lock = sqlx::query_as::<_, SlotLockRow>(&sql)
        .bind(user_id)
        .bind(address_id)
        .bind(&slot.slot_id)
        .bind(slot.start)
        .bind(slot.end)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    let previous = previous.into_iter().filter(|id| *id != slot.slot_id).collect();
    Ok((lock, previous))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partner::{BookingRequest, PartnerError, PartnerProduct};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Freezes whatever it is asked for at a fixed start and records releases.
    struct FixedPartner {
        start: DateTime<Utc>,
        released: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DiagnosticsPartner for FixedPartner {
        async fn available_slots(&self, _q: &SlotQuery) -> Result<Vec<PartnerSlot>, PartnerError> {
            Ok(Vec::new())
        }

        async fn freeze_slot(&self, slot_id: &str, _q: &SlotQuery) -> Result<PartnerSlot, PartnerError> {
            Ok(PartnerSlot {
                slot_id: slot_id.to_string(),
                start: self.start,
                end: self.start + Duration::hours(1),
                available: true,
            })
        }

        async fn release_slot(&self, slot_id: &str) -> Result<(), PartnerError> {
            self.released.lock().unwrap().push(slot_id.to_string());
            Ok(())
        }

        async fn create_booking(&self, _req: &BookingRequest) -> Result<String, PartnerError> {
            Err(PartnerError::Rejected("not used".into()))
        }

        async fn fetch_catalog(&self) -> Result<Vec<PartnerProduct>, PartnerError> {
            Ok(Vec::new())
        }
    }

    fn query(now: DateTime<Utc>) -> SlotQuery {
        SlotQuery {
            pincode: "560001".into(),
            latitude: None,
            longitude: None,
            date: now.date_naive(),
        }
    }

    #[tokio::test]
    async fn started_slot_is_released_back_to_partner() {
        let now = Utc::now();
        let partner = FixedPartner {
            start: now - Duration::minutes(5),
            released: Mutex::new(Vec::new()),
        };
        let err = hold_partner_slot(&partner, "slot-1", &query(now), now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SLOT_UNAVAILABLE");
        assert_eq!(*partner.released.lock().unwrap(), vec!["slot-1".to_string()]);
    }

    #[tokio::test]
    async fn future_slot_stays_frozen() {
        let now = Utc::now();
        let partner = FixedPartner {
            start: now + Duration::hours(2),
            released: Mutex::new(Vec::new()),
        };
        let slot = hold_partner_slot(&partner, "slot-2", &query(now), now).await.unwrap();
        assert_eq!(slot.slot_id, "slot-2");
        assert!(partner.released.lock().unwrap().is_empty());
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn bookable_window() {
        let today = d(2026, 3, 1);
        assert!(ensure_bookable_date(today, today).is_ok());
        assert!(ensure_bookable_date(d(2026, 3, 15), today).is_ok());
        assert!(ensure_bookable_date(d(2026, 3, 16), today).is_err());
        assert!(ensure_bookable_date(d(2026, 2, 28), today).is_err());
    }
}
