//! Diagnostics partner integration: live collection slots, slot freezing,
//! booking placement and catalog sync.

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{config::PartnerConfig, error::ApiError, signature};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartnerSlot {
    pub slot_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotQuery {
    pub pincode: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingItem {
    pub partner_code: String,
    pub patient_name: String,
    pub gender: i16,
    pub age: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingRequest {
    pub order_id: Uuid,
    pub slot_id: String,
    pub customer_phone: String,
    pub address_line: String,
    pub pincode: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub amount_paise: i64,
    pub items: Vec<BookingItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerProduct {
    pub partner_code: String,
    pub name: String,
    /// 0 test, 1 package
    pub product_type: i16,
    pub mrp_paise: i64,
    pub sample_type: Option<String>,
    pub fasting_required: bool,
    pub report_tat_hours: Option<i32>,
}

#[derive(Debug, thiserror::Error)]
pub enum PartnerError {
    #[error("partner unreachable: {0}")]
    Transport(String),
    #[error("partner rejected request: {0}")]
    Rejected(String),
    #[error("slot is no longer available")]
    SlotUnavailable,
}

impl From<PartnerError> for ApiError {
    fn from(e: PartnerError) -> Self {
        match e {
            PartnerError::SlotUnavailable => ApiError::Conflict("SLOT_UNAVAILABLE", e.to_string()),
            PartnerError::Rejected(_) => ApiError::BadGateway("PARTNER_REJECTED", e.to_string()),
            PartnerError::Transport(_) => ApiError::BadGateway("PARTNER_UNAVAILABLE", e.to_string()),
        }
    }
}

#[async_trait]
pub trait DiagnosticsPartner: Send + Sync {
    async fn available_slots(&self, q: &SlotQuery) -> Result<Vec<PartnerSlot>, PartnerError>;

    /// Holds the slot for this customer. Returns the slot as the partner
    /// sees it, which is the source of truth for start/end.
    async fn freeze_slot(&self, slot_id: &str, q: &SlotQuery) -> Result<PartnerSlot, PartnerError>;

    async fn release_slot(&self, slot_id: &str) -> Result<(), PartnerError>;

    /// Returns the partner booking reference.
    async fn create_booking(&self, req: &BookingRequest) -> Result<String, PartnerError>;

    async fn fetch_catalog(&self) -> Result<Vec<PartnerProduct>, PartnerError>;
}

/* -------------------------
   HTTP partner
--------------------------*/

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct SlotRef<'a> {
    slot_id: &'a str,
}

#[derive(Debug, Serialize)]
struct FreezeBody<'a> {
    slot_id: &'a str,
    #[serde(flatten)]
    query: &'a SlotQuery,
}

#[derive(Debug, Deserialize)]
struct BookingAck {
    booking_id: String,
}

pub struct HttpPartner {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    secret: String,
}

impl HttpPartner {
    pub fn new(base_url: String, cfg: &PartnerConfig) -> Result<Self, PartnerError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| PartnerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            secret: cfg.secret.clone(),
        })
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PartnerError> {
        self.post_envelope(path, body)
            .await?
            .ok_or_else(|| PartnerError::Rejected(format!("{path}: empty response")))
    }

    async fn post_envelope<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>, PartnerError> {
        let payload = serde_json::to_vec(body).map_err(|e| PartnerError::Transport(e.to_string()))?;
        let checksum = signature::sign(&self.secret, &payload);

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-Api-Key", &self.api_key)
            .header("X-Checksum", checksum)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| PartnerError::Transport(e.to_string()))?;

        Self::unwrap_envelope(path, resp).await
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        path: &str,
        resp: reqwest::Response,
    ) -> Result<Option<T>, PartnerError> {
        let status = resp.status();
        if status.is_server_error() {
            return Err(PartnerError::Transport(format!("{path}: HTTP {status}")));
        }
        let env: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| PartnerError::Transport(format!("{path}: bad response: {e}")))?;
        if !env.status {
            return Err(PartnerError::Rejected(env.message));
        }
        Ok(env.data)
    }
}

#[async_trait]
impl DiagnosticsPartner for HttpPartner {
    async fn available_slots(&self, q: &SlotQuery) -> Result<Vec<PartnerSlot>, PartnerError> {
        self.post("/slots/search", q).await
    }

    async fn freeze_slot(&self, slot_id: &str, q: &SlotQuery) -> Result<PartnerSlot, PartnerError> {
        let slot: PartnerSlot = self
            .post("/slots/freeze", &FreezeBody { slot_id, query: q })
            .await
            .map_err(|e| match e {
                PartnerError::Rejected(_) => PartnerError::SlotUnavailable,
                other => other,
            })?;
        Ok(slot)
    }

    async fn release_slot(&self, slot_id: &str) -> Result<(), PartnerError> {
        let _: Option<serde_json::Value> = self.post_envelope("/slots/release", &SlotRef { slot_id }).await?;
        Ok(())
    }

    async fn create_booking(&self, req: &BookingRequest) -> Result<String, PartnerError> {
        let ack: BookingAck = self.post("/bookings", req).await?;
        Ok(ack.booking_id)
    }

    async fn fetch_catalog(&self) -> Result<Vec<PartnerProduct>, PartnerError> {
        let resp = self
            .client
            .get(format!("{}/products", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .header("X-Checksum", signature::sign(&self.secret, b""))
            .send()
            .await
            .map_err(|e| PartnerError::Transport(e.to_string()))?;
        Ok(Self::unwrap_envelope("/products", resp).await?.unwrap_or_default())
    }
}

/* -------------------------
   Sandbox partner
--------------------------*/

const SANDBOX_SLOT_PREFIX: &str = "sbx-";
const SANDBOX_FIRST_HOUR: u32 = 6;
const SANDBOX_LAST_HOUR: u32 = 11;

const IST_OFFSET_SECS: i32 = 5 * 3600 + 1800;

fn ist() -> Option<FixedOffset> {
    FixedOffset::east_opt(IST_OFFSET_SECS)
}

/// Calendar date in India at `now`; slot dates are local to the partner.
pub fn local_date(now: DateTime<Utc>) -> NaiveDate {
    match ist() {
        Some(tz) => now.with_timezone(&tz).date_naive(),
        None => now.date_naive(),
    }
}

/// Deterministic hourly morning slots, used when no partner URL is configured.
#[derive(Debug, Default)]
pub struct SandboxPartner;

impl SandboxPartner {
    pub fn slot_id(start_local: NaiveDateTime) -> String {
        format!("{SANDBOX_SLOT_PREFIX}{}", start_local.format("%Y%m%d%H%M"))
    }

    pub fn parse_slot_id(slot_id: &str) -> Option<PartnerSlot> {
        let raw = slot_id.strip_prefix(SANDBOX_SLOT_PREFIX)?;
        let local = NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M").ok()?;
        let start = ist()?.from_local_datetime(&local).single()?.with_timezone(&Utc);
        Some(PartnerSlot {
            slot_id: slot_id.to_string(),
            start,
            end: start + Duration::hours(1),
            available: true,
        })
    }

    pub fn slots_for(date: NaiveDate, now: DateTime<Utc>) -> Vec<PartnerSlot> {
        (SANDBOX_FIRST_HOUR..=SANDBOX_LAST_HOUR)
            .filter_map(|h| date.and_hms_opt(h, 0, 0))
            .filter_map(|local| Self::parse_slot_id(&Self::slot_id(local)))
            .map(|mut s| {
                s.available = s.start > now;
                s
            })
            .collect()
    }
}

#[async_trait]
impl DiagnosticsPartner for SandboxPartner {
    async fn available_slots(&self, q: &SlotQuery) -> Result<Vec<PartnerSlot>, PartnerError> {
        Ok(Self::slots_for(q.date, Utc::now()))
    }

    async fn freeze_slot(&self, slot_id: &str, _q: &SlotQuery) -> Result<PartnerSlot, PartnerError> {
        let slot = Self::parse_slot_id(slot_id).ok_or(PartnerError::SlotUnavailable)?;
        if slot.start <= Utc::now() {
            return Err(PartnerError::SlotUnavailable);
        }
        Ok(slot)
    }

    async fn release_slot(&self, _slot_id: &str) -> Result<(), PartnerError> {
        Ok(())
    }

    async fn create_booking(&self, req: &BookingRequest) -> Result<String, PartnerError> {
        if req.items.is_empty() {
            return Err(PartnerError::Rejected("booking has no items".into()));
        }
        Ok(format!("SBX-{}", &req.order_id.simple().to_string()[..12].to_uppercase()))
    }

    async fn fetch_catalog(&self) -> Result<Vec<PartnerProduct>, PartnerError> {
        let item = |code: &str, name: &str, ty: i16, mrp: i64, fasting: bool| PartnerProduct {
            partner_code: code.to_string(),
            name: name.to_string(),
            product_type: ty,
            mrp_paise: mrp,
            sample_type: Some("Blood".to_string()),
            fasting_required: fasting,
            report_tat_hours: Some(24),
        };
        Ok(vec![
            item("SBX-CBC", "Complete Blood Count", 0, 45_000, false),
            item("SBX-LIPID", "Lipid Profile", 0, 90_000, true),
            item("SBX-THYROID", "Thyroid Profile (T3, T4, TSH)", 0, 70_000, false),
            item("SBX-FULLBODY", "Full Body Checkup", 1, 399_900, true),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn sandbox_slot_ids_round_trip_through_ist() {
        let local = date(2026, 3, 1).and_hms_opt(7, 0, 0).unwrap();
        let id = SandboxPartner::slot_id(local);
        assert_eq!(id, "sbx-202603010700");
        let slot = SandboxPartner::parse_slot_id(&id).unwrap();
        assert_eq!(slot.start.to_rfc3339(), "2026-03-01T01:30:00+00:00");
        assert_eq!(slot.end - slot.start, Duration::hours(1));
    }

    #[test]
    fn sandbox_rejects_foreign_ids() {
        assert!(SandboxPartner::parse_slot_id("hx-202603010700").is_none());
        assert!(SandboxPartner::parse_slot_id("sbx-garbage").is_none());
    }

    #[test]
    fn past_slots_are_unavailable() {
        let day = date(2026, 3, 1);
        let now = SandboxPartner::parse_slot_id("sbx-202603010830").unwrap().start;
        let slots = SandboxPartner::slots_for(day, now);
        assert_eq!(slots.len(), 6);
        let open: Vec<_> = slots.iter().filter(|s| s.available).collect();
        assert_eq!(open.len(), 3);
        assert_eq!(open[0].slot_id, "sbx-202603010900");
    }

    #[tokio::test]
    async fn sandbox_booking_requires_items() {
        let req = BookingRequest {
            order_id: Uuid::new_v4(),
            slot_id: "sbx-203001010700".into(),
            customer_phone: "9876543210".into(),
            address_line: "1 MG Road".into(),
            pincode: "560001".into(),
            latitude: None,
            longitude: None,
            amount_paise: 0,
            items: vec![],
        };
        assert!(matches!(
            SandboxPartner.create_booking(&req).await,
            Err(PartnerError::Rejected(_))
        ));
    }

    #[test]
    fn local_date_rolls_over_at_ist_midnight() {
        let before = "2026-03-01T18:29:00Z".parse::<DateTime<Utc>>().unwrap();
        let after = "2026-03-01T18:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(local_date(before), date(2026, 3, 1));
        assert_eq!(local_date(after), date(2026, 3, 2));
    }

    #[test]
    fn slot_unavailable_is_conflict() {
        let err: ApiError = PartnerError::SlotUnavailable.into();
        assert_eq!(err.code(), "SLOT_UNAVAILABLE");
    }
}
