use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::Config,
    gateway::{PaymentGateway, RazorpayGateway, SandboxGateway},
    middleware::rate_limit::RateLimiter,
    partner::{DiagnosticsPartner, HttpPartner, SandboxPartner},
};

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub config: Arc<Config>,
    pub partner: Arc<dyn DiagnosticsPartner>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub otp_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Picks HTTP or sandbox integrations depending on configured URLs.
    pub fn new(db: sqlx::PgPool, config: Config) -> anyhow::Result<Self> {
        let partner: Arc<dyn DiagnosticsPartner> = match &config.partner.base_url {
            Some(url) => {
                tracing::info!("diagnostics partner: {url}");
                Arc::new(HttpPartner::new(url.clone(), &config.partner)?)
            }
            None => {
                tracing::warn!("PARTNER_BASE_URL not set, using sandbox partner");
                Arc::new(SandboxPartner)
            }
        };
        let gateway: Arc<dyn PaymentGateway> = match &config.gateway.base_url {
            Some(url) => {
                tracing::info!("payment gateway: {url}");
                Arc::new(RazorpayGateway::new(url.clone(), &config.gateway)?)
            }
            None => {
                tracing::warn!("GATEWAY_BASE_URL not set, using sandbox gateway");
                Arc::new(SandboxGateway::new(&config.gateway))
            }
        };
        let otp_limiter = Arc::new(RateLimiter::per_hour(config.otp_rate_limit_per_hour));

        Ok(Self {
            db,
            config: Arc::new(config),
            partner,
            gateway,
            otp_limiter,
        })
    }
}

/* -------------------------
   API DTOs
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

impl<T> ApiOk<T> {
    pub fn new(data: T) -> Self {
        ApiOk { data }
    }
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub data: OkData,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        OkResponse {
            data: OkData { ok: true },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub display_name: String,
    pub role: String,
    pub referral_code: String,
    pub gender: Option<i16>,
    pub date_of_birth: Option<NaiveDate>,
}

impl From<UserRow> for UserProfile {
    fn from(u: UserRow) -> Self {
        UserProfile {
            user_id: u.user_id,
            phone: u.phone,
            email: u.email,
            display_name: u.display_name,
            role: role_to_string(u.roles),
            referral_code: u.referral_code,
            gender: u.gender,
            date_of_birth: u.date_of_birth,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponseData {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
    pub is_new_user: bool,
}

#[derive(Debug, Deserialize)]
pub struct StaffLoginRequest {
    pub email: String,
    pub password: String,
    pub device_name: Option<String>,
}

/* -------------------------
   DB Row Models
--------------------------*/

pub const USER_COLUMNS: &str = "user_id, phone, email, display_name, password_hash, roles, \
     is_active, referral_code, referred_by, gender, date_of_birth, created_at";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub user_id: Uuid,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub display_name: String,
    pub password_hash: Option<String>,
    pub roles: i16,
    pub is_active: bool,
    pub referral_code: String,
    pub referred_by: Option<Uuid>,
    pub gender: Option<i16>,
    pub date_of_birth: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct SessionTokenRow {
    pub session_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/* -------------------------
   Roles
--------------------------*/

pub const ROLE_CUSTOMER: i16 = 0;
pub const ROLE_SUPER_ADMIN: i16 = 1;
pub const ROLE_MANAGER: i16 = 2;

/// 0 customer, 1 super_admin, 2 manager
pub fn role_to_string(role: i16) -> String {
    match role {
        ROLE_CUSTOMER => "customer",
        ROLE_SUPER_ADMIN => "super_admin",
        ROLE_MANAGER => "manager",
        _ => "unknown",
    }
    .to_string()
}

pub fn is_known_role(role: i16) -> bool {
    matches!(role, ROLE_CUSTOMER | ROLE_SUPER_ADMIN | ROLE_MANAGER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names() {
        assert_eq!(role_to_string(ROLE_CUSTOMER), "customer");
        assert_eq!(role_to_string(ROLE_SUPER_ADMIN), "super_admin");
        assert_eq!(role_to_string(ROLE_MANAGER), "manager");
        assert_eq!(role_to_string(9), "unknown");
        assert!(!is_known_role(9));
    }
}
