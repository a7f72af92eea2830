use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    auth::{
        generate_access_token, generate_otp, generate_referral_code, hash_access_token, hash_otp,
        verify_password,
    },
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
    referral,
    validation::{mask_phone, normalize_phone},
    wallet,
};

const MAX_OTP_ATTEMPTS: i32 = 5;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/otp/request", post(request_otp))
        .route("/otp/verify", post(verify_otp))
        .route("/staff/login", post(staff_login))
        .route("/me", get(me))
        .route("/logout", post(logout))
        // Rotate access token for the current session (invalidates old token immediately)
        .route("/refresh", post(refresh))
}

/* -------------------------
   Sessions
--------------------------*/

async fn create_session(
    conn: &mut PgConnection,
    user_id: Uuid,
    device_name: Option<&str>,
    ttl_hours: i64,
) -> Result<(String, SessionTokenRow), ApiError> {
    let access_token = generate_access_token();
    let token_hash = hash_access_token(&access_token);
    let expires_at = Utc::now() + Duration::hours(ttl_hours);

    let session: SessionTokenRow = sqlx::query_as::<_, SessionTokenRow>(
        r#"
        INSERT INTO session_token (user_id, session_token_hash, device_name, expires_at)
        VALUES ($1, $2, $3, $4)
        RETURNING session_token_id, expires_at
        "#,
    )
    .bind(user_id)
    .bind(&token_hash)
    .bind(device_name)
    .bind(expires_at)
    .fetch_one(conn)
    .await
    .map_err(ApiError::db)?;

    Ok((access_token, session))
}

async fn load_user(conn: &mut PgConnection, user_id: Uuid) -> Result<Option<UserRow>, ApiError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM app_user WHERE user_id = $1");
    sqlx::query_as::<_, UserRow>(&sql)
        .bind(user_id)
        .fetch_optional(conn)
        .await
        .map_err(ApiError::db)
}

/* -------------------------
   OTP login
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct OtpRequest {
    pub phone: String,
}

#[derive(Debug, Serialize)]
pub struct OtpRequestData {
    pub sent: bool,
    pub expires_in_seconds: i64,
    /// Only with OTP_DEV_ECHO.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_code: Option<String>,
}

pub async fn request_otp(
    State(state): State<AppState>,
    Json(req): Json<OtpRequest>,
) -> Result<Json<ApiOk<OtpRequestData>>, ApiError> {
    let phone = normalize_phone(&req.phone)?;
    state.otp_limiter.check(&phone)?;

    let code = generate_otp();
    let ttl_minutes = state.config.otp_ttl_minutes;
    let expires_at = Utc::now() + Duration::minutes(ttl_minutes);

    let mut tx = state.db.begin().await?;
    // Only the newest code is valid.
    sqlx::query("UPDATE otp_code SET consumed_at = now() WHERE phone = $1 AND consumed_at IS NULL")
        .bind(&phone)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO otp_code (phone, code_hash, expires_at) VALUES ($1, $2, $3)")
        .bind(&phone)
        .bind(hash_otp(&phone, &code))
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    // SMS delivery is handled by the messaging provider integration; the
    // code never appears in logs.
    tracing::info!(phone = %mask_phone(&phone), "otp issued");

    Ok(Json(ApiOk::new(OtpRequestData {
        sent: true,
        expires_in_seconds: ttl_minutes * 60,
        dev_code: state.config.otp_dev_echo.then_some(code),
    })))
}

#[derive(Debug, Deserialize)]
pub struct OtpVerifyRequest {
    pub phone: String,
    pub code: String,
    pub referral_code: Option<String>,
    pub device_name: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct OtpRow {
    otp_id: Uuid,
    code_hash: String,
    attempts: i32,
}

pub async fn verify_otp(
    State(state): State<AppState>,
    Json(req): Json<OtpVerifyRequest>,
) -> Result<Json<ApiOk<LoginResponseData>>, ApiError> {
    let phone = normalize_phone(&req.phone)?;
    let code = req.code.trim();
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::validation("code must be 6 digits"));
    }

    let mut tx = state.db.begin().await?;

    let otp: OtpRow = sqlx::query_as::<_, OtpRow>(
        r#"
        SELECT otp_id, code_hash, attempts
        FROM otp_code
        WHERE phone = $1
          AND consumed_at IS NULL
          AND expires_at > now()
        ORDER BY created_at DESC
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(&phone)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::Unauthorized("OTP_EXPIRED", "code expired, request a new one".into()))?;

    if otp.attempts >= MAX_OTP_ATTEMPTS {
        return Err(ApiError::Unauthorized(
            "OTP_LOCKED",
            "too many wrong attempts, request a new code".into(),
        ));
    }

    if otp.code_hash != hash_otp(&phone, code) {
        sqlx::query("UPDATE otp_code SET attempts = attempts + 1 WHERE otp_id = $1")
            .bind(otp.otp_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(phone = %mask_phone(&phone), "otp mismatch");
        return Err(ApiError::Unauthorized("OTP_INVALID", "incorrect code".into()));
    }

    sqlx::query("UPDATE otp_code SET consumed_at = now() WHERE otp_id = $1")
        .bind(otp.otp_id)
        .execute(&mut *tx)
        .await?;

    let sql = format!("SELECT {USER_COLUMNS} FROM app_user WHERE phone = $1");
    let existing = sqlx::query_as::<_, UserRow>(&sql)
        .bind(&phone)
        .fetch_optional(&mut *tx)
        .await?;

    let (user, is_new_user) = match existing {
        Some(u) => {
            if !u.is_active {
                return Err(ApiError::Forbidden("FORBIDDEN", "Account is disabled".into()));
            }
            (u, false)
        }
        None => {
            let sql = format!(
                r#"
                INSERT INTO app_user (phone, roles, referral_code)
                VALUES ($1, $2, $3)
                RETURNING {USER_COLUMNS}
                "#
            );
            let u = sqlx::query_as::<_, UserRow>(&sql)
                .bind(&phone)
                .bind(ROLE_CUSTOMER)
                .bind(generate_referral_code())
                .fetch_one(&mut *tx)
                .await?;
            wallet::ensure_wallet(&mut tx, u.user_id).await?;

            if let Some(rc) = req.referral_code.as_deref().filter(|s| !s.trim().is_empty()) {
                referral::attach(&mut tx, u.user_id, rc).await?;
            }
            tracing::info!(user_id = %u.user_id, phone = %mask_phone(&phone), "customer registered");
            (u, true)
        }
    };

    let (access_token, session) = create_session(
        &mut tx,
        user.user_id,
        req.device_name.as_deref(),
        state.config.session_ttl_hours,
    )
    .await?;
    tx.commit().await?;

    Ok(Json(ApiOk::new(LoginResponseData {
        access_token,
        expires_at: session.expires_at,
        user: user.into(),
        is_new_user,
    })))
}

/* -------------------------
   Staff login
--------------------------*/

pub async fn staff_login(
    State(state): State<AppState>,
    Json(req): Json<StaffLoginRequest>,
) -> Result<Json<ApiOk<LoginResponseData>>, ApiError> {
    let email = req.email.trim().to_ascii_lowercase();
    if email.is_empty() || req.password.is_empty() {
        return Err(ApiError::validation("email and password are required"));
    }

    let sql = format!("SELECT {USER_COLUMNS} FROM app_user WHERE lower(email) = $1");
    let user: UserRow = sqlx::query_as::<_, UserRow>(&sql)
        .bind(&email)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(ApiError::invalid_credentials)?;

    if !user.is_active {
        return Err(ApiError::Forbidden("FORBIDDEN", "Account is disabled".into()));
    }
    if user.roles != ROLE_MANAGER && user.roles != ROLE_SUPER_ADMIN {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Account type not allowed for this login".into(),
        ));
    }
    let Some(stored) = user.password_hash.as_deref() else {
        return Err(ApiError::invalid_credentials());
    };
    if !verify_password(&req.password, stored) {
        tracing::info!(user_id = %user.user_id, "staff login failed");
        return Err(ApiError::invalid_credentials());
    }

    let mut conn = state.db.acquire().await?;
    let (access_token, session) = create_session(
        &mut conn,
        user.user_id,
        req.device_name.as_deref(),
        state.config.session_ttl_hours,
    )
    .await?;
    tracing::info!(user_id = %user.user_id, role = %role_to_string(user.roles), "staff login");

    Ok(Json(ApiOk::new(LoginResponseData {
        access_token,
        expires_at: session.expires_at,
        user: user.into(),
        is_new_user: false,
    })))
}

/* -------------------------
   Current session
--------------------------*/

#[derive(Debug, Serialize)]
pub struct MeData {
    pub user: UserProfile,
    pub session: SessionInfo,
}

pub async fn me(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<MeData>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    let user = load_user(&mut conn, auth.user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(ApiError::session_expired)?;

    Ok(Json(ApiOk::new(MeData {
        user: user.into(),
        session: SessionInfo {
            session_token_id: auth.session_token_id,
            expires_at: auth.session_expires_at,
        },
    })))
}

pub async fn logout(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<OkResponse>, ApiError> {
    let rows = sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE session_token_id = $1
          AND user_id = $2
          AND revoked_at IS NULL
        "#,
    )
    .bind(auth.session_token_id)
    .bind(auth.user_id)
    .execute(&state.db)
    .await?;

    if rows.rows_affected() == 0 {
        return Err(ApiError::session_expired());
    }

    Ok(Json(OkResponse::ok()))
}

#[derive(Debug, Serialize)]
pub struct RefreshData {
    pub access_token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub session_token_id: Uuid,
}

/// POST /api/v1/auth/refresh
/// Rotates the access token for the current session and extends it.
pub async fn refresh(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<RefreshData>>, ApiError> {
    let new_token = generate_access_token();
    let new_hash = hash_access_token(&new_token);
    let expires_at = Utc::now() + Duration::hours(state.config.session_ttl_hours);

    let row: Option<(chrono::DateTime<chrono::Utc>,)> = sqlx::query_as(
        r#"
        UPDATE session_token
        SET session_token_hash = $1,
            expires_at = $4,
            last_seen_at = now()
        WHERE session_token_id = $2
          AND user_id = $3
          AND revoked_at IS NULL
          AND expires_at > now()
        RETURNING expires_at
        "#,
    )
    .bind(new_hash)
    .bind(auth.session_token_id)
    .bind(auth.user_id)
    .bind(expires_at)
    .fetch_optional(&state.db)
    .await?;

    let expires_at = row.ok_or_else(ApiError::session_expired)?.0;

    Ok(Json(ApiOk::new(RefreshData {
        access_token: new_token,
        expires_at,
        session_token_id: auth.session_token_id,
    })))
}
