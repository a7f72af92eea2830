// src/routes/profile_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    checkout,
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
    pagination::{PageQuery, Paged},
    validation::{double_option, ensure_gender, ensure_min_age, required, validate_pincode},
    wallet::{self, LedgerEntry},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/profile", get(get_profile).patch(update_profile))
        .route("/addresses", get(list_addresses).post(create_address))
        .route(
            "/addresses/{address_id}",
            patch(update_address).delete(delete_address),
        )
        .route("/addresses/{address_id}/default", post(set_default_address))
        .route("/patients", get(list_patients).post(create_patient))
        .route(
            "/patients/{patient_id}",
            patch(update_patient).delete(delete_patient),
        )
        .route("/wallet", get(get_wallet))
        .route("/referrals", get(list_my_referrals))
}

/* -------------------------
   Profile
--------------------------*/

async fn load_profile(conn: &mut PgConnection, user_id: Uuid) -> Result<UserProfile, ApiError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM app_user WHERE user_id = $1");
    let user = sqlx::query_as::<_, UserRow>(&sql)
        .bind(user_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| ApiError::not_found("user"))?;
    Ok(user.into())
}

pub async fn get_profile(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<UserProfile>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    Ok(Json(ApiOk::new(load_profile(&mut conn, auth.user_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub email: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub gender: Option<Option<i16>>,
    #[serde(default, deserialize_with = "double_option")]
    pub date_of_birth: Option<Option<NaiveDate>>,
}

pub async fn update_profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<ApiOk<UserProfile>>, ApiError> {
    let display_name = match req.display_name.as_deref() {
        Some(n) => Some(required(n, "display_name")?.to_string()),
        None => None,
    };
    let email = match &req.email {
        Some(Some(e)) => {
            let e = e.trim().to_ascii_lowercase();
            if !e.contains('@') || e.starts_with('@') || e.ends_with('@') {
                return Err(ApiError::validation("email is not valid"));
            }
            Some(Some(e))
        }
        Some(None) => Some(None),
        None => None,
    };
    if let Some(Some(g)) = req.gender {
        ensure_gender(g)?;
    }
    if let Some(Some(dob)) = req.date_of_birth {
        if dob > Utc::now().date_naive() {
            return Err(ApiError::validation("date_of_birth cannot be in the future"));
        }
    }

    let mut tx = state.db.begin().await?;
    sqlx::query(
        r#"
        UPDATE app_user SET
            display_name  = COALESCE($2, display_name),
            email         = CASE WHEN $3 THEN $4 ELSE email END,
            gender        = CASE WHEN $5 THEN $6 ELSE gender END,
            date_of_birth = CASE WHEN $7 THEN $8 ELSE date_of_birth END,
            updated_at    = now()
        WHERE user_id = $1
        "#,
    )
    .bind(auth.user_id)
    .bind(display_name)
    .bind(email.is_some())
    .bind(email.flatten())
    .bind(req.gender.is_some())
    .bind(req.gender.flatten())
    .bind(req.date_of_birth.is_some())
    .bind(req.date_of_birth.flatten())
    .execute(&mut *tx)
    .await
    .map_err(|e| ApiError::unique_or_db(e, "EMAIL_TAKEN", "email is already in use"))?;

    let profile = load_profile(&mut tx, auth.user_id).await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(profile)))
}

/* -------------------------
   Addresses
--------------------------*/

pub const ADDRESS_COLUMNS: &str = "address_id, user_id, label, line1, line2, city, state, pincode, \
     latitude, longitude, is_default, created_at";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AddressRow {
    pub address_id: Uuid,
    pub user_id: Uuid,
    pub label: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub pincode: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

pub async fn load_address(
    conn: &mut PgConnection,
    address_id: Uuid,
    user_id: Uuid,
) -> Result<AddressRow, ApiError> {
    let sql = format!(
        "SELECT {ADDRESS_COLUMNS} FROM address WHERE address_id = $1 AND user_id = $2 AND deleted_at IS NULL"
    );
    sqlx::query_as::<_, AddressRow>(&sql)
        .bind(address_id)
        .bind(user_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| ApiError::not_found("address"))
}

fn validate_coordinates(lat: Option<f64>, lng: Option<f64>) -> Result<(), ApiError> {
    match (lat, lng) {
        (None, None) => Ok(()),
        (Some(lat), Some(lng))
            if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) =>
        {
            Ok(())
        }
        (Some(_), Some(_)) => Err(ApiError::validation("coordinates are out of range")),
        _ => Err(ApiError::validation("latitude and longitude must be given together")),
    }
}

/// Serializes default changes for one user.
async fn lock_addresses(conn: &mut PgConnection, user_id: Uuid) -> Result<(), ApiError> {
    sqlx::query("SELECT address_id FROM address WHERE user_id = $1 AND deleted_at IS NULL FOR UPDATE")
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn make_default(conn: &mut PgConnection, user_id: Uuid, address_id: Uuid) -> Result<(), ApiError> {
    sqlx::query(
        r#"
        UPDATE address SET is_default = (address_id = $2)
        WHERE user_id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(user_id)
    .bind(address_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn list_addresses(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<AddressRow>>>, ApiError> {
    let sql = format!(
        r#"
        SELECT {ADDRESS_COLUMNS}
        FROM address
        WHERE user_id = $1 AND deleted_at IS NULL
        ORDER BY is_default DESC, created_at DESC
        "#
    );
    let rows = sqlx::query_as::<_, AddressRow>(&sql)
        .bind(auth.user_id)
        .fetch_all(&state.db)
        .await?;
    Ok(Json(ApiOk::new(rows)))
}

#[derive(Debug, Deserialize)]
pub struct CreateAddressRequest {
    pub label: Option<String>,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub pincode: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub is_default: bool,
}

pub async fn create_address(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateAddressRequest>,
) -> Result<Json<ApiOk<AddressRow>>, ApiError> {
    let label = req
        .label
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Home");
    let line1 = required(&req.line1, "line1")?;
    let city = required(&req.city, "city")?;
    let st = required(&req.state, "state")?;
    validate_pincode(&req.pincode)?;
    validate_coordinates(req.latitude, req.longitude)?;

    let mut tx = state.db.begin().await?;
    lock_addresses(&mut tx, auth.user_id).await?;
    let existing: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM address WHERE user_id = $1 AND deleted_at IS NULL")
            .bind(auth.user_id)
            .fetch_one(&mut *tx)
            .await?;

    let sql = format!(
        r#"
        INSERT INTO address (user_id, label, line1, line2, city, state, pincode, latitude, longitude)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {ADDRESS_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, AddressRow>(&sql)
        .bind(auth.user_id)
        .bind(label)
        .bind(line1)
        .bind(req.line2.as_deref().map(str::trim).filter(|s| !s.is_empty()))
        .bind(city)
        .bind(st)
        .bind(req.pincode.trim())
        .bind(req.latitude)
        .bind(req.longitude)
        .fetch_one(&mut *tx)
        .await?;

    if existing == 0 || req.is_default {
        make_default(&mut tx, auth.user_id, row.address_id).await?;
    }
    let row = load_address(&mut tx, row.address_id, auth.user_id).await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAddressRequest {
    pub label: Option<String>,
    pub line1: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub line2: Option<Option<String>>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub pincode: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub latitude: Option<Option<f64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub longitude: Option<Option<f64>>,
}

pub async fn update_address(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(address_id): Path<Uuid>,
    Json(req): Json<UpdateAddressRequest>,
) -> Result<Json<ApiOk<AddressRow>>, ApiError> {
    let mut tx = state.db.begin().await?;
    let current = load_address(&mut tx, address_id, auth.user_id).await?;

    let label = match req.label.as_deref() {
        Some(v) => required(v, "label")?.to_string(),
        None => current.label,
    };
    let line1 = match req.line1.as_deref() {
        Some(v) => required(v, "line1")?.to_string(),
        None => current.line1,
    };
    let line2 = match req.line2 {
        Some(v) => v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
        None => current.line2,
    };
    let city = match req.city.as_deref() {
        Some(v) => required(v, "city")?.to_string(),
        None => current.city,
    };
    let st = match req.state.as_deref() {
        Some(v) => required(v, "state")?.to_string(),
        None => current.state,
    };
    let pincode = match req.pincode.as_deref() {
        Some(v) => {
            validate_pincode(v)?;
            v.trim().to_string()
        }
        None => current.pincode,
    };
    let latitude = req.latitude.unwrap_or(current.latitude);
    let longitude = req.longitude.unwrap_or(current.longitude);
    validate_coordinates(latitude, longitude)?;

    let sql = format!(
        r#"
        UPDATE address
        SET label = $3, line1 = $4, line2 = $5, city = $6, state = $7, pincode = $8,
            latitude = $9, longitude = $10
        WHERE address_id = $1 AND user_id = $2
        RETURNING {ADDRESS_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, AddressRow>(&sql)
        .bind(address_id)
        .bind(auth.user_id)
        .bind(label)
        .bind(line1)
        .bind(line2)
        .bind(city)
        .bind(st)
        .bind(pincode)
        .bind(latitude)
        .bind(longitude)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(row)))
}

pub async fn set_default_address(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(address_id): Path<Uuid>,
) -> Result<Json<ApiOk<AddressRow>>, ApiError> {
    let mut tx = state.db.begin().await?;
    lock_addresses(&mut tx, auth.user_id).await?;
    load_address(&mut tx, address_id, auth.user_id).await?;
    make_default(&mut tx, auth.user_id, address_id).await?;
    let row = load_address(&mut tx, address_id, auth.user_id).await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(row)))
}

/// Soft delete. If the default goes, the most recent remaining address
/// takes over.
pub async fn delete_address(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(address_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    let mut tx = state.db.begin().await?;
    lock_addresses(&mut tx, auth.user_id).await?;
    let current = load_address(&mut tx, address_id, auth.user_id).await?;

    sqlx::query("UPDATE address SET deleted_at = now(), is_default = false WHERE address_id = $1")
        .bind(address_id)
        .execute(&mut *tx)
        .await?;

    if current.is_default {
        let next: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT address_id FROM address
            WHERE user_id = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(auth.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(next) = next {
            make_default(&mut tx, auth.user_id, next).await?;
        }
    }
    tx.commit().await?;
    Ok(Json(OkResponse::ok()))
}

/* -------------------------
   Patients
--------------------------*/

pub const PATIENT_COLUMNS: &str = "patient_id, user_id, full_name, relation, gender, date_of_birth, created_at";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PatientRow {
    pub patient_id: Uuid,
    pub user_id: Uuid,
    pub full_name: String,
    pub relation: String,
    pub gender: i16,
    pub date_of_birth: NaiveDate,
    pub created_at: DateTime<Utc>,
}

async fn load_patient(conn: &mut PgConnection, patient_id: Uuid, user_id: Uuid) -> Result<PatientRow, ApiError> {
    let sql = format!(
        "SELECT {PATIENT_COLUMNS} FROM patient WHERE patient_id = $1 AND user_id = $2 AND deleted_at IS NULL"
    );
    sqlx::query_as::<_, PatientRow>(&sql)
        .bind(patient_id)
        .bind(user_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| ApiError::not_found("patient"))
}

pub async fn list_patients(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<PatientRow>>>, ApiError> {
    let sql = format!(
        "SELECT {PATIENT_COLUMNS} FROM patient WHERE user_id = $1 AND deleted_at IS NULL ORDER BY created_at ASC"
    );
    let rows = sqlx::query_as::<_, PatientRow>(&sql)
        .bind(auth.user_id)
        .fetch_all(&state.db)
        .await?;
    Ok(Json(ApiOk::new(rows)))
}

#[derive(Debug, Deserialize)]
pub struct CreatePatientRequest {
    pub full_name: String,
    pub relation: Option<String>,
    pub gender: i16,
    pub date_of_birth: NaiveDate,
}

pub async fn create_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreatePatientRequest>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    let full_name = required(&req.full_name, "full_name")?;
    let relation = req
        .relation
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("self")
        .to_ascii_lowercase();
    ensure_gender(req.gender)?;
    ensure_min_age(
        req.date_of_birth,
        Utc::now().date_naive(),
        state.config.min_patient_age_years,
    )?;

    let sql = format!(
        r#"
        INSERT INTO patient (user_id, full_name, relation, gender, date_of_birth)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {PATIENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, PatientRow>(&sql)
        .bind(auth.user_id)
        .bind(full_name)
        .bind(relation)
        .bind(req.gender)
        .bind(req.date_of_birth)
        .fetch_one(&state.db)
        .await?;
    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePatientRequest {
    pub full_name: Option<String>,
    pub relation: Option<String>,
    pub gender: Option<i16>,
    pub date_of_birth: Option<NaiveDate>,
}

pub async fn update_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<UpdatePatientRequest>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    let full_name = match req.full_name.as_deref() {
        Some(v) => Some(required(v, "full_name")?.to_string()),
        None => None,
    };
    let relation = match req.relation.as_deref() {
        Some(v) => Some(required(v, "relation")?.to_ascii_lowercase()),
        None => None,
    };
    if let Some(g) = req.gender {
        ensure_gender(g)?;
    }
    if let Some(dob) = req.date_of_birth {
        ensure_min_age(dob, Utc::now().date_naive(), state.config.min_patient_age_years)?;
    }

    let mut tx = state.db.begin().await?;
    load_patient(&mut tx, patient_id, auth.user_id).await?;
    let sql = format!(
        r#"
        UPDATE patient SET
            full_name     = COALESCE($3, full_name),
            relation      = COALESCE($4, relation),
            gender        = COALESCE($5, gender),
            date_of_birth = COALESCE($6, date_of_birth)
        WHERE patient_id = $1 AND user_id = $2
        RETURNING {PATIENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, PatientRow>(&sql)
        .bind(patient_id)
        .bind(auth.user_id)
        .bind(full_name)
        .bind(relation)
        .bind(req.gender)
        .bind(req.date_of_birth)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(row)))
}

/// Soft delete; the patient's cart lines go with it. Past orders keep
/// referencing the row.
pub async fn delete_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    let mut tx = state.db.begin().await?;
    load_patient(&mut tx, patient_id, auth.user_id).await?;
    sqlx::query("UPDATE patient SET deleted_at = now() WHERE patient_id = $1")
        .bind(patient_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM cart_item WHERE patient_id = $1 AND user_id = $2")
        .bind(patient_id)
        .bind(auth.user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Json(OkResponse::ok()))
}

/* -------------------------
   Wallet & referrals
--------------------------*/

#[derive(Debug, Serialize)]
pub struct WalletView {
    pub balance_paise: i64,
    pub ledger: Paged<LedgerEntry>,
}

/// Balance plus a page of the ledger, newest first. Holds of lapsed unpaid
/// orders are returned before reading.
pub async fn wallet_view(state: &AppState, user_id: Uuid, page: &PageQuery) -> Result<WalletView, ApiError> {
    checkout::abandon_stale_orders(state, user_id).await?;
    let balance_paise = wallet::balance(&state.db, user_id).await?;
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wallet_ledger WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(&state.db)
        .await?;
    let items = sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT entry_id, user_id, amount_paise, balance_after_paise, reason,
               reference_id, created_by, created_at
        FROM wallet_ledger
        WHERE user_id = $1
        ORDER BY created_at DESC, entry_id
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(user_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.db)
    .await?;

    Ok(WalletView {
        balance_paise,
        ledger: Paged::new(items, page, total),
    })
}

pub async fn get_wallet(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiOk<WalletView>>, ApiError> {
    Ok(Json(ApiOk::new(wallet_view(&state, auth.user_id, &page).await?)))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MyReferralRow {
    pub referral_id: Uuid,
    pub referee_name: String,
    pub status: i16,
    pub referrer_reward_paise: i64,
    pub rewarded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MyReferrals {
    pub referral_code: String,
    pub total_earned_paise: i64,
    pub referrals: Vec<MyReferralRow>,
}

pub async fn list_my_referrals(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<MyReferrals>>, ApiError> {
    let referral_code: String = sqlx::query_scalar("SELECT referral_code FROM app_user WHERE user_id = $1")
        .bind(auth.user_id)
        .fetch_one(&state.db)
        .await?;

    let referrals = sqlx::query_as::<_, MyReferralRow>(
        r#"
        SELECT r.referral_id,
               COALESCE(NULLIF(u.display_name, ''), 'New member') AS referee_name,
               r.status, r.referrer_reward_paise, r.rewarded_at, r.created_at
        FROM referral r
        JOIN app_user u ON u.user_id = r.referee_id
        WHERE r.referrer_id = $1
        ORDER BY r.created_at DESC
        "#,
    )
    .bind(auth.user_id)
    .fetch_all(&state.db)
    .await?;

    let total_earned_paise = referrals.iter().map(|r| r.referrer_reward_paise).sum();
    Ok(Json(ApiOk::new(MyReferrals {
        referral_code,
        total_earned_paise,
        referrals,
    })))
}
