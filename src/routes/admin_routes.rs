// src/routes/admin_routes.rs
//
// Super-admin console.

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    audit,
    auth::{generate_referral_code, hash_password},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
    order_state::OrderStatus,
    pagination::{PageQuery, Paged},
    referral::{REFERRAL_PENDING, REFERRAL_REWARDED},
    routes::profile_routes::{WalletView, wallet_view},
    settings::{KNOWN_KEYS, PlatformSettings},
    validation::{normalize_phone, required},
    wallet,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_staff))
        .route("/users/{user_id}", patch(update_user))
        .route("/wallets/{user_id}", get(get_wallet))
        .route("/wallets/{user_id}/adjust", post(adjust_wallet))
        .route("/referrals", get(list_referrals))
        .route("/audit-logs", get(list_audit_logs))
        .route("/config", get(get_config).put(put_config))
        .route("/stats", get(stats))
}

/* -------------------------
   Users
--------------------------*/

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AdminUserRow {
    pub user_id: Uuid,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub display_name: String,
    pub roles: i16,
    pub is_active: bool,
    pub referral_code: String,
    pub wallet_balance_paise: i64,
    pub created_at: DateTime<Utc>,
}

const ADMIN_USER_SELECT: &str = r#"
    SELECT u.user_id, u.phone, u.email, u.display_name, u.roles, u.is_active, u.referral_code,
           COALESCE(w.balance_paise, 0) AS wallet_balance_paise, u.created_at
    FROM app_user u
    LEFT JOIN wallet w ON w.user_id = u.user_id
"#;

#[derive(Debug, Default, Deserialize)]
pub struct UserListQuery {
    /// Matches phone, email or name.
    pub q: Option<String>,
    pub role: Option<i16>,
    pub active: Option<bool>,
}

pub fn push_user_filters(qb: &mut QueryBuilder<'_, Postgres>, f: &UserListQuery) {
    qb.push(" WHERE 1=1");
    if let Some(term) = f.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let like = format!("%{term}%");
        qb.push(" AND (u.phone ILIKE ")
            .push_bind(like.clone())
            .push(" OR u.email ILIKE ")
            .push_bind(like.clone())
            .push(" OR u.display_name ILIKE ")
            .push_bind(like)
            .push(")");
    }
    if let Some(r) = f.role {
        qb.push(" AND u.roles = ").push_bind(r);
    }
    if let Some(a) = f.active {
        qb.push(" AND u.is_active = ").push_bind(a);
    }
}

pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(filter): Query<UserListQuery>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiOk<Paged<AdminUserRow>>>, ApiError> {
    auth.ensure_super_admin()?;

    let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM app_user u");
    push_user_filters(&mut count_qb, &filter);
    let total: i64 = count_qb.build_query_scalar().fetch_one(&state.db).await?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(ADMIN_USER_SELECT);
    push_user_filters(&mut qb, &filter);
    qb.push(" ORDER BY u.created_at DESC LIMIT ")
        .push_bind(page.limit())
        .push(" OFFSET ")
        .push_bind(page.offset());
    let items = qb.build_query_as::<AdminUserRow>().fetch_all(&state.db).await?;

    Ok(Json(ApiOk::new(Paged::new(items, &page, total))))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub roles: Option<i16>,
    pub is_active: Option<bool>,
}

pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<ApiOk<AdminUserRow>>, ApiError> {
    auth.ensure_super_admin()?;
    if let Some(r) = req.roles {
        if !is_known_role(r) {
            return Err(ApiError::validation("roles must be 0, 1 or 2"));
        }
    }
    if user_id == auth.user_id && (req.roles.is_some_and(|r| r != auth.role) || req.is_active == Some(false)) {
        return Err(ApiError::Conflict(
            "CANNOT_MODIFY_SELF",
            "you cannot change your own role or deactivate yourself".into(),
        ));
    }

    let mut tx = state.db.begin().await?;
    let before: Option<(i16, bool)> =
        sqlx::query_as("SELECT roles, is_active FROM app_user WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
    let (old_role, old_active) = before.ok_or_else(|| ApiError::not_found("user"))?;

    sqlx::query(
        r#"
        UPDATE app_user
        SET roles = COALESCE($2, roles), is_active = COALESCE($3, is_active), updated_at = now()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .bind(req.roles)
    .bind(req.is_active)
    .execute(&mut *tx)
    .await?;

    let role_changed = req.roles.is_some_and(|r| r != old_role);
    if req.is_active == Some(false) || role_changed {
        // Sessions carry the role; force a fresh login.
        sqlx::query("UPDATE session_token SET revoked_at = now() WHERE user_id = $1 AND revoked_at IS NULL")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }

    audit::record(
        &mut tx,
        Some(auth.user_id),
        "user.update",
        "app_user",
        Some(user_id.to_string()),
        json!({
            "before": { "roles": old_role, "is_active": old_active },
            "after": { "roles": req.roles.unwrap_or(old_role), "is_active": req.is_active.unwrap_or(old_active) },
        }),
    )
    .await?;

    let sql = format!("{ADMIN_USER_SELECT} WHERE u.user_id = $1");
    let row = sqlx::query_as::<_, AdminUserRow>(&sql)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct CreateStaffRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub phone: Option<String>,
    pub roles: i16,
}

pub const MIN_STAFF_PASSWORD_LEN: usize = 10;

pub async fn create_staff(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateStaffRequest>,
) -> Result<Json<ApiOk<AdminUserRow>>, ApiError> {
    auth.ensure_super_admin()?;
    if req.roles != ROLE_MANAGER && req.roles != ROLE_SUPER_ADMIN {
        return Err(ApiError::validation("staff roles are 1 (super_admin) or 2 (manager)"));
    }
    let email = required(&req.email, "email")?.to_ascii_lowercase();
    if !email.contains('@') {
        return Err(ApiError::validation("email is not valid"));
    }
    let display_name = required(&req.display_name, "display_name")?;
    if req.password.chars().count() < MIN_STAFF_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "password must be at least {MIN_STAFF_PASSWORD_LEN} characters"
        )));
    }
    let phone = match req.phone.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(p) => Some(normalize_phone(p)?),
        None => None,
    };
    let password_hash = hash_password(&req.password).map_err(ApiError::Internal)?;

    let mut tx = state.db.begin().await?;
    let user_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO app_user (email, phone, display_name, password_hash, roles, referral_code)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING user_id
        "#,
    )
    .bind(&email)
    .bind(phone)
    .bind(display_name)
    .bind(password_hash)
    .bind(req.roles)
    .bind(generate_referral_code())
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| ApiError::unique_or_db(e, "USER_EXISTS", "email or phone already registered"))?;
    wallet::ensure_wallet(&mut tx, user_id).await?;

    audit::record(
        &mut tx,
        Some(auth.user_id),
        "user.create_staff",
        "app_user",
        Some(user_id.to_string()),
        json!({ "email": email, "roles": req.roles }),
    )
    .await?;

    let sql = format!("{ADMIN_USER_SELECT} WHERE u.user_id = $1");
    let row = sqlx::query_as::<_, AdminUserRow>(&sql)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    tracing::info!(%user_id, role = %role_to_string(req.roles), "staff account created");
    Ok(Json(ApiOk::new(row)))
}

/* -------------------------
   Wallets
--------------------------*/

pub async fn get_wallet(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiOk<WalletView>>, ApiError> {
    auth.ensure_super_admin()?;
    Ok(Json(ApiOk::new(wallet_view(&state, user_id, &page).await?)))
}

#[derive(Debug, Deserialize)]
pub struct AdjustWalletRequest {
    /// Positive credits, negative debits.
    pub amount_paise: i64,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct AdjustWalletResponse {
    pub entry: wallet::LedgerEntry,
    pub balance_paise: i64,
}

pub async fn adjust_wallet(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<AdjustWalletRequest>,
) -> Result<Json<ApiOk<AdjustWalletResponse>>, ApiError> {
    auth.ensure_super_admin()?;
    let note = required(&req.reason, "reason")?.to_string();
    if req.amount_paise == 0 {
        return Err(ApiError::validation("amount_paise cannot be zero"));
    }

    let mut tx = state.db.begin().await?;
    let exists: Option<Uuid> = sqlx::query_scalar("SELECT user_id FROM app_user WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
    if exists.is_none() {
        return Err(ApiError::not_found("user"));
    }

    let entry = if req.amount_paise > 0 {
        wallet::credit(
            &mut tx,
            user_id,
            req.amount_paise,
            wallet::REASON_ADMIN_ADJUSTMENT,
            None,
            Some(auth.user_id),
        )
        .await?
    } else {
        wallet::debit(
            &mut tx,
            user_id,
            -req.amount_paise,
            wallet::REASON_ADMIN_ADJUSTMENT,
            None,
            Some(auth.user_id),
        )
        .await?
    };

    audit::record(
        &mut tx,
        Some(auth.user_id),
        "wallet.adjust",
        "wallet",
        Some(user_id.to_string()),
        json!({ "amount_paise": req.amount_paise, "reason": note, "entry_id": entry.entry_id }),
    )
    .await?;
    tx.commit().await?;

    Ok(Json(ApiOk::new(AdjustWalletResponse {
        balance_paise: entry.balance_after_paise,
        entry,
    })))
}

/* -------------------------
   Referrals
--------------------------*/

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AdminReferralRow {
    pub referral_id: Uuid,
    pub referrer_id: Uuid,
    pub referrer_name: String,
    pub referee_id: Uuid,
    pub referee_name: String,
    pub status: i16,
    pub referrer_reward_paise: i64,
    pub referee_reward_paise: i64,
    pub rewarded_order_id: Option<Uuid>,
    pub rewarded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReferralListQuery {
    pub status: Option<i16>,
}

pub async fn list_referrals(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(filter): Query<ReferralListQuery>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiOk<Paged<AdminReferralRow>>>, ApiError> {
    auth.ensure_super_admin()?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM referral WHERE ($1::SMALLINT IS NULL OR status = $1)")
        .bind(filter.status)
        .fetch_one(&state.db)
        .await?;
    let items = sqlx::query_as::<_, AdminReferralRow>(
        r#"
        SELECT r.referral_id, r.referrer_id, ru.display_name AS referrer_name,
               r.referee_id, eu.display_name AS referee_name, r.status,
               r.referrer_reward_paise, r.referee_reward_paise,
               r.rewarded_order_id, r.rewarded_at, r.created_at
        FROM referral r
        JOIN app_user ru ON ru.user_id = r.referrer_id
        JOIN app_user eu ON eu.user_id = r.referee_id
        WHERE ($1::SMALLINT IS NULL OR r.status = $1)
        ORDER BY r.created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(filter.status)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.db)
    .await?;

    Ok(Json(ApiOk::new(Paged::new(items, &page, total))))
}

/* -------------------------
   Audit logs
--------------------------*/

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AuditLogRow {
    pub audit_id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub detail: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditLogQuery {
    pub actor: Option<Uuid>,
    pub action: Option<String>,
    pub entity_type: Option<String>,
}

pub fn push_audit_filters(qb: &mut QueryBuilder<'_, Postgres>, f: &AuditLogQuery) {
    qb.push(" WHERE 1=1");
    if let Some(a) = f.actor {
        qb.push(" AND actor_user_id = ").push_bind(a);
    }
    if let Some(action) = f.action.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND action = ").push_bind(action.to_string());
    }
    if let Some(t) = f.entity_type.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND entity_type = ").push_bind(t.to_string());
    }
}

pub async fn list_audit_logs(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(filter): Query<AuditLogQuery>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiOk<Paged<AuditLogRow>>>, ApiError> {
    auth.ensure_super_admin()?;

    let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM audit_log");
    push_audit_filters(&mut count_qb, &filter);
    let total: i64 = count_qb.build_query_scalar().fetch_one(&state.db).await?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT audit_id, actor_user_id, action, entity_type, entity_id, detail, created_at FROM audit_log",
    );
    push_audit_filters(&mut qb, &filter);
    qb.push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(page.limit())
        .push(" OFFSET ")
        .push_bind(page.offset());
    let items = qb.build_query_as::<AuditLogRow>().fetch_all(&state.db).await?;

    Ok(Json(ApiOk::new(Paged::new(items, &page, total))))
}

/* -------------------------
   System config
--------------------------*/

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ConfigEntry {
    pub key: String,
    pub value: JsonValue,
    pub updated_by: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConfigView {
    /// Values in effect, defaults included.
    pub effective: PlatformSettings,
    pub stored: Vec<ConfigEntry>,
    pub known_keys: [&'static str; 3],
}

async fn config_view(conn: &mut sqlx::PgConnection) -> Result<ConfigView, ApiError> {
    let stored = sqlx::query_as::<_, ConfigEntry>(
        "SELECT key, value, updated_by, updated_at FROM system_config ORDER BY key",
    )
    .fetch_all(&mut *conn)
    .await?;
    let effective = PlatformSettings::load(conn).await?;
    Ok(ConfigView {
        effective,
        stored,
        known_keys: KNOWN_KEYS,
    })
}

pub async fn get_config(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<ConfigView>>, ApiError> {
    auth.ensure_super_admin()?;
    let mut conn = state.db.acquire().await?;
    Ok(Json(ApiOk::new(config_view(&mut conn).await?)))
}

#[derive(Debug, Deserialize)]
pub struct PutConfigRequest {
    pub key: String,
    pub value: JsonValue,
}

pub async fn put_config(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<PutConfigRequest>,
) -> Result<Json<ApiOk<ConfigView>>, ApiError> {
    auth.ensure_super_admin()?;
    let key = req.key.trim();
    PlatformSettings::default()
        .apply(key, &req.value)
        .map_err(ApiError::validation)?;

    let mut tx = state.db.begin().await?;
    let previous: Option<JsonValue> =
        sqlx::query_scalar("SELECT value FROM system_config WHERE key = $1 FOR UPDATE")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
    sqlx::query(
        r#"
        INSERT INTO system_config (key, value, updated_by, updated_at)
        VALUES ($1, $2, $3, now())
        ON CONFLICT (key) DO UPDATE
        SET value = EXCLUDED.value, updated_by = EXCLUDED.updated_by, updated_at = now()
        "#,
    )
    .bind(key)
    .bind(&req.value)
    .bind(auth.user_id)
    .execute(&mut *tx)
    .await?;
    audit::record(
        &mut tx,
        Some(auth.user_id),
        "config.update",
        "system_config",
        Some(key.to_string()),
        json!({ "before": previous, "after": req.value }),
    )
    .await?;
    let view = config_view(&mut tx).await?;
    tx.commit().await?;
    tracing::info!(key, "system config updated");
    Ok(Json(ApiOk::new(view)))
}

/* -------------------------
   Stats
--------------------------*/

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PlatformStats {
    pub customers: i64,
    pub staff: i64,
    pub orders_total: i64,
    pub orders_confirmed: i64,
    pub orders_booking_failed: i64,
    pub gross_revenue_paise: i64,
    pub wallet_liability_paise: i64,
    pub referrals_pending: i64,
    pub referrals_rewarded: i64,
}

pub async fn stats(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<PlatformStats>>, ApiError> {
    auth.ensure_super_admin()?;
    let row = sqlx::query_as::<_, PlatformStats>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM app_user WHERE roles = $1) AS customers,
            (SELECT COUNT(*) FROM app_user WHERE roles <> $1) AS staff,
            (SELECT COUNT(*) FROM booking_order) AS orders_total,
            (SELECT COUNT(*) FROM booking_order WHERE status = $2) AS orders_confirmed,
            (SELECT COUNT(*) FROM booking_order WHERE status = $3) AS orders_booking_failed,
            (SELECT COALESCE(SUM(payable_paise + wallet_paise), 0)::BIGINT
               FROM booking_order WHERE status = $2) AS gross_revenue_paise,
            (SELECT COALESCE(SUM(balance_paise), 0)::BIGINT FROM wallet) AS wallet_liability_paise,
            (SELECT COUNT(*) FROM referral WHERE status = $4) AS referrals_pending,
            (SELECT COUNT(*) FROM referral WHERE status = $5) AS referrals_rewarded
        "#,
    )
    .bind(ROLE_CUSTOMER)
    .bind(OrderStatus::Confirmed)
    .bind(OrderStatus::BookingFailed)
    .bind(REFERRAL_PENDING)
    .bind(REFERRAL_REWARDED)
    .fetch_one(&state.db)
    .await?;
    Ok(Json(ApiOk::new(row)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_search_matches_three_columns() {
        let f = UserListQuery {
            q: Some("98765".into()),
            role: Some(ROLE_MANAGER),
            active: None,
        };
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT 1 FROM app_user u");
        push_user_filters(&mut qb, &f);
        assert_eq!(
            qb.sql(),
            "SELECT 1 FROM app_user u WHERE 1=1 AND (u.phone ILIKE $1 OR u.email ILIKE $2 \
             OR u.display_name ILIKE $3) AND u.roles = $4"
        );
    }

    #[test]
    fn audit_filters_skip_blank_values() {
        let f = AuditLogQuery {
            actor: None,
            action: Some("  ".into()),
            entity_type: Some("promo_code".into()),
        };
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT 1 FROM audit_log");
        push_audit_filters(&mut qb, &f);
        assert_eq!(qb.sql(), "SELECT 1 FROM audit_log WHERE 1=1 AND entity_type = $1");
    }
}
