use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::hash_access_token;
use crate::error::ApiError;
use crate::models::{AppState, ROLE_MANAGER, ROLE_SUPER_ADMIN};

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: i16,
    pub session_token_id: Uuid,
    pub session_expires_at: DateTime<Utc>,
}

impl AuthContext {
    pub fn is_super_admin(&self) -> bool {
        self.role == ROLE_SUPER_ADMIN
    }

    pub fn is_manager(&self) -> bool {
        self.role == ROLE_MANAGER
    }

    /// Manager console: managers and super-admins.
    pub fn ensure_manager(&self) -> Result<(), ApiError> {
        if self.is_manager() || self.is_super_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "FORBIDDEN",
                "Only managers and super-admins can do this".into(),
            ))
        }
    }

    pub fn ensure_super_admin(&self) -> Result<(), ApiError> {
        if self.is_super_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "FORBIDDEN",
                "Only super-admins can do this".into(),
            ))
        }
    }
}

/// How stale `last_seen_at` may get before a request refreshes it.
pub const LAST_SEEN_RESOLUTION_SECS: i64 = 300;

#[derive(Debug, sqlx::FromRow)]
struct SessionLookupRow {
    session_token_id: Uuid,
    user_id: Uuid,
    roles: i16,
    expires_at: DateTime<Utc>,
    last_seen_at: Option<DateTime<Utc>>,
}

fn needs_touch(last_seen_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_seen_at.is_none_or(|t| now - t >= Duration::seconds(LAST_SEEN_RESOLUTION_SECS))
}

/// Resolves a bearer token to a live session of an active user.
pub async fn lookup_session(db: &PgPool, token: &str) -> Result<AuthContext, ApiError> {
    let row = sqlx::query_as::<_, SessionLookupRow>(
        r#"
        SELECT st.session_token_id, st.user_id, u.roles, st.expires_at, st.last_seen_at
        FROM session_token st
        JOIN app_user u ON u.user_id = st.user_id
        WHERE st.session_token_hash = $1
          AND st.revoked_at IS NULL
          AND st.expires_at > now()
          AND u.is_active = true
        "#,
    )
    .bind(hash_access_token(token))
    .fetch_optional(db)
    .await?
    .ok_or_else(ApiError::session_expired)?;

    if needs_touch(row.last_seen_at, Utc::now()) {
        if let Err(e) = sqlx::query("UPDATE session_token SET last_seen_at = now() WHERE session_token_id = $1")
            .bind(row.session_token_id)
            .execute(db)
            .await
        {
            tracing::debug!("last_seen_at not updated: {e}");
        }
    }

    Ok(AuthContext {
        user_id: row.user_id,
        role: row.roles,
        session_token_id: row.session_token_id,
        session_expires_at: row.expires_at,
    })
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::session_expired())?;
            lookup_session(&state.db, authz.token()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ROLE_CUSTOMER;

    fn ctx(role: i16) -> AuthContext {
        AuthContext {
            user_id: Uuid::new_v4(),
            role,
            session_token_id: Uuid::new_v4(),
            session_expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn manager_console_admits_both_staff_roles() {
        assert!(ctx(ROLE_MANAGER).ensure_manager().is_ok());
        assert!(ctx(ROLE_SUPER_ADMIN).ensure_manager().is_ok());
        assert!(ctx(ROLE_CUSTOMER).ensure_manager().is_err());
    }

    #[test]
    fn admin_console_is_super_admin_only() {
        assert!(ctx(ROLE_SUPER_ADMIN).ensure_super_admin().is_ok());
        assert!(ctx(ROLE_MANAGER).ensure_super_admin().is_err());
        assert!(ctx(ROLE_CUSTOMER).ensure_super_admin().is_err());
    }

    #[test]
    fn last_seen_is_refreshed_at_most_every_few_minutes() {
        let now = Utc::now();
        assert!(needs_touch(None, now));
        assert!(!needs_touch(Some(now - Duration::seconds(30)), now));
        assert!(needs_touch(Some(now - Duration::seconds(LAST_SEEN_RESOLUTION_SECS)), now));
    }
}
