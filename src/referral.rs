use serde::Serialize;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::ApiError;
use crate::settings::PlatformSettings;
use crate::wallet;

pub const REFERRAL_PENDING: i16 = 0;
pub const REFERRAL_REWARDED: i16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RewardOutcome {
    pub referrer_id: Uuid,
    pub referrer_reward_paise: i64,
    pub referee_reward_paise: i64,
}

/// Links a new user to the owner of `code`. Self-referral and unknown codes
/// are rejected; a user can be referred at most once.
pub async fn attach(conn: &mut PgConnection, referee_id: Uuid, code: &str) -> Result<Uuid, ApiError> {
    let code = code.trim().to_ascii_uppercase();
    let referrer: Option<Uuid> =
        sqlx::query_scalar("SELECT user_id FROM app_user WHERE referral_code = $1 AND is_active = true")
            .bind(&code)
            .fetch_optional(&mut *conn)
            .await?;
    let referrer_id = referrer
        .ok_or_else(|| ApiError::BadRequest("INVALID_REFERRAL_CODE", "referral code not found".into()))?;
    if referrer_id == referee_id {
        return Err(ApiError::BadRequest(
            "INVALID_REFERRAL_CODE",
            "you cannot use your own referral code".into(),
        ));
    }

    sqlx::query(
        r#"
        INSERT INTO referral (referrer_id, referee_id, status)
        VALUES ($1, $2, $3)
        ON CONFLICT (referee_id) DO NOTHING
        "#,
    )
    .bind(referrer_id)
    .bind(referee_id)
    .bind(REFERRAL_PENDING)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE app_user SET referred_by = $2 WHERE user_id = $1 AND referred_by IS NULL")
        .bind(referee_id)
        .bind(referrer_id)
        .execute(conn)
        .await?;

    Ok(referrer_id)
}

/// Pays out the pending referral of `referee_id`, if any, for its first
/// confirmed order. Runs inside the caller's transaction.
pub async fn reward_if_pending(
    conn: &mut PgConnection,
    referee_id: Uuid,
    order_id: Uuid,
    settings: &PlatformSettings,
) -> Result<Option<RewardOutcome>, ApiError> {
    let pending: Option<(Uuid, Uuid)> = sqlx::query_as(
        r#"
        SELECT referral_id, referrer_id
        FROM referral
        WHERE referee_id = $1 AND status = $2
        FOR UPDATE
        "#,
    )
    .bind(referee_id)
    .bind(REFERRAL_PENDING)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((referral_id, referrer_id)) = pending else {
        return Ok(None);
    };

    if settings.referrer_reward_paise > 0 {
        wallet::credit(
            &mut *conn,
            referrer_id,
            settings.referrer_reward_paise,
            wallet::REASON_REFERRAL_REWARD,
            Some(order_id),
            None,
        )
        .await?;
    }
    if settings.referee_reward_paise > 0 {
        wallet::credit(
            &mut *conn,
            referee_id,
            settings.referee_reward_paise,
            wallet::REASON_REFERRAL_SIGNUP,
            Some(order_id),
            None,
        )
        .await?;
    }

    sqlx::query(
        r#"
        UPDATE referral
        SET status = $2,
            referrer_reward_paise = $3,
            referee_reward_paise = $4,
            rewarded_order_id = $5,
            rewarded_at = now()
        WHERE referral_id = $1
        "#,
    )
    .bind(referral_id)
    .bind(REFERRAL_REWARDED)
    .bind(settings.referrer_reward_paise)
    .bind(settings.referee_reward_paise)
    .bind(order_id)
    .execute(conn)
    .await?;

    tracing::info!(%referrer_id, %referee_id, %order_id, "referral rewarded");
    Ok(Some(RewardOutcome {
        referrer_id,
        referrer_reward_paise: settings.referrer_reward_paise,
        referee_reward_paise: settings.referee_reward_paise,
    }))
}
