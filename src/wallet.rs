//! Wallet balance and its append-only ledger.
//!
//! Every balance change writes exactly one ledger row carrying the signed
//! amount and the resulting balance, so `sum(ledger) == balance` holds for
//! every wallet. `reconcile` checks that.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::ApiError;
use crate::pricing::Paise;

pub const REASON_ORDER_PAYMENT: &str = "order_payment";
pub const REASON_ORDER_REFUND: &str = "order_refund";
pub const REASON_REFERRAL_REWARD: &str = "referral_reward";
pub const REASON_REFERRAL_SIGNUP: &str = "referral_signup_bonus";
pub const REASON_ADMIN_ADJUSTMENT: &str = "admin_adjustment";

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("insufficient wallet balance: have {balance}, need {requested}")]
    Insufficient { balance: Paise, requested: Paise },
    #[error("db error: {0}")]
    Db(#[from] sqlx::Error),
}

impl From<WalletError> for ApiError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::InvalidAmount => ApiError::validation(e.to_string()),
            WalletError::Insufficient { .. } => ApiError::Conflict("INSUFFICIENT_BALANCE", e.to_string()),
            WalletError::Db(db) => ApiError::db(db),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub user_id: Uuid,
    pub amount_paise: i64,
    pub balance_after_paise: i64,
    pub reason: String,
    pub reference_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Balance after applying signed `delta`, rejecting overdrafts.
pub fn next_balance(balance: Paise, delta: Paise) -> Result<Paise, WalletError> {
    if delta == 0 {
        return Err(WalletError::InvalidAmount);
    }
    let next = balance
        .checked_add(delta)
        .ok_or(WalletError::InvalidAmount)?;
    if next < 0 {
        return Err(WalletError::Insufficient {
            balance,
            requested: -delta,
        });
    }
    Ok(next)
}

pub async fn ensure_wallet(conn: &mut PgConnection, user_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO wallet (user_id, balance_paise)
        VALUES ($1, 0)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Locks the wallet row for the rest of the transaction.
pub async fn balance_for_update(conn: &mut PgConnection, user_id: Uuid) -> Result<Paise, sqlx::Error> {
    ensure_wallet(&mut *conn, user_id).await?;
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT balance_paise FROM wallet WHERE user_id = $1 FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_one(conn)
    .await
}

pub async fn balance(pool: &PgPool, user_id: Uuid) -> Result<Paise, sqlx::Error> {
    let b: Option<i64> = sqlx::query_scalar("SELECT balance_paise FROM wallet WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(b.unwrap_or(0))
}

async fn apply(
    conn: &mut PgConnection,
    user_id: Uuid,
    delta: Paise,
    reason: &str,
    reference_id: Option<Uuid>,
    created_by: Option<Uuid>,
) -> Result<LedgerEntry, WalletError> {
    let current = balance_for_update(&mut *conn, user_id).await?;
    let next = next_balance(current, delta)?;

    sqlx::query(
        r#"
        UPDATE wallet SET balance_paise = $2, updated_at = now()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .bind(next)
    .execute(&mut *conn)
    .await?;

    let entry = sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO wallet_ledger
            (user_id, amount_paise, balance_after_paise, reason, reference_id, created_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING entry_id, user_id, amount_paise, balance_after_paise, reason,
                  reference_id, created_by, created_at
        "#,
    )
    .bind(user_id)
    .bind(delta)
    .bind(next)
    .bind(reason)
    .bind(reference_id)
    .bind(created_by)
    .fetch_one(conn)
    .await?;

    tracing::info!(%user_id, delta, balance = next, reason, "wallet updated");
    Ok(entry)
}

pub async fn credit(
    conn: &mut PgConnection,
    user_id: Uuid,
    amount: Paise,
    reason: &str,
    reference_id: Option<Uuid>,
    created_by: Option<Uuid>,
) -> Result<LedgerEntry, WalletError> {
    if amount <= 0 {
        return Err(WalletError::InvalidAmount);
    }
    apply(conn, user_id, amount, reason, reference_id, created_by).await
}

pub async fn debit(
    conn: &mut PgConnection,
    user_id: Uuid,
    amount: Paise,
    reason: &str,
    reference_id: Option<Uuid>,
    created_by: Option<Uuid>,
) -> Result<LedgerEntry, WalletError> {
    if amount <= 0 {
        return Err(WalletError::InvalidAmount);
    }
    apply(conn, user_id, -amount, reason, reference_id, created_by).await
}

/* -------------------------
   Reconciliation
--------------------------*/

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Drift {
    pub user_id: Uuid,
    pub balance_paise: i64,
    pub ledger_sum_paise: i64,
}

impl Drift {
    pub fn difference(&self) -> i64 {
        self.balance_paise - self.ledger_sum_paise
    }
}

/// Wallets whose stored balance differs from the sum of their ledger.
pub async fn reconcile(pool: &PgPool) -> Result<Vec<Drift>, sqlx::Error> {
    sqlx::query_as::<_, Drift>(
        r#"
        SELECT w.user_id,
               w.balance_paise,
               COALESCE(SUM(l.amount_paise), 0)::BIGINT AS ledger_sum_paise
        FROM wallet w
        LEFT JOIN wallet_ledger l ON l.user_id = w.user_id
        GROUP BY w.user_id, w.balance_paise
        HAVING w.balance_paise <> COALESCE(SUM(l.amount_paise), 0)
        ORDER BY w.user_id
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Resets the balance to the ledger sum. The ledger is the source of truth.
pub async fn fix_drift(pool: &PgPool, drift: &Drift) -> Result<bool, sqlx::Error> {
    if drift.ledger_sum_paise < 0 {
        return Ok(false);
    }
    let res = sqlx::query(
        r#"
        UPDATE wallet SET balance_paise = $2, updated_at = now()
        WHERE user_id = $1 AND balance_paise = $3
        "#,
    )
    .bind(drift.user_id)
    .bind(drift.ledger_sum_paise)
    .bind(drift.balance_paise)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_and_debit_move_balance() {
        assert_eq!(next_balance(100, 50).unwrap(), 150);
        assert_eq!(next_balance(100, -100).unwrap(), 0);
    }

    #[test]
    fn overdraft_is_rejected_with_amounts() {
        match next_balance(100, -101) {
            Err(WalletError::Insufficient { balance, requested }) => {
                assert_eq!(balance, 100);
                assert_eq!(requested, 101);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_and_overflow_are_invalid() {
        assert!(matches!(next_balance(10, 0), Err(WalletError::InvalidAmount)));
        assert!(matches!(next_balance(i64::MAX, 1), Err(WalletError::InvalidAmount)));
    }

    #[test]
    fn drift_difference_is_signed() {
        let d = Drift {
            user_id: Uuid::nil(),
            balance_paise: 900,
            ledger_sum_paise: 1_000,
        };
        assert_eq!(d.difference(), -100);
    }

    #[test]
    fn insufficient_maps_to_conflict() {
        let err: ApiError = WalletError::Insufficient { balance: 0, requested: 1 }.into();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    }
}
