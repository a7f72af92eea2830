//! Platform settings stored in `system_config` as JSON values.

use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::PgConnection;

use crate::error::ApiError;
use crate::pricing::DEFAULT_MAX_WALLET_USAGE_PERCENT;

pub const KEY_REFERRER_REWARD: &str = "referrer_reward_paise";
pub const KEY_REFEREE_REWARD: &str = "referee_reward_paise";
pub const KEY_MAX_WALLET_USAGE: &str = "max_wallet_usage_percent";

pub const KNOWN_KEYS: [&str; 3] = [KEY_REFERRER_REWARD, KEY_REFEREE_REWARD, KEY_MAX_WALLET_USAGE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlatformSettings {
    pub referrer_reward_paise: i64,
    pub referee_reward_paise: i64,
    pub max_wallet_usage_percent: u8,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        PlatformSettings {
            referrer_reward_paise: 10_000,
            referee_reward_paise: 5_000,
            max_wallet_usage_percent: DEFAULT_MAX_WALLET_USAGE_PERCENT,
        }
    }
}

fn non_negative_paise(key: &str, value: &JsonValue) -> Result<i64, String> {
    value
        .as_i64()
        .filter(|v| *v >= 0)
        .ok_or_else(|| format!("{key} must be a non-negative integer (paise)"))
}

impl PlatformSettings {
    /// Validates and applies one key. Unknown keys are rejected.
    pub fn apply(&mut self, key: &str, value: &JsonValue) -> Result<(), String> {
        match key {
            KEY_REFERRER_REWARD => self.referrer_reward_paise = non_negative_paise(key, value)?,
            KEY_REFEREE_REWARD => self.referee_reward_paise = non_negative_paise(key, value)?,
            KEY_MAX_WALLET_USAGE => {
                self.max_wallet_usage_percent = value
                    .as_u64()
                    .filter(|v| *v <= 100)
                    .map(|v| v as u8)
                    .ok_or_else(|| format!("{key} must be an integer between 0 and 100"))?;
            }
            other => return Err(format!("unknown config key: {other}")),
        }
        Ok(())
    }

    /// Defaults overlaid with stored values. Invalid stored values are
    /// logged and skipped.
    pub async fn load(conn: &mut PgConnection) -> Result<Self, ApiError> {
        let rows: Vec<(String, JsonValue)> =
            sqlx::query_as("SELECT key, value FROM system_config")
                .fetch_all(conn)
                .await
                .map_err(ApiError::db)?;

        let mut s = PlatformSettings::default();
        for (key, value) in rows {
            if let Err(e) = s.apply(&key, &value) {
                tracing::warn!("ignoring system_config entry: {e}");
            }
        }
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn applies_known_keys() {
        let mut s = PlatformSettings::default();
        s.apply(KEY_REFERRER_REWARD, &json!(25_000)).unwrap();
        s.apply(KEY_MAX_WALLET_USAGE, &json!(40)).unwrap();
        assert_eq!(s.referrer_reward_paise, 25_000);
        assert_eq!(s.max_wallet_usage_percent, 40);
    }

    #[test]
    fn rejects_bad_values_and_keys() {
        let mut s = PlatformSettings::default();
        assert!(s.apply(KEY_REFEREE_REWARD, &json!(-1)).is_err());
        assert!(s.apply(KEY_REFEREE_REWARD, &json!("100")).is_err());
        assert!(s.apply(KEY_MAX_WALLET_USAGE, &json!(101)).is_err());
        assert!(s.apply("theme", &json!("dark")).is_err());
        assert_eq!(s, PlatformSettings::default());
    }

    #[test]
    fn every_known_key_is_accepted() {
        let mut s = PlatformSettings::default();
        for key in KNOWN_KEYS {
            s.apply(key, &json!(10)).unwrap();
        }
    }
}
