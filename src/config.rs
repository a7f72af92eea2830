use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub session_ttl_hours: i64,
    pub otp_ttl_minutes: i64,
    /// Return the OTP in the request response. Never enable outside local dev.
    pub otp_dev_echo: bool,
    pub otp_rate_limit_per_hour: u32,
    pub slot_lock_minutes: i64,
    pub min_patient_age_years: u32,
    pub gateway: GatewayConfig,
    pub partner: PartnerConfig,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// None selects the sandbox gateway.
    pub base_url: Option<String>,
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: String,
}

#[derive(Clone, Debug)]
pub struct PartnerConfig {
    /// None selects the sandbox partner.
    pub base_url: Option<String>,
    pub api_key: String,
    pub secret: String,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_flag(raw: Option<String>) -> bool {
    matches!(
        raw.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let gateway = GatewayConfig {
            base_url: non_empty("GATEWAY_BASE_URL"),
            key_id: non_empty("GATEWAY_KEY_ID").unwrap_or_else(|| "rzp_test_sandbox".to_string()),
            key_secret: non_empty("GATEWAY_KEY_SECRET")
                .unwrap_or_else(|| "sandbox_key_secret".to_string()),
            webhook_secret: non_empty("GATEWAY_WEBHOOK_SECRET")
                .unwrap_or_else(|| "sandbox_webhook_secret".to_string()),
        };
        if gateway.base_url.is_some() && non_empty("GATEWAY_KEY_SECRET").is_none() {
            anyhow::bail!("GATEWAY_KEY_SECRET is required when GATEWAY_BASE_URL is set");
        }

        let partner = PartnerConfig {
            base_url: non_empty("PARTNER_BASE_URL"),
            api_key: non_empty("PARTNER_API_KEY").unwrap_or_default(),
            secret: non_empty("PARTNER_SECRET").unwrap_or_default(),
        };
        if partner.base_url.is_some() && partner.secret.is_empty() {
            anyhow::bail!("PARTNER_SECRET is required when PARTNER_BASE_URL is set");
        }

        Ok(Self {
            database_url,
            bind_addr,
            session_ttl_hours: parse_or("SESSION_TTL_HOURS", 24 * 30),
            otp_ttl_minutes: parse_or("OTP_TTL_MINUTES", 10),
            otp_dev_echo: parse_flag(env::var("OTP_DEV_ECHO").ok()),
            otp_rate_limit_per_hour: parse_or("OTP_RATE_LIMIT_PER_HOUR", 5),
            slot_lock_minutes: parse_or("SLOT_LOCK_MINUTES", 15),
            min_patient_age_years: parse_or("MIN_PATIENT_AGE_YEARS", 5),
            gateway,
            partner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_truthy_spellings() {
        assert!(parse_flag(Some("true".into())));
        assert!(parse_flag(Some("TRUE".into())));
        assert!(parse_flag(Some("1".into())));
        assert!(parse_flag(Some("on".into())));
        assert!(!parse_flag(Some("false".into())));
        assert!(!parse_flag(Some("".into())));
        assert!(!parse_flag(None));
    }

    #[test]
    fn parse_or_falls_back_on_garbage() {
        // SAFETY: test-local variable name, no other test reads it.
        unsafe { env::set_var("DOCNOW_TEST_PARSE_OR", "not-a-number") };
        assert_eq!(parse_or("DOCNOW_TEST_PARSE_OR", 15_i64), 15);
        unsafe { env::set_var("DOCNOW_TEST_PARSE_OR", " 42 ") };
        assert_eq!(parse_or("DOCNOW_TEST_PARSE_OR", 15_i64), 42);
        unsafe { env::remove_var("DOCNOW_TEST_PARSE_OR") };
    }
}
