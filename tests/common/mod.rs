#![allow(dead_code)]

use docnow_server::config::{Config, GatewayConfig, PartnerConfig};

pub const KEY_SECRET: &str = "test_key_secret";
pub const WEBHOOK_SECRET: &str = "test_webhook_secret";

/// Sandbox partner and gateway, fixed test secrets.
pub fn test_config(database_url: &str) -> Config {
    Config {
        database_url: database_url.to_string(),
        bind_addr: "127.0.0.1:0".into(),
        session_ttl_hours: 24,
        otp_ttl_minutes: 10,
        otp_dev_echo: false,
        otp_rate_limit_per_hour: 5,
        slot_lock_minutes: 15,
        min_patient_age_years: 5,
        gateway: GatewayConfig {
            base_url: None,
            key_id: "rzp_test".into(),
            key_secret: KEY_SECRET.into(),
            webhook_secret: WEBHOOK_SECRET.into(),
        },
        partner: PartnerConfig {
            base_url: None,
            api_key: String::new(),
            secret: String::new(),
        },
    }
}
