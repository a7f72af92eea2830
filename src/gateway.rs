//! Payment gateway order creation. Signature checks live in `signature`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{config::GatewayConfig, error::ApiError};

pub const CURRENCY: &str = "INR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("payment gateway unreachable: {0}")]
    Transport(String),
    #[error("payment gateway rejected order: {0}")]
    Rejected(String),
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError::BadGateway("GATEWAY_ERROR", e.to_string())
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Public key handed to the client-side checkout widget.
    fn key_id(&self) -> &str;

    async fn create_order(&self, amount_paise: i64, receipt: &str) -> Result<GatewayOrder, GatewayError>;
}

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
    payment_capture: u8,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: GatewayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    description: String,
}

pub struct RazorpayGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl RazorpayGateway {
    pub fn new(base_url: String, cfg: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key_id: cfg.key_id.clone(),
            key_secret: cfg.key_secret.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn create_order(&self, amount_paise: i64, receipt: &str) -> Result<GatewayOrder, GatewayError> {
        let resp = self
            .client
            .post(format!("{}/v1/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&CreateOrderBody {
                amount: amount_paise,
                currency: CURRENCY,
                receipt,
                payment_capture: 1,
            })
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp
                .json::<GatewayErrorBody>()
                .await
                .map(|b| b.error.description)
                .unwrap_or_else(|_| format!("HTTP {status}"));
            return Err(if status.is_server_error() {
                GatewayError::Transport(detail)
            } else {
                GatewayError::Rejected(detail)
            });
        }

        resp.json::<GatewayOrder>()
            .await
            .map_err(|e| GatewayError::Transport(format!("bad response: {e}")))
    }
}

/// Issues local order ids. Clients sign payments with the configured key
/// secret, so verification runs the same code path as production.
pub struct SandboxGateway {
    key_id: String,
}

impl SandboxGateway {
    pub fn new(cfg: &GatewayConfig) -> Self {
        Self {
            key_id: cfg.key_id.clone(),
        }
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn create_order(&self, amount_paise: i64, _receipt: &str) -> Result<GatewayOrder, GatewayError> {
        if amount_paise <= 0 {
            return Err(GatewayError::Rejected("amount must be positive".into()));
        }
        Ok(GatewayOrder {
            id: format!("order_sbx_{}", Uuid::new_v4().simple()),
            amount: amount_paise,
            currency: CURRENCY.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> GatewayConfig {
        GatewayConfig {
            base_url: None,
            key_id: "rzp_test_x".into(),
            key_secret: "secret".into(),
            webhook_secret: "whsec".into(),
        }
    }

    #[tokio::test]
    async fn sandbox_issues_unique_orders() {
        let gw = SandboxGateway::new(&cfg());
        let a = gw.create_order(49_900, "r1").await.unwrap();
        let b = gw.create_order(49_900, "r1").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.amount, 49_900);
        assert_eq!(a.currency, "INR");
        assert_eq!(gw.key_id(), "rzp_test_x");
    }

    #[tokio::test]
    async fn sandbox_rejects_zero_amount() {
        let gw = SandboxGateway::new(&cfg());
        assert!(matches!(gw.create_order(0, "r").await, Err(GatewayError::Rejected(_))));
    }
}
