// src/routes/payment_routes.rs

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    checkout::{self, InitiateRequest, InitiateResult, OrderRow, Quote},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, OkResponse},
    settings::PlatformSettings,
    signature,
};

pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-razorpay-signature";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payments/quote", post(quote))
        .route("/payments/initiate", post(initiate))
        .route("/payments/verify", post(verify))
        .route("/payments/failed", post(failed))
        .route("/payments/webhook", post(webhook))
}

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub promo_code: Option<String>,
    #[serde(default)]
    pub use_wallet: bool,
}

/// Price breakdown for the current cart. Reserves nothing; lapsed holds
/// are returned first so the wallet figure is current.
pub async fn quote(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<QuoteRequest>,
) -> Result<Json<ApiOk<Quote>>, ApiError> {
    checkout::abandon_stale_orders(&state, auth.user_id).await?;
    let mut conn = state.db.acquire().await?;
    let settings = PlatformSettings::load(&mut conn).await?;
    let q = checkout::quote(
        &mut conn,
        auth.user_id,
        req.promo_code.as_deref(),
        req.use_wallet,
        &settings,
    )
    .await?;
    Ok(Json(ApiOk::new(q)))
}

pub async fn initiate(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<InitiateRequest>,
) -> Result<Json<ApiOk<InitiateResult>>, ApiError> {
    let result = checkout::initiate(&state, auth.user_id, &req).await?;
    Ok(Json(ApiOk::new(result)))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub order_id: Uuid,
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentOutcome {
    pub order: OrderRow,
    /// False when this payment had already been recorded.
    pub newly_paid: bool,
}

fn invalid_signature() -> ApiError {
    ApiError::BadRequest("INVALID_SIGNATURE", "payment signature is invalid".into())
}

/// Checks the checkout signature, records the payment and places the
/// partner booking. Safe to retry.
pub async fn verify(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<ApiOk<PaymentOutcome>>, ApiError> {
    let gw_order = req.gateway_order_id.trim();
    let gw_payment = req.gateway_payment_id.trim();
    if gw_order.is_empty() || gw_payment.is_empty() {
        return Err(ApiError::validation("gateway ids are required"));
    }
    if !signature::verify_payment(&state.config.gateway.key_secret, gw_order, gw_payment, &req.signature) {
        tracing::warn!(order_id = %req.order_id, "payment verify with bad signature");
        return Err(invalid_signature());
    }

    let (paid, newly_paid) =
        checkout::mark_paid(&state, req.order_id, Some(auth.user_id), Some((gw_order, gw_payment))).await?;
    if newly_paid {
        tracing::info!(order_id = %paid.order_id, payment_id = gw_payment, "payment verified");
    }
    let order = checkout::finalize_booking(&state, paid.order_id).await?;
    Ok(Json(ApiOk::new(PaymentOutcome { order, newly_paid })))
}

#[derive(Debug, Deserialize)]
pub struct FailedRequest {
    pub order_id: Uuid,
    pub reason: Option<String>,
}

/// Client-reported checkout failure or dismissal.
pub async fn failed(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<FailedRequest>,
) -> Result<Json<ApiOk<OrderRow>>, ApiError> {
    let reason = req
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("payment failed");
    let reason: String = reason.chars().take(500).collect();
    let order = checkout::fail_payment(&state, req.order_id, Some(auth.user_id), &reason).await?;
    Ok(Json(ApiOk::new(order)))
}

/* -------------------------
   Webhook
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<WebhookPaymentWrapper>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPaymentWrapper {
    pub entity: WebhookPayment,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayment {
    pub id: String,
    pub order_id: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAction {
    Captured,
    Failed,
    Ignore,
}

impl WebhookAction {
    pub fn for_event(event: &str) -> Self {
        match event {
            "payment.captured" | "order.paid" => WebhookAction::Captured,
            "payment.failed" => WebhookAction::Failed,
            _ => WebhookAction::Ignore,
        }
    }
}

/// Gateway callback. The signature is checked before anything touches the
/// database. Conflicts are acknowledged so the gateway stops retrying;
/// internal errors are not.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>, ApiError> {
    let sig = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(invalid_signature)?;
    if !signature::verify_webhook(&state.config.gateway.webhook_secret, &body, sig) {
        tracing::warn!("webhook rejected: bad signature");
        return Err(invalid_signature());
    }

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::validation(format!("malformed webhook body: {e}")))?;
    let action = WebhookAction::for_event(&event.event);
    let payment = match (action, event.payload.payment) {
        (WebhookAction::Ignore, _) | (_, None) => {
            tracing::debug!(event = %event.event, "webhook ignored");
            return Ok(Json(OkResponse::ok()));
        }
        (_, Some(p)) => p.entity,
    };
    let Some(gw_order) = payment.order_id.as_deref() else {
        tracing::warn!(payment_id = %payment.id, "webhook payment without order id");
        return Ok(Json(OkResponse::ok()));
    };

    let order_id: Option<Uuid> =
        sqlx::query_scalar("SELECT order_id FROM booking_order WHERE gateway_order_id = $1")
            .bind(gw_order)
            .fetch_optional(&state.db)
            .await?;
    let Some(order_id) = order_id else {
        tracing::warn!(gateway_order_id = gw_order, "webhook for unknown order");
        return Ok(Json(OkResponse::ok()));
    };

    let outcome = match action {
        WebhookAction::Captured => {
            match checkout::mark_paid(&state, order_id, None, Some((gw_order, payment.id.as_str()))).await {
                Ok(_) => checkout::finalize_booking(&state, order_id).await.map(|_| ()),
                Err(e) => Err(e),
            }
        }
        WebhookAction::Failed => {
            // The customer may retry on the same gateway order; the order
            // stays open until its slot lock lapses or the client gives up.
            let reason = payment
                .error_description
                .as_deref()
                .unwrap_or("payment failed at gateway");
            checkout::note_payment_attempt_failed(&state, order_id, reason)
                .await
                .map(|noted| {
                    if noted {
                        tracing::info!(%order_id, payment_id = %payment.id, "payment attempt failed");
                    }
                })
        }
        WebhookAction::Ignore => Ok(()),
    };

    match outcome {
        Ok(()) => {
            tracing::info!(%order_id, event = %event.event, "webhook processed");
            Ok(Json(OkResponse::ok()))
        }
        Err(e @ ApiError::Internal(_)) => Err(e),
        Err(e) => {
            tracing::warn!(%order_id, event = %event.event, code = e.code(), "webhook not applied");
            Ok(Json(OkResponse::ok()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_events_map_to_actions() {
        assert_eq!(WebhookAction::for_event("payment.captured"), WebhookAction::Captured);
        assert_eq!(WebhookAction::for_event("order.paid"), WebhookAction::Captured);
        assert_eq!(WebhookAction::for_event("payment.failed"), WebhookAction::Failed);
        assert_eq!(WebhookAction::for_event("refund.created"), WebhookAction::Ignore);
    }

    #[test]
    fn webhook_body_parses_payment_entity() {
        let body = r#"{
            "event": "payment.captured",
            "payload": {"payment": {"entity": {"id": "pay_1", "order_id": "order_9", "amount": 500}}}
        }"#;
        let e: WebhookEvent = serde_json::from_str(body).unwrap();
        let p = e.payload.payment.unwrap().entity;
        assert_eq!(p.id, "pay_1");
        assert_eq!(p.order_id.as_deref(), Some("order_9"));
    }

    #[test]
    fn webhook_without_payload_is_accepted() {
        let e: WebhookEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(e.payload.payment.is_none());
    }
}
