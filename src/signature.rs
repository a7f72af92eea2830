//! HMAC-SHA256 checksums shared by the payment gateway (callback and
//! webhook signatures) and the diagnostics partner (request checksums).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, new_from_slice cannot fail here.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of a hex signature against `payload`.
pub fn verify(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Payload signed by the gateway after checkout: `"{order_id}|{payment_id}"`.
pub fn payment_payload(gateway_order_id: &str, gateway_payment_id: &str) -> String {
    format!("{gateway_order_id}|{gateway_payment_id}")
}

pub fn verify_payment(
    key_secret: &str,
    gateway_order_id: &str,
    gateway_payment_id: &str,
    signature_hex: &str,
) -> bool {
    let payload = payment_payload(gateway_order_id, gateway_payment_id);
    verify(key_secret, payload.as_bytes(), signature_hex)
}

/// Webhooks sign the raw request body.
pub fn verify_webhook(webhook_secret: &str, body: &[u8], signature_hex: &str) -> bool {
    verify(webhook_secret, body, signature_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_rfc4231_case_2() {
        let sig = sign("Jefe", b"what do ya want for nothing?");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn payment_signature_verifies_only_for_same_ids() {
        let sig = sign("key_secret", payment_payload("order_A", "pay_B").as_bytes());
        assert!(verify_payment("key_secret", "order_A", "pay_B", &sig));
        assert!(!verify_payment("key_secret", "order_A", "pay_C", &sig));
        assert!(!verify_payment("other_secret", "order_A", "pay_B", &sig));
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert!(!verify("k", b"body", "zz-not-hex"));
        assert!(!verify("k", b"body", ""));
    }

    #[test]
    fn uppercase_hex_is_accepted() {
        let sig = sign("whsec", b"{\"event\":\"payment.captured\"}").to_uppercase();
        assert!(verify_webhook("whsec", b"{\"event\":\"payment.captured\"}", &sig));
    }
}
