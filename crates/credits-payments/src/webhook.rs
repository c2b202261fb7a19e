//! Lemon Squeezy Webhook Handling
//!
//! Webhooks only tell the app that something changed. Crediting still goes
//! through the reconciliation coordinator, so a webhook delivered twice or out
//! of order can never grant credits on its own.

use credits_core::{ProviderOrder, PurchaseId};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::error::{PaymentError, Result};
use crate::orders::OrderResource;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Parsed webhook event
#[derive(Clone, Debug)]
pub enum WebhookEvent {
    /// Order created - a pending purchase may now be reconcilable
    OrderCreated {
        order: ProviderOrder,
        purchase_id: Option<PurchaseId>,
    },

    /// Order refunded - logged for support, credits are not clawed back here
    OrderRefunded { order_id: String },

    /// Unhandled event type
    Other { event_name: String },
}

#[derive(Deserialize)]
struct WebhookDocument {
    meta: WebhookMeta,
    data: Value,
}

#[derive(Deserialize)]
struct WebhookMeta {
    event_name: String,
    #[serde(default)]
    custom_data: Option<Value>,
}

/// Verify `signature` (hex) against the raw `payload`
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(PaymentError::Config("webhook secret is empty".into()));
    }
    let expected = hex::decode(signature.trim())
        .map_err(|e| PaymentError::WebhookSignature(format!("not hex: {e}")))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PaymentError::Config(e.to_string()))?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| PaymentError::WebhookSignature("signature mismatch".into()))
}

/// Verify and parse a webhook delivery
pub fn parse_event(payload: &[u8], signature: &str, secret: &str) -> Result<WebhookEvent> {
    verify_signature(payload, signature, secret)?;

    let document: WebhookDocument = serde_json::from_slice(payload)
        .map_err(|e| PaymentError::WebhookParse(e.to_string()))?;

    let event = match document.meta.event_name.as_str() {
        "order_created" => {
            let resource: OrderResource = serde_json::from_value(document.data)
                .map_err(|e| PaymentError::WebhookParse(format!("order data: {e}")))?;
            let order = resource.into_order(document.meta.custom_data)?;
            let purchase_id = order.purchase_id().map(PurchaseId::from_string);
            WebhookEvent::OrderCreated { order, purchase_id }
        }
        "order_refunded" => {
            let order_id = document
                .data
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| PaymentError::WebhookParse("refund without order id".into()))?
                .to_string();
            WebhookEvent::OrderRefunded { order_id }
        }
        other => WebhookEvent::Other {
            event_name: other.to_string(),
        },
    };

    tracing::info!(event = ?event_kind(&event), "verified provider webhook");
    Ok(event)
}

const fn event_kind(event: &WebhookEvent) -> &'static str {
    match event {
        WebhookEvent::OrderCreated { .. } => "order_created",
        WebhookEvent::OrderRefunded { .. } => "order_refunded",
        WebhookEvent::Other { .. } => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn sign(payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    const ORDER_CREATED: &str = r#"{
        "meta": {"event_name": "order_created", "custom_data": {"purchase_id": "p-77", "credits": 10}},
        "data": {
            "type": "orders",
            "id": "5001",
            "attributes": {
                "status": "paid",
                "user_email": "alice@example.com",
                "created_at": "2026-10-16T10:00:00Z",
                "total": 500
            }
        }
    }"#;

    #[test]
    fn test_order_created_uses_meta_custom_data() {
        let payload = ORDER_CREATED.as_bytes();
        let event = parse_event(payload, &sign(payload), SECRET).unwrap();

        let WebhookEvent::OrderCreated { order, purchase_id } = event else {
            panic!("expected order_created");
        };
        assert_eq!(order.order_id, "5001");
        assert_eq!(purchase_id.unwrap().as_str(), "p-77");
        assert_eq!(order.custom_data.unwrap().credits, Some(10));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let signature = sign(ORDER_CREATED.as_bytes());
        let tampered = ORDER_CREATED.replace("500", "1");
        assert!(matches!(
            parse_event(tampered.as_bytes(), &signature, SECRET),
            Err(PaymentError::WebhookSignature(_))
        ));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        assert!(matches!(
            verify_signature(b"{}", "zz-not-hex", SECRET),
            Err(PaymentError::WebhookSignature(_))
        ));
    }

    #[test]
    fn test_other_events_pass_through() {
        let payload = br#"{"meta": {"event_name": "subscription_created"}, "data": {}}"#;
        let event = parse_event(payload, &sign(payload), SECRET).unwrap();
        assert!(matches!(event, WebhookEvent::Other { event_name } if event_name == "subscription_created"));
    }
}
