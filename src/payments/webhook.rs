//! Processor webhook verification.
//!
//! The signature header looks like `t=1700000000,v1=<hex>`, where each `v1` is
//! an HMAC-SHA256 of `"{t}.{payload}"` under the endpoint secret.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use super::CheckoutSession;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";
pub const TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq)]
pub enum WebhookError {
    #[error("missing or malformed signature header")]
    MalformedHeader,

    #[error("signature timestamp outside tolerance")]
    Stale,

    #[error("signature mismatch")]
    Mismatch,

    #[error("invalid webhook payload")]
    Payload,
}

fn parse_header(header: &str) -> Result<(i64, Vec<Vec<u8>>), WebhookError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }
    match timestamp {
        Some(t) if !signatures.is_empty() => Ok((t, signatures)),
        _ => Err(WebhookError::MalformedHeader),
    }
}

fn signed_payload_mac(payload: &[u8], secret: &str, timestamp: i64) -> Result<HmacSha256, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::Mismatch)?;
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    Ok(mac)
}

/// Builds a signature header the way the processor does.
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, WebhookError> {
    let mac = signed_payload_mac(payload, secret, timestamp)?;
    Ok(format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes())))
}

pub fn verify(payload: &[u8], header: &str, secret: &str, now: i64) -> Result<(), WebhookError> {
    let (timestamp, signatures) = parse_header(header)?;
    if (now - timestamp).abs() > TOLERANCE_SECS {
        return Err(WebhookError::Stale);
    }

    let mac = signed_payload_mac(payload, secret, timestamp)?;
    if signatures.iter().any(|sig| mac.clone().verify_slice(sig).is_ok()) {
        Ok(())
    } else {
        Err(WebhookError::Mismatch)
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

impl WebhookEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, WebhookError> {
        serde_json::from_slice(payload).map_err(|_| WebhookError::Payload)
    }

    /// The paid checkout session carried by a `checkout.session.completed`
    /// event, if this is one.
    pub fn paid_checkout(&self) -> Result<Option<CheckoutSession>, WebhookError> {
        if self.kind != CHECKOUT_COMPLETED {
            return Ok(None);
        }
        let session: CheckoutSession =
            serde_json::from_value(self.data.object.clone()).map_err(|_| WebhookError::Payload)?;
        Ok(session.is_paid().then_some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn valid_signature_passes() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, SECRET, 1_700_000_000).unwrap();
        assert_eq!(verify(payload, &header, SECRET, 1_700_000_100), Ok(()));
    }

    #[test]
    fn tampered_payload_fails() {
        let header = sign(br#"{"id":"evt_1"}"#, SECRET, 1_700_000_000).unwrap();
        assert_eq!(
            verify(br#"{"id":"evt_2"}"#, &header, SECRET, 1_700_000_000),
            Err(WebhookError::Mismatch)
        );
    }

    #[test]
    fn old_signatures_are_stale() {
        let payload = b"{}";
        let header = sign(payload, SECRET, 1_700_000_000).unwrap();
        assert_eq!(
            verify(payload, &header, SECRET, 1_700_000_000 + TOLERANCE_SECS + 1),
            Err(WebhookError::Stale)
        );
    }

    #[test]
    fn any_matching_v1_is_accepted() {
        let payload = b"{}";
        let good = sign(payload, SECRET, 42).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t=42,v1={},v1={}", "00".repeat(32), good_sig);
        assert_eq!(verify(payload, &header, SECRET, 42), Ok(()));
    }

    #[test]
    fn garbage_header_is_malformed() {
        assert_eq!(verify(b"{}", "nonsense", SECRET, 0), Err(WebhookError::MalformedHeader));
    }

    #[test]
    fn only_paid_completed_sessions_are_extracted() {
        let paid = br#"{"id":"evt_1","type":"checkout.session.completed","data":{"object":{
            "id":"cs_1","url":null,"payment_status":"paid","amount_total":2900,"currency":"usd",
            "customer":"cus_1","payment_intent":"pi_1","metadata":{"kind":"membership"}}}}"#;
        let event = WebhookEvent::parse(paid).unwrap();
        let session = event.paid_checkout().unwrap().unwrap();
        assert_eq!(session.id, "cs_1");
        assert_eq!(session.metadata.get("kind").map(String::as_str), Some("membership"));

        let other = br#"{"id":"evt_2","type":"invoice.paid","data":{"object":{}}}"#;
        assert!(WebhookEvent::parse(other).unwrap().paid_checkout().unwrap().is_none());
    }
}
