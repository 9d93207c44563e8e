use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{CheckoutRequest, CheckoutSession, PaymentError, PaymentProcessor, Refund};
use crate::config::PaymentConfig;

/// Stripe-compatible REST client (form-encoded requests, bearer key).
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    api_base: String,
    secret_key: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

impl StripeClient {
    pub fn new(config: &PaymentConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
        }
    }

    fn key(&self) -> Result<&str, PaymentError> {
        self.secret_key.as_deref().ok_or(PaymentError::NotConfigured)
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, PaymentError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|b| b.error.message)
            .unwrap_or(text);
        log::warn!("Payment processor returned {}: {}", status, message);
        Err(PaymentError::Api { status: status.as_u16(), message })
    }

    async fn post_form<T: DeserializeOwned>(&self, path: &str, form: &[(String, String)]) -> Result<T, PaymentError> {
        let url = format!("{}{}", self.api_base, path);
        let resp = self.http.post(&url).bearer_auth(self.key()?).form(form).send().await?;
        Self::decode(resp).await
    }
}

pub(crate) fn checkout_form(request: &CheckoutRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
        ("customer_email".to_string(), request.customer_email.clone()),
        ("line_items[0][quantity]".to_string(), "1".to_string()),
        ("line_items[0][price_data][currency]".to_string(), request.currency.clone()),
        ("line_items[0][price_data][unit_amount]".to_string(), request.amount_cents.to_string()),
        ("line_items[0][price_data][product_data][name]".to_string(), request.product_name.clone()),
    ];
    for (key, value) in &request.metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
    form
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession, PaymentError> {
        let session: CheckoutSession = self.post_form("/v1/checkout/sessions", &checkout_form(request)).await?;
        log::info!("Created checkout session {}", session.id);
        Ok(session)
    }

    async fn retrieve_checkout(&self, session_id: &str) -> Result<CheckoutSession, PaymentError> {
        let url = format!("{}/v1/checkout/sessions/{}", self.api_base, session_id);
        let resp = self.http.get(&url).bearer_auth(self.key()?).send().await?;
        Self::decode(resp).await
    }

    async fn refund(&self, payment_intent_id: &str, amount_cents: i64) -> Result<Refund, PaymentError> {
        let form = vec![
            ("payment_intent".to_string(), payment_intent_id.to_string()),
            ("amount".to_string(), amount_cents.to_string()),
        ];
        let refund: Refund = self.post_form("/v1/refunds", &form).await?;
        log::info!("Issued refund {} for {}", refund.id, payment_intent_id);
        Ok(refund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_form_carries_line_item_and_metadata() {
        let request = CheckoutRequest {
            product_name: "Growth membership".to_string(),
            amount_cents: 9_900,
            currency: "usd".to_string(),
            customer_email: "ada@example.org".to_string(),
            success_url: "http://localhost:3000/ok".to_string(),
            cancel_url: "http://localhost:3000/cancel".to_string(),
            metadata: vec![("kind".to_string(), "membership".to_string())],
        };
        let form = checkout_form(&request);
        let get = |k: &str| form.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("mode"), Some("payment"));
        assert_eq!(get("line_items[0][price_data][unit_amount]"), Some("9900"));
        assert_eq!(get("metadata[kind]"), Some("membership"));
    }

    #[actix_web::test]
    async fn missing_key_is_reported_before_any_request() {
        let client = StripeClient::new(&PaymentConfig {
            api_base: "http://127.0.0.1:9".to_string(),
            secret_key: None,
            webhook_secret: None,
            frontend_url: "http://localhost:3000".to_string(),
        });
        let err = client.retrieve_checkout("cs_test").await.unwrap_err();
        assert!(matches!(err, PaymentError::NotConfigured));
    }
}
