//! Hosted-checkout payment processing.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

mod stripe;
pub mod webhook;

pub use stripe::StripeClient;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payments are not configured")]
    NotConfigured,

    #[error("request to payment processor failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("payment processor returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Checkout session as reported by the processor.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub payment_status: String,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub customer: Option<String>,
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Refund {
    pub id: String,
    pub status: Option<String>,
    pub amount: Option<i64>,
}

/// One line, one quantity: memberships and event tickets are both sold this way.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub product_name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub customer_email: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: Vec<(String, String)>,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession, PaymentError>;

    async fn retrieve_checkout(&self, session_id: &str) -> Result<CheckoutSession, PaymentError>;

    async fn refund(&self, payment_intent_id: &str, amount_cents: i64) -> Result<Refund, PaymentError>;
}
