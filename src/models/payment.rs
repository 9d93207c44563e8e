use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MembershipTier;
use crate::schema::payment_history;

text_enum! {
    pub enum PaymentKind {
        Membership => "membership",
        EventRegistration => "event_registration",
        Refund => "refund",
    }
}

text_enum! {
    pub enum LedgerStatus {
        Succeeded => "succeeded",
        Refunded => "refunded",
    }
}

/// Append-only ledger row.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = payment_history)]
pub struct PaymentHistory {
    pub id: Uuid,
    /// `None` once the member has been deleted.
    pub user_id: Option<Uuid>,
    pub kind: PaymentKind,
    pub status: LedgerStatus,
    pub amount_cents: i32,
    pub currency: String,
    pub description: String,
    pub membership_tier: Option<MembershipTier>,
    pub event_id: Option<Uuid>,
    pub registration_id: Option<Uuid>,
    pub processor_session_id: Option<String>,
    pub processor_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = payment_history)]
pub struct NewPaymentHistory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: PaymentKind,
    pub status: LedgerStatus,
    pub amount_cents: i32,
    pub currency: String,
    pub description: String,
    pub membership_tier: Option<MembershipTier>,
    pub event_id: Option<Uuid>,
    pub registration_id: Option<Uuid>,
    pub processor_session_id: Option<String>,
    pub processor_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipCheckoutRequest {
    pub tier: MembershipTier,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPaymentRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

/// Result of applying a paid checkout session.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fulfillment {
    Membership { user: crate::models::User },
    EventRegistration { registration: crate::models::EventRegistration },
    AlreadyProcessed { session_id: String },
}
