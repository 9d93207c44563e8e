use chrono::{DateTime, Utc};
use diesel::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::event_registrations;

text_enum! {
    pub enum RegistrationStatus {
        Pending => "pending",
        Registered => "registered",
        Attended => "attended",
        Cancelled => "cancelled",
    }
}

text_enum! {
    pub enum RegistrationType {
        Direct => "direct",
        Waitlist => "waitlist",
    }
}

text_enum! {
    pub enum PaymentStatus {
        NotRequired => "not_required",
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        Refunded => "refunded",
    }
}

impl RegistrationStatus {
    /// Statuses that hold a seat and count as the member's live registration.
    pub const LIVE: [RegistrationStatus; 3] = [
        RegistrationStatus::Pending,
        RegistrationStatus::Registered,
        RegistrationStatus::Attended,
    ];

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }
}

pub const CONFIRMATION_CODE_LEN: usize = 8;
const CONFIRMATION_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn generate_confirmation_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CONFIRMATION_CODE_LEN)
        .map(|_| CONFIRMATION_ALPHABET[rng.gen_range(0..CONFIRMATION_ALPHABET.len())] as char)
        .collect()
}

pub fn normalize_confirmation_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = event_registrations)]
pub struct EventRegistration {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub status: RegistrationStatus,
    pub registration_type: RegistrationType,
    pub confirmation_code: String,
    pub payment_status: PaymentStatus,
    pub amount_paid_cents: i32,
    #[serde(skip_serializing)]
    pub payment_session_id: Option<String>,
    #[serde(skip_serializing)]
    pub payment_intent_id: Option<String>,
    #[serde(skip_serializing)]
    pub refund_id: Option<String>,
    pub refund_amount_cents: Option<i32>,
    pub checked_in: bool,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub checked_in_by: Option<Uuid>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = event_registrations)]
pub struct NewEventRegistration {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub status: RegistrationStatus,
    pub registration_type: RegistrationType,
    pub confirmation_code: String,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewEventRegistration {
    /// Free events are confirmed immediately; paid ones wait for payment.
    pub fn initial_state(is_free: bool) -> (RegistrationStatus, PaymentStatus) {
        if is_free {
            (RegistrationStatus::Registered, PaymentStatus::NotRequired)
        } else {
            (RegistrationStatus::Pending, PaymentStatus::Pending)
        }
    }
}

/// A refund that has been approved locally and still has to be issued with
/// the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundPlan {
    pub registration_id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub payment_intent_id: Option<String>,
    pub amount_cents: i32,
    pub currency: String,
}

#[derive(Debug)]
pub struct CancelledRegistration {
    pub registration: EventRegistration,
    pub refund: Option<RefundPlan>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckInRequest {
    pub confirmation_code: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RegisterOutcome {
    Registered { registration: EventRegistration },
    Waitlisted { waitlist: crate::models::WaitlistEntry },
}

/// Attendee row for admin listings.
#[derive(Debug, Serialize)]
pub struct Attendee {
    #[serde(flatten)]
    pub registration: EventRegistration,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

/// A member's registration together with a short event summary.
#[derive(Debug, Serialize)]
pub struct MyRegistration {
    #[serde(flatten)]
    pub registration: EventRegistration,
    pub event_title: String,
    pub event_slug: String,
    pub event_start_date: DateTime<Utc>,
    pub event_status: crate::models::EventStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_codes_are_eight_uppercase_alphanumerics() {
        for _ in 0..200 {
            let code = generate_confirmation_code();
            assert_eq!(code.len(), CONFIRMATION_CODE_LEN);
            assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn codes_are_matched_case_insensitively() {
        assert_eq!(normalize_confirmation_code(" ab12cd34 "), "AB12CD34");
    }

    #[test]
    fn paid_events_start_pending() {
        assert_eq!(
            NewEventRegistration::initial_state(false),
            (RegistrationStatus::Pending, PaymentStatus::Pending)
        );
        assert_eq!(
            NewEventRegistration::initial_state(true),
            (RegistrationStatus::Registered, PaymentStatus::NotRequired)
        );
    }

    #[test]
    fn cancelled_is_not_live() {
        assert!(RegistrationStatus::Attended.is_live());
        assert!(!RegistrationStatus::Cancelled.is_live());
    }
}
