use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::prelude::*;
use uuid::Uuid;

use super::{find_event, lock_event};
use crate::error::{ApiError, ApiResult};
use crate::models::{
    Event, EventRegistration, Fulfillment, LedgerStatus, MembershipStatus, MembershipTier,
    NewPaymentHistory, Page, Paged, PaymentHistory, PaymentKind, PaymentStatus, RegistrationStatus,
    User,
};
use crate::payments::CheckoutSession;
use crate::schema::{event_registrations, payment_history, users};

pub const META_KIND: &str = "kind";
pub const META_USER: &str = "user_id";
pub const META_TIER: &str = "tier";
pub const META_EVENT: &str = "event_id";
pub const META_REGISTRATION: &str = "registration_id";

fn metadata<'a>(session: &'a CheckoutSession, key: &str) -> ApiResult<&'a str> {
    session
        .metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ApiError::bad_request(format!("Checkout session is missing metadata '{}'", key)))
}

fn metadata_uuid(session: &CheckoutSession, key: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(metadata(session, key)?)
        .map_err(|_| ApiError::bad_request(format!("Checkout session metadata '{}' is not a valid id", key)))
}

/// Validates that the caller has a registration waiting for payment on a paid event.
pub fn prepare_event_checkout(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
) -> ApiResult<(Event, EventRegistration, User)> {
    let event = find_event(conn, event_id)?;
    if event.is_free() {
        return Err(ApiError::bad_request("This event is free; no payment is required"));
    }
    let registration = super::registrations::find_for_user(conn, event_id, user_id)?
        .ok_or_else(|| ApiError::not_found("You have no registration for this event"))?;
    if registration.status != RegistrationStatus::Pending || registration.payment_status != PaymentStatus::Pending {
        return Err(ApiError::bad_request("Registration is not awaiting payment"));
    }
    let user = super::users::get_user(conn, user_id)?;
    Ok((event, registration, user))
}

pub fn attach_session(
    conn: &mut PgConnection,
    registration_id: Uuid,
    session_id: &str,
    now: DateTime<Utc>,
) -> ApiResult<()> {
    diesel::update(event_registrations::table.find(registration_id))
        .set((
            event_registrations::payment_session_id.eq(Some(session_id)),
            event_registrations::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}

fn already_processed(conn: &mut PgConnection, session_id: &str) -> QueryResult<bool> {
    let seen: i64 = payment_history::table
        .filter(payment_history::processor_session_id.eq(session_id))
        .select(count_star())
        .first(conn)?;
    Ok(seen > 0)
}

/// Applies a paid checkout session. Safe to call repeatedly for the same
/// session, from the webhook and the verify fallback alike.
pub fn fulfill(conn: &mut PgConnection, session: &CheckoutSession, now: DateTime<Utc>) -> ApiResult<Fulfillment> {
    if !session.is_paid() {
        return Err(ApiError::bad_request("Checkout session has not been paid"));
    }
    let user_id = metadata_uuid(session, META_USER)?;
    let kind: PaymentKind = metadata(session, META_KIND)?
        .parse()
        .map_err(|_| ApiError::bad_request("Checkout session has an unknown kind"))?;

    conn.transaction(|conn| {
        // Serializes concurrent fulfilment of this member's sessions.
        let user: User = users::table
            .find(user_id)
            .select(User::as_select())
            .for_update()
            .first(conn)
            .optional()?
            .ok_or_else(|| ApiError::not_found("User not found"))?;

        if already_processed(conn, &session.id)? {
            log::info!("Checkout session {} was already fulfilled", session.id);
            return Ok(Fulfillment::AlreadyProcessed { session_id: session.id.clone() });
        }

        match kind {
            PaymentKind::Membership => fulfill_membership(conn, session, user, now),
            PaymentKind::EventRegistration => fulfill_registration(conn, session, user, now),
            PaymentKind::Refund => Err(ApiError::bad_request("Checkout session has an unknown kind")),
        }
    })
}

fn ledger_row(
    session: &CheckoutSession,
    user_id: Uuid,
    kind: PaymentKind,
    fallback_amount: i32,
    fallback_currency: &str,
    description: String,
    now: DateTime<Utc>,
) -> NewPaymentHistory {
    NewPaymentHistory {
        id: Uuid::new_v4(),
        user_id,
        kind,
        status: LedgerStatus::Succeeded,
        amount_cents: session
            .amount_total
            .and_then(|a| i32::try_from(a).ok())
            .unwrap_or(fallback_amount),
        currency: session.currency.clone().unwrap_or_else(|| fallback_currency.to_string()),
        description,
        membership_tier: None,
        event_id: None,
        registration_id: None,
        processor_session_id: Some(session.id.clone()),
        processor_payment_id: session.payment_intent.clone(),
        created_at: now,
    }
}

fn fulfill_membership(
    conn: &mut PgConnection,
    session: &CheckoutSession,
    user: User,
    now: DateTime<Utc>,
) -> ApiResult<Fulfillment> {
    let tier: MembershipTier = metadata(session, META_TIER)?
        .parse()
        .map_err(|_| ApiError::bad_request("Checkout session has an unknown tier"))?;
    let expires_at = tier.extend_expiry(user.membership_expires_at, now);

    let updated = diesel::update(users::table.find(user.id))
        .set((
            users::membership_tier.eq(Some(tier)),
            users::membership_status.eq(MembershipStatus::Active),
            users::membership_expires_at.eq(Some(expires_at)),
            users::payment_customer_id.eq(session.customer.clone().or(user.payment_customer_id)),
            users::updated_at.eq(now),
        ))
        .returning(User::as_returning())
        .get_result(conn)?;

    let mut row = ledger_row(
        session,
        user.id,
        PaymentKind::Membership,
        tier.price_cents(),
        "usd",
        format!("{} membership", tier.display_name()),
        now,
    );
    row.membership_tier = Some(tier);
    diesel::insert_into(payment_history::table).values(&row).execute(conn)?;

    log::info!("Activated {} membership for user {} until {}", tier, user.id, expires_at);
    Ok(Fulfillment::Membership { user: updated })
}

fn fulfill_registration(
    conn: &mut PgConnection,
    session: &CheckoutSession,
    user: User,
    now: DateTime<Utc>,
) -> ApiResult<Fulfillment> {
    let registration_id = metadata_uuid(session, META_REGISTRATION)?;
    let registration: EventRegistration = event_registrations::table
        .find(registration_id)
        .select(EventRegistration::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("Registration not found"))?;
    if registration.user_id != user.id {
        return Err(ApiError::bad_request("Checkout session does not match the registration"));
    }
    let event = lock_event(conn, registration.event_id)?;

    // A registration cancelled while the member was paying keeps its status;
    // the payment is still recorded so it can be refunded.
    let status = match registration.status {
        RegistrationStatus::Pending => RegistrationStatus::Registered,
        other => other,
    };
    let row = {
        let mut row = ledger_row(
            session,
            user.id,
            PaymentKind::EventRegistration,
            event.price_cents,
            &event.currency,
            format!("Registration: {}", event.title),
            now,
        );
        row.event_id = Some(event.id);
        row.registration_id = Some(registration.id);
        row
    };

    let updated = diesel::update(event_registrations::table.find(registration.id))
        .set((
            event_registrations::status.eq(status),
            event_registrations::payment_status.eq(PaymentStatus::Completed),
            event_registrations::amount_paid_cents.eq(row.amount_cents),
            event_registrations::payment_session_id.eq(Some(session.id.as_str())),
            event_registrations::payment_intent_id.eq(session.payment_intent.as_deref()),
            event_registrations::updated_at.eq(now),
        ))
        .returning(EventRegistration::as_returning())
        .get_result(conn)?;
    diesel::insert_into(payment_history::table).values(&row).execute(conn)?;

    log::info!("Payment completed for registration {} (event {})", registration.id, event.id);
    Ok(Fulfillment::EventRegistration { registration: updated })
}

pub fn history(conn: &mut PgConnection, user_id: Uuid) -> ApiResult<Vec<PaymentHistory>> {
    let rows = payment_history::table
        .filter(payment_history::user_id.eq(user_id))
        .order(payment_history::created_at.desc())
        .select(PaymentHistory::as_select())
        .load(conn)?;
    Ok(rows)
}

pub fn ledger(conn: &mut PgConnection, page: &Page) -> ApiResult<Paged<PaymentHistory>> {
    let total: i64 = payment_history::table.select(count_star()).first(conn)?;
    let items = payment_history::table
        .order(payment_history::created_at.desc())
        .limit(page.limit())
        .offset(page.offset())
        .select(PaymentHistory::as_select())
        .load(conn)?;
    Ok(Paged::new(items, total, page))
}
