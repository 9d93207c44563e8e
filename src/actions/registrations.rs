use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::waitlist::{enqueue, expire_stale_offers, fill_free_seats};
use super::{count_waitlist, lock_event, seats_taken, Transition};
use crate::error::{ApiError, ApiResult};
use crate::models::{
    generate_confirmation_code, normalize_confirmation_code, Attendee, CancelledRegistration, Event,
    EventRegistration, LedgerStatus, MyRegistration, NewEventRegistration, NewPaymentHistory,
    PaymentKind, PaymentStatus, RefundPlan, RegisterOutcome, RegistrationStatus, RegistrationType,
    SeatDecision, WaitlistStatus,
};
use crate::schema::{event_registrations, event_waitlist, events, payment_history, users};

pub(crate) fn find_for_user(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
) -> QueryResult<Option<EventRegistration>> {
    event_registrations::table
        .filter(event_registrations::event_id.eq(event_id))
        .filter(event_registrations::user_id.eq(user_id))
        .select(EventRegistration::as_select())
        .first(conn)
        .optional()
}

/// Inserts a registration, or revives the user's cancelled one with a fresh
/// confirmation code. The event row must already be locked.
pub(crate) fn create_or_reactivate(
    conn: &mut PgConnection,
    event: &Event,
    user_id: Uuid,
    registration_type: RegistrationType,
    now: DateTime<Utc>,
) -> ApiResult<EventRegistration> {
    let (status, payment_status) = NewEventRegistration::initial_state(event.is_free());
    let code = generate_confirmation_code();

    let registration = match find_for_user(conn, event.id, user_id)? {
        Some(existing) if existing.status.is_live() => {
            return Err(ApiError::conflict("You are already registered for this event"));
        }
        Some(existing) => diesel::update(event_registrations::table.find(existing.id))
            .set((
                event_registrations::status.eq(status),
                event_registrations::registration_type.eq(registration_type),
                event_registrations::confirmation_code.eq(&code),
                event_registrations::payment_status.eq(payment_status),
                event_registrations::amount_paid_cents.eq(0),
                event_registrations::payment_session_id.eq(None::<String>),
                event_registrations::payment_intent_id.eq(None::<String>),
                event_registrations::refund_id.eq(None::<String>),
                event_registrations::refund_amount_cents.eq(None::<i32>),
                event_registrations::checked_in.eq(false),
                event_registrations::checked_in_at.eq(None::<DateTime<Utc>>),
                event_registrations::checked_in_by.eq(None::<Uuid>),
                event_registrations::cancelled_at.eq(None::<DateTime<Utc>>),
                event_registrations::updated_at.eq(now),
            ))
            .returning(EventRegistration::as_returning())
            .get_result(conn)?,
        None => diesel::insert_into(event_registrations::table)
            .values(&NewEventRegistration {
                id: Uuid::new_v4(),
                event_id: event.id,
                user_id,
                status,
                registration_type,
                confirmation_code: code,
                payment_status,
                created_at: now,
                updated_at: now,
            })
            .returning(EventRegistration::as_returning())
            .get_result(conn)?,
    };

    log::info!(
        "User {} registered for event {} ({}, {})",
        user_id,
        event.id,
        registration.registration_type,
        registration.status
    );
    Ok(registration)
}

/// Registers the user, or queues them when the event is full and has a waitlist.
pub fn register(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<Transition<RegisterOutcome>> {
    conn.transaction(|conn| {
        let event = lock_event(conn, event_id)?;
        event.ensure_registration_open(now)?;

        if event.members_only {
            let user = super::users::get_user(conn, user_id)?;
            if !user.is_admin() && !user.has_active_membership(now) {
                return Err(ApiError::forbidden("This event is open to active members only"));
            }
        }

        let offers = expire_stale_offers(conn, &event, now)?;

        if find_for_user(conn, event_id, user_id)?.map_or(false, |r| r.status.is_live()) {
            return Err(ApiError::conflict("You are already registered for this event"));
        }
        let on_waitlist: Option<WaitlistStatus> = event_waitlist::table
            .filter(event_waitlist::event_id.eq(event_id))
            .filter(event_waitlist::user_id.eq(user_id))
            .select(event_waitlist::status)
            .first(conn)
            .optional()?;
        if on_waitlist.map_or(false, |s| s.is_live()) {
            return Err(ApiError::conflict("You are already on the waitlist for this event"));
        }

        let taken = seats_taken(conn, event_id)?;
        let outstanding = count_waitlist(conn, event_id, WaitlistStatus::Offered)?;
        let outcome = match event.seat_decision(taken, outstanding) {
            SeatDecision::Available => RegisterOutcome::Registered {
                registration: create_or_reactivate(conn, &event, user_id, RegistrationType::Direct, now)?,
            },
            SeatDecision::Waitlist => RegisterOutcome::Waitlisted {
                waitlist: enqueue(conn, &event, user_id, now)?,
            },
            SeatDecision::Full => return Err(ApiError::bad_request("Event is full")),
        };
        Ok(Transition::new(outcome, offers))
    })
}

/// Cancels the caller's registration and hands the seat to the waitlist.
///
/// A paid registration yields a [`RefundPlan`] when the refund policy allows
/// one at `now`; issuing it is left to the caller.
pub fn cancel(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<Transition<CancelledRegistration>> {
    conn.transaction(|conn| {
        let event = lock_event(conn, event_id)?;
        let registration = find_for_user(conn, event_id, user_id)?
            .filter(|r| r.status != RegistrationStatus::Cancelled)
            .ok_or_else(|| ApiError::not_found("You have no active registration for this event"))?;
        if registration.status == RegistrationStatus::Attended {
            return Err(ApiError::bad_request("Cannot cancel a registration after check-in"));
        }

        let refund = if registration.payment_status == PaymentStatus::Completed
            && registration.amount_paid_cents > 0
        {
            match event.refund_quote(now, registration.amount_paid_cents) {
                Ok(amount) if amount > 0 => Some(RefundPlan {
                    registration_id: registration.id,
                    event_id,
                    user_id,
                    payment_intent_id: registration.payment_intent_id.clone(),
                    amount_cents: amount,
                    currency: event.currency.clone(),
                }),
                Ok(_) => None,
                Err(reason) => {
                    log::info!("No refund for registration {}: {}", registration.id, reason);
                    None
                }
            }
        } else {
            None
        };

        let cancelled = diesel::update(event_registrations::table.find(registration.id))
            .set((
                event_registrations::status.eq(RegistrationStatus::Cancelled),
                event_registrations::cancelled_at.eq(Some(now)),
                event_registrations::updated_at.eq(now),
            ))
            .returning(EventRegistration::as_returning())
            .get_result(conn)?;

        let offers = fill_free_seats(conn, &event, now)?;
        log::info!("User {} cancelled registration for event {}", user_id, event_id);
        Ok(Transition::new(CancelledRegistration { registration: cancelled, refund }, offers))
    })
}

fn refundable(registration: &EventRegistration) -> ApiResult<()> {
    if registration.status == RegistrationStatus::Attended || registration.checked_in {
        return Err(ApiError::bad_request("Cannot refund a registration after check-in"));
    }
    if registration.payment_status != PaymentStatus::Completed || registration.amount_paid_cents <= 0 {
        return Err(ApiError::bad_request("There is no completed payment to refund"));
    }
    if registration.payment_intent_id.is_none() {
        return Err(ApiError::bad_request("Payment reference is missing; the refund cannot be issued"));
    }
    Ok(())
}

/// Checks a member-initiated refund against the event's policy and deadline.
pub fn prepare_refund(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<RefundPlan> {
    let event = super::find_event(conn, event_id)?;
    let registration = find_for_user(conn, event_id, user_id)?
        .ok_or_else(|| ApiError::not_found("You have no registration for this event"))?;
    refundable(&registration)?;

    let amount = event.refund_quote(now, registration.amount_paid_cents)?;
    if amount <= 0 {
        return Err(ApiError::bad_request("Nothing to refund"));
    }
    Ok(RefundPlan {
        registration_id: registration.id,
        event_id,
        user_id,
        payment_intent_id: registration.payment_intent_id,
        amount_cents: amount,
        currency: event.currency,
    })
}

/// Admin refund: the full amount, ignoring deadline and policy.
pub fn prepare_admin_refund(conn: &mut PgConnection, registration_id: Uuid) -> ApiResult<RefundPlan> {
    let (registration, currency): (EventRegistration, String) = event_registrations::table
        .inner_join(events::table)
        .filter(event_registrations::id.eq(registration_id))
        .select((EventRegistration::as_select(), events::currency))
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("Registration not found"))?;
    refundable(&registration)?;

    Ok(RefundPlan {
        registration_id: registration.id,
        event_id: registration.event_id,
        user_id: registration.user_id,
        payment_intent_id: registration.payment_intent_id,
        amount_cents: registration.amount_paid_cents,
        currency,
    })
}

/// Records a refund the processor has issued: the registration is cancelled,
/// marked refunded, and a ledger row is appended.
pub fn complete_refund(
    conn: &mut PgConnection,
    plan: &RefundPlan,
    refund_id: &str,
    now: DateTime<Utc>,
) -> ApiResult<Transition<EventRegistration>> {
    conn.transaction(|conn| {
        let event = lock_event(conn, plan.event_id)?;
        let before: EventRegistration = event_registrations::table
            .find(plan.registration_id)
            .select(EventRegistration::as_select())
            .first(conn)?;

        let refunded = diesel::update(event_registrations::table.find(plan.registration_id))
            .set((
                event_registrations::status.eq(RegistrationStatus::Cancelled),
                event_registrations::payment_status.eq(PaymentStatus::Refunded),
                event_registrations::refund_id.eq(Some(refund_id)),
                event_registrations::refund_amount_cents.eq(Some(plan.amount_cents)),
                event_registrations::cancelled_at.eq(Some(before.cancelled_at.unwrap_or(now))),
                event_registrations::updated_at.eq(now),
            ))
            .returning(EventRegistration::as_returning())
            .get_result(conn)?;

        diesel::insert_into(payment_history::table)
            .values(&NewPaymentHistory {
                id: Uuid::new_v4(),
                user_id: plan.user_id,
                kind: PaymentKind::Refund,
                status: LedgerStatus::Refunded,
                amount_cents: plan.amount_cents,
                currency: plan.currency.clone(),
                description: format!("Refund: {}", event.title),
                membership_tier: None,
                event_id: Some(plan.event_id),
                registration_id: Some(plan.registration_id),
                processor_session_id: None,
                processor_payment_id: Some(refund_id.to_string()),
                created_at: now,
            })
            .execute(conn)?;

        let offers = if before.status.is_live() {
            fill_free_seats(conn, &event, now)?
        } else {
            Vec::new()
        };
        log::info!(
            "Refunded {} {} for registration {}",
            plan.amount_cents,
            plan.currency,
            plan.registration_id
        );
        Ok(Transition::new(refunded, offers))
    })
}

/// Admin check-in by confirmation code.
pub fn check_in(
    conn: &mut PgConnection,
    event_id: Uuid,
    code: &str,
    admin_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<EventRegistration> {
    let code = normalize_confirmation_code(code);
    let registration: EventRegistration = event_registrations::table
        .filter(event_registrations::event_id.eq(event_id))
        .filter(event_registrations::confirmation_code.eq(&code))
        .select(EventRegistration::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("No registration with this confirmation code"))?;

    match registration.status {
        RegistrationStatus::Pending => return Err(ApiError::bad_request("Registration payment is still pending")),
        RegistrationStatus::Cancelled => return Err(ApiError::bad_request("Registration has been cancelled")),
        _ if registration.checked_in => return Err(ApiError::conflict("Attendee is already checked in")),
        _ => {}
    }

    let checked_in = diesel::update(event_registrations::table.find(registration.id))
        .set((
            event_registrations::status.eq(RegistrationStatus::Attended),
            event_registrations::checked_in.eq(true),
            event_registrations::checked_in_at.eq(Some(now)),
            event_registrations::checked_in_by.eq(Some(admin_id)),
            event_registrations::updated_at.eq(now),
        ))
        .returning(EventRegistration::as_returning())
        .get_result(conn)?;

    log::info!("Checked in registration {} for event {}", checked_in.id, event_id);
    Ok(checked_in)
}

pub fn attendees(conn: &mut PgConnection, event_id: Uuid) -> ApiResult<Vec<Attendee>> {
    super::find_event(conn, event_id)?;

    let rows: Vec<(EventRegistration, (String, String, String))> = event_registrations::table
        .inner_join(users::table.on(users::id.eq(event_registrations::user_id)))
        .filter(event_registrations::event_id.eq(event_id))
        .filter(event_registrations::status.ne(RegistrationStatus::Cancelled))
        .order(event_registrations::created_at.asc())
        .select((
            EventRegistration::as_select(),
            (users::email, users::first_name, users::last_name),
        ))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(registration, (email, first_name, last_name))| Attendee {
            registration,
            email,
            first_name,
            last_name,
        })
        .collect())
}

pub fn registration_for(conn: &mut PgConnection, event_id: Uuid, user_id: Uuid) -> ApiResult<EventRegistration> {
    find_for_user(conn, event_id, user_id)?
        .ok_or_else(|| ApiError::not_found("You have no registration for this event"))
}

pub fn for_user(conn: &mut PgConnection, user_id: Uuid, now: DateTime<Utc>) -> ApiResult<Vec<MyRegistration>> {
    let rows: Vec<(EventRegistration, Event)> = event_registrations::table
        .inner_join(events::table)
        .filter(event_registrations::user_id.eq(user_id))
        .order(events::start_date.asc())
        .select((EventRegistration::as_select(), Event::as_select()))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(registration, event)| MyRegistration {
            registration,
            event_status: event.status_at(now),
            event_title: event.title,
            event_slug: event.slug,
            event_start_date: event.start_date,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paid(status: RegistrationStatus, checked_in: bool) -> EventRegistration {
        let now = Utc::now();
        EventRegistration {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status,
            registration_type: RegistrationType::Direct,
            confirmation_code: "AB12CD34".to_string(),
            payment_status: PaymentStatus::Completed,
            amount_paid_cents: 5_000,
            payment_session_id: Some("cs_1".to_string()),
            payment_intent_id: Some("pi_1".to_string()),
            refund_id: None,
            refund_amount_cents: None,
            checked_in,
            checked_in_at: checked_in.then_some(now),
            checked_in_by: None,
            cancelled_at: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn completed_payments_are_refundable() {
        assert!(refundable(&paid(RegistrationStatus::Registered, false)).is_ok());
    }

    #[test]
    fn checked_in_registrations_are_not_refundable() {
        let err = refundable(&paid(RegistrationStatus::Attended, true)).unwrap_err();
        assert_eq!(err.to_string(), "Cannot refund a registration after check-in");
    }

    #[test]
    fn unpaid_registrations_are_not_refundable() {
        let mut registration = paid(RegistrationStatus::Registered, false);
        registration.payment_status = PaymentStatus::Pending;
        assert!(matches!(refundable(&registration), Err(ApiError::BadRequest(_))));
    }
}
