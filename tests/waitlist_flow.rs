//! Registration, waitlist and feedback flows against a real Postgres.
//!
//! Set `TEST_DATABASE_URL` to run them. Every test works inside a test
//! transaction that is rolled back, so the database is left untouched.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use diesel::{Connection, PgConnection};
use diesel_migrations::MigrationHarness;
use serde_json::{json, Value};
use uuid::Uuid;

use membership::{
    actions,
    db::MIGRATIONS,
    error::ApiError,
    models::{
        offer_window, CreateEventRequest, Event, EventRegistration, Fulfillment, MembershipStatus, NewUser, Page,
        PaymentStatus, RegisterOutcome, RegistrationStatus, RegistrationType, Role, SubmitFeedbackRequest, User,
        WaitlistEntry, WaitlistStatus,
    },
    payments::CheckoutSession,
};

fn connection() -> Option<PgConnection> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL is not set, skipping");
        return None;
    };
    let mut conn = PgConnection::establish(&url).expect("connect to TEST_DATABASE_URL");
    conn.run_pending_migrations(MIGRATIONS).expect("run migrations");
    conn.begin_test_transaction().expect("begin test transaction");
    Some(conn)
}

fn user(conn: &mut PgConnection, name: &str, role: Role) -> User {
    let now = Utc::now();
    actions::users::create_user(
        conn,
        &NewUser {
            id: Uuid::new_v4(),
            email: format!("{}-{}@example.org", name, Uuid::new_v4().simple()),
            password_hash: "unused".to_string(),
            first_name: name.to_string(),
            last_name: "Tester".to_string(),
            phone: None,
            company: None,
            job_title: None,
            role,
            membership_tier: None,
            membership_status: MembershipStatus::Active,
            is_approved: true,
            created_at: now,
            updated_at: now,
        },
    )
    .unwrap()
}

fn event_with(conn: &mut PgConnection, admin: &User, extra: Value) -> Event {
    let start = Utc::now() + Duration::days(7);
    let mut body = json!({
        "title": "Capacity Test",
        "start_date": start,
        "end_date": start + Duration::hours(2),
        "waitlist_enabled": true,
    });
    if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    let request: CreateEventRequest = serde_json::from_value(body).unwrap();
    actions::events::create(conn, request, admin.id, Utc::now()).unwrap()
}

fn event(conn: &mut PgConnection, admin: &User, max_attendees: i32) -> Event {
    event_with(conn, admin, json!({ "max_attendees": max_attendees }))
}

fn registered(outcome: RegisterOutcome) -> EventRegistration {
    match outcome {
        RegisterOutcome::Registered { registration } => registration,
        other => panic!("expected registration, got {:?}", other),
    }
}

fn paid_session(registration: &EventRegistration) -> CheckoutSession {
    CheckoutSession {
        id: format!("cs_flow_{}", Uuid::new_v4().simple()),
        url: None,
        payment_status: "paid".to_string(),
        amount_total: Some(5_000),
        currency: Some("usd".to_string()),
        customer: None,
        payment_intent: Some(format!("pi_flow_{}", Uuid::new_v4().simple())),
        metadata: HashMap::from([
            ("kind".to_string(), "event_registration".to_string()),
            ("user_id".to_string(), registration.user_id.to_string()),
            ("event_id".to_string(), registration.event_id.to_string()),
            ("registration_id".to_string(), registration.id.to_string()),
        ]),
    }
}

/// Registers `member` for a paid event and completes the payment.
fn paid_registration(conn: &mut PgConnection, event: &Event, member: &User, now: DateTime<Utc>) -> EventRegistration {
    let pending = registered(actions::registrations::register(conn, event.id, member.id, now).unwrap().value);
    match actions::payments::fulfill(conn, &paid_session(&pending), now).unwrap() {
        Fulfillment::EventRegistration { registration } => registration,
        other => panic!("expected event fulfilment, got {:?}", other),
    }
}

fn waitlisted(outcome: RegisterOutcome) -> WaitlistEntry {
    match outcome {
        RegisterOutcome::Waitlisted { waitlist } => waitlist,
        other => panic!("expected waitlist, got {:?}", other),
    }
}

fn waiting_positions(conn: &mut PgConnection, event_id: Uuid) -> Vec<i32> {
    let members = actions::waitlist::list(conn, event_id, Utc::now()).unwrap().value;
    members
        .iter()
        .filter(|m| m.entry.status == WaitlistStatus::Waiting)
        .filter_map(|m| m.entry.position)
        .collect()
}

#[test]
fn cancelled_seat_goes_to_the_head_of_the_waitlist() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let a = user(conn, "a", Role::Member);
    let b = user(conn, "b", Role::Member);
    let event = event(conn, &admin, 1);

    let first = actions::registrations::register(conn, event.id, a.id, now).unwrap().value;
    assert!(matches!(first, RegisterOutcome::Registered { .. }));

    let entry = waitlisted(actions::registrations::register(conn, event.id, b.id, now).unwrap().value);
    assert_eq!(entry.position, Some(1));
    assert_eq!(entry.status, WaitlistStatus::Waiting);

    let cancelled = actions::registrations::cancel(conn, event.id, a.id, now).unwrap();
    assert_eq!(cancelled.value.registration.status, RegistrationStatus::Cancelled);
    assert!(cancelled.value.refund.is_none());
    assert_eq!(cancelled.offers.len(), 1);
    assert_eq!(cancelled.offers[0].user_id, b.id);
    assert_eq!(cancelled.offers[0].status, WaitlistStatus::Offered);
    assert!(cancelled.offers[0].offer_expires_at.is_some());

    let registration = actions::waitlist::accept(conn, event.id, b.id, now).unwrap().value;
    assert_eq!(registration.registration_type, RegistrationType::Waitlist);
    assert_eq!(registration.status, RegistrationStatus::Registered);

    let position = actions::waitlist::position(conn, event.id, b.id, now).unwrap().value;
    assert_eq!(position.entry.status, WaitlistStatus::Accepted);

    let stats = actions::stats::event_stats(conn, event.id).unwrap();
    assert_eq!(stats.seats_taken, 1);
}

#[test]
fn capacity_is_never_exceeded() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let event = event(conn, &admin, 2);

    let mut registered = 0;
    for i in 0..5 {
        let member = user(conn, &format!("m{}", i), Role::Member);
        match actions::registrations::register(conn, event.id, member.id, now).unwrap().value {
            RegisterOutcome::Registered { .. } => registered += 1,
            RegisterOutcome::Waitlisted { .. } => {}
        }
    }

    assert_eq!(registered, 2);
    assert_eq!(actions::stats::event_stats(conn, event.id).unwrap().seats_taken, 2);
    assert_eq!(waiting_positions(conn, event.id), vec![1, 2, 3]);
}

#[test]
fn positions_stay_contiguous_when_members_leave() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let holder = user(conn, "holder", Role::Member);
    let event = event(conn, &admin, 1);
    actions::registrations::register(conn, event.id, holder.id, now).unwrap();

    let waiters: Vec<User> = (0..4).map(|i| user(conn, &format!("w{}", i), Role::Member)).collect();
    for w in &waiters {
        actions::waitlist::join(conn, event.id, w.id, now).unwrap();
    }
    assert_eq!(waiting_positions(conn, event.id), vec![1, 2, 3, 4]);

    actions::waitlist::leave(conn, event.id, waiters[1].id, now).unwrap();
    assert_eq!(waiting_positions(conn, event.id), vec![1, 2, 3]);

    actions::waitlist::decline(conn, event.id, waiters[0].id, now).unwrap();
    assert_eq!(waiting_positions(conn, event.id), vec![1, 2]);

    let last = actions::waitlist::position(conn, event.id, waiters[3].id, now).unwrap().value;
    assert_eq!(last.entry.position, Some(2));
    assert_eq!(last.waiting_total, 2);

    let dup = actions::waitlist::join(conn, event.id, waiters[2].id, now).unwrap_err();
    assert!(matches!(dup, ApiError::Conflict(_)));
}

#[test]
fn feedback_requires_check_in_and_is_accepted_once() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let member = user(conn, "member", Role::Member);
    let event = event(conn, &admin, 10);

    let registration = registered(actions::registrations::register(conn, event.id, member.id, now).unwrap().value);

    let feedback = || -> SubmitFeedbackRequest {
        serde_json::from_value(json!({ "rating": 5, "comment": "Great", "would_recommend": true })).unwrap()
    };

    let early = actions::feedback::submit(conn, event.id, member.id, feedback(), now).unwrap_err();
    assert!(matches!(early, ApiError::Forbidden(_)));

    let code = registration.confirmation_code.to_lowercase();
    let checked_in = actions::registrations::check_in(conn, event.id, &code, admin.id, now).unwrap();
    assert_eq!(checked_in.status, RegistrationStatus::Attended);
    assert_eq!(checked_in.checked_in_by, Some(admin.id));

    let again = actions::registrations::check_in(conn, event.id, &code, admin.id, now).unwrap_err();
    assert!(matches!(again, ApiError::Conflict(_)));

    actions::feedback::submit(conn, event.id, member.id, feedback(), now).unwrap();
    let duplicate = actions::feedback::submit(conn, event.id, member.id, feedback(), now).unwrap_err();
    assert!(matches!(duplicate, ApiError::Conflict(_)));

    let summary = actions::feedback::summary(conn, event.id).unwrap();
    assert_eq!(summary.count, 1);
    assert_eq!(summary.average_rating, Some(5.0));
}

#[test]
fn lapsed_offer_passes_to_the_next_waiter_on_read() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let holder = user(conn, "holder", Role::Member);
    let b = user(conn, "b", Role::Member);
    let c = user(conn, "c", Role::Member);
    let event = event(conn, &admin, 1);

    actions::registrations::register(conn, event.id, holder.id, now).unwrap();
    waitlisted(actions::registrations::register(conn, event.id, b.id, now).unwrap().value);
    waitlisted(actions::registrations::register(conn, event.id, c.id, now).unwrap().value);

    let offers = actions::registrations::cancel(conn, event.id, holder.id, now).unwrap().offers;
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].user_id, b.id);

    let later = now + offer_window() + Duration::seconds(1);
    let listed = actions::waitlist::list(conn, event.id, later).unwrap();
    assert_eq!(listed.offers.len(), 1);
    assert_eq!(listed.offers[0].user_id, c.id);

    let late = actions::waitlist::accept(conn, event.id, b.id, later).unwrap_err();
    assert!(matches!(late, ApiError::BadRequest(ref m) if m == "Your seat offer has expired"));

    let registration = actions::waitlist::accept(conn, event.id, c.id, later).unwrap().value;
    assert_eq!(registration.registration_type, RegistrationType::Waitlist);
}

#[test]
fn timer_expiry_only_fires_once_the_offer_is_due() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let holder = user(conn, "holder", Role::Member);
    let b = user(conn, "b", Role::Member);
    let c = user(conn, "c", Role::Member);
    let event = event(conn, &admin, 1);

    actions::registrations::register(conn, event.id, holder.id, now).unwrap();
    actions::waitlist::join(conn, event.id, b.id, now).unwrap();
    actions::waitlist::join(conn, event.id, c.id, now).unwrap();
    let offer = actions::registrations::cancel(conn, event.id, holder.id, now).unwrap().offers.remove(0);

    let early = actions::waitlist::expire_offer(conn, offer.id, now).unwrap();
    assert!(!early.value);
    assert!(early.offers.is_empty());

    let deadline = offer.offer_expires_at.unwrap();
    let due = actions::waitlist::expire_offer(conn, offer.id, deadline).unwrap();
    assert!(due.value);
    assert_eq!(due.offers.len(), 1);
    assert_eq!(due.offers[0].user_id, c.id);

    let again = actions::waitlist::expire_offer(conn, offer.id, deadline).unwrap();
    assert!(!again.value);
}

#[test]
fn full_waitlist_turns_registrations_away() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let event = event_with(conn, &admin, json!({ "max_attendees": 1, "waitlist_capacity": 1 }));

    let first = user(conn, "first", Role::Member);
    let second = user(conn, "second", Role::Member);
    let third = user(conn, "third", Role::Member);
    actions::registrations::register(conn, event.id, first.id, now).unwrap();
    waitlisted(actions::registrations::register(conn, event.id, second.id, now).unwrap().value);

    let err = actions::registrations::register(conn, event.id, third.id, now).unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(ref m) if m == "Waitlist is full"));
    let err = actions::waitlist::join(conn, event.id, third.id, now).unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
    assert_eq!(waiting_positions(conn, event.id), vec![1]);
}

#[test]
fn payment_completes_a_pending_registration_once() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let member = user(conn, "member", Role::Member);
    let event = event_with(conn, &admin, json!({ "max_attendees": 5, "price_cents": 5_000 }));

    let pending = registered(actions::registrations::register(conn, event.id, member.id, now).unwrap().value);
    assert_eq!(pending.status, RegistrationStatus::Pending);
    assert_eq!(pending.payment_status, PaymentStatus::Pending);

    let session = paid_session(&pending);
    let paid = match actions::payments::fulfill(conn, &session, now).unwrap() {
        Fulfillment::EventRegistration { registration } => registration,
        other => panic!("expected event fulfilment, got {:?}", other),
    };
    assert_eq!(paid.status, RegistrationStatus::Registered);
    assert_eq!(paid.payment_status, PaymentStatus::Completed);
    assert_eq!(paid.amount_paid_cents, 5_000);

    let replay = actions::payments::fulfill(conn, &session, now).unwrap();
    assert!(matches!(replay, Fulfillment::AlreadyProcessed { .. }));
    assert_eq!(actions::payments::history(conn, member.id).unwrap().len(), 1);
}

#[test]
fn cancelling_a_paid_seat_quotes_the_refund_and_promotes() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let payer = user(conn, "payer", Role::Member);
    let waiter = user(conn, "waiter", Role::Member);
    let event = event_with(
        conn,
        &admin,
        json!({ "max_attendees": 1, "price_cents": 5_000, "refund_policy": "partial", "partial_refund_percent": 50 }),
    );

    paid_registration(conn, &event, &payer, now);
    actions::waitlist::join(conn, event.id, waiter.id, now).unwrap();

    let cancelled = actions::registrations::cancel(conn, event.id, payer.id, now).unwrap();
    let plan = cancelled.value.refund.expect("refund plan");
    assert_eq!(plan.amount_cents, 2_500);
    assert_eq!(cancelled.offers.len(), 1);
    assert_eq!(cancelled.offers[0].user_id, waiter.id);

    let refunded = actions::registrations::complete_refund(conn, &plan, "re_flow_1", now).unwrap();
    assert_eq!(refunded.value.status, RegistrationStatus::Cancelled);
    assert_eq!(refunded.value.payment_status, PaymentStatus::Refunded);
    assert_eq!(refunded.value.refund_amount_cents, Some(2_500));
    assert!(refunded.offers.is_empty());
    assert_eq!(actions::payments::history(conn, payer.id).unwrap().len(), 2);
}

#[test]
fn member_refunds_stop_at_the_cancellation_deadline() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let member = user(conn, "member", Role::Member);
    let event = event_with(
        conn,
        &admin,
        json!({ "max_attendees": 5, "price_cents": 5_000, "cancellation_deadline": now + Duration::days(1) }),
    );
    paid_registration(conn, &event, &member, now);

    let late = actions::registrations::prepare_refund(conn, event.id, member.id, now + Duration::days(2)).unwrap_err();
    assert!(matches!(late, ApiError::BadRequest(ref m) if m == "Cancellation deadline has passed"));

    let plan = actions::registrations::prepare_refund(conn, event.id, member.id, now).unwrap();
    assert_eq!(plan.amount_cents, 5_000);
}

#[test]
fn checked_in_registrations_cannot_be_refunded_by_admins() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let member = user(conn, "member", Role::Member);
    let event = event_with(conn, &admin, json!({ "max_attendees": 5, "price_cents": 5_000 }));
    let registration = paid_registration(conn, &event, &member, now);

    actions::registrations::check_in(conn, event.id, &registration.confirmation_code, admin.id, now).unwrap();

    let err = actions::registrations::prepare_admin_refund(conn, registration.id).unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
    let row = actions::registrations::registration_for(conn, event.id, member.id).unwrap();
    assert_eq!(row.status, RegistrationStatus::Attended);
    assert_eq!(row.payment_status, PaymentStatus::Completed);
}

#[test]
fn deleting_members_keeps_the_queue_contiguous_and_frees_their_seat() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let holder = user(conn, "holder", Role::Member);
    let event = event(conn, &admin, 1);
    actions::registrations::register(conn, event.id, holder.id, now).unwrap();

    let waiters: Vec<User> = (0..3).map(|i| user(conn, &format!("w{}", i), Role::Member)).collect();
    for w in &waiters {
        actions::waitlist::join(conn, event.id, w.id, now).unwrap();
    }

    let removed = actions::users::delete_user(conn, waiters[0].id, now).unwrap();
    assert_eq!(removed.value.id, waiters[0].id);
    assert!(removed.offers.is_empty());
    assert_eq!(waiting_positions(conn, event.id), vec![1, 2]);

    let removed = actions::users::delete_user(conn, holder.id, now).unwrap();
    assert_eq!(removed.offers.len(), 1);
    assert_eq!(removed.offers[0].user_id, waiters[1].id);
    assert_eq!(waiting_positions(conn, event.id), vec![1]);
    assert_eq!(actions::stats::event_stats(conn, event.id).unwrap().seats_taken, 0);
}

#[test]
fn ledger_rows_outlive_the_member() {
    let Some(mut conn) = connection() else { return };
    let conn = &mut conn;
    let now = Utc::now();

    let admin = user(conn, "admin", Role::Admin);
    let member = user(conn, "member", Role::Member);
    let event = event_with(conn, &admin, json!({ "max_attendees": 5, "price_cents": 5_000 }));
    paid_registration(conn, &event, &member, now);

    let page = Page { page: None, limit: Some(100) };
    let before = actions::payments::ledger(conn, &page).unwrap().total;
    actions::users::delete_user(conn, member.id, now).unwrap();
    let after = actions::payments::ledger(conn, &page).unwrap();

    assert_eq!(after.total, before);
    assert!(after.items.iter().any(|row| row.user_id.is_none() && row.event_id == Some(event.id)));
}
