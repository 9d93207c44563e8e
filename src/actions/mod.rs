//! Database operations. Every function takes a checked-out connection and the
//! current time, so handlers run them inside `web::block`.

use diesel::dsl::count_star;
use diesel::prelude::*;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{Event, RegistrationStatus, WaitlistEntry, WaitlistStatus};
use crate::schema::{event_registrations, event_waitlist, events as events_table};

pub mod events;
pub mod feedback;
pub mod payments;
pub mod registrations;
pub mod stats;
pub mod users;
pub mod waitlist;

/// A result together with the waitlist entries that received a seat offer as
/// a side effect. Callers notify those members and schedule their expiry.
#[derive(Debug)]
pub struct Transition<T> {
    pub value: T,
    pub offers: Vec<WaitlistEntry>,
}

impl<T> Transition<T> {
    pub fn new(value: T, offers: Vec<WaitlistEntry>) -> Self {
        Self { value, offers }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Transition<U> {
        Transition { value: f(self.value), offers: self.offers }
    }
}

pub fn find_event(conn: &mut PgConnection, event_id: Uuid) -> ApiResult<Event> {
    events_table::table
        .find(event_id)
        .select(Event::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("Event not found"))
}

/// Loads the event and holds its row lock until the surrounding transaction ends.
pub(crate) fn lock_event(conn: &mut PgConnection, event_id: Uuid) -> ApiResult<Event> {
    events_table::table
        .find(event_id)
        .select(Event::as_select())
        .for_update()
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("Event not found"))
}

pub(crate) fn seats_taken(conn: &mut PgConnection, event_id: Uuid) -> QueryResult<i64> {
    event_registrations::table
        .filter(event_registrations::event_id.eq(event_id))
        .filter(event_registrations::status.eq_any(RegistrationStatus::LIVE))
        .select(count_star())
        .first(conn)
}

pub(crate) fn count_waitlist(
    conn: &mut PgConnection,
    event_id: Uuid,
    status: WaitlistStatus,
) -> QueryResult<i64> {
    event_waitlist::table
        .filter(event_waitlist::event_id.eq(event_id))
        .filter(event_waitlist::status.eq(status))
        .select(count_star())
        .first(conn)
}
