use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::{count_waitlist, lock_event, seats_taken, Transition};
use crate::error::{ApiError, ApiResult};
use crate::models::{
    offer_window, Event, EventRegistration, EventStatus, NewWaitlistEntry, RegistrationStatus,
    RegistrationType, WaitlistEntry, WaitlistMember, WaitlistPosition, WaitlistStatus,
};
use crate::schema::{event_registrations, event_waitlist, users};

fn find_entry(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
) -> QueryResult<Option<WaitlistEntry>> {
    event_waitlist::table
        .filter(event_waitlist::event_id.eq(event_id))
        .filter(event_waitlist::user_id.eq(user_id))
        .select(WaitlistEntry::as_select())
        .first(conn)
        .optional()
}

fn find_live_entry(conn: &mut PgConnection, event_id: Uuid, user_id: Uuid) -> ApiResult<WaitlistEntry> {
    find_entry(conn, event_id, user_id)?
        .filter(|e| e.status.is_live())
        .ok_or_else(|| ApiError::not_found("You are not on the waitlist for this event"))
}

/// Moves every waiting row behind `position` one place forward.
fn close_gap(conn: &mut PgConnection, event_id: Uuid, position: i32, now: DateTime<Utc>) -> QueryResult<usize> {
    diesel::update(
        event_waitlist::table
            .filter(event_waitlist::event_id.eq(event_id))
            .filter(event_waitlist::status.eq(WaitlistStatus::Waiting))
            .filter(event_waitlist::position.gt(position)),
    )
    .set((
        event_waitlist::position.eq(event_waitlist::position - 1),
        event_waitlist::updated_at.eq(now),
    ))
    .execute(conn)
}

/// Turns a waiting row into a seat offer and closes the gap it leaves.
fn make_offer(conn: &mut PgConnection, entry: &WaitlistEntry, now: DateTime<Utc>) -> ApiResult<WaitlistEntry> {
    if entry.status != WaitlistStatus::Waiting {
        return Err(ApiError::bad_request("Only waiting members can be offered a seat"));
    }

    let offered = diesel::update(event_waitlist::table.find(entry.id))
        .set((
            event_waitlist::status.eq(WaitlistStatus::Offered),
            event_waitlist::position.eq(None::<i32>),
            event_waitlist::notified.eq(true),
            event_waitlist::notified_at.eq(Some(now)),
            event_waitlist::offer_expires_at.eq(Some(now + offer_window())),
            event_waitlist::updated_at.eq(now),
        ))
        .returning(WaitlistEntry::as_returning())
        .get_result(conn)?;

    if let Some(position) = entry.position {
        close_gap(conn, entry.event_id, position, now)?;
    }

    log::info!(
        "Offered seat for event {} to user {} until {:?}",
        offered.event_id,
        offered.user_id,
        offered.offer_expires_at
    );
    Ok(offered)
}

/// Drops the user's waitlist row, whatever its state, and closes the gap it
/// leaves. The event row must already be locked.
pub(crate) fn withdraw(conn: &mut PgConnection, event_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> ApiResult<()> {
    let Some(entry) = find_entry(conn, event_id, user_id)? else {
        return Ok(());
    };
    diesel::delete(event_waitlist::table.find(entry.id)).execute(conn)?;
    if let Some(position) = entry.position {
        close_gap(conn, event_id, position, now)?;
    }
    Ok(())
}

/// Offers freed seats to the head of the queue for as long as seats are free.
/// The event row must already be locked.
pub(crate) fn fill_free_seats(
    conn: &mut PgConnection,
    event: &Event,
    now: DateTime<Utc>,
) -> ApiResult<Vec<WaitlistEntry>> {
    let mut offers = Vec::new();
    if !event.is_published || event.status_at(now) != EventStatus::Upcoming {
        return Ok(offers);
    }

    loop {
        let taken = seats_taken(conn, event.id)?;
        let outstanding = count_waitlist(conn, event.id, WaitlistStatus::Offered)?;
        if !event.can_offer_seat(taken, outstanding) {
            break;
        }

        let next: Option<WaitlistEntry> = event_waitlist::table
            .filter(event_waitlist::event_id.eq(event.id))
            .filter(event_waitlist::status.eq(WaitlistStatus::Waiting))
            .order(event_waitlist::position.asc())
            .select(WaitlistEntry::as_select())
            .first(conn)
            .optional()?;

        match next {
            Some(entry) => offers.push(make_offer(conn, &entry, now)?),
            None => break,
        }
    }
    Ok(offers)
}

/// Expires offers whose window has passed and re-offers the freed seats.
/// The event row must already be locked.
pub(crate) fn expire_stale_offers(
    conn: &mut PgConnection,
    event: &Event,
    now: DateTime<Utc>,
) -> ApiResult<Vec<WaitlistEntry>> {
    let expired = diesel::update(
        event_waitlist::table
            .filter(event_waitlist::event_id.eq(event.id))
            .filter(event_waitlist::status.eq(WaitlistStatus::Offered))
            .filter(event_waitlist::offer_expires_at.le(now)),
    )
    .set((
        event_waitlist::status.eq(WaitlistStatus::Expired),
        event_waitlist::updated_at.eq(now),
    ))
    .execute(conn)?;

    if expired == 0 {
        return Ok(Vec::new());
    }
    log::info!("Expired {} stale waitlist offer(s) for event {}", expired, event.id);
    fill_free_seats(conn, event, now)
}

/// Appends the user to the waiting queue of an already locked event.
pub(crate) fn enqueue(
    conn: &mut PgConnection,
    event: &Event,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<WaitlistEntry> {
    if !event.waitlist_enabled {
        return Err(ApiError::bad_request("Waitlist is not enabled for this event"));
    }

    let existing = find_entry(conn, event.id, user_id)?;
    if existing.as_ref().map_or(false, |e| e.status.is_live()) {
        return Err(ApiError::conflict("You are already on the waitlist for this event"));
    }

    let waiting = count_waitlist(conn, event.id, WaitlistStatus::Waiting)?;
    if !event.waitlist_has_room(waiting) {
        return Err(ApiError::bad_request("Waitlist is full"));
    }
    let position = waiting as i32 + 1;

    let entry = match existing {
        Some(previous) => diesel::update(event_waitlist::table.find(previous.id))
            .set((
                event_waitlist::status.eq(WaitlistStatus::Waiting),
                event_waitlist::position.eq(Some(position)),
                event_waitlist::notified.eq(false),
                event_waitlist::notified_at.eq(None::<DateTime<Utc>>),
                event_waitlist::offer_expires_at.eq(None::<DateTime<Utc>>),
                event_waitlist::responded_at.eq(None::<DateTime<Utc>>),
                event_waitlist::updated_at.eq(now),
            ))
            .returning(WaitlistEntry::as_returning())
            .get_result(conn)?,
        None => diesel::insert_into(event_waitlist::table)
            .values(&NewWaitlistEntry {
                id: Uuid::new_v4(),
                event_id: event.id,
                user_id,
                position: Some(position),
                status: WaitlistStatus::Waiting,
                created_at: now,
                updated_at: now,
            })
            .returning(WaitlistEntry::as_returning())
            .get_result(conn)?,
    };

    log::info!("User {} joined waitlist for event {} at position {}", user_id, event.id, position);
    Ok(entry)
}

pub fn join(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<Transition<WaitlistEntry>> {
    conn.transaction(|conn| {
        let event = lock_event(conn, event_id)?;
        event.ensure_registration_open(now)?;
        let offers = expire_stale_offers(conn, &event, now)?;

        let registered: Option<RegistrationStatus> = event_registrations::table
            .filter(event_registrations::event_id.eq(event_id))
            .filter(event_registrations::user_id.eq(user_id))
            .select(event_registrations::status)
            .first(conn)
            .optional()?;
        if registered.map_or(false, |s| s.is_live()) {
            return Err(ApiError::conflict("You are already registered for this event"));
        }

        let entry = enqueue(conn, &event, user_id, now)?;
        Ok(Transition::new(entry, offers))
    })
}

/// Removes the caller's live row. Leaving an offer hands the seat on.
pub fn leave(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<Transition<()>> {
    conn.transaction(|conn| {
        let event = lock_event(conn, event_id)?;
        let entry = find_live_entry(conn, event_id, user_id)?;

        diesel::delete(event_waitlist::table.find(entry.id)).execute(conn)?;
        if let Some(position) = entry.position {
            close_gap(conn, event_id, position, now)?;
        }

        let offers = fill_free_seats(conn, &event, now)?;
        log::info!("User {} left waitlist for event {}", user_id, event_id);
        Ok(Transition::new((), offers))
    })
}

pub fn decline(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<Transition<WaitlistEntry>> {
    conn.transaction(|conn| {
        let event = lock_event(conn, event_id)?;
        let entry = find_live_entry(conn, event_id, user_id)?;

        let declined = diesel::update(event_waitlist::table.find(entry.id))
            .set((
                event_waitlist::status.eq(WaitlistStatus::Declined),
                event_waitlist::position.eq(None::<i32>),
                event_waitlist::responded_at.eq(Some(now)),
                event_waitlist::updated_at.eq(now),
            ))
            .returning(WaitlistEntry::as_returning())
            .get_result(conn)?;
        if let Some(position) = entry.position {
            close_gap(conn, event_id, position, now)?;
        }

        let offers = fill_free_seats(conn, &event, now)?;
        Ok(Transition::new(declined, offers))
    })
}

/// Converts an open offer into a registration of type `waitlist`.
pub fn accept(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<Transition<EventRegistration>> {
    conn.transaction(|conn| {
        let event = lock_event(conn, event_id)?;
        let offers = expire_stale_offers(conn, &event, now)?;

        let entry = find_entry(conn, event_id, user_id)?
            .ok_or_else(|| ApiError::not_found("You are not on the waitlist for this event"))?;
        match entry.status {
            WaitlistStatus::Offered => {}
            WaitlistStatus::Expired => return Err(ApiError::bad_request("Your seat offer has expired")),
            _ => return Err(ApiError::bad_request("You have no open seat offer for this event")),
        }

        match event.status_at(now) {
            EventStatus::Upcoming => {}
            EventStatus::Cancelled => return Err(ApiError::bad_request("Event has been cancelled")),
            _ => return Err(ApiError::bad_request("Registration is closed for this event")),
        }
        if !event.has_seat_for_offer(seats_taken(conn, event_id)?) {
            return Err(ApiError::bad_request("Event is full"));
        }

        let registration =
            super::registrations::create_or_reactivate(conn, &event, user_id, RegistrationType::Waitlist, now)?;

        diesel::update(event_waitlist::table.find(entry.id))
            .set((
                event_waitlist::status.eq(WaitlistStatus::Accepted),
                event_waitlist::responded_at.eq(Some(now)),
                event_waitlist::updated_at.eq(now),
            ))
            .execute(conn)?;

        log::info!("User {} accepted waitlist offer for event {}", user_id, event_id);
        Ok(Transition::new(registration, offers))
    })
}

/// Admin promotion. Without a user the head of the queue is offered.
/// Manual promotion does not require a free seat.
pub fn promote(
    conn: &mut PgConnection,
    event_id: Uuid,
    target: Option<Uuid>,
    now: DateTime<Utc>,
) -> ApiResult<Transition<WaitlistEntry>> {
    conn.transaction(|conn| {
        let event = lock_event(conn, event_id)?;
        let offers = expire_stale_offers(conn, &event, now)?;

        let waiting = event_waitlist::table
            .filter(event_waitlist::event_id.eq(event_id))
            .filter(event_waitlist::status.eq(WaitlistStatus::Waiting))
            .select(WaitlistEntry::as_select())
            .into_boxed();
        let candidate: Option<WaitlistEntry> = match target {
            Some(user_id) => waiting.filter(event_waitlist::user_id.eq(user_id)).first(conn).optional()?,
            None => waiting.order(event_waitlist::position.asc()).first(conn).optional()?,
        };

        let entry = match (candidate, target) {
            (Some(entry), _) => entry,
            (None, Some(_)) => return Err(ApiError::not_found("User is not waiting for this event")),
            (None, None) => return Err(ApiError::not_found("No one is waiting for this event")),
        };

        let offered = make_offer(conn, &entry, now)?;
        Ok(Transition::new(offered, offers))
    })
}

pub fn position(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<Transition<WaitlistPosition>> {
    conn.transaction(|conn| {
        let event = lock_event(conn, event_id)?;
        let offers = expire_stale_offers(conn, &event, now)?;

        let entry = find_entry(conn, event_id, user_id)?
            .ok_or_else(|| ApiError::not_found("You are not on the waitlist for this event"))?;
        let waiting_total = count_waitlist(conn, event_id, WaitlistStatus::Waiting)?;
        Ok(Transition::new(WaitlistPosition { entry, waiting_total }, offers))
    })
}

/// Every waitlist row of the event, waiting rows first in queue order.
pub fn list(
    conn: &mut PgConnection,
    event_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<Transition<Vec<WaitlistMember>>> {
    conn.transaction(|conn| {
        let event = lock_event(conn, event_id)?;
        let offers = expire_stale_offers(conn, &event, now)?;

        let rows: Vec<(WaitlistEntry, (String, String, String))> = event_waitlist::table
            .inner_join(users::table)
            .filter(event_waitlist::event_id.eq(event_id))
            .select((
                WaitlistEntry::as_select(),
                (users::email, users::first_name, users::last_name),
            ))
            .load(conn)?;

        let mut members: Vec<WaitlistMember> = rows
            .into_iter()
            .map(|(entry, (email, first_name, last_name))| WaitlistMember {
                entry,
                email,
                first_name,
                last_name,
            })
            .collect();
        members.sort_by_key(|m| (m.entry.position.is_none(), m.entry.position, m.entry.created_at));
        Ok(Transition::new(members, offers))
    })
}

/// The caller's live waitlist rows across all events.
pub fn for_user(conn: &mut PgConnection, user_id: Uuid) -> ApiResult<Vec<WaitlistEntry>> {
    let entries = event_waitlist::table
        .filter(event_waitlist::user_id.eq(user_id))
        .filter(event_waitlist::status.eq_any(WaitlistStatus::LIVE))
        .order(event_waitlist::created_at.desc())
        .select(WaitlistEntry::as_select())
        .load(conn)?;
    Ok(entries)
}

/// Timer-driven expiry of a single offer. Returns `false` when the offer was
/// already answered or is not yet due.
pub fn expire_offer(
    conn: &mut PgConnection,
    entry_id: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<Transition<bool>> {
    conn.transaction(|conn| {
        let event_id: Option<Uuid> = event_waitlist::table
            .find(entry_id)
            .select(event_waitlist::event_id)
            .first(conn)
            .optional()?;
        let Some(event_id) = event_id else {
            return Ok(Transition::new(false, Vec::new()));
        };

        let event = lock_event(conn, event_id)?;
        let entry: WaitlistEntry = event_waitlist::table
            .find(entry_id)
            .select(WaitlistEntry::as_select())
            .first(conn)?;
        if !entry.offer_expired(now) {
            return Ok(Transition::new(false, Vec::new()));
        }

        diesel::update(event_waitlist::table.find(entry_id))
            .set((
                event_waitlist::status.eq(WaitlistStatus::Expired),
                event_waitlist::updated_at.eq(now),
            ))
            .execute(conn)?;
        log::info!("Waitlist offer {} for event {} expired", entry_id, event_id);

        let offers = fill_free_seats(conn, &event, now)?;
        Ok(Transition::new(true, offers))
    })
}
