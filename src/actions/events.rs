use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::pg::Pg;
use diesel::prelude::*;
use uuid::Uuid;

use super::waitlist::fill_free_seats;
use super::{find_event, lock_event, Transition};
use crate::error::{ApiError, ApiResult};
use crate::models::{
    slugify, CreateEventRequest, Event, EventFilter, EventStatus, EventView, Page, Paged,
    RegistrationStatus, UpdateEventRequest, WaitlistStatus,
};
use crate::schema::{event_registrations, event_waitlist, events};

/// First of `base`, `base-2`, `base-3`, ... not present in `taken`.
pub fn unique_slug(base: &str, taken: &[String]) -> String {
    if !taken.iter().any(|s| s == base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !taken.iter().any(|s| s == candidate))
        .unwrap_or_else(|| format!("{}-{}", base, Uuid::new_v4().simple()))
}

pub fn create(
    conn: &mut PgConnection,
    request: CreateEventRequest,
    created_by: Uuid,
    now: DateTime<Utc>,
) -> ApiResult<Event> {
    request.validate()?;
    let base = slugify(&request.title);

    let taken: Vec<String> = events::table
        .filter(events::slug.like(format!("{}%", base)))
        .select(events::slug)
        .load(conn)?;
    let slug = unique_slug(&base, &taken);

    let event = diesel::insert_into(events::table)
        .values(&request.into_new_event(slug, created_by, now))
        .returning(Event::as_returning())
        .get_result(conn)?;

    log::info!("Created event {} ({})", event.slug, event.id);
    Ok(event)
}

/// Applies a partial update. Raising capacity offers the new seats to the waitlist.
pub fn update(
    conn: &mut PgConnection,
    event_id: Uuid,
    request: UpdateEventRequest,
    now: DateTime<Utc>,
) -> ApiResult<Transition<Event>> {
    conn.transaction(|conn| {
        let current = lock_event(conn, event_id)?;
        let changes = request.into_changeset(&current, now)?;

        let event = diesel::update(events::table.find(event_id))
            .set(&changes)
            .returning(Event::as_returning())
            .get_result(conn)?;

        let offers = fill_free_seats(conn, &event, now)?;
        Ok(Transition::new(event, offers))
    })
}

pub fn cancel(conn: &mut PgConnection, event_id: Uuid, now: DateTime<Utc>) -> ApiResult<Event> {
    let event = find_event(conn, event_id)?;
    if event.is_cancelled {
        return Err(ApiError::bad_request("Event is already cancelled"));
    }
    let event = diesel::update(events::table.find(event_id))
        .set((events::is_cancelled.eq(true), events::updated_at.eq(now)))
        .returning(Event::as_returning())
        .get_result(conn)?;
    log::info!("Cancelled event {}", event.id);
    Ok(event)
}

/// Deletes the event and everything hanging off it. Returns the removed row.
pub fn delete(conn: &mut PgConnection, event_id: Uuid) -> ApiResult<Event> {
    let event = find_event(conn, event_id)?;
    diesel::delete(events::table.find(event_id)).execute(conn)?;
    log::info!("Deleted event {}", event_id);
    Ok(event)
}

/// Replaces the event image, returning the updated event and the previous
/// image reference.
pub fn set_image(
    conn: &mut PgConnection,
    event_id: Uuid,
    image: Option<String>,
    now: DateTime<Utc>,
) -> ApiResult<(Event, Option<String>)> {
    let previous = find_event(conn, event_id)?.image;
    let event = diesel::update(events::table.find(event_id))
        .set((events::image.eq(image), events::updated_at.eq(now)))
        .returning(Event::as_returning())
        .get_result(conn)?;
    Ok((event, previous))
}

/// Looks up by UUID or slug. Unpublished events are hidden from non-admins.
pub fn get(
    conn: &mut PgConnection,
    id_or_slug: &str,
    include_unpublished: bool,
    now: DateTime<Utc>,
) -> ApiResult<EventView> {
    let query = events::table.select(Event::as_select()).into_boxed();
    let query = match Uuid::parse_str(id_or_slug) {
        Ok(id) => query.filter(events::id.eq(id)),
        Err(_) => query.filter(events::slug.eq(id_or_slug.to_string())),
    };
    let event: Event = query
        .first(conn)
        .optional()?
        .filter(|e| e.is_published || include_unpublished)
        .ok_or_else(|| ApiError::not_found("Event not found"))?;

    let mut views = with_counts(conn, vec![event], now)?;
    views.pop().ok_or_else(|| ApiError::internal("event view missing"))
}

fn filtered<'a>(filter: &EventFilter, include_unpublished: bool, now: DateTime<Utc>) -> events::BoxedQuery<'a, Pg> {
    let mut query = events::table.into_boxed();

    if !include_unpublished {
        query = query.filter(events::is_published.eq(true));
    }
    if let Some(event_type) = filter.event_type {
        query = query.filter(events::event_type.eq(event_type));
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search);
        query = query.filter(events::title.ilike(pattern.clone()).or(events::description.ilike(pattern)));
    }
    query = match filter.status {
        None => query,
        Some(EventStatus::Cancelled) => query.filter(events::is_cancelled.eq(true)),
        Some(EventStatus::Upcoming) => query
            .filter(events::is_cancelled.eq(false))
            .filter(events::start_date.gt(now)),
        Some(EventStatus::Ongoing) => query
            .filter(events::is_cancelled.eq(false))
            .filter(events::start_date.le(now))
            .filter(events::end_date.ge(now)),
        Some(EventStatus::Completed) => query
            .filter(events::is_cancelled.eq(false))
            .filter(events::end_date.lt(now)),
    };
    query
}

pub fn list(
    conn: &mut PgConnection,
    filter: &EventFilter,
    is_admin: bool,
    now: DateTime<Utc>,
) -> ApiResult<Paged<EventView>> {
    let include_unpublished = is_admin && filter.all;
    let page = Page { page: filter.page, limit: filter.limit };

    let total: i64 = filtered(filter, include_unpublished, now)
        .select(count_star())
        .first(conn)?;
    let rows: Vec<Event> = filtered(filter, include_unpublished, now)
        .order((events::start_date.asc(), events::id.asc()))
        .limit(page.limit())
        .offset(page.offset())
        .select(Event::as_select())
        .load(conn)?;

    let items = with_counts(conn, rows, now)?;
    Ok(Paged::new(items, total, &page))
}

fn with_counts(conn: &mut PgConnection, rows: Vec<Event>, now: DateTime<Utc>) -> ApiResult<Vec<EventView>> {
    let ids: Vec<Uuid> = rows.iter().map(|e| e.id).collect();

    let seats: HashMap<Uuid, i64> = event_registrations::table
        .filter(event_registrations::event_id.eq_any(&ids))
        .filter(event_registrations::status.eq_any(RegistrationStatus::LIVE))
        .group_by(event_registrations::event_id)
        .select((event_registrations::event_id, count_star()))
        .load::<(Uuid, i64)>(conn)?
        .into_iter()
        .collect();
    let waiting: HashMap<Uuid, i64> = event_waitlist::table
        .filter(event_waitlist::event_id.eq_any(&ids))
        .filter(event_waitlist::status.eq(WaitlistStatus::Waiting))
        .group_by(event_waitlist::event_id)
        .select((event_waitlist::event_id, count_star()))
        .load::<(Uuid, i64)>(conn)?
        .into_iter()
        .collect();

    Ok(rows
        .into_iter()
        .map(|event| {
            let taken = seats.get(&event.id).copied().unwrap_or(0);
            let queued = waiting.get(&event.id).copied().unwrap_or(0);
            EventView::new(event, now, taken, queued)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_slug_appends_the_first_free_suffix() {
        let taken = vec!["rust-meetup".to_string(), "rust-meetup-2".to_string()];
        assert_eq!(unique_slug("rust-meetup", &taken), "rust-meetup-3");
        assert_eq!(unique_slug("rust-meetup-berlin", &taken), "rust-meetup-berlin");
        assert_eq!(unique_slug("fresh", &[]), "fresh");
    }
}
