use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::schema::events;

text_enum! {
    pub enum EventType {
        Workshop => "workshop",
        Meetup => "meetup",
        Conference => "conference",
        Webinar => "webinar",
        Networking => "networking",
        Other => "other",
    }
}

text_enum! {
    /// Displayed status. Never stored: it is derived from the clock and the
    /// manual cancellation flag.
    pub enum EventStatus {
        Upcoming => "upcoming",
        Ongoing => "ongoing",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

text_enum! {
    pub enum RefundPolicy {
        Full => "full",
        Partial => "partial",
        NoRefund => "none",
    }
}

impl EventStatus {
    pub fn derive(
        now: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancelled: bool,
    ) -> EventStatus {
        if cancelled {
            EventStatus::Cancelled
        } else if now < start {
            EventStatus::Upcoming
        } else if now <= end {
            EventStatus::Ongoing
        } else {
            EventStatus::Completed
        }
    }
}

/// Outcome of a capacity check for a new direct registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatDecision {
    Available,
    Waitlist,
    Full,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = events)]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub event_type: EventType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub location: String,
    pub is_virtual: bool,
    pub virtual_link: Option<String>,
    pub max_attendees: Option<i32>,
    pub price_cents: i32,
    pub currency: String,
    pub image: Option<String>,
    pub waitlist_enabled: bool,
    pub waitlist_capacity: Option<i32>,
    pub registration_deadline: Option<DateTime<Utc>>,
    pub cancellation_deadline: Option<DateTime<Utc>>,
    pub refund_policy: RefundPolicy,
    pub partial_refund_percent: i32,
    pub is_cancelled: bool,
    pub is_published: bool,
    pub members_only: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn status_at(&self, now: DateTime<Utc>) -> EventStatus {
        EventStatus::derive(now, self.start_date, self.end_date, self.is_cancelled)
    }

    pub fn is_free(&self) -> bool {
        self.price_cents == 0
    }

    pub fn ensure_registration_open(&self, now: DateTime<Utc>) -> ApiResult<()> {
        if !self.is_published {
            return Err(ApiError::not_found("Event not found"));
        }
        match self.status_at(now) {
            EventStatus::Upcoming => {}
            EventStatus::Cancelled => return Err(ApiError::bad_request("Event has been cancelled")),
            _ => return Err(ApiError::bad_request("Registration is closed for this event")),
        }
        if let Some(deadline) = self.registration_deadline {
            if now > deadline {
                return Err(ApiError::bad_request("Registration deadline has passed"));
            }
        }
        Ok(())
    }

    /// Seats are held by pending, registered and attended rows. Outstanding
    /// waitlist offers reserve a seat as well, so a newcomer cannot take it.
    pub fn seat_decision(&self, seats_taken: i64, outstanding_offers: i64) -> SeatDecision {
        match self.max_attendees {
            Some(max) if seats_taken + outstanding_offers >= i64::from(max) => {
                if self.waitlist_enabled {
                    SeatDecision::Waitlist
                } else {
                    SeatDecision::Full
                }
            }
            _ => SeatDecision::Available,
        }
    }

    /// Whether one more waiting entry may be offered a seat.
    pub fn can_offer_seat(&self, seats_taken: i64, outstanding_offers: i64) -> bool {
        self.max_attendees
            .map_or(true, |max| seats_taken + outstanding_offers < i64::from(max))
    }

    /// Whether an offered entry may still convert into a registration.
    pub fn has_seat_for_offer(&self, seats_taken: i64) -> bool {
        self.max_attendees.map_or(true, |max| seats_taken < i64::from(max))
    }

    pub fn waitlist_has_room(&self, waiting: i64) -> bool {
        self.waitlist_capacity.map_or(true, |cap| waiting < i64::from(cap))
    }

    pub fn seats_remaining(&self, seats_taken: i64) -> Option<i64> {
        self.max_attendees.map(|max| (i64::from(max) - seats_taken).max(0))
    }

    /// Amount refundable for `amount_paid` when a member cancels at `now`.
    pub fn refund_quote(&self, now: DateTime<Utc>, amount_paid: i32) -> ApiResult<i32> {
        if let Some(deadline) = self.cancellation_deadline {
            if now > deadline {
                return Err(ApiError::bad_request("Cancellation deadline has passed"));
            }
        }
        match self.refund_policy {
            RefundPolicy::Full => Ok(amount_paid),
            RefundPolicy::Partial => {
                let pct = self.partial_refund_percent.clamp(0, 100);
                Ok(((i64::from(amount_paid) * i64::from(pct)) / 100) as i32)
            }
            RefundPolicy::NoRefund => Err(ApiError::bad_request("This event does not offer refunds")),
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = events)]
pub struct NewEvent {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub event_type: EventType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub location: String,
    pub is_virtual: bool,
    pub virtual_link: Option<String>,
    pub max_attendees: Option<i32>,
    pub price_cents: i32,
    pub currency: String,
    pub waitlist_enabled: bool,
    pub waitlist_capacity: Option<i32>,
    pub registration_deadline: Option<DateTime<Utc>>,
    pub cancellation_deadline: Option<DateTime<Utc>>,
    pub refund_policy: RefundPolicy,
    pub partial_refund_percent: i32,
    pub is_published: bool,
    pub members_only: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, AsChangeset)]
#[diesel(table_name = events)]
pub struct EventChangeset {
    pub title: Option<String>,
    pub description: Option<String>,
    pub event_type: Option<EventType>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub is_virtual: Option<bool>,
    pub virtual_link: Option<Option<String>>,
    pub max_attendees: Option<Option<i32>>,
    pub price_cents: Option<i32>,
    pub currency: Option<String>,
    pub waitlist_enabled: Option<bool>,
    pub waitlist_capacity: Option<Option<i32>>,
    pub registration_deadline: Option<Option<DateTime<Utc>>>,
    pub cancellation_deadline: Option<Option<DateTime<Utc>>>,
    pub refund_policy: Option<RefundPolicy>,
    pub partial_refund_percent: Option<i32>,
    pub is_published: Option<bool>,
    pub members_only: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEventRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub event_type: Option<EventType>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub is_virtual: bool,
    pub virtual_link: Option<String>,
    pub max_attendees: Option<i32>,
    #[serde(default)]
    pub price_cents: i32,
    pub currency: Option<String>,
    #[serde(default)]
    pub waitlist_enabled: bool,
    pub waitlist_capacity: Option<i32>,
    pub registration_deadline: Option<DateTime<Utc>>,
    pub cancellation_deadline: Option<DateTime<Utc>>,
    pub refund_policy: Option<RefundPolicy>,
    pub partial_refund_percent: Option<i32>,
    pub is_published: Option<bool>,
    #[serde(default)]
    pub members_only: bool,
}

/// Absent field: unchanged. Explicit `null`: cleared.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial update. Nullable columns take `null` to clear them.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateEventRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub event_type: Option<EventType>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub is_virtual: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    pub virtual_link: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub max_attendees: Option<Option<i32>>,
    pub price_cents: Option<i32>,
    pub currency: Option<String>,
    pub waitlist_enabled: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    pub waitlist_capacity: Option<Option<i32>>,
    #[serde(default, deserialize_with = "nullable")]
    pub registration_deadline: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "nullable")]
    pub cancellation_deadline: Option<Option<DateTime<Utc>>>,
    pub refund_policy: Option<RefundPolicy>,
    pub partial_refund_percent: Option<i32>,
    pub is_published: Option<bool>,
    pub members_only: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub event_type: Option<EventType>,
    pub search: Option<String>,
    #[serde(default)]
    pub all: bool,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// Event as returned to clients, with derived fields.
#[derive(Debug, Serialize)]
pub struct EventView {
    #[serde(flatten)]
    pub event: Event,
    pub status: EventStatus,
    pub seats_taken: i64,
    pub seats_remaining: Option<i64>,
    pub waitlist_count: i64,
}

impl EventView {
    pub fn new(event: Event, now: DateTime<Utc>, seats_taken: i64, waitlist_count: i64) -> Self {
        Self {
            status: event.status_at(now),
            seats_remaining: event.seats_remaining(seats_taken),
            seats_taken,
            waitlist_count,
            event,
        }
    }
}

fn validate_limits(
    max_attendees: Option<i32>,
    price_cents: Option<i32>,
    waitlist_capacity: Option<i32>,
    partial_refund_percent: Option<i32>,
    currency: Option<&str>,
) -> ApiResult<()> {
    if max_attendees.map_or(false, |m| m <= 0) {
        return Err(ApiError::bad_request("max_attendees must be greater than 0"));
    }
    if price_cents.map_or(false, |p| p < 0) {
        return Err(ApiError::bad_request("price_cents must not be negative"));
    }
    if waitlist_capacity.map_or(false, |c| c <= 0) {
        return Err(ApiError::bad_request("waitlist_capacity must be greater than 0"));
    }
    if partial_refund_percent.map_or(false, |p| !(0..=100).contains(&p)) {
        return Err(ApiError::bad_request("partial_refund_percent must be between 0 and 100"));
    }
    if currency.map_or(false, |c| c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_alphabetic())) {
        return Err(ApiError::bad_request("currency must be a 3-letter ISO code"));
    }
    Ok(())
}

impl CreateEventRequest {
    pub fn validate(&self) -> ApiResult<()> {
        let title = self.title.trim();
        if title.is_empty() || title.chars().count() > 255 {
            return Err(ApiError::bad_request("title is required (max 255 characters)"));
        }
        if self.end_date < self.start_date {
            return Err(ApiError::bad_request("end_date must not be before start_date"));
        }
        if let Some(deadline) = self.registration_deadline {
            if deadline > self.end_date {
                return Err(ApiError::bad_request("registration_deadline must not be after end_date"));
            }
        }
        validate_limits(
            self.max_attendees,
            Some(self.price_cents),
            self.waitlist_capacity,
            self.partial_refund_percent,
            self.currency.as_deref(),
        )
    }

    pub fn into_new_event(self, slug: String, created_by: Uuid, now: DateTime<Utc>) -> NewEvent {
        NewEvent {
            id: Uuid::new_v4(),
            title: self.title.trim().to_string(),
            slug,
            description: self.description,
            event_type: self.event_type.unwrap_or(EventType::Other),
            start_date: self.start_date,
            end_date: self.end_date,
            location: self.location,
            is_virtual: self.is_virtual,
            virtual_link: self.virtual_link,
            max_attendees: self.max_attendees,
            price_cents: self.price_cents,
            currency: self.currency.map(|c| c.to_lowercase()).unwrap_or_else(|| "usd".to_string()),
            waitlist_enabled: self.waitlist_enabled,
            waitlist_capacity: self.waitlist_capacity,
            registration_deadline: self.registration_deadline,
            cancellation_deadline: self.cancellation_deadline,
            refund_policy: self.refund_policy.unwrap_or(RefundPolicy::Full),
            partial_refund_percent: self.partial_refund_percent.unwrap_or(50),
            is_published: self.is_published.unwrap_or(true),
            members_only: self.members_only,
            created_by: Some(created_by),
            created_at: now,
            updated_at: now,
        }
    }
}

impl UpdateEventRequest {
    /// Validates the patch against the stored event and builds the changeset.
    /// The slug is never part of it.
    pub fn into_changeset(self, current: &Event, now: DateTime<Utc>) -> ApiResult<EventChangeset> {
        if let Some(title) = &self.title {
            let title = title.trim();
            if title.is_empty() || title.chars().count() > 255 {
                return Err(ApiError::bad_request("title is required (max 255 characters)"));
            }
        }
        let start = self.start_date.unwrap_or(current.start_date);
        let end = self.end_date.unwrap_or(current.end_date);
        if end < start {
            return Err(ApiError::bad_request("end_date must not be before start_date"));
        }
        validate_limits(
            self.max_attendees.flatten(),
            self.price_cents,
            self.waitlist_capacity.flatten(),
            self.partial_refund_percent,
            self.currency.as_deref(),
        )?;

        Ok(EventChangeset {
            title: self.title.map(|t| t.trim().to_string()),
            description: self.description,
            event_type: self.event_type,
            start_date: self.start_date,
            end_date: self.end_date,
            location: self.location,
            is_virtual: self.is_virtual,
            virtual_link: self.virtual_link,
            max_attendees: self.max_attendees,
            price_cents: self.price_cents,
            currency: self.currency.map(|c| c.to_lowercase()),
            waitlist_enabled: self.waitlist_enabled,
            waitlist_capacity: self.waitlist_capacity,
            registration_deadline: self.registration_deadline,
            cancellation_deadline: self.cancellation_deadline,
            refund_policy: self.refund_policy,
            partial_refund_percent: self.partial_refund_percent,
            is_published: self.is_published,
            members_only: self.members_only,
            updated_at: Some(now),
        })
    }
}

/// Lowercase, dash-separated ASCII slug. Never empty.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(80);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "event".to_string()
    } else {
        slug
    }
}
