use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::event_waitlist;

text_enum! {
    pub enum WaitlistStatus {
        Waiting => "waiting",
        Offered => "offered",
        Accepted => "accepted",
        Declined => "declined",
        Expired => "expired",
    }
}

impl WaitlistStatus {
    /// A member holds at most one row in one of these per event.
    pub const LIVE: [WaitlistStatus; 2] = [WaitlistStatus::Waiting, WaitlistStatus::Offered];

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }
}

/// How long a promoted member has to accept the freed seat.
pub fn offer_window() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = event_waitlist)]
pub struct WaitlistEntry {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub position: Option<i32>,
    pub status: WaitlistStatus,
    pub notified: bool,
    pub notified_at: Option<DateTime<Utc>>,
    pub offer_expires_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WaitlistEntry {
    /// An offer lapses at its deadline, inclusive.
    pub fn offer_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == WaitlistStatus::Offered
            && self.offer_expires_at.map_or(false, |exp| now >= exp)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = event_waitlist)]
pub struct NewWaitlistEntry {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub position: Option<i32>,
    pub status: WaitlistStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromoteRequest {
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct WaitlistPosition {
    pub entry: WaitlistEntry,
    pub waiting_total: i64,
}

#[derive(Debug, Serialize)]
pub struct WaitlistMember {
    #[serde(flatten)]
    pub entry: WaitlistEntry,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: WaitlistStatus, expires: Option<DateTime<Utc>>) -> WaitlistEntry {
        let now = Utc::now();
        WaitlistEntry {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            position: None,
            status,
            notified: true,
            notified_at: Some(now),
            offer_expires_at: expires,
            responded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn offers_expire_after_their_deadline() {
        let now = Utc::now();
        let offered = entry(WaitlistStatus::Offered, Some(now + offer_window()));
        assert!(!offered.offer_expired(now));
        assert!(offered.offer_expired(now + offer_window() + Duration::seconds(1)));
    }

    #[test]
    fn offers_lapse_exactly_at_the_deadline() {
        let deadline = Utc::now() + offer_window();
        let offered = entry(WaitlistStatus::Offered, Some(deadline));
        assert!(!offered.offer_expired(deadline - Duration::milliseconds(1)));
        assert!(offered.offer_expired(deadline));
    }

    #[test]
    fn only_offers_can_expire() {
        let now = Utc::now();
        let waiting = entry(WaitlistStatus::Waiting, Some(now - Duration::hours(1)));
        assert!(!waiting.offer_expired(now));
    }

    #[test]
    fn live_statuses() {
        assert!(WaitlistStatus::Waiting.is_live());
        assert!(WaitlistStatus::Offered.is_live());
        assert!(!WaitlistStatus::Accepted.is_live());
        assert!(!WaitlistStatus::Expired.is_live());
    }
}
