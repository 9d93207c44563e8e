use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

/// Counts keyed by status/tier spelling. Every known key is present, zero
/// when nothing matches.
pub type Tally = BTreeMap<&'static str, i64>;

pub fn tally<K: Copy>(
    keys: &[K],
    name: impl Fn(&K) -> &'static str,
    rows: impl IntoIterator<Item = (K, i64)>,
) -> Tally {
    let mut counts: Tally = keys.iter().map(|k| (name(k), 0)).collect();
    for (key, n) in rows {
        *counts.entry(name(&key)).or_insert(0) += n;
    }
    counts
}

#[derive(Debug, Serialize)]
pub struct MemberStats {
    pub total: i64,
    pub pending_approval: i64,
    pub by_status: Tally,
    pub by_tier: Tally,
}

#[derive(Debug, Serialize)]
pub struct EventCounts {
    pub total: i64,
    pub by_status: Tally,
}

#[derive(Debug, Serialize)]
pub struct RegistrationCounts {
    pub total: i64,
    pub checked_in: i64,
    pub by_status: Tally,
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct Revenue {
    pub gross_cents: i64,
    pub refunded_cents: i64,
    pub net_cents: i64,
}

impl Revenue {
    pub fn new(gross_cents: i64, refunded_cents: i64) -> Self {
        Self { gross_cents, refunded_cents, net_cents: gross_cents - refunded_cents }
    }
}

#[derive(Debug, Serialize)]
pub struct Overview {
    pub members: MemberStats,
    pub events: EventCounts,
    pub registrations: RegistrationCounts,
    pub revenue: Revenue,
}

#[derive(Debug, Serialize)]
pub struct EventStats {
    pub event_id: Uuid,
    pub max_attendees: Option<i32>,
    pub seats_taken: i64,
    pub seats_remaining: Option<i64>,
    pub registrations: RegistrationCounts,
    /// Checked-in share of live registrations, 0-100.
    pub attendance_rate: Option<f64>,
    pub waiting: i64,
    pub offered: i64,
    pub feedback_count: i64,
    pub average_rating: Option<f64>,
    pub revenue: Revenue,
}

pub fn attendance_rate(checked_in: i64, live: i64) -> Option<f64> {
    if live == 0 {
        None
    } else {
        Some(((checked_in as f64 / live as f64) * 1000.0).round() / 10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RegistrationStatus;

    #[test]
    fn tally_fills_missing_keys_with_zero() {
        let counts = tally(
            RegistrationStatus::ALL,
            RegistrationStatus::as_str,
            vec![(RegistrationStatus::Registered, 3), (RegistrationStatus::Cancelled, 1)],
        );
        assert_eq!(counts.len(), RegistrationStatus::ALL.len());
        assert_eq!(counts["registered"], 3);
        assert_eq!(counts["pending"], 0);
    }

    #[test]
    fn attendance_rate_rounds_to_one_decimal() {
        assert_eq!(attendance_rate(2, 3), Some(66.7));
        assert_eq!(attendance_rate(0, 0), None);
    }
}
