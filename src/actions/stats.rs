use chrono::{DateTime, Utc};
use diesel::dsl::{count_star, sum};
use diesel::prelude::*;
use uuid::Uuid;

use super::{count_waitlist, find_event, seats_taken};
use crate::error::ApiResult;
use crate::models::{
    attendance_rate, mean_rating, tally, EventCounts, EventStats, EventStatus, MemberStats,
    MembershipStatus, MembershipTier, Overview, PaymentKind, RegistrationCounts, RegistrationStatus,
    Revenue, WaitlistStatus,
};
use crate::schema::{event_feedback, event_registrations, events, payment_history, users};

fn member_stats(conn: &mut PgConnection) -> QueryResult<MemberStats> {
    let total: i64 = users::table.select(count_star()).first(conn)?;
    let pending_approval: i64 = users::table
        .filter(users::is_approved.eq(false))
        .select(count_star())
        .first(conn)?;
    let by_status = users::table
        .group_by(users::membership_status)
        .select((users::membership_status, count_star()))
        .load::<(MembershipStatus, i64)>(conn)?;
    let by_tier = users::table
        .filter(users::membership_tier.is_not_null())
        .group_by(users::membership_tier)
        .select((users::membership_tier, count_star()))
        .load::<(Option<MembershipTier>, i64)>(conn)?;

    Ok(MemberStats {
        total,
        pending_approval,
        by_status: tally(MembershipStatus::ALL, MembershipStatus::as_str, by_status),
        by_tier: tally(
            MembershipTier::ALL,
            MembershipTier::as_str,
            by_tier.into_iter().filter_map(|(tier, n)| tier.map(|t| (t, n))),
        ),
    })
}

fn registration_counts(conn: &mut PgConnection, event_id: Option<Uuid>) -> QueryResult<RegistrationCounts> {
    let rows: Vec<(RegistrationStatus, i64)> = match event_id {
        Some(id) => event_registrations::table
            .filter(event_registrations::event_id.eq(id))
            .group_by(event_registrations::status)
            .select((event_registrations::status, count_star()))
            .load(conn)?,
        None => event_registrations::table
            .group_by(event_registrations::status)
            .select((event_registrations::status, count_star()))
            .load(conn)?,
    };

    let mut checked_in = event_registrations::table
        .filter(event_registrations::checked_in.eq(true))
        .select(count_star())
        .into_boxed();
    if let Some(id) = event_id {
        checked_in = checked_in.filter(event_registrations::event_id.eq(id));
    }

    Ok(RegistrationCounts {
        total: rows.iter().map(|(_, n)| n).sum(),
        checked_in: checked_in.first(conn)?,
        by_status: tally(RegistrationStatus::ALL, RegistrationStatus::as_str, rows),
    })
}

fn revenue(conn: &mut PgConnection, event_id: Option<Uuid>) -> QueryResult<Revenue> {
    let mut gross = payment_history::table
        .filter(payment_history::kind.ne(PaymentKind::Refund))
        .select(sum(payment_history::amount_cents))
        .into_boxed();
    let mut refunded = payment_history::table
        .filter(payment_history::kind.eq(PaymentKind::Refund))
        .select(sum(payment_history::amount_cents))
        .into_boxed();
    if let Some(id) = event_id {
        gross = gross.filter(payment_history::event_id.eq(id));
        refunded = refunded.filter(payment_history::event_id.eq(id));
    }

    let gross: Option<i64> = gross.first(conn)?;
    let refunded: Option<i64> = refunded.first(conn)?;
    Ok(Revenue::new(gross.unwrap_or(0), refunded.unwrap_or(0)))
}

pub fn overview(conn: &mut PgConnection, now: DateTime<Utc>) -> ApiResult<Overview> {
    let schedule: Vec<(DateTime<Utc>, DateTime<Utc>, bool)> = events::table
        .select((events::start_date, events::end_date, events::is_cancelled))
        .load(conn)?;
    let statuses = schedule
        .iter()
        .map(|(start, end, cancelled)| (EventStatus::derive(now, *start, *end, *cancelled), 1));

    Ok(Overview {
        members: member_stats(conn)?,
        events: EventCounts {
            total: schedule.len() as i64,
            by_status: tally(EventStatus::ALL, EventStatus::as_str, statuses),
        },
        registrations: registration_counts(conn, None)?,
        revenue: revenue(conn, None)?,
    })
}

pub fn event_stats(conn: &mut PgConnection, event_id: Uuid) -> ApiResult<EventStats> {
    let event = find_event(conn, event_id)?;
    let taken = seats_taken(conn, event_id)?;
    let registrations = registration_counts(conn, Some(event_id))?;

    let ratings: Vec<i32> = event_feedback::table
        .filter(event_feedback::event_id.eq(event_id))
        .select(event_feedback::rating)
        .load(conn)?;
    let feedback_count = ratings.len() as i64;
    let average_rating = mean_rating(ratings.into_iter());

    Ok(EventStats {
        event_id,
        max_attendees: event.max_attendees,
        seats_taken: taken,
        seats_remaining: event.seats_remaining(taken),
        attendance_rate: attendance_rate(registrations.checked_in, taken),
        registrations,
        waiting: count_waitlist(conn, event_id, WaitlistStatus::Waiting)?,
        offered: count_waitlist(conn, event_id, WaitlistStatus::Offered)?,
        feedback_count,
        average_rating,
        revenue: revenue(conn, Some(event_id))?,
    })
}
