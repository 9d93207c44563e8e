use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::find_event;
use crate::error::{ApiError, ApiResult};
use crate::models::{EventFeedback, FeedbackSummary, FeedbackView, SubmitFeedbackRequest};
use crate::schema::{event_feedback, event_registrations, users};

/// Stores feedback from a checked-in attendee. One submission per member and event.
pub fn submit(
    conn: &mut PgConnection,
    event_id: Uuid,
    user_id: Uuid,
    request: SubmitFeedbackRequest,
    now: DateTime<Utc>,
) -> ApiResult<EventFeedback> {
    request.validate()?;
    find_event(conn, event_id)?;

    let attended: Option<bool> = event_registrations::table
        .filter(event_registrations::event_id.eq(event_id))
        .filter(event_registrations::user_id.eq(user_id))
        .select(event_registrations::checked_in)
        .first(conn)
        .optional()?;
    if attended != Some(true) {
        return Err(ApiError::forbidden("Only checked-in attendees can leave feedback"));
    }

    let already: i64 = event_feedback::table
        .filter(event_feedback::event_id.eq(event_id))
        .filter(event_feedback::user_id.eq(user_id))
        .count()
        .get_result(conn)?;
    if already > 0 {
        return Err(ApiError::conflict("You have already submitted feedback for this event"));
    }

    let feedback = diesel::insert_into(event_feedback::table)
        .values(&request.into_new_feedback(event_id, user_id, now))
        .returning(EventFeedback::as_returning())
        .get_result(conn)?;
    log::info!("User {} left feedback for event {}", user_id, event_id);
    Ok(feedback)
}

pub fn mine(conn: &mut PgConnection, event_id: Uuid, user_id: Uuid) -> ApiResult<EventFeedback> {
    event_feedback::table
        .filter(event_feedback::event_id.eq(event_id))
        .filter(event_feedback::user_id.eq(user_id))
        .select(EventFeedback::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("You have not submitted feedback for this event"))
}

fn rows_for(conn: &mut PgConnection, event_id: Uuid) -> QueryResult<Vec<EventFeedback>> {
    event_feedback::table
        .filter(event_feedback::event_id.eq(event_id))
        .select(EventFeedback::as_select())
        .load(conn)
}

pub fn summary(conn: &mut PgConnection, event_id: Uuid) -> ApiResult<FeedbackSummary> {
    find_event(conn, event_id)?;
    Ok(FeedbackSummary::from_rows(&rows_for(conn, event_id)?))
}

/// Admin listing, newest first. Anonymous rows do not reveal their author.
pub fn list(conn: &mut PgConnection, event_id: Uuid) -> ApiResult<Vec<FeedbackView>> {
    find_event(conn, event_id)?;

    let rows: Vec<(EventFeedback, (String, String))> = event_feedback::table
        .inner_join(users::table)
        .filter(event_feedback::event_id.eq(event_id))
        .order(event_feedback::created_at.desc())
        .select((EventFeedback::as_select(), (users::first_name, users::last_name)))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(feedback, (first, last))| FeedbackView::new(feedback, format!("{} {}", first, last)))
        .collect())
}
