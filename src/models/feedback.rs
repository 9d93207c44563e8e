use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::schema::event_feedback;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = event_feedback)]
pub struct EventFeedback {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub rating: i32,
    pub content_rating: Option<i32>,
    pub speaker_rating: Option<i32>,
    pub venue_rating: Option<i32>,
    pub networking_rating: Option<i32>,
    pub comment: Option<String>,
    pub would_recommend: Option<bool>,
    pub is_anonymous: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = event_feedback)]
pub struct NewEventFeedback {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub rating: i32,
    pub content_rating: Option<i32>,
    pub speaker_rating: Option<i32>,
    pub venue_rating: Option<i32>,
    pub networking_rating: Option<i32>,
    pub comment: Option<String>,
    pub would_recommend: Option<bool>,
    pub is_anonymous: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitFeedbackRequest {
    pub rating: i32,
    pub content_rating: Option<i32>,
    pub speaker_rating: Option<i32>,
    pub venue_rating: Option<i32>,
    pub networking_rating: Option<i32>,
    pub comment: Option<String>,
    pub would_recommend: Option<bool>,
    #[serde(default)]
    pub is_anonymous: bool,
}

const MAX_COMMENT_CHARS: usize = 2_000;

fn check_rating(value: i32, field: &str) -> ApiResult<()> {
    if (1..=5).contains(&value) {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!("{} must be between 1 and 5", field)))
    }
}

impl SubmitFeedbackRequest {
    pub fn validate(&self) -> ApiResult<()> {
        check_rating(self.rating, "rating")?;
        let optional = [
            (self.content_rating, "content_rating"),
            (self.speaker_rating, "speaker_rating"),
            (self.venue_rating, "venue_rating"),
            (self.networking_rating, "networking_rating"),
        ];
        for (value, field) in optional {
            if let Some(v) = value {
                check_rating(v, field)?;
            }
        }
        if self.comment.as_ref().map_or(false, |c| c.chars().count() > MAX_COMMENT_CHARS) {
            return Err(ApiError::bad_request("comment is too long"));
        }
        Ok(())
    }

    pub fn into_new_feedback(self, event_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> NewEventFeedback {
        NewEventFeedback {
            id: Uuid::new_v4(),
            event_id,
            user_id,
            rating: self.rating,
            content_rating: self.content_rating,
            speaker_rating: self.speaker_rating,
            venue_rating: self.venue_rating,
            networking_rating: self.networking_rating,
            comment: self.comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            would_recommend: self.would_recommend,
            is_anonymous: self.is_anonymous,
            created_at: now,
        }
    }
}

/// Feedback row as shown to admins. Anonymous rows carry neither the author's
/// id nor their name.
#[derive(Debug, Serialize)]
pub struct FeedbackView {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Option<Uuid>,
    pub author_name: Option<String>,
    pub rating: i32,
    pub content_rating: Option<i32>,
    pub speaker_rating: Option<i32>,
    pub venue_rating: Option<i32>,
    pub networking_rating: Option<i32>,
    pub comment: Option<String>,
    pub would_recommend: Option<bool>,
    pub is_anonymous: bool,
    pub created_at: DateTime<Utc>,
}

impl FeedbackView {
    pub fn new(feedback: EventFeedback, author_name: String) -> Self {
        let visible = !feedback.is_anonymous;
        Self {
            id: feedback.id,
            event_id: feedback.event_id,
            user_id: visible.then_some(feedback.user_id),
            author_name: visible.then_some(author_name),
            rating: feedback.rating,
            content_rating: feedback.content_rating,
            speaker_rating: feedback.speaker_rating,
            venue_rating: feedback.venue_rating,
            networking_rating: feedback.networking_rating,
            comment: feedback.comment,
            would_recommend: feedback.would_recommend,
            is_anonymous: feedback.is_anonymous,
            created_at: feedback.created_at,
        }
    }
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct FeedbackSummary {
    pub count: i64,
    pub average_rating: Option<f64>,
    pub average_content_rating: Option<f64>,
    pub average_speaker_rating: Option<f64>,
    pub average_venue_rating: Option<f64>,
    pub average_networking_rating: Option<f64>,
    pub recommend_percent: Option<f64>,
}

/// Mean rounded to two decimals, `None` when empty.
pub fn mean_rating(values: impl Iterator<Item = i32>) -> Option<f64> {
    let (sum, n) = values.fold((0i64, 0i64), |(s, n), v| (s + i64::from(v), n + 1));
    if n == 0 {
        None
    } else {
        Some(((sum as f64 / n as f64) * 100.0).round() / 100.0)
    }
}

impl FeedbackSummary {
    pub fn from_rows(rows: &[EventFeedback]) -> Self {
        let answered: Vec<bool> = rows.iter().filter_map(|r| r.would_recommend).collect();
        let recommend_percent = if answered.is_empty() {
            None
        } else {
            let yes = answered.iter().filter(|v| **v).count() as f64;
            Some(((yes / answered.len() as f64) * 1000.0).round() / 10.0)
        };

        Self {
            count: rows.len() as i64,
            average_rating: mean_rating(rows.iter().map(|r| r.rating)),
            average_content_rating: mean_rating(rows.iter().filter_map(|r| r.content_rating)),
            average_speaker_rating: mean_rating(rows.iter().filter_map(|r| r.speaker_rating)),
            average_venue_rating: mean_rating(rows.iter().filter_map(|r| r.venue_rating)),
            average_networking_rating: mean_rating(rows.iter().filter_map(|r| r.networking_rating)),
            recommend_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(rating: i32) -> SubmitFeedbackRequest {
        SubmitFeedbackRequest {
            rating,
            content_rating: None,
            speaker_rating: None,
            venue_rating: None,
            networking_rating: None,
            comment: None,
            would_recommend: None,
            is_anonymous: false,
        }
    }

    fn row(rating: i32, speaker: Option<i32>, recommend: Option<bool>) -> EventFeedback {
        EventFeedback {
            id: Uuid::new_v4(),
            event_id: Uuid::nil(),
            user_id: Uuid::new_v4(),
            rating,
            content_rating: None,
            speaker_rating: speaker,
            venue_rating: None,
            networking_rating: None,
            comment: None,
            would_recommend: recommend,
            is_anonymous: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ratings_must_be_one_to_five() {
        assert!(request(1).validate().is_ok());
        assert!(request(5).validate().is_ok());
        assert!(request(0).validate().is_err());
        assert!(request(6).validate().is_err());

        let mut req = request(4);
        req.venue_rating = Some(9);
        assert!(req.validate().is_err());
    }

    #[test]
    fn summary_averages_only_answered_categories() {
        let rows = vec![
            row(5, Some(4), Some(true)),
            row(4, None, Some(false)),
            row(2, Some(3), None),
        ];
        let summary = FeedbackSummary::from_rows(&rows);

        assert_eq!(summary.count, 3);
        assert_eq!(summary.average_rating, Some(3.67));
        assert_eq!(summary.average_speaker_rating, Some(3.5));
        assert_eq!(summary.average_venue_rating, None);
        assert_eq!(summary.recommend_percent, Some(50.0));
    }

    #[test]
    fn anonymous_feedback_hides_its_author() {
        let mut anonymous = row(4, None, None);
        anonymous.is_anonymous = true;
        let view = FeedbackView::new(anonymous, "Ada Lovelace".to_string());
        assert_eq!(view.user_id, None);
        assert_eq!(view.author_name, None);

        let named = row(4, None, None);
        let author = named.user_id;
        let view = FeedbackView::new(named, "Ada Lovelace".to_string());
        assert_eq!(view.user_id, Some(author));
        assert_eq!(view.author_name.as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn empty_summary() {
        assert_eq!(FeedbackSummary::from_rows(&[]), FeedbackSummary::default());
    }
}
