//! Domain models persisted as documents in the progress store.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be stored as a
//! JSON document body and handed unchanged to HTTP consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::duration::MediaDuration;
use crate::types::{CourseId, LearnerId, QuizId, VideoId};

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Gating state of a single video or quiz for one learner.
///
/// The variants are ordered so that `max` merges two observations without
/// ever regressing a completed item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Blocked,
    Unblocked,
    Completed,
}

impl ItemStatus {
    pub fn is_playable(self) -> bool {
        self != ItemStatus::Blocked
    }
}

/// Gating state of a whole course for one learner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CourseStatus {
    Blocked,
    Unblocked,
    InProgress,
    Completed,
}

// ---------------------------------------------------------------------------
// Learner
// ---------------------------------------------------------------------------

/// Account-level data the engine needs: the coin balance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Learner {
    pub id: LearnerId,
    /// Spendable in-app currency. Unsigned, so it can never go negative.
    pub balance: u64,
    #[serde(default)]
    pub subscribed: bool,
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// Pricing tier of a course, used only to pick a default unlock cost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CourseTier {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

/// A video entry inside a course definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourseVideo {
    pub id: VideoId,
    /// Sparse ordering key. Missing values fall back to the array position.
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub duration: Option<MediaDuration>,
}

/// A course as authored in the content catalogue. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Course {
    pub id: CourseId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tier: CourseTier,
    /// Explicit skip-unlock cost; overrides the tier default when set.
    #[serde(default)]
    pub unlock_cost: Option<u64>,
    #[serde(default)]
    pub quiz_id: Option<QuizId>,
    #[serde(default)]
    pub videos: Vec<CourseVideo>,
}

impl Course {
    /// Videos sorted by their effective order (explicit order, else index + 1).
    ///
    /// The sort is stable, so duplicate order values keep authoring order.
    pub fn ordered_videos(&self) -> Vec<(i64, &CourseVideo)> {
        let mut videos: Vec<(i64, &CourseVideo)> = self
            .videos
            .iter()
            .enumerate()
            .map(|(i, v)| (v.order.unwrap_or(i as i64 + 1), v))
            .collect();
        videos.sort_by_key(|(order, _)| *order);
        videos
    }

    pub fn contains_video(&self, video: &VideoId) -> bool {
        self.videos.iter().any(|v| &v.id == video)
    }
}

/// Catalogue order of courses: course N+1 is gated on course N.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalogue {
    pub courses: Vec<CourseId>,
}

impl Catalogue {
    pub fn position(&self, course: &CourseId) -> Option<usize> {
        self.courses.iter().position(|c| c == course)
    }

    pub fn previous(&self, course: &CourseId) -> Option<&CourseId> {
        match self.position(course) {
            Some(i) if i > 0 => self.courses.get(i - 1),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-learner documents
// ---------------------------------------------------------------------------

/// Watch progress of one learner on one video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    pub position_secs: f64,
    pub duration_secs: f64,
    /// `position / duration * 100`, clamped to `0..=100`.
    pub percentage: f64,
    pub status: ItemStatus,
    pub updated_at: DateTime<Utc>,
}

/// Audit fact appended when a video first reaches completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionFact {
    pub learner_id: LearnerId,
    pub video_id: VideoId,
    pub course_id: CourseId,
    pub at: DateTime<Utc>,
}

/// Fact recorded once a learner has passed a course quiz.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuizCompletion {
    pub learner_id: LearnerId,
    pub course_id: CourseId,
    pub quiz_id: QuizId,
    pub at: DateTime<Utc>,
}

/// Materialized course status. Only ever a cache of the derivation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CourseGatingState {
    pub status: CourseStatus,
    pub updated_at: DateTime<Utc>,
}

/// Immutable audit record of a currency unlock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub learner_id: LearnerId,
    pub course_id: CourseId,
    pub cost: u64,
    pub balance_after: u64,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(id: &str, order: Option<i64>) -> CourseVideo {
        CourseVideo {
            id: VideoId::parse(id).unwrap(),
            order,
            duration: None,
        }
    }

    #[test]
    fn missing_order_defaults_to_position() {
        let course = Course {
            id: CourseId::parse("c1").unwrap(),
            title: String::new(),
            tier: CourseTier::Beginner,
            unlock_cost: None,
            quiz_id: None,
            videos: vec![video("b", Some(20)), video("a", None), video("c", Some(5))],
        };

        let ids: Vec<&str> = course
            .ordered_videos()
            .into_iter()
            .map(|(_, v)| v.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn item_status_orders_towards_completion() {
        assert!(ItemStatus::Completed > ItemStatus::Unblocked);
        assert!(ItemStatus::Unblocked > ItemStatus::Blocked);
        assert_eq!(
            ItemStatus::Completed.max(ItemStatus::Unblocked),
            ItemStatus::Completed
        );
    }

    #[test]
    fn catalogue_previous() {
        let cat = Catalogue {
            courses: vec![CourseId::parse("a").unwrap(), CourseId::parse("b").unwrap()],
        };
        assert_eq!(cat.previous(&CourseId::parse("a").unwrap()), None);
        assert_eq!(
            cat.previous(&CourseId::parse("b").unwrap()).map(|c| c.as_str()),
            Some("a")
        );
    }
}
