//! Gating derivation.
//!
//! [`derive`] is a pure function from a course definition plus what is known
//! about one learner ([`LearnerFacts`]) to the gating state of every video,
//! the quiz, and the course itself. [`GatingResolver`] gathers those inputs
//! from the store and walks the catalogue so that "previous course
//! completed" is itself derived rather than read from a stored flag.
//!
//! Rules, in order:
//!
//! 1. A course is accessible if it is the first in the catalogue, the
//!    previous course is completed, or a ledger entry unlocked it.
//! 2. A video's status is its stored progress status (a completion fact
//!    forces `completed`), else `blocked`.
//! 3. In an accessible course, the video after a completed one is at least
//!    `unblocked`, and when nothing is completed yet the lowest-order video
//!    is at least `unblocked`. In an inaccessible course everything not
//!    already completed is `blocked`.
//! 4. The quiz is `completed` once a quiz fact exists, `unblocked` when every
//!    video is completed, otherwise `blocked`.
//! 5. The course is `completed` with its quiz (or, without a quiz, with all
//!    of its videos), `in_progress` once the learner has started it, else
//!    `unblocked`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use coursegate_shared::{
    Course, CourseGatingState, CourseId, CourseStatus, ItemStatus, LearnerId, LedgerEntry,
    ProgressRecord, QuizId, VideoId,
};
use coursegate_store::paths::{self, LearnerDoc};
use coursegate_store::{Document, ProgressStore};
use serde::Serialize;
use tracing::{debug, warn};

use crate::catalogue::ContentCatalogue;
use crate::error::{EngineError, Result};
use crate::retry::with_backoff;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Everything the derivation needs to know about one learner.
#[derive(Debug, Clone, Default)]
pub struct LearnerFacts {
    pub progress: HashMap<VideoId, ProgressRecord>,
    pub completed_videos: HashSet<VideoId>,
    pub completed_quizzes: HashSet<QuizId>,
    /// Courses with at least one ledger entry.
    pub unlocked_courses: HashSet<CourseId>,
}

impl LearnerFacts {
    /// Build facts from the learner's documents. Unreadable documents are
    /// logged and skipped.
    pub fn from_documents(docs: &[Document]) -> Self {
        let mut facts = Self::default();
        for doc in docs {
            let Some((_, kind)) = paths::classify(&doc.path) else {
                continue;
            };
            match kind {
                LearnerDoc::Progress(video) => match doc.decode::<ProgressRecord>() {
                    Ok(record) => {
                        facts.progress.insert(video, record);
                    }
                    Err(e) => warn!(path = %doc.path, error = %e, "skipping malformed progress record"),
                },
                LearnerDoc::Completion(video) => {
                    facts.completed_videos.insert(video);
                }
                LearnerDoc::Quiz(quiz) => {
                    facts.completed_quizzes.insert(quiz);
                }
                LearnerDoc::LedgerEntry(_) => match doc.decode::<LedgerEntry>() {
                    Ok(entry) => {
                        facts.unlocked_courses.insert(entry.course_id);
                    }
                    Err(e) => warn!(path = %doc.path, error = %e, "skipping malformed ledger entry"),
                },
                LearnerDoc::CourseState(_) => {}
            }
        }
        facts
    }

    fn stored_status(&self, video: &VideoId) -> Option<ItemStatus> {
        let from_record = self.progress.get(video).map(|r| r.status);
        if self.completed_videos.contains(video) {
            return Some(ItemStatus::Completed);
        }
        from_record
    }
}

/// Inputs of one course derivation.
#[derive(Debug, Clone, Copy)]
pub struct GatingInput<'a> {
    pub course: &'a Course,
    pub facts: &'a LearnerFacts,
    /// Result of rule 1, computed by the caller from catalogue position and
    /// ledger entries.
    pub accessible: bool,
}

/// Derived gating state of one video.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VideoGate {
    pub video_id: VideoId,
    pub order: i64,
    pub status: ItemStatus,
    pub percentage: f64,
}

/// Derived gating state of a quiz.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QuizGate {
    pub quiz_id: QuizId,
    pub status: ItemStatus,
}

/// Derived gating state of a course for one learner.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GatingSnapshot {
    pub course_id: CourseId,
    pub course: CourseStatus,
    /// Videos in playback order.
    pub videos: Vec<VideoGate>,
    pub quiz: Option<QuizGate>,
}

impl GatingSnapshot {
    pub fn video_status(&self, video: &VideoId) -> Option<ItemStatus> {
        self.videos
            .iter()
            .find(|v| &v.video_id == video)
            .map(|v| v.status)
    }

    pub fn quiz_status(&self) -> Option<ItemStatus> {
        self.quiz.as_ref().map(|q| q.status)
    }

    /// Whether the learner may enter the course at all.
    pub fn is_accessible(&self) -> bool {
        self.course != CourseStatus::Blocked
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derive the gating state of one course. Deterministic and side-effect
/// free apart from logging configuration errors.
pub fn derive(input: &GatingInput<'_>) -> GatingSnapshot {
    let course = input.course;
    let facts = input.facts;
    let ordered = course.ordered_videos();

    let mut statuses: Vec<ItemStatus> = ordered
        .iter()
        .map(|(_, v)| facts.stored_status(&v.id).unwrap_or(ItemStatus::Blocked))
        .collect();

    let started = statuses.iter().any(|s| s.is_playable());

    if input.accessible {
        for i in 1..statuses.len() {
            if statuses[i - 1] == ItemStatus::Completed {
                statuses[i] = statuses[i].max(ItemStatus::Unblocked);
            }
        }
        if !statuses.contains(&ItemStatus::Completed) {
            if let Some(first) = statuses.first_mut() {
                *first = (*first).max(ItemStatus::Unblocked);
            }
        }
    } else {
        for status in statuses.iter_mut() {
            if *status != ItemStatus::Completed {
                *status = ItemStatus::Blocked;
            }
        }
    }

    let all_videos_completed = statuses.iter().all(|s| *s == ItemStatus::Completed);

    let quiz = course.quiz_id.as_ref().map(|quiz_id| {
        let status = if facts.completed_quizzes.contains(quiz_id) {
            ItemStatus::Completed
        } else if input.accessible && all_videos_completed {
            ItemStatus::Unblocked
        } else {
            ItemStatus::Blocked
        };
        QuizGate {
            quiz_id: quiz_id.clone(),
            status,
        }
    });

    let course_status = if !input.accessible {
        CourseStatus::Blocked
    } else if ordered.is_empty() && quiz.is_none() {
        warn!(course = %course.id, "course has neither videos nor a quiz, treating as blocked");
        CourseStatus::Blocked
    } else {
        let finished = match &quiz {
            Some(quiz) => quiz.status == ItemStatus::Completed,
            None => all_videos_completed,
        };
        if finished {
            CourseStatus::Completed
        } else if started {
            CourseStatus::InProgress
        } else {
            CourseStatus::Unblocked
        }
    };

    let videos = ordered
        .iter()
        .zip(statuses)
        .map(|((order, video), status)| VideoGate {
            video_id: video.id.clone(),
            order: *order,
            status,
            percentage: facts
                .progress
                .get(&video.id)
                .map(|r| r.percentage)
                .unwrap_or(0.0),
        })
        .collect();

    GatingSnapshot {
        course_id: course.id.clone(),
        course: course_status,
        videos,
        quiz,
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Gathers learner facts and course metadata, then derives gating state.
///
/// Holds no mutable state of its own; safe to share and call concurrently.
pub struct GatingResolver {
    store: Arc<dyn ProgressStore>,
    catalogue: Arc<ContentCatalogue>,
}

impl GatingResolver {
    pub fn new(store: Arc<dyn ProgressStore>, catalogue: Arc<ContentCatalogue>) -> Self {
        Self { store, catalogue }
    }

    pub fn catalogue(&self) -> &Arc<ContentCatalogue> {
        &self.catalogue
    }

    /// Read every per-learner document fresh from the store.
    pub async fn load_facts(&self, learner: &LearnerId) -> Result<LearnerFacts> {
        let prefix = &paths::learner_prefix(learner);
        let store = &self.store;
        let docs = with_backoff("learner facts", || async move {
            store.list(prefix).await.map_err(EngineError::from)
        })
        .await?;
        Ok(LearnerFacts::from_documents(&docs))
    }

    /// Resolve one course with freshly loaded facts.
    pub async fn resolve(&self, learner: &LearnerId, course: &CourseId) -> Result<GatingSnapshot> {
        let facts = self.load_facts(learner).await?;
        self.resolve_with(&facts, course).await
    }

    /// Resolve one course against already loaded facts.
    pub async fn resolve_with(
        &self,
        facts: &LearnerFacts,
        course_id: &CourseId,
    ) -> Result<GatingSnapshot> {
        let catalogue = self.catalogue.catalogue().await?;

        let Some(position) = catalogue.position(course_id) else {
            // Off-catalogue courses have no predecessor; only a purchase opens
            // them.
            let course = self.catalogue.course(course_id).await?;
            return Ok(derive(&GatingInput {
                course: &course,
                facts,
                accessible: facts.unlocked_courses.contains(course_id),
            }));
        };

        let mut previous_completed = false;
        let mut snapshot = None;
        for (i, id) in catalogue.courses[..=position].iter().enumerate() {
            let course = self.catalogue.course(id).await?;
            let accessible =
                i == 0 || previous_completed || facts.unlocked_courses.contains(id);
            let derived = derive(&GatingInput {
                course: &course,
                facts,
                accessible,
            });
            previous_completed = derived.course == CourseStatus::Completed;
            snapshot = Some(derived);
        }

        snapshot.ok_or_else(|| EngineError::NotFound(format!("course {course_id}")))
    }

    /// Resolve every catalogue course in order, in one pass.
    pub async fn resolve_catalogue(&self, learner: &LearnerId) -> Result<Vec<GatingSnapshot>> {
        let facts = self.load_facts(learner).await?;
        let catalogue = self.catalogue.catalogue().await?;

        let mut snapshots = Vec::with_capacity(catalogue.courses.len());
        let mut previous_completed = false;
        for (i, id) in catalogue.courses.iter().enumerate() {
            let course = self.catalogue.course(id).await?;
            let accessible =
                i == 0 || previous_completed || facts.unlocked_courses.contains(id);
            let derived = derive(&GatingInput {
                course: &course,
                facts: &facts,
                accessible,
            });
            previous_completed = derived.course == CourseStatus::Completed;
            snapshots.push(derived);
        }
        Ok(snapshots)
    }

    /// Materialize the derived course status as a convenience document.
    /// Writes only when the stored value differs; returns whether it wrote.
    pub async fn persist_course_status(
        &self,
        learner: &LearnerId,
        snapshot: &GatingSnapshot,
    ) -> Result<bool> {
        let path = paths::course_state(learner, &snapshot.course_id);
        if let Some(doc) = self.store.get(&path).await? {
            match doc.decode::<CourseGatingState>() {
                Ok(stored) if stored.status == snapshot.course => return Ok(false),
                Ok(stored) => debug!(
                    learner = %learner,
                    course = %snapshot.course_id,
                    stored = ?stored.status,
                    derived = ?snapshot.course,
                    "materialized course status is stale"
                ),
                Err(e) => warn!(path = %path, error = %e, "overwriting unreadable course state"),
            }
        }

        let state = CourseGatingState {
            status: snapshot.course,
            updated_at: Utc::now(),
        };
        let body = serde_json::to_value(&state)
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        self.store.put(&path, body).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use coursegate_shared::{CourseTier, CourseVideo};

    use super::*;

    fn id<T: std::str::FromStr>(s: &str) -> T
    where
        T::Err: std::fmt::Debug,
    {
        s.parse().unwrap()
    }

    fn course(videos: &[(&str, i64)], quiz: Option<&str>) -> Course {
        Course {
            id: id("course-1"),
            title: "Course".into(),
            tier: CourseTier::Beginner,
            unlock_cost: None,
            quiz_id: quiz.map(id),
            videos: videos
                .iter()
                .map(|(v, order)| CourseVideo {
                    id: id(v),
                    order: Some(*order),
                    duration: None,
                })
                .collect(),
        }
    }

    fn record(status: ItemStatus) -> ProgressRecord {
        ProgressRecord {
            position_secs: 10.0,
            duration_secs: 100.0,
            percentage: 10.0,
            status,
            updated_at: Utc::now(),
        }
    }

    fn with_progress(entries: &[(&str, ItemStatus)]) -> LearnerFacts {
        let mut facts = LearnerFacts::default();
        for (video, status) in entries {
            facts.progress.insert(id(video), record(*status));
        }
        facts
    }

    fn statuses(snapshot: &GatingSnapshot) -> Vec<ItemStatus> {
        snapshot.videos.iter().map(|v| v.status).collect()
    }

    #[test]
    fn test_first_video_unblocked_by_default() {
        let course = course(&[("v2", 20), ("v1", 10)], None);
        let facts = LearnerFacts::default();
        let snapshot = derive(&GatingInput {
            course: &course,
            facts: &facts,
            accessible: true,
        });

        assert_eq!(snapshot.videos[0].video_id, id::<VideoId>("v1"));
        assert_eq!(
            statuses(&snapshot),
            vec![ItemStatus::Unblocked, ItemStatus::Blocked]
        );
        assert_eq!(snapshot.course, CourseStatus::Unblocked);
    }

    #[test]
    fn test_partial_progress_is_in_progress() {
        let course = course(&[("v1", 1), ("v2", 2), ("v3", 3)], Some("q1"));
        let facts = with_progress(&[("v1", ItemStatus::Completed), ("v2", ItemStatus::Unblocked)]);
        let snapshot = derive(&GatingInput {
            course: &course,
            facts: &facts,
            accessible: true,
        });

        assert_eq!(
            statuses(&snapshot),
            vec![ItemStatus::Completed, ItemStatus::Unblocked, ItemStatus::Blocked]
        );
        assert_eq!(snapshot.quiz_status(), Some(ItemStatus::Blocked));
        assert_eq!(snapshot.course, CourseStatus::InProgress);
    }

    #[test]
    fn test_completed_video_unblocks_next() {
        let course = course(&[("v1", 1), ("v2", 2)], None);
        let facts = with_progress(&[("v1", ItemStatus::Completed)]);
        let snapshot = derive(&GatingInput {
            course: &course,
            facts: &facts,
            accessible: true,
        });
        assert_eq!(snapshot.video_status(&id("v2")), Some(ItemStatus::Unblocked));
    }

    #[test]
    fn test_quiz_unblocks_after_all_videos() {
        let course = course(&[("v1", 1), ("v2", 2)], Some("q1"));
        let facts = with_progress(&[("v1", ItemStatus::Completed), ("v2", ItemStatus::Completed)]);
        let snapshot = derive(&GatingInput {
            course: &course,
            facts: &facts,
            accessible: true,
        });
        assert_eq!(snapshot.quiz_status(), Some(ItemStatus::Unblocked));
        assert_eq!(snapshot.course, CourseStatus::InProgress);

        let mut facts = facts;
        facts.completed_quizzes.insert(id("q1"));
        let snapshot = derive(&GatingInput {
            course: &course,
            facts: &facts,
            accessible: true,
        });
        assert_eq!(snapshot.quiz_status(), Some(ItemStatus::Completed));
        assert_eq!(snapshot.course, CourseStatus::Completed);
    }

    #[test]
    fn test_without_quiz_all_videos_complete_the_course() {
        let course = course(&[("v1", 1)], None);
        let facts = with_progress(&[("v1", ItemStatus::Completed)]);
        let snapshot = derive(&GatingInput {
            course: &course,
            facts: &facts,
            accessible: true,
        });
        assert_eq!(snapshot.course, CourseStatus::Completed);
    }

    #[test]
    fn test_completion_fact_overrides_stale_record() {
        let course = course(&[("v1", 1), ("v2", 2)], None);
        let mut facts = with_progress(&[("v1", ItemStatus::Unblocked)]);
        facts.completed_videos.insert(id("v1"));
        let snapshot = derive(&GatingInput {
            course: &course,
            facts: &facts,
            accessible: true,
        });
        assert_eq!(
            statuses(&snapshot),
            vec![ItemStatus::Completed, ItemStatus::Unblocked]
        );
    }

    #[test]
    fn test_inaccessible_course_is_fully_blocked() {
        let course = course(&[("v1", 1), ("v2", 2)], Some("q1"));
        let facts = with_progress(&[("v1", ItemStatus::Unblocked)]);
        let snapshot = derive(&GatingInput {
            course: &course,
            facts: &facts,
            accessible: false,
        });
        assert_eq!(
            statuses(&snapshot),
            vec![ItemStatus::Blocked, ItemStatus::Blocked]
        );
        assert_eq!(snapshot.quiz_status(), Some(ItemStatus::Blocked));
        assert_eq!(snapshot.course, CourseStatus::Blocked);
    }

    #[test]
    fn test_quiz_only_course() {
        let course = course(&[], Some("q1"));
        let facts = LearnerFacts::default();
        let snapshot = derive(&GatingInput {
            course: &course,
            facts: &facts,
            accessible: true,
        });
        assert_eq!(snapshot.quiz_status(), Some(ItemStatus::Unblocked));
        assert_eq!(snapshot.course, CourseStatus::Unblocked);
    }

    #[test]
    fn test_empty_course_is_configuration_error() {
        let course = course(&[], None);
        let facts = LearnerFacts::default();
        let snapshot = derive(&GatingInput {
            course: &course,
            facts: &facts,
            accessible: true,
        });
        assert_eq!(snapshot.course, CourseStatus::Blocked);
    }

    #[test]
    fn test_facts_from_documents() {
        let learner: LearnerId = id("l1");
        let video: VideoId = id("v1");
        let now = Utc::now();
        let doc = |path: String, body: serde_json::Value| Document {
            path,
            body,
            version: 1,
            revision: 1,
            updated_at: now,
        };

        let docs = vec![
            doc(
                paths::progress(&learner, &video),
                serde_json::to_value(record(ItemStatus::Unblocked)).unwrap(),
            ),
            doc(paths::completion(&learner, &video), serde_json::json!({})),
            doc(
                paths::progress(&learner, &id("broken")),
                serde_json::json!({"nonsense": true}),
            ),
        ];

        let facts = LearnerFacts::from_documents(&docs);
        assert_eq!(facts.progress.len(), 1);
        assert!(facts.completed_videos.contains(&video));
    }
}
