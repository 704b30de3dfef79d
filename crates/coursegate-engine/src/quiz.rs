//! Quiz completion facts.

use std::sync::Arc;

use chrono::Utc;
use coursegate_shared::{CourseId, ItemStatus, LearnerId, QuizCompletion};
use coursegate_store::{paths, Precondition, ProgressStore, StoreError, WriteBatch};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::gating::GatingResolver;

/// Records passed quizzes once the gating state allows them.
pub struct QuizRecorder {
    store: Arc<dyn ProgressStore>,
    resolver: Arc<GatingResolver>,
}

impl QuizRecorder {
    pub fn new(store: Arc<dyn ProgressStore>, resolver: Arc<GatingResolver>) -> Self {
        Self { store, resolver }
    }

    /// Record that `learner` passed the quiz of `course`.
    ///
    /// Succeeds without writing when the quiz is already completed. Fails
    /// with [`EngineError::Locked`] while any video of the course is still
    /// incomplete.
    pub async fn complete_quiz(&self, learner: &LearnerId, course_id: &CourseId) -> Result<()> {
        let course = self.resolver.catalogue().course(course_id).await?;
        let Some(quiz_id) = course.quiz_id.clone() else {
            return Err(EngineError::NotFound(format!("quiz of course {course_id}")));
        };

        let snapshot = self.resolver.resolve(learner, course_id).await?;
        match snapshot.quiz_status() {
            Some(ItemStatus::Completed) => return Ok(()),
            Some(ItemStatus::Unblocked) => {}
            Some(ItemStatus::Blocked) | None => {
                return Err(EngineError::Locked(format!("quiz {quiz_id}")));
            }
        }

        let fact = QuizCompletion {
            learner_id: learner.clone(),
            course_id: course_id.clone(),
            quiz_id: quiz_id.clone(),
            at: Utc::now(),
        };
        let batch = WriteBatch::new().set_model(
            paths::quiz(learner, &quiz_id),
            &fact,
            Precondition::Absent,
        )?;
        match self.store.commit(batch).await {
            Ok(_) => {}
            // Another session recorded it first.
            Err(StoreError::Conflict { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        info!(learner = %learner, course = %course_id, quiz = %quiz_id, "quiz completed");

        match self.resolver.resolve(learner, course_id).await {
            Ok(snapshot) => {
                if let Err(e) = self.resolver.persist_course_status(learner, &snapshot).await {
                    warn!(learner = %learner, course = %course_id, error = %e, "failed to materialize course status");
                }
            }
            Err(e) => warn!(learner = %learner, course = %course_id, error = %e, "failed to re-resolve course"),
        }
        Ok(())
    }
}
