//! Document path layout.
//!
//! ```text
//! catalogue
//! courses/{course}
//! learners/{learner}
//! learners/{learner}/progress/{video}
//! learners/{learner}/completions/{video}
//! learners/{learner}/quizzes/{quiz}
//! learners/{learner}/courses/{course}
//! learners/{learner}/ledger/{entry}
//! ```

use coursegate_shared::{CourseId, LearnerId, QuizId, VideoId};
use uuid::Uuid;

pub const CATALOGUE: &str = "catalogue";

pub fn course(course: &CourseId) -> String {
    format!("courses/{course}")
}

pub fn learner(learner: &LearnerId) -> String {
    format!("learners/{learner}")
}

/// Prefix covering every per-learner document except the account itself.
pub fn learner_prefix(learner: &LearnerId) -> String {
    format!("learners/{learner}/")
}

pub fn progress(learner: &LearnerId, video: &VideoId) -> String {
    format!("learners/{learner}/progress/{video}")
}

pub fn progress_prefix(learner: &LearnerId) -> String {
    format!("learners/{learner}/progress/")
}

pub fn completion(learner: &LearnerId, video: &VideoId) -> String {
    format!("learners/{learner}/completions/{video}")
}

pub fn completions_prefix(learner: &LearnerId) -> String {
    format!("learners/{learner}/completions/")
}

pub fn quiz(learner: &LearnerId, quiz: &QuizId) -> String {
    format!("learners/{learner}/quizzes/{quiz}")
}

pub fn quizzes_prefix(learner: &LearnerId) -> String {
    format!("learners/{learner}/quizzes/")
}

pub fn course_state(learner: &LearnerId, course: &CourseId) -> String {
    format!("learners/{learner}/courses/{course}")
}

pub fn ledger_entry(learner: &LearnerId, entry: &Uuid) -> String {
    format!("learners/{learner}/ledger/{entry}")
}

pub fn ledger_prefix(learner: &LearnerId) -> String {
    format!("learners/{learner}/ledger/")
}

/// Classified per-learner document path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnerDoc {
    Progress(VideoId),
    Completion(VideoId),
    Quiz(QuizId),
    CourseState(CourseId),
    LedgerEntry(String),
}

/// Split a per-learner document path into its learner and document kind.
/// Returns `None` for paths outside the per-learner layout.
pub fn classify(path: &str) -> Option<(LearnerId, LearnerDoc)> {
    let mut parts = path.split('/');
    if parts.next()? != "learners" {
        return None;
    }
    let learner = LearnerId::parse(parts.next()?).ok()?;
    let kind = parts.next()?;
    let id = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let doc = match kind {
        "progress" => LearnerDoc::Progress(VideoId::parse(id).ok()?),
        "completions" => LearnerDoc::Completion(VideoId::parse(id).ok()?),
        "quizzes" => LearnerDoc::Quiz(QuizId::parse(id).ok()?),
        "courses" => LearnerDoc::CourseState(CourseId::parse(id).ok()?),
        "ledger" => LearnerDoc::LedgerEntry(id.to_string()),
        _ => return None,
    };
    Some((learner, doc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_round_trips_builders() {
        let l = LearnerId::parse("l1").unwrap();
        let v = VideoId::parse("v9").unwrap();

        assert_eq!(
            classify(&progress(&l, &v)),
            Some((l.clone(), LearnerDoc::Progress(v.clone())))
        );
        assert_eq!(
            classify(&completion(&l, &v)),
            Some((l.clone(), LearnerDoc::Completion(v)))
        );
        assert_eq!(classify(&learner(&l)), None);
        assert_eq!(classify("courses/c1"), None);
        assert_eq!(classify("learners/l1/unknown/x"), None);
    }
}
