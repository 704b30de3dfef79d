#![allow(dead_code)]

use std::sync::Arc;

use coursegate_engine::catalogue::CatalogueFile;
use coursegate_engine::progress::{PlaybackSample, SampleOutcome, SampleTrigger};
use coursegate_engine::{Engine, EngineConfig};
use coursegate_shared::{Course, CourseTier, CourseVideo, LearnerId, MediaDuration};
use coursegate_store::{ProgressStore, SqliteProgressStore};

pub fn course(id: &str, cost: Option<u64>, videos: &[&str], quiz: Option<&str>) -> Course {
    Course {
        id: id.parse().unwrap(),
        title: format!("Course {id}"),
        tier: CourseTier::Intermediate,
        unlock_cost: cost,
        quiz_id: quiz.map(|q| q.parse().unwrap()),
        videos: videos
            .iter()
            .enumerate()
            .map(|(i, v)| CourseVideo {
                id: v.parse().unwrap(),
                order: Some(i as i64 + 1),
                duration: Some(MediaDuration::from_secs_f64(100.0).unwrap()),
            })
            .collect(),
    }
}

/// Two courses: `c1` (v1, v2, v3 + quiz q1) then `c2` (w1, w2, cost 200).
pub fn catalogue_file() -> CatalogueFile {
    CatalogueFile {
        courses: vec![
            course("c1", None, &["v1", "v2", "v3"], Some("q1")),
            course("c2", Some(200), &["w1", "w2"], None),
        ],
    }
}

pub async fn engine_on(store: Arc<dyn ProgressStore>) -> Engine {
    let engine = Engine::new(store, EngineConfig::default());
    engine.catalogue().import(&catalogue_file()).await.unwrap();
    engine
}

pub async fn engine() -> Engine {
    engine_on(Arc::new(SqliteProgressStore::open_in_memory().unwrap())).await
}

pub fn learner() -> LearnerId {
    "learner-1".parse().unwrap()
}

pub async fn watch_to(
    engine: &Engine,
    learner: &LearnerId,
    course: &str,
    video: &str,
    position_secs: f64,
) -> SampleOutcome {
    let sample = PlaybackSample {
        video_id: video.parse().unwrap(),
        course_id: course.parse().unwrap(),
        position_secs,
        duration: Some(MediaDuration::parse("100").unwrap()),
        trigger: SampleTrigger::Pause,
    };
    engine.record_sample(learner, &sample).await
}
