mod common;

use common::{engine, learner, watch_to};
use coursegate_engine::progress::SampleOutcome;
use coursegate_engine::EngineError;
use coursegate_shared::{CourseId, CourseStatus, ItemStatus, VideoId};

fn c(id: &str) -> CourseId {
    id.parse().unwrap()
}

fn v(id: &str) -> VideoId {
    id.parse().unwrap()
}

#[tokio::test]
async fn completing_a_video_unblocks_the_next() {
    let engine = engine().await;
    let l = learner();

    let before = engine.resolve(&l, &c("c1")).await.unwrap();
    assert_eq!(before.video_status(&v("v2")), Some(ItemStatus::Blocked));

    let outcome = watch_to(&engine, &l, "c1", "v1", 96.0).await;
    assert_eq!(
        outcome,
        SampleOutcome::Written {
            status: ItemStatus::Completed,
            completed_now: true
        }
    );

    let after = engine.resolve(&l, &c("c1")).await.unwrap();
    assert_eq!(after.videos[0].percentage, 96.0);
    assert_eq!(after.video_status(&v("v1")), Some(ItemStatus::Completed));
    assert_eq!(after.video_status(&v("v2")), Some(ItemStatus::Unblocked));
    assert_eq!(after.video_status(&v("v3")), Some(ItemStatus::Blocked));
}

#[tokio::test]
async fn unlock_without_funds_leaves_balance() {
    let engine = engine().await;
    let l = learner();
    engine.credit(&l, 50).await.unwrap();

    let err = engine.unlock(&l, &c("c2")).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientFunds {
            balance: 50,
            cost: 200
        }
    ));
    assert_eq!(engine.balance(&l).await.unwrap(), 50);
    assert_eq!(
        engine.resolve(&l, &c("c2")).await.unwrap().course,
        CourseStatus::Blocked
    );
}

#[tokio::test]
async fn unlock_with_funds_opens_course() {
    let engine = engine().await;
    let l = learner();
    engine.credit(&l, 300).await.unwrap();

    let receipt = engine.unlock(&l, &c("c2")).await.unwrap();
    assert_eq!(receipt.new_balance, 100);
    assert_eq!(engine.balance(&l).await.unwrap(), 100);

    let snapshot = engine.resolve(&l, &c("c2")).await.unwrap();
    assert_eq!(snapshot.course, CourseStatus::Unblocked);
    assert_eq!(snapshot.video_status(&v("w1")), Some(ItemStatus::Unblocked));

    let history = engine.history(&l).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].course_id, c("c2"));
    assert_eq!(history[0].balance_after, 100);
}

#[tokio::test]
async fn quiz_stays_blocked_while_videos_remain() {
    let engine = engine().await;
    let l = learner();

    watch_to(&engine, &l, "c1", "v1", 100.0).await;
    watch_to(&engine, &l, "c1", "v2", 30.0).await;

    let snapshot = engine.resolve(&l, &c("c1")).await.unwrap();
    assert_eq!(snapshot.video_status(&v("v1")), Some(ItemStatus::Completed));
    assert_eq!(snapshot.video_status(&v("v2")), Some(ItemStatus::Unblocked));
    assert_eq!(snapshot.video_status(&v("v3")), Some(ItemStatus::Blocked));
    assert_eq!(snapshot.quiz_status(), Some(ItemStatus::Blocked));
    assert_eq!(snapshot.course, CourseStatus::InProgress);

    let err = engine.complete_quiz(&l, &c("c1")).await.unwrap_err();
    assert!(matches!(err, EngineError::Locked(_)));
}

#[tokio::test]
async fn course_completes_only_with_quiz() {
    let engine = engine().await;
    let l = learner();

    for video in ["v1", "v2", "v3"] {
        watch_to(&engine, &l, "c1", video, 100.0).await;
    }

    let snapshot = engine.resolve(&l, &c("c1")).await.unwrap();
    assert_eq!(snapshot.quiz_status(), Some(ItemStatus::Unblocked));
    assert_eq!(snapshot.course, CourseStatus::InProgress);
    assert_eq!(
        engine.resolve(&l, &c("c2")).await.unwrap().course,
        CourseStatus::Blocked
    );

    engine.complete_quiz(&l, &c("c1")).await.unwrap();

    let snapshot = engine.resolve(&l, &c("c1")).await.unwrap();
    assert_eq!(snapshot.quiz_status(), Some(ItemStatus::Completed));
    assert_eq!(snapshot.course, CourseStatus::Completed);

    let next = engine.resolve(&l, &c("c2")).await.unwrap();
    assert_eq!(next.course, CourseStatus::Unblocked);
    assert_eq!(next.video_status(&v("w1")), Some(ItemStatus::Unblocked));

    // Nothing left to buy once the course opened by completion.
    engine.credit(&l, 500).await.unwrap();
    let err = engine.unlock(&l, &c("c2")).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyUnlocked(_)));
}

#[tokio::test]
async fn next_course_blocked_until_previous_completed() {
    let engine = engine().await;
    let l = learner();

    let snapshots = engine.resolve_catalogue(&l).await.unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].course, CourseStatus::Unblocked);
    // Lowest-order video of an accessible, untouched course is playable.
    assert_eq!(snapshots[0].videos[0].status, ItemStatus::Unblocked);
    assert_eq!(snapshots[1].course, CourseStatus::Blocked);
    assert!(snapshots[1]
        .videos
        .iter()
        .all(|v| v.status == ItemStatus::Blocked));

    for video in ["v1", "v2", "v3"] {
        watch_to(&engine, &l, "c1", video, 100.0).await;
        let snapshots = engine.resolve_catalogue(&l).await.unwrap();
        assert_eq!(snapshots[1].course, CourseStatus::Blocked);
    }
}

#[tokio::test]
async fn completion_survives_rewatching() {
    let engine = engine().await;
    let l = learner();

    watch_to(&engine, &l, "c1", "v1", 100.0).await;
    watch_to(&engine, &l, "c1", "v1", 5.0).await;

    let snapshot = engine.resolve(&l, &c("c1")).await.unwrap();
    assert_eq!(snapshot.video_status(&v("v1")), Some(ItemStatus::Completed));
}
