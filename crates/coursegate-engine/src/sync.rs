//! Cross-session sync.
//!
//! A [`SyncBridge`] turns the store's change feed into re-derived gating
//! snapshots for one (learner, course) pair. All subscriptions to the same
//! pair share a single store watch and pump task; the pump is aborted when
//! the last [`Subscription`] goes away.
//!
//! Conflicts follow last-writer-wins on the server stamp
//! `(updated_at, revision)`. Notifications older than what was already seen
//! for a path are dropped, and an update staged locally with
//! [`SyncBridge::stage_local`] stands only until a server notification with
//! a later timestamp arrives for the same path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use coursegate_shared::{CourseId, LearnerId, LedgerEntry};
use coursegate_store::paths::{self, LearnerDoc};
use coursegate_store::{Document, ProgressStore, Watch, WatchEvent};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gating::{GatingResolver, GatingSnapshot};

type ChannelKey = (LearnerId, CourseId);
type Stamp = (DateTime<Utc>, u64);

/// Where a [`SyncUpdate`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// A committed write observed on the store feed.
    Server,
    /// An optimistic update staged by this process.
    Local,
    /// A fresh resolve after notifications were dropped.
    Resync,
}

/// Re-derived gating state pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct SyncUpdate {
    pub origin: UpdateOrigin,
    /// Document that triggered the update, if any.
    pub path: Option<String>,
    pub snapshot: GatingSnapshot,
}

// ---------------------------------------------------------------------------
// Stamp bookkeeping
// ---------------------------------------------------------------------------

/// Per-path stamps of one channel: the newest server stamp applied and any
/// pending local stages.
#[derive(Debug, Default)]
struct StampBook {
    applied: HashMap<String, Stamp>,
    staged: HashMap<String, DateTime<Utc>>,
}

impl StampBook {
    fn stage(&mut self, path: &str, at: DateTime<Utc>) {
        self.staged.insert(path.to_string(), at);
    }

    /// Decide whether a server notification should be applied, recording it
    /// if so.
    fn admit(&mut self, path: &str, stamp: Stamp) -> bool {
        if let Some(seen) = self.applied.get(path) {
            if stamp <= *seen {
                return false;
            }
        }
        if let Some(staged_at) = self.staged.get(path) {
            if stamp.0 < *staged_at {
                return false;
            }
            self.staged.remove(path);
        }
        self.applied.insert(path.to_string(), stamp);
        true
    }

    fn reset(&mut self) {
        self.applied.clear();
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

struct Channel {
    refs: usize,
    tx: broadcast::Sender<SyncUpdate>,
    stamps: Arc<Mutex<StampBook>>,
    pump: JoinHandle<()>,
}

struct BridgeInner {
    store: Arc<dyn ProgressStore>,
    resolver: Arc<GatingResolver>,
    capacity: usize,
    channels: Mutex<HashMap<ChannelKey, Channel>>,
}

impl BridgeInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelKey, Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, key: &ChannelKey) {
        let mut channels = self.lock();
        let Some(channel) = channels.get_mut(key) else {
            return;
        };
        channel.refs = channel.refs.saturating_sub(1);
        if channel.refs == 0 {
            if let Some(channel) = channels.remove(key) {
                channel.pump.abort();
                debug!(learner = %key.0, course = %key.1, "sync channel closed");
            }
        }
    }
}

/// Registry of live sync channels. Cheap to clone.
#[derive(Clone)]
pub struct SyncBridge {
    inner: Arc<BridgeInner>,
}

impl SyncBridge {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        resolver: Arc<GatingResolver>,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                store,
                resolver,
                capacity: capacity.max(1),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to gating updates of `course` for `learner`.
    ///
    /// Must be called from within a tokio runtime; the first subscription
    /// to a pair spawns its pump task.
    pub fn subscribe(&self, learner: &LearnerId, course: &CourseId) -> Subscription {
        let key = (learner.clone(), course.clone());
        let mut channels = self.inner.lock();

        let rx = match channels.get_mut(&key) {
            Some(channel) => {
                channel.refs += 1;
                channel.tx.subscribe()
            }
            None => {
                let (tx, rx) = broadcast::channel(self.inner.capacity);
                let stamps = Arc::new(Mutex::new(StampBook::default()));
                // Watch before spawning so no commit between now and the
                // pump's first poll is missed.
                let watch = self.inner.store.watch(&paths::learner_prefix(learner));
                let pump = tokio::spawn(pump(
                    key.clone(),
                    watch,
                    self.inner.resolver.clone(),
                    tx.clone(),
                    stamps.clone(),
                ));
                info!(learner = %learner, course = %course, "sync channel opened");
                channels.insert(
                    key.clone(),
                    Channel {
                        refs: 1,
                        tx,
                        stamps,
                        pump,
                    },
                );
                rx
            }
        };

        Subscription {
            inner: self.inner.clone(),
            key,
            rx,
            released: false,
        }
    }

    /// Publish an optimistic snapshot for a write this session is about to
    /// commit. Returns `false` when nobody is subscribed to the pair.
    pub fn stage_local(
        &self,
        learner: &LearnerId,
        course: &CourseId,
        path: &str,
        snapshot: GatingSnapshot,
    ) -> bool {
        let channels = self.inner.lock();
        let Some(channel) = channels.get(&(learner.clone(), course.clone())) else {
            return false;
        };
        lock_stamps(&channel.stamps).stage(path, Utc::now());
        let _ = channel.tx.send(SyncUpdate {
            origin: UpdateOrigin::Local,
            path: Some(path.to_string()),
            snapshot,
        });
        true
    }

    /// Whether anyone is subscribed to the pair.
    pub fn is_subscribed(&self, learner: &LearnerId, course: &CourseId) -> bool {
        self.inner
            .lock()
            .contains_key(&(learner.clone(), course.clone()))
    }

    /// Number of (learner, course) pairs with a live pump.
    pub fn active_channels(&self) -> usize {
        self.inner.lock().len()
    }
}

fn lock_stamps(stamps: &Mutex<StampBook>) -> MutexGuard<'_, StampBook> {
    stamps
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whether a per-learner document feeds into the gating state of `course`.
async fn is_relevant(resolver: &GatingResolver, course_id: &CourseId, doc: &Document) -> bool {
    let Some((_, kind)) = paths::classify(&doc.path) else {
        return false;
    };
    let course = match resolver.catalogue().course(course_id).await {
        Ok(course) => course,
        Err(e) => {
            warn!(course = %course_id, error = %e, "cannot load course for sync");
            return false;
        }
    };
    match kind {
        LearnerDoc::Progress(video) | LearnerDoc::Completion(video) => {
            course.contains_video(&video)
        }
        LearnerDoc::Quiz(quiz) => course.quiz_id.as_ref() == Some(&quiz),
        LearnerDoc::CourseState(state_course) => &state_course == course_id,
        LearnerDoc::LedgerEntry(_) => doc
            .decode::<LedgerEntry>()
            .map(|entry| &entry.course_id == course_id)
            .unwrap_or(false),
    }
}

async fn pump(
    key: ChannelKey,
    mut watch: Watch,
    resolver: Arc<GatingResolver>,
    tx: broadcast::Sender<SyncUpdate>,
    stamps: Arc<Mutex<StampBook>>,
) {
    let (learner, course) = &key;
    debug!(learner = %learner, course = %course, prefix = watch.prefix(), "sync pump started");

    while let Some(event) = watch.next().await {
        let (origin, path) = match event {
            WatchEvent::Changed(doc) => {
                if !is_relevant(&resolver, course, &doc).await {
                    continue;
                }
                if !lock_stamps(&stamps).admit(&doc.path, doc.stamp()) {
                    debug!(path = %doc.path, revision = doc.revision, "dropping stale notification");
                    continue;
                }
                (UpdateOrigin::Server, Some(doc.path))
            }
            WatchEvent::Lagged(missed) => {
                warn!(learner = %learner, course = %course, missed, "sync feed lagged, resyncing");
                lock_stamps(&stamps).reset();
                (UpdateOrigin::Resync, None)
            }
        };

        match resolver.resolve(learner, course).await {
            Ok(snapshot) => {
                let _ = tx.send(SyncUpdate {
                    origin,
                    path,
                    snapshot,
                });
            }
            Err(e) => warn!(learner = %learner, course = %course, error = %e, "sync resolve failed"),
        }
    }

    warn!(learner = %learner, course = %course, "store change feed closed");
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle to a stream of [`SyncUpdate`]s. Dropping it unsubscribes.
pub struct Subscription {
    inner: Arc<BridgeInner>,
    key: ChannelKey,
    rx: broadcast::Receiver<SyncUpdate>,
    released: bool,
}

impl Subscription {
    pub fn learner(&self) -> &LearnerId {
        &self.key.0
    }

    pub fn course(&self) -> &CourseId {
        &self.key.1
    }

    /// Next update. A subscriber that fell behind gets a single fresh
    /// [`UpdateOrigin::Resync`] snapshot instead of the dropped ones.
    /// Returns `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<SyncUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(learner = %self.key.0, course = %self.key.1, missed, "subscriber lagged");
                    match self.inner.resolver.resolve(&self.key.0, &self.key.1).await {
                        Ok(snapshot) => {
                            return Some(SyncUpdate {
                                origin: UpdateOrigin::Resync,
                                path: None,
                                snapshot,
                            })
                        }
                        Err(e) => {
                            warn!(error = %e, "resync after lag failed");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving updates. Equivalent to dropping the subscription.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release(&self.key);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use coursegate_shared::{
        Catalogue, CompletionFact, Course, CourseTier, CourseVideo, ItemStatus, ProgressRecord,
        VideoId,
    };
    use coursegate_store::SqliteProgressStore;
    use serde_json::json;

    use super::*;
    use crate::catalogue::ContentCatalogue;
    use crate::config::EngineConfig;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn stamp_book_drops_stale_and_local_superseded() {
        let mut book = StampBook::default();
        assert!(book.admit("p", (at(10), 5)));
        assert!(!book.admit("p", (at(10), 5)));
        assert!(!book.admit("p", (at(9), 4)));
        assert!(book.admit("p", (at(11), 6)));

        book.stage("p", at(20));
        // An older write arriving late does not override the staged view.
        assert!(!book.admit("p", (at(15), 7)));
        // The server copy of the staged write supersedes it.
        assert!(book.admit("p", (at(21), 8)));
        assert!(book.staged.is_empty());
    }

    async fn setup() -> (Arc<SqliteProgressStore>, SyncBridge) {
        setup_with_capacity(16).await
    }

    async fn setup_with_capacity(capacity: usize) -> (Arc<SqliteProgressStore>, SyncBridge) {
        let store = Arc::new(SqliteProgressStore::open_in_memory().unwrap());
        let catalogue = Arc::new(ContentCatalogue::new(store.clone(), &EngineConfig::default()));
        let course = Course {
            id: "c1".parse().unwrap(),
            title: "Basics".into(),
            tier: CourseTier::Beginner,
            unlock_cost: None,
            quiz_id: None,
            videos: vec![
                CourseVideo {
                    id: "v1".parse().unwrap(),
                    order: Some(1),
                    duration: None,
                },
                CourseVideo {
                    id: "v2".parse().unwrap(),
                    order: Some(2),
                    duration: None,
                },
            ],
        };
        catalogue.publish_course(&course).await.unwrap();
        catalogue
            .publish_catalogue(&Catalogue {
                courses: vec![course.id.clone()],
            })
            .await
            .unwrap();
        let resolver = Arc::new(GatingResolver::new(store.clone(), catalogue));
        let bridge = SyncBridge::new(store.clone(), resolver, capacity);
        (store, bridge)
    }

    async fn next(sub: &mut Subscription) -> SyncUpdate {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for sync update")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_remote_completion_is_pushed() {
        let (store, bridge) = setup().await;
        let learner: LearnerId = "l1".parse().unwrap();
        let course: CourseId = "c1".parse().unwrap();
        let mut sub = bridge.subscribe(&learner, &course);

        // Unrelated document first; it must not produce an update.
        store
            .put(&paths::progress(&learner, &"other".parse().unwrap()), json!({}))
            .await
            .unwrap();

        let v1: VideoId = "v1".parse().unwrap();
        let fact = CompletionFact {
            learner_id: learner.clone(),
            video_id: v1.clone(),
            course_id: course.clone(),
            at: Utc::now(),
        };
        store
            .put(&paths::completion(&learner, &v1), serde_json::to_value(&fact).unwrap())
            .await
            .unwrap();

        let update = next(&mut sub).await;
        assert_eq!(update.origin, UpdateOrigin::Server);
        assert_eq!(update.path.as_deref(), Some(paths::completion(&learner, &v1).as_str()));
        assert_eq!(update.snapshot.video_status(&v1), Some(ItemStatus::Completed));
        assert_eq!(
            update.snapshot.video_status(&"v2".parse().unwrap()),
            Some(ItemStatus::Unblocked)
        );
    }

    #[tokio::test]
    async fn test_subscriptions_share_one_pump() {
        let (_, bridge) = setup().await;
        let learner: LearnerId = "l1".parse().unwrap();
        let course: CourseId = "c1".parse().unwrap();

        let a = bridge.subscribe(&learner, &course);
        let b = bridge.subscribe(&learner, &course);
        assert_eq!(bridge.active_channels(), 1);

        a.unsubscribe();
        assert_eq!(bridge.active_channels(), 1);
        drop(b);
        assert_eq!(bridge.active_channels(), 0);
    }

    #[tokio::test]
    async fn test_server_write_supersedes_local_stage() {
        let (store, bridge) = setup().await;
        let learner: LearnerId = "l1".parse().unwrap();
        let course: CourseId = "c1".parse().unwrap();
        let v1: VideoId = "v1".parse().unwrap();
        let path = paths::progress(&learner, &v1);
        let mut sub = bridge.subscribe(&learner, &course);

        let mut optimistic = bridge.inner.resolver.resolve(&learner, &course).await.unwrap();
        optimistic.videos[0].percentage = 50.0;
        assert!(bridge.stage_local(&learner, &course, &path, optimistic));
        let local = next(&mut sub).await;
        assert_eq!(local.origin, UpdateOrigin::Local);
        assert_eq!(local.snapshot.videos[0].percentage, 50.0);

        let record = ProgressRecord {
            position_secs: 40.0,
            duration_secs: 100.0,
            percentage: 40.0,
            status: ItemStatus::Unblocked,
            updated_at: Utc::now(),
        };
        store
            .put(&path, serde_json::to_value(&record).unwrap())
            .await
            .unwrap();

        let server = next(&mut sub).await;
        assert_eq!(server.origin, UpdateOrigin::Server);
        assert_eq!(server.snapshot.videos[0].percentage, 40.0);
    }

    fn completion(learner: &LearnerId, video: &VideoId, course: &CourseId) -> serde_json::Value {
        serde_json::to_value(CompletionFact {
            learner_id: learner.clone(),
            video_id: video.clone(),
            course_id: course.clone(),
            at: Utc::now(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_nothing_delivered_after_unsubscribe() {
        let (store, bridge) = setup().await;
        let learner: LearnerId = "l1".parse().unwrap();
        let course: CourseId = "c1".parse().unwrap();
        let v1: VideoId = "v1".parse().unwrap();

        let sub = bridge.subscribe(&learner, &course);
        sub.unsubscribe();
        assert_eq!(bridge.active_channels(), 0);

        store
            .put(&paths::completion(&learner, &v1), completion(&learner, &v1, &course))
            .await
            .unwrap();

        // A fresh subscription only sees writes made after it.
        let mut sub = bridge.subscribe(&learner, &course);
        let pending = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_resync() {
        let (store, bridge) = setup_with_capacity(1).await;
        let learner: LearnerId = "l1".parse().unwrap();
        let course: CourseId = "c1".parse().unwrap();
        let v1: VideoId = "v1".parse().unwrap();
        let v2: VideoId = "v2".parse().unwrap();
        let mut sub = bridge.subscribe(&learner, &course);

        store
            .put(&paths::completion(&learner, &v1), completion(&learner, &v1, &course))
            .await
            .unwrap();
        let record = ProgressRecord {
            position_secs: 40.0,
            duration_secs: 100.0,
            percentage: 40.0,
            status: ItemStatus::Unblocked,
            updated_at: Utc::now(),
        };
        store
            .put(&paths::progress(&learner, &v2), serde_json::to_value(&record).unwrap())
            .await
            .unwrap();
        store
            .put(&paths::completion(&learner, &v2), completion(&learner, &v2, &course))
            .await
            .unwrap();

        // Let the pump push all three updates through the one-slot channel.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let update = next(&mut sub).await;
        assert_eq!(update.origin, UpdateOrigin::Resync);
        assert_eq!(update.path, None);
        assert_eq!(update.snapshot.video_status(&v1), Some(ItemStatus::Completed));
        assert_eq!(update.snapshot.video_status(&v2), Some(ItemStatus::Completed));
    }

    #[tokio::test]
    async fn test_stage_without_subscribers_is_noop() {
        let (_, bridge) = setup().await;
        let learner: LearnerId = "l1".parse().unwrap();
        let course: CourseId = "c1".parse().unwrap();
        let snapshot = bridge.inner.resolver.resolve(&learner, &course).await.unwrap();
        assert!(!bridge.stage_local(&learner, &course, "learners/l1/progress/v1", snapshot));
    }
}
