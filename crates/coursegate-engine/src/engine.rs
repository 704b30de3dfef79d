//! Engine facade.

use std::sync::Arc;

use coursegate_shared::{CourseId, ItemStatus, LearnerId, LedgerEntry};
use coursegate_store::{paths, ProgressStore};
use tracing::{debug, info, warn};

use crate::catalogue::ContentCatalogue;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::gating::{GatingResolver, GatingSnapshot};
use crate::ledger::{UnlockLedger, UnlockReceipt};
use crate::progress::{watch_percentage, PlaybackSample, ProgressTracker, SampleOutcome};
use crate::quiz::QuizRecorder;
use crate::sync::{Subscription, SyncBridge};

/// All engine components sharing one store handle and one metadata cache.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn ProgressStore>,
    catalogue: Arc<ContentCatalogue>,
    tracker: ProgressTracker,
    resolver: Arc<GatingResolver>,
    ledger: UnlockLedger,
    quizzes: QuizRecorder,
    sync: SyncBridge,
}

impl Engine {
    pub fn new(store: Arc<dyn ProgressStore>, config: EngineConfig) -> Self {
        let catalogue = Arc::new(ContentCatalogue::new(store.clone(), &config));
        let resolver = Arc::new(GatingResolver::new(store.clone(), catalogue.clone()));
        let tracker = ProgressTracker::new(store.clone(), &config);
        let ledger = UnlockLedger::new(store.clone(), resolver.clone(), config.clone());
        let quizzes = QuizRecorder::new(store.clone(), resolver.clone());
        let sync = SyncBridge::new(store.clone(), resolver.clone(), config.sync_channel_capacity);

        info!(
            threshold_pct = config.completion_threshold_pct,
            debounce = ?config.progress_debounce,
            cache_ttl = ?config.cache_ttl,
            "engine initialized"
        );

        Self {
            config,
            store,
            catalogue,
            tracker,
            resolver,
            ledger,
            quizzes,
            sync,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    pub fn catalogue(&self) -> &Arc<ContentCatalogue> {
        &self.catalogue
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn resolver(&self) -> &Arc<GatingResolver> {
        &self.resolver
    }

    pub fn ledger(&self) -> &UnlockLedger {
        &self.ledger
    }

    pub fn sync(&self) -> &SyncBridge {
        &self.sync
    }

    /// Ingest a playback sample. Samples whose video is not part of the
    /// named course are rejected. Live subscribers see an optimistic snapshot
    /// before the write, and when the sample completes a video the course's
    /// derived status is materialized as well.
    pub async fn record_sample(&self, learner: &LearnerId, sample: &PlaybackSample) -> SampleOutcome {
        match self.catalogue.course(&sample.course_id).await {
            Ok(course) if course.contains_video(&sample.video_id) => {}
            Ok(_) => {
                warn!(
                    learner = %learner,
                    video = %sample.video_id,
                    course = %sample.course_id,
                    "sample video is not part of its course"
                );
                return SampleOutcome::Rejected;
            }
            Err(e) => {
                warn!(learner = %learner, course = %sample.course_id, error = %e, "cannot verify sample course");
                return SampleOutcome::Rejected;
            }
        }

        if self.sync.is_subscribed(learner, &sample.course_id) {
            self.stage_optimistic(learner, sample).await;
        }

        let outcome = self.tracker.record_sample(learner, sample).await;
        if let SampleOutcome::Written {
            completed_now: true,
            ..
        } = outcome
        {
            if let Err(e) = self.materialize(learner, &sample.course_id).await {
                warn!(learner = %learner, course = %sample.course_id, error = %e, "failed to materialize course status");
            }
        }
        outcome
    }

    /// Publish the snapshot the sample is expected to produce. The server
    /// notification for the write supersedes it.
    async fn stage_optimistic(&self, learner: &LearnerId, sample: &PlaybackSample) {
        let mut snapshot = match self.resolver.resolve(learner, &sample.course_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(learner = %learner, course = %sample.course_id, error = %e, "skipping optimistic update");
                return;
            }
        };
        let Some(gate) = snapshot
            .videos
            .iter_mut()
            .find(|v| v.video_id == sample.video_id)
        else {
            return;
        };

        if let Some(duration) = sample.duration {
            gate.percentage = watch_percentage(sample.position_secs, duration.as_secs_f64());
        }
        gate.status = if gate.percentage >= self.config.completion_threshold_pct {
            ItemStatus::Completed
        } else {
            gate.status.max(ItemStatus::Unblocked)
        };

        let path = paths::progress(learner, &sample.video_id);
        self.sync
            .stage_local(learner, &sample.course_id, &path, snapshot);
    }

    /// Derive the gating state of one course from fresh reads.
    pub async fn resolve(&self, learner: &LearnerId, course: &CourseId) -> Result<GatingSnapshot> {
        self.resolver.resolve(learner, course).await
    }

    /// Resolve and persist the derived course status.
    pub async fn materialize(&self, learner: &LearnerId, course: &CourseId) -> Result<GatingSnapshot> {
        let snapshot = self.resolver.resolve(learner, course).await?;
        self.resolver.persist_course_status(learner, &snapshot).await?;
        Ok(snapshot)
    }

    pub async fn resolve_catalogue(&self, learner: &LearnerId) -> Result<Vec<GatingSnapshot>> {
        self.resolver.resolve_catalogue(learner).await
    }

    pub async fn unlock(&self, learner: &LearnerId, course: &CourseId) -> Result<UnlockReceipt> {
        self.ledger.unlock(learner, course).await
    }

    pub async fn complete_quiz(&self, learner: &LearnerId, course: &CourseId) -> Result<()> {
        self.quizzes.complete_quiz(learner, course).await
    }

    pub async fn balance(&self, learner: &LearnerId) -> Result<u64> {
        self.ledger.balance(learner).await
    }

    pub async fn history(&self, learner: &LearnerId) -> Result<Vec<LedgerEntry>> {
        self.ledger.history(learner).await
    }

    pub async fn credit(&self, learner: &LearnerId, amount: u64) -> Result<u64> {
        self.ledger.credit(learner, amount).await
    }

    pub fn subscribe(&self, learner: &LearnerId, course: &CourseId) -> Subscription {
        self.sync.subscribe(learner, course)
    }

    /// Drop expired metadata cache entries.
    pub fn purge_caches(&self) {
        self.catalogue.purge_expired();
    }
}
