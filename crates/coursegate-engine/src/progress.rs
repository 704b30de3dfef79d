//! Playback sample ingestion.
//!
//! The player calls [`ProgressTracker::record_sample`] on a bounded tick and
//! on pause/exit. The tracker keeps the last-known record per learner and
//! video in memory, writes to the store only when something worth
//! persisting happened, and never lets a store failure reach the playback
//! loop: errors are logged and the write is retried on the next sample.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use coursegate_shared::{
    CompletionFact, CourseId, ItemStatus, LearnerId, MediaDuration, ProgressRecord, VideoId,
};
use coursegate_store::{paths, Precondition, ProgressStore, StoreError, WriteBatch};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// What caused the player to report a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleTrigger {
    /// Periodic playback tick; subject to debouncing.
    #[default]
    Tick,
    /// Playback paused; always written.
    Pause,
    /// Player closed; always written, then tracking state is dropped.
    Exit,
}

/// One playback position report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSample {
    pub video_id: VideoId,
    pub course_id: CourseId,
    pub position_secs: f64,
    /// Reported length of the media. Falls back to the last known length.
    #[serde(default)]
    pub duration: Option<MediaDuration>,
    #[serde(default)]
    pub trigger: SampleTrigger,
}

/// What the tracker did with a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Persisted. `completed_now` is set on the transition to completed.
    Written {
        status: ItemStatus,
        completed_now: bool,
    },
    /// Kept in memory only; the debounce window has not elapsed.
    Debounced { status: ItemStatus },
    /// The store rejected the write; it will be retried on the next sample.
    Failed { status: ItemStatus },
    /// The sample names a video outside its course and was not tracked.
    Rejected,
}

impl SampleOutcome {
    pub fn status(&self) -> ItemStatus {
        match self {
            SampleOutcome::Written { status, .. }
            | SampleOutcome::Debounced { status }
            | SampleOutcome::Failed { status } => *status,
            SampleOutcome::Rejected => ItemStatus::Blocked,
        }
    }
}

/// `position / duration * 100`, clamped. Unknown or degenerate input is 0.
pub fn watch_percentage(position_secs: f64, duration_secs: f64) -> f64 {
    if !position_secs.is_finite() || !duration_secs.is_finite() || duration_secs <= 0.0 {
        return 0.0;
    }
    (position_secs / duration_secs * 100.0).clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// In-memory view of one learner's progress on one video.
#[derive(Debug, Clone)]
struct Tracked {
    record: Option<ProgressRecord>,
    /// Store version the last read or write observed; `None` if absent.
    version: Option<u64>,
    last_write: Option<Instant>,
    /// A previous write failed and must be retried regardless of debounce.
    retry: bool,
    completion_recorded: bool,
}

impl Tracked {
    fn status(&self) -> ItemStatus {
        self.record
            .as_ref()
            .map(|r| r.status)
            .unwrap_or(ItemStatus::Blocked)
    }
}

type TrackKey = (LearnerId, VideoId);

/// Converts playback samples into persisted progress records.
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    threshold_pct: f64,
    debounce: Duration,
    tracked: Mutex<HashMap<TrackKey, Tracked>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            threshold_pct: config.completion_threshold_pct,
            debounce: config.progress_debounce,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest one sample. Never fails; see [`SampleOutcome`].
    pub async fn record_sample(&self, learner: &LearnerId, sample: &PlaybackSample) -> SampleOutcome {
        let key = (learner.clone(), sample.video_id.clone());
        self.ensure_tracked(&key).await;

        let now = Instant::now();
        let plan = {
            let mut tracked = self.lock();
            let Some(entry) = tracked.get_mut(&key) else {
                // Only reachable if a concurrent exit dropped the entry.
                return SampleOutcome::Debounced {
                    status: ItemStatus::Blocked,
                };
            };

            let previous = entry.status();
            let duration_secs = sample
                .duration
                .map(|d| d.as_secs_f64())
                .or_else(|| entry.record.as_ref().map(|r| r.duration_secs))
                .unwrap_or(0.0);
            let percentage = watch_percentage(sample.position_secs, duration_secs);

            let status = if previous == ItemStatus::Completed || percentage >= self.threshold_pct {
                ItemStatus::Completed
            } else {
                ItemStatus::Unblocked
            };

            entry.record = Some(ProgressRecord {
                position_secs: if sample.position_secs.is_finite() {
                    sample.position_secs.max(0.0)
                } else {
                    0.0
                },
                duration_secs,
                percentage,
                status,
                updated_at: Utc::now(),
            });

            let window_elapsed = entry
                .last_write
                .map_or(true, |at| now.duration_since(at) >= self.debounce);
            let due = status != previous
                || sample.trigger != SampleTrigger::Tick
                || entry.retry
                || window_elapsed;

            if !due {
                return SampleOutcome::Debounced { status };
            }

            WritePlan {
                record: entry.record.clone(),
                version: entry.version,
                include_completion: status == ItemStatus::Completed && !entry.completion_recorded,
                completed_now: status == ItemStatus::Completed && previous != ItemStatus::Completed,
            }
        };

        let outcome = match self.write(learner, sample, plan.clone()).await {
            Ok(written) => {
                let mut tracked = self.lock();
                if let Some(entry) = tracked.get_mut(&key) {
                    entry.version = Some(written.version);
                    entry.last_write = Some(now);
                    entry.retry = false;
                    entry.completion_recorded |= written.completion_recorded;
                    if let Some(record) = entry.record.as_mut() {
                        // A concurrent writer may have completed the video.
                        record.status = record.status.max(written.status);
                    }
                }
                if plan.completed_now {
                    info!(learner = %learner, video = %sample.video_id, course = %sample.course_id, "video completed");
                }
                SampleOutcome::Written {
                    status: written.status,
                    completed_now: plan.completed_now,
                }
            }
            Err(e) => {
                warn!(
                    learner = %learner,
                    video = %sample.video_id,
                    error = %e,
                    "failed to persist progress, will retry on next sample"
                );
                let mut tracked = self.lock();
                if let Some(entry) = tracked.get_mut(&key) {
                    entry.retry = true;
                }
                SampleOutcome::Failed {
                    status: plan.record.as_ref().map(|r| r.status).unwrap_or(ItemStatus::Blocked),
                }
            }
        };

        if sample.trigger == SampleTrigger::Exit {
            self.forget(learner, &sample.video_id);
        }
        outcome
    }

    /// Drop in-memory tracking for a video (player unmounted).
    pub fn forget(&self, learner: &LearnerId, video: &VideoId) {
        self.lock().remove(&(learner.clone(), video.clone()));
    }

    /// Last-known status without touching the store.
    pub fn cached_status(&self, learner: &LearnerId, video: &VideoId) -> Option<ItemStatus> {
        self.lock()
            .get(&(learner.clone(), video.clone()))
            .map(|t| t.status())
    }

    /// Number of videos currently tracked in memory.
    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    /// Load the stored record for a key not tracked yet. A failed read is
    /// treated as "no record"; the version precondition on the eventual
    /// write protects whatever is actually stored.
    async fn ensure_tracked(&self, key: &TrackKey) {
        if self.lock().contains_key(key) {
            return;
        }

        let (learner, video) = key;
        let (record, version) = match self.store.get(&paths::progress(learner, video)).await {
            Ok(Some(doc)) => match doc.decode::<ProgressRecord>() {
                Ok(record) => (Some(record), Some(doc.version)),
                Err(e) => {
                    warn!(learner = %learner, video = %video, error = %e, "stored progress unreadable");
                    (None, Some(doc.version))
                }
            },
            Ok(None) => (None, None),
            Err(e) => {
                warn!(learner = %learner, video = %video, error = %e, "could not read stored progress");
                (None, None)
            }
        };

        let completion_recorded = record
            .as_ref()
            .map_or(false, |r| r.status == ItemStatus::Completed);

        self.lock().entry(key.clone()).or_insert(Tracked {
            record,
            version,
            last_write: None,
            retry: false,
            completion_recorded,
        });
    }

    /// Commit the planned write. On a version conflict, merge with the
    /// stored record (statuses only move forward) and try once more.
    async fn write(
        &self,
        learner: &LearnerId,
        sample: &PlaybackSample,
        mut plan: WritePlan,
    ) -> Result<Written, StoreError> {
        match self.commit_plan(learner, sample, &plan).await {
            Err(StoreError::Conflict { path }) => {
                debug!(learner = %learner, video = %sample.video_id, %path, "progress write conflict, merging");
                let progress_path = paths::progress(learner, &sample.video_id);
                let stored = self.store.get(&progress_path).await?;
                let completion = self
                    .store
                    .get(&paths::completion(learner, &sample.video_id))
                    .await?;

                plan.version = stored.as_ref().map(|d| d.version);
                if let (Some(ours), Some(doc)) = (plan.record.as_mut(), stored.as_ref()) {
                    if let Ok(theirs) = doc.decode::<ProgressRecord>() {
                        ours.status = ours.status.max(theirs.status);
                    }
                }
                if completion.is_some() {
                    plan.include_completion = false;
                }
                let mut written = self.commit_plan(learner, sample, &plan).await?;
                written.completion_recorded |= completion.is_some();
                Ok(written)
            }
            other => other,
        }
    }

    async fn commit_plan(
        &self,
        learner: &LearnerId,
        sample: &PlaybackSample,
        plan: &WritePlan,
    ) -> Result<Written, StoreError> {
        let Some(record) = plan.record.as_ref() else {
            return Err(StoreError::NotFound);
        };

        let precondition = match plan.version {
            Some(v) => Precondition::Version(v),
            None => Precondition::Absent,
        };
        let mut batch = WriteBatch::new().set_model(
            paths::progress(learner, &sample.video_id),
            record,
            precondition,
        )?;

        if plan.include_completion {
            let fact = CompletionFact {
                learner_id: learner.clone(),
                video_id: sample.video_id.clone(),
                course_id: sample.course_id.clone(),
                at: Utc::now(),
            };
            batch = batch.set_model(
                paths::completion(learner, &sample.video_id),
                &fact,
                Precondition::Absent,
            )?;
        }

        let receipt = self.store.commit(batch).await?;
        let version = receipt.documents.first().map(|d| d.version).unwrap_or(1);
        Ok(Written {
            version,
            status: record.status,
            completion_recorded: plan.include_completion,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TrackKey, Tracked>> {
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone)]
struct WritePlan {
    record: Option<ProgressRecord>,
    version: Option<u64>,
    include_completion: bool,
    completed_now: bool,
}

#[derive(Debug, Clone, Copy)]
struct Written {
    version: u64,
    status: ItemStatus,
    completion_recorded: bool,
}
