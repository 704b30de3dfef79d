//! Course and catalogue lookups through the [`EntryCache`].

use std::collections::HashSet;
use std::sync::Arc;

use coursegate_shared::{Catalogue, Course, CourseId};
use coursegate_store::{paths, ProgressStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, EntryCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::retry::with_backoff;

/// Authoring bundle: courses listed in catalogue order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogueFile {
    pub courses: Vec<Course>,
}

/// Read-through access to immutable-within-TTL content metadata.
pub struct ContentCatalogue {
    store: Arc<dyn ProgressStore>,
    courses: EntryCache<CourseId, Arc<Course>>,
    catalogue: EntryCache<(), Arc<Catalogue>>,
}

impl ContentCatalogue {
    pub fn new(store: Arc<dyn ProgressStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            courses: EntryCache::new(config.cache_ttl),
            catalogue: EntryCache::new(config.cache_ttl),
        }
    }

    /// Fetch a course definition, cache-first.
    pub async fn course(&self, id: &CourseId) -> Result<Arc<Course>> {
        if let Some(course) = self.courses.get(id) {
            return Ok(course);
        }

        let path = &paths::course(id);
        let store = &self.store;
        let doc = with_backoff("course", || async move {
            store.get(path).await.map_err(EngineError::from)
        })
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("course {id}")))?;

        let course: Arc<Course> = Arc::new(doc.decode()?);
        debug!(course = %id, "course metadata loaded from store");
        self.courses.put(id.clone(), course.clone());
        Ok(course)
    }

    /// Fetch the catalogue order. A store without a catalogue document has an
    /// empty catalogue.
    pub async fn catalogue(&self) -> Result<Arc<Catalogue>> {
        let store = &self.store;
        self.catalogue
            .get_or_load((), move || async move {
                let doc = with_backoff("catalogue", || async move {
                    store.get(paths::CATALOGUE).await.map_err(EngineError::from)
                })
                .await?;
                let catalogue = match doc {
                    Some(doc) => doc.decode()?,
                    None => Catalogue::default(),
                };
                Ok::<_, EngineError>(Arc::new(catalogue))
            })
            .await
    }

    /// Write a course definition and drop any cached copy.
    ///
    /// Rejects courses whose explicit video orders collide, since gating
    /// relies on a total order within the course.
    pub async fn publish_course(&self, course: &Course) -> Result<()> {
        validate_course(course)?;
        let body = serde_json::to_value(course)
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        self.store.put(&paths::course(&course.id), body).await?;
        self.courses.invalidate(&course.id);
        info!(course = %course.id, videos = course.videos.len(), "course published");
        Ok(())
    }

    pub async fn publish_catalogue(&self, catalogue: &Catalogue) -> Result<()> {
        let body = serde_json::to_value(catalogue)
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        self.store.put(paths::CATALOGUE, body).await?;
        self.catalogue.invalidate(&());
        info!(courses = catalogue.courses.len(), "catalogue published");
        Ok(())
    }

    /// Publish every course of an authoring bundle, then the catalogue order.
    pub async fn import(&self, file: &CatalogueFile) -> Result<()> {
        for course in &file.courses {
            self.publish_course(course).await?;
        }
        let catalogue = Catalogue {
            courses: file.courses.iter().map(|c| c.id.clone()).collect(),
        };
        self.publish_catalogue(&catalogue).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.courses.stats()
    }

    pub fn purge_expired(&self) {
        self.courses.purge_expired();
        self.catalogue.purge_expired();
    }
}

fn validate_course(course: &Course) -> Result<()> {
    let mut seen_orders = HashSet::new();
    let mut seen_ids = HashSet::new();
    for (order, video) in course.ordered_videos() {
        if !seen_ids.insert(&video.id) {
            return Err(EngineError::InvalidInput(format!(
                "course {} lists video {} twice",
                course.id, video.id
            )));
        }
        if !seen_orders.insert(order) {
            return Err(EngineError::InvalidInput(format!(
                "course {} has duplicate video order {order}",
                course.id
            )));
        }
    }
    if course.videos.is_empty() && course.quiz_id.is_none() {
        warn!(course = %course.id, "course has neither videos nor a quiz");
    }
    Ok(())
}
