//! The [`ProgressStore`] contract and its SQLite implementation.
//!
//! The engine never talks to SQLite directly. It reads documents, commits
//! precondition-guarded batches, and watches path prefixes for changes, so
//! any backend offering those three primitives (a hosted document database,
//! a test double) can stand in for [`SqliteProgressStore`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{CommitReceipt, Document, Precondition, WriteBatch};

/// Buffered change notifications before slow watchers start lagging.
const CHANGE_FEED_CAPACITY: usize = 1024;

/// Remote document store capabilities the engine relies on.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Read one document.
    async fn get(&self, path: &str) -> Result<Option<Document>>;

    /// Read every document under a path prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<Document>>;

    /// Atomically apply a batch of precondition-guarded writes.
    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt>;

    /// Unconditionally overwrite one document.
    async fn put(&self, path: &str, body: serde_json::Value) -> Result<Document> {
        let receipt = self
            .commit(WriteBatch::new().set(path, body, Precondition::Any))
            .await?;
        receipt.documents.into_iter().next().ok_or(StoreError::NotFound)
    }

    /// Subscribe to changes of documents under `prefix`.
    fn watch(&self, prefix: &str) -> Watch;
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

/// Event yielded by a [`Watch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A document under the watched prefix was written.
    Changed(Document),
    /// The watcher fell behind and `n` notifications were dropped. Consumers
    /// should re-read whatever state they derive from the feed.
    Lagged(u64),
}

/// A push subscription to document changes under one path prefix.
pub struct Watch {
    prefix: String,
    rx: broadcast::Receiver<Document>,
}

impl Watch {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<Document>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next relevant event. Returns `None` once the store side
    /// of the feed is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(doc) if doc.path.starts_with(&self.prefix) => {
                    return Some(WatchEvent::Changed(doc));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(WatchEvent::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

/// [`ProgressStore`] backed by a [`Database`].
///
/// Clones share one connection and one change feed. Independent handles
/// opened on the same file share data and transactional isolation, but each
/// only notifies its own watchers.
#[derive(Clone)]
pub struct SqliteProgressStore {
    db: Arc<Mutex<Database>>,
    changes: broadcast::Sender<Document>,
}

impl SqliteProgressStore {
    pub fn new(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(db)),
            changes,
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Database::new()?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run a closure against the database on the blocking thread pool.
    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|_| StoreError::Unavailable("database handle poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store worker failed: {e}")))?
    }
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    async fn get(&self, path: &str) -> Result<Option<Document>> {
        let path = path.to_string();
        self.with_db(move |db| db.get_document(&path)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Document>> {
        let prefix = prefix.to_string();
        self.with_db(move |db| db.list_documents(&prefix)).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt> {
        let changes = self.changes.clone();
        self.with_db(move |db| {
            let receipt = db.apply_batch(&batch)?;
            // Published while the handle is still locked so watchers observe
            // commits in revision order.
            for doc in &receipt.documents {
                let _ = changes.send(doc.clone());
            }
            debug!(
                revision = receipt.revision,
                writes = receipt.documents.len(),
                "batch committed"
            );
            Ok(receipt)
        })
        .await
    }

    fn watch(&self, prefix: &str) -> Watch {
        Watch::new(prefix, self.changes.subscribe())
    }
}
