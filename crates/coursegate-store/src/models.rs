//! Document, write batch and commit types exchanged with the store.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A stored JSON document together with its concurrency metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub path: String,
    pub body: serde_json::Value,
    /// Per-document version, bumped on every write. The first write is 1.
    pub version: u64,
    /// Store-wide commit sequence number of the commit that wrote this
    /// version.
    pub revision: u64,
    /// Server timestamp of that commit.
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Decode the body into a typed model.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Ordering key for "last server timestamp wins" comparisons.
    pub fn stamp(&self) -> (DateTime<Utc>, u64) {
        (self.updated_at, self.revision)
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Condition a document must satisfy for a write to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional write.
    Any,
    /// The document must not exist yet (append-only records).
    Absent,
    /// The document must still be at this version.
    Version(u64),
}

impl Precondition {
    /// Precondition matching what a read observed: the document's version,
    /// or absence when it did not exist.
    pub fn observed(doc: Option<&Document>) -> Self {
        match doc {
            Some(doc) => Precondition::Version(doc.version),
            None => Precondition::Absent,
        }
    }

    pub fn holds(&self, current_version: Option<u64>) -> bool {
        match (self, current_version) {
            (Precondition::Any, _) => true,
            (Precondition::Absent, None) => true,
            (Precondition::Absent, Some(_)) => false,
            (Precondition::Version(expected), Some(actual)) => *expected == actual,
            (Precondition::Version(_), None) => false,
        }
    }
}

/// A single document write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub path: String,
    pub body: serde_json::Value,
    pub precondition: Precondition,
}

/// A set of writes committed atomically: all of them or none.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw JSON write.
    pub fn set(
        mut self,
        path: impl Into<String>,
        body: serde_json::Value,
        precondition: Precondition,
    ) -> Self {
        self.writes.push(Write {
            path: path.into(),
            body,
            precondition,
        });
        self
    }

    /// Append a write of a serializable model.
    pub fn set_model<T: Serialize>(
        self,
        path: impl Into<String>,
        model: &T,
        precondition: Precondition,
    ) -> Result<Self> {
        let body = serde_json::to_value(model)?;
        Ok(self.set(path, body, precondition))
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
    /// The documents as written, in batch order.
    pub documents: Vec<Document>,
}
