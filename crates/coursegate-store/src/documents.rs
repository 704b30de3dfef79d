//! CRUD operations for [`Document`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{CommitReceipt, Document, WriteBatch};

impl Database {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single document by path.
    pub fn get_document(&self, path: &str) -> Result<Option<Document>> {
        let doc = self
            .conn()
            .query_row(
                "SELECT path, body, version, revision, updated_at
                 FROM documents
                 WHERE path = ?1",
                params![path],
                row_to_document,
            )
            .optional()?;
        Ok(doc)
    }

    /// List every document whose path starts with `prefix`, ordered by path.
    pub fn list_documents(&self, prefix: &str) -> Result<Vec<Document>> {
        let mut stmt = self.conn().prepare(
            "SELECT path, body, version, revision, updated_at
             FROM documents
             WHERE substr(path, 1, length(?1)) = ?1
             ORDER BY path ASC",
        )?;

        let rows = stmt.query_map(params![prefix], row_to_document)?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }

    // ------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------

    /// Apply a batch atomically.
    ///
    /// Runs inside an `IMMEDIATE` transaction so the precondition checks and
    /// the writes see the same snapshot even when other connections share the
    /// file. The first failed precondition aborts the whole batch with
    /// [`StoreError::Conflict`].
    pub fn apply_batch(&mut self, batch: &WriteBatch) -> Result<CommitReceipt> {
        let first_path = batch
            .writes
            .first()
            .map(|w| w.path.clone())
            .unwrap_or_default();

        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::from_sqlite(e, &first_path))?;

        let (last_revision, last_updated): (i64, Option<String>) = tx.query_row(
            "SELECT COALESCE(MAX(revision), 0),
                    (SELECT updated_at FROM documents ORDER BY revision DESC LIMIT 1)
             FROM documents",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let revision = last_revision as u64 + 1;

        // Server timestamps never run backwards, even if the wall clock does.
        let mut updated_at = Utc::now();
        if let Some(last) = last_updated {
            let last = DateTime::parse_from_rfc3339(&last)?.with_timezone(&Utc);
            if updated_at < last {
                updated_at = last;
            }
        }

        let mut documents = Vec::with_capacity(batch.len());
        for write in &batch.writes {
            let current: Option<i64> = tx
                .query_row(
                    "SELECT version FROM documents WHERE path = ?1",
                    params![write.path],
                    |row| row.get(0),
                )
                .optional()?;

            if !write.precondition.holds(current.map(|v| v as u64)) {
                tracing::debug!(
                    path = %write.path,
                    precondition = ?write.precondition,
                    current = ?current,
                    "write precondition failed"
                );
                return Err(StoreError::Conflict {
                    path: write.path.clone(),
                });
            }

            let version = current.unwrap_or(0) as u64 + 1;
            let body = serde_json::to_string(&write.body)?;
            tx.execute(
                "INSERT INTO documents (path, body, version, revision, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(path) DO UPDATE SET
                    body = excluded.body,
                    version = excluded.version,
                    revision = excluded.revision,
                    updated_at = excluded.updated_at",
                params![
                    write.path,
                    body,
                    version as i64,
                    revision as i64,
                    updated_at.to_rfc3339(),
                ],
            )?;

            documents.push(Document {
                path: write.path.clone(),
                body: write.body.clone(),
                version,
                revision,
                updated_at,
            });
        }

        tx.commit()
            .map_err(|e| StoreError::from_sqlite(e, &first_path))?;

        Ok(CommitReceipt {
            revision,
            updated_at,
            documents,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Document`].
fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let path: String = row.get(0)?;
    let body_str: String = row.get(1)?;
    let version: i64 = row.get(2)?;
    let revision: i64 = row.get(3)?;
    let updated_str: String = row.get(4)?;

    let body: serde_json::Value = serde_json::from_str(&body_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Document {
        path,
        body,
        version: version as u64,
        revision: revision as u64,
        updated_at,
    })
}
