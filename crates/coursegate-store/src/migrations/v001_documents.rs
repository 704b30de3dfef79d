//! v001 -- Document table.
//!
//! Every persisted value (learners, courses, progress, ledger entries) is a
//! JSON document addressed by a slash-separated path.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    path       TEXT PRIMARY KEY NOT NULL,   -- e.g. learners/{id}/progress/{video}
    body       TEXT NOT NULL,               -- JSON
    version    INTEGER NOT NULL,            -- per-document, starts at 1
    revision   INTEGER NOT NULL,            -- store-wide commit sequence
    updated_at TEXT NOT NULL                -- RFC-3339 server timestamp
);

CREATE INDEX IF NOT EXISTS idx_documents_revision ON documents(revision);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
