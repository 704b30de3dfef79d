//! # coursegate-store
//!
//! The document store the unlock engine persists into.
//!
//! [`ProgressStore`] is the contract the engine consumes: per-document reads,
//! atomic multi-document write batches guarded by version preconditions, and
//! a push feed of changed documents. [`SqliteProgressStore`] implements it on
//! top of a synchronous [`Database`] handle wrapping a `rusqlite::Connection`.

pub mod database;
pub mod documents;
pub mod migrations;
pub mod models;
pub mod paths;
pub mod store;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use store::{ProgressStore, SqliteProgressStore, Watch, WatchEvent};
