//! # coursegate-engine
//!
//! Progressive content-unlock engine.
//!
//! - [`progress::ProgressTracker`] turns playback samples into persisted
//!   progress records.
//! - [`gating::GatingResolver`] derives video, quiz and course gating state.
//! - [`ledger::UnlockLedger`] spends coins to skip-unlock a course atomically.
//! - [`cache::EntryCache`] keeps course metadata reads off the store.
//! - [`sync::SyncBridge`] republishes derived state when another session
//!   writes progress.
//!
//! [`Engine`] wires them together around one [`ProgressStore`] handle.
//!
//! [`ProgressStore`]: coursegate_store::ProgressStore

pub mod cache;
pub mod catalogue;
pub mod config;
pub mod engine;
pub mod gating;
pub mod ledger;
pub mod progress;
pub mod quiz;
pub mod sync;

mod error;
mod retry;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
