//! # coursegate-shared
//!
//! Identifiers, domain models and constants shared by the store, the
//! unlock engine and the HTTP server.

pub mod constants;
pub mod duration;
pub mod error;
pub mod models;
pub mod types;

pub use duration::MediaDuration;
pub use error::ParseError;
pub use models::*;
pub use types::{CourseId, LearnerId, QuizId, VideoId};
