use thiserror::Error;

/// Errors raised while turning loosely typed content data into domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}
