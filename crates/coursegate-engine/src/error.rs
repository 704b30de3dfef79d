use coursegate_store::StoreError;
use thiserror::Error;

/// Errors surfaced by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The learner cannot afford the unlock. Recoverable by purchasing coins.
    #[error("Insufficient funds: balance {balance}, cost {cost}")]
    InsufficientFunds { balance: u64, cost: u64 },

    /// A learner, course or quiz referenced by the call does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The transaction lost a race with a concurrent writer or timed out.
    #[error("Conflicting concurrent update")]
    Conflict,

    /// The store could not be reached or failed internally.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The course is already playable; nothing to buy.
    #[error("Course {0} is already unlocked")]
    AlreadyUnlocked(String),

    /// Skip-unlock only reaches the course right after an accessible one.
    #[error("Course {0} cannot be unlocked yet")]
    NotEligible(String),

    /// The item is still gated for this learner.
    #[error("{0} is locked")]
    Locked(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict | EngineError::StoreUnavailable(_))
    }

    /// Whether the specific reason should be shown to the learner rather
    /// than a generic failure message.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientFunds { .. }
                | EngineError::AlreadyUnlocked(_)
                | EngineError::NotEligible(_)
                | EngineError::Locked(_)
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => EngineError::Conflict,
            StoreError::NotFound => EngineError::NotFound("document".into()),
            other => EngineError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_taxonomy() {
        let conflict: EngineError = StoreError::Conflict { path: "x".into() }.into();
        assert!(matches!(conflict, EngineError::Conflict));
        assert!(conflict.is_retryable());

        let unavailable: EngineError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(unavailable, EngineError::StoreUnavailable(_)));

        let funds = EngineError::InsufficientFunds { balance: 1, cost: 2 };
        assert!(funds.is_user_facing());
        assert!(!funds.is_retryable());
    }
}
