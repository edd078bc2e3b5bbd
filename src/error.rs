use thiserror::Error;

/// Failures talking to the synchronized store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is disconnected")]
    Disconnected,

    #[error("write conflict on `{key}`: {reason}")]
    Conflict { key: String, reason: String },

    #[error("document `{0}` is malformed")]
    Malformed(String),

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Input rejected at the boundary. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid count value")]
    NotANumber,

    #[error("Enter a valid number")]
    Empty,

    #[error("Invalid number format")]
    Format,

    #[error("Fractional amounts are not supported")]
    Fractional,

    #[error("Amount must be greater than zero")]
    NonPositive,
}

/// Everything an administration action can fail with.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("history entry `{0}` not found")]
    HistoryEntryNotFound(String),

    #[error("history entry `{0}` has no value to roll back to")]
    NotRollbackEligible(String),
}
