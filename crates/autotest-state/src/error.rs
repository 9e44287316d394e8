//! State store errors.

use thiserror::Error;

use crate::types::{JobId, QueueEntryId};

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    /// Opening, reading or writing a table failed inside a transaction.
    #[error("state table access failed: {0}")]
    Storage(String),

    #[error("failed to encode row: {0}")]
    Encode(String),

    /// A stored row no longer deserializes into its type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("queue entry {0} not found")]
    QueueEntryNotFound(QueueEntryId),
}
