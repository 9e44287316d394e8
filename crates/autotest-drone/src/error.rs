//! Drone error types.

use thiserror::Error;

/// Errors raised while talking to or acting on a drone.
#[derive(Debug, Error)]
pub enum DroneError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("drone {0} is unreachable")]
    Unreachable(String),

    #[error("drone {hostname} call failed: {message}")]
    Transport { hostname: String, message: String },

    #[error("drone {hostname} did not answer within {secs}s")]
    Timeout { hostname: String, secs: u64 },

    #[error("invalid drone response: {0}")]
    Protocol(String),

    #[error("unexpected call result: expected {expected}")]
    UnexpectedResult { expected: &'static str },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type DroneResult<T> = Result<T, DroneError>;
