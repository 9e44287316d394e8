//! Scheduler error types.

use autotest_drone::DroneError;
use autotest_state::{AtomicGroupId, JobId, StateError};
use thiserror::Error;

use crate::pidfile::PidfileId;

/// Errors raised by the drone manager.
#[derive(Debug, Error)]
pub enum DroneManagerError {
    #[error("no valid drones found")]
    NoValidDrones,

    #[error("command failed; no drones available: {0}")]
    NoDronesAvailable(String),

    #[error("results repository is not initialized")]
    NotInitialized,

    #[error("unknown drone: {0}")]
    UnknownDrone(String),

    #[error("pidfile {0} has no process")]
    NoProcessForPidfile(PidfileId),

    #[error("file {file_path} is already attached to execution {results_dir}")]
    DuplicateAttachment {
        results_dir: String,
        file_path: String,
    },

    #[error("drone error: {0}")]
    Drone(#[from] DroneError),
}

pub type DroneManagerResult<T> = Result<T, DroneManagerError>;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no metahost scheduler to handle {0}")]
    NoMetahostScheduler(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("atomic group not found: {0}")]
    AtomicGroupNotFound(AtomicGroupId),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("drone manager error: {0}")]
    DroneManager(#[from] DroneManagerError),
}

impl SchedulerError {
    /// Errors that mean the scheduler cannot make progress at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoMetahostScheduler(_) | Self::DroneManager(DroneManagerError::NoValidDrones)
        )
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
