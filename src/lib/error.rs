//! ## Orchestrator Errors
//!
//! Defines [`OrchestratorError`], the single error type returned by every fallible
//! operation in this crate, and the [`OrchestratorResult`] alias.
//!
//! Caller-facing rejections (`InvalidRequest`, `UnknownPool`, `BinaryUnavailable`,
//! `Spawn`, `JobNotFound`) are produced before any resource is held. The remaining
//! variants describe internal faults that supervisors report on the status channel.

use std::{
    fmt,
    sync::{MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard},
};

use crate::job::{JobId, JobState};

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug)]
pub enum OrchestratorError {
    /// The job request failed validation (missing credential, thread count out of range).
    InvalidRequest(String),
    /// No pool with this identifier is present in the catalog.
    UnknownPool(String),
    /// No worker binary is registered for the algorithm on this platform, or it is missing
    /// from disk.
    BinaryUnavailable { algorithm: String, platform: String },
    /// The OS refused to create the worker process.
    Spawn(std::io::Error),
    /// No job with this identifier is known.
    JobNotFound(JobId),
    /// A job with this identifier already exists.
    DuplicateJob(JobId),
    /// The requested state change is not allowed from the job's current state.
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    /// Error due to a poisoned lock.
    PoisonLock(String),
    /// I/O error on a worker pipe or log file.
    Io(std::io::Error),
    /// Error building or deserializing the configuration.
    Config(ext_config::ConfigError),
    /// The configuration deserialized but holds unusable values.
    InvalidConfig(String),
    /// Errors on bad CLI argument input.
    BadCliArgs,
    /// The tracing subscriber could not be installed.
    Logging(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use OrchestratorError::*;
        match self {
            InvalidRequest(reason) => write!(f, "Invalid job request: {reason}"),
            UnknownPool(pool_id) => write!(f, "Unknown pool: `{pool_id}`"),
            BinaryUnavailable {
                algorithm,
                platform,
            } => write!(
                f,
                "No worker binary available for algorithm `{algorithm}` on `{platform}`"
            ),
            Spawn(e) => write!(f, "Failed to spawn worker process: `{e:?}`"),
            JobNotFound(job_id) => write!(f, "Job not found: {job_id}"),
            DuplicateJob(job_id) => write!(f, "Job already exists: {job_id}"),
            InvalidTransition { job_id, from, to } => write!(
                f,
                "Invalid transition for job {job_id}: {} -> {}",
                from.name(),
                to.name()
            ),
            PoisonLock(e) => write!(f, "Poison lock: {e:?}"),
            Io(e) => write!(f, "I/O error: `{e:?}`"),
            Config(e) => write!(f, "Config error: {e:?}"),
            InvalidConfig(reason) => write!(f, "Invalid configuration: {reason}"),
            BadCliArgs => write!(f, "Bad CLI arg input"),
            Logging(e) => write!(f, "Failed to initialize logging: {e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> OrchestratorError {
        OrchestratorError::Io(e)
    }
}

impl From<ext_config::ConfigError> for OrchestratorError {
    fn from(e: ext_config::ConfigError) -> OrchestratorError {
        OrchestratorError::Config(e)
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for OrchestratorError {
    fn from(e: PoisonError<MutexGuard<T>>) -> OrchestratorError {
        OrchestratorError::PoisonLock(e.to_string())
    }
}

impl<T> From<PoisonError<RwLockReadGuard<'_, T>>> for OrchestratorError {
    fn from(e: PoisonError<RwLockReadGuard<T>>) -> OrchestratorError {
        OrchestratorError::PoisonLock(e.to_string())
    }
}

impl<T> From<PoisonError<RwLockWriteGuard<'_, T>>> for OrchestratorError {
    fn from(e: PoisonError<RwLockWriteGuard<T>>) -> OrchestratorError {
        OrchestratorError::PoisonLock(e.to_string())
    }
}
