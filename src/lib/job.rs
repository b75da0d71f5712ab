//! ## Job Data Model
//!
//! Types shared by the registry, the lifecycle manager and the telemetry stream:
//! [`JobId`], [`JobRequest`], [`JobState`], [`JobStats`], [`MiningJob`] and the
//! read-only [`JobSummary`] handed to observers.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{parser::ShareReport, pool_catalog::PoolView};

/// Unique identifier for one launch of a worker process.
///
/// Built from the algorithm, the pool, the creation time and a process-wide counter, so
/// two starts issued within the same millisecond still get distinct identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(algorithm: &str, pool_id: &str, created_at: u64, counter: u64) -> Self {
        JobId(format!("{algorithm}-{pool_id}-{created_at}-{counter}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

/// A request to run one worker against one pool, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Mining algorithm. Defaults to the pool's algorithm when absent.
    #[serde(default)]
    pub algorithm: Option<String>,
    /// Identifier of the pool in the catalog.
    #[serde(rename = "pool")]
    pub pool_id: String,
    /// Wallet address or pool account name.
    pub wallet: String,
    /// Worker name appended to the credential by pools that support it.
    #[serde(default)]
    pub worker: String,
    /// Number of CPU threads handed to the worker.
    pub threads: u32,
    /// Optional worker intensity.
    #[serde(default)]
    pub intensity: Option<u32>,
}

impl JobRequest {
    pub fn new(pool_id: &str, wallet: &str, worker: &str, threads: u32) -> Self {
        Self {
            algorithm: None,
            pool_id: pool_id.to_string(),
            wallet: wallet.to_string(),
            worker: worker.to_string(),
            threads,
            intensity: None,
        }
    }

    pub fn with_algorithm(mut self, algorithm: &str) -> Self {
        self.algorithm = Some(algorithm.to_string());
        self
    }

    pub fn with_intensity(mut self, intensity: u32) -> Self {
        self.intensity = Some(intensity);
        self
    }
}

/// The resolved configuration a job runs with. The pool is snapshotted at start and
/// never re-resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub algorithm: String,
    pub pool: PoolView,
    pub wallet: String,
    pub worker: String,
    pub threads: u32,
    pub intensity: Option<u32>,
    /// The exact command line the worker was launched with.
    pub command_line: String,
}

/// Lifecycle state of a job.
///
/// `Starting -> Running -> {Stopped, Failed}`. Both terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum JobState {
    Starting,
    Running,
    Stopped,
    #[serde(rename_all = "camelCase")]
    Failed {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Stopped | JobState::Failed { .. })
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Stopped => "stopped",
            JobState::Failed { .. } => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal forward step.
    ///
    /// Terminal states are handled by the registry before this is consulted.
    pub(crate) fn can_advance_to(&self, next: &JobState) -> bool {
        match (self, next) {
            (JobState::Starting, JobState::Running) => true,
            (JobState::Starting | JobState::Running, n) if n.is_terminal() => true,
            _ => false,
        }
    }
}

/// Metrics extracted from a job's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    /// Last reported hash rate in MH/s.
    pub hash_rate: f64,
    pub accepted_shares: u64,
    pub rejected_shares: u64,
    /// Milliseconds since the Unix epoch of the last applied update.
    pub last_update: Option<u64>,
    /// Number of updates applied so far. Lets observers discard stale deltas.
    #[serde(skip)]
    pub(crate) revision: u64,
}

impl JobStats {
    /// Applies a share report only if it does not move either counter backwards.
    pub(crate) fn accept_shares(&mut self, report: &ShareReport) -> bool {
        if report.accepted < self.accepted_shares || report.rejected() < self.rejected_shares {
            return false;
        }
        self.accepted_shares = report.accepted;
        self.rejected_shares = report.rejected();
        true
    }
}

/// A job as stored in the registry.
#[derive(Debug, Clone)]
pub struct MiningJob {
    pub id: JobId,
    pub config: JobConfig,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub state: JobState,
    /// Set when the job reached a terminal state.
    pub ended_at: Option<u64>,
}

impl MiningJob {
    pub fn new(id: JobId, config: JobConfig, created_at: u64) -> Self {
        Self {
            id,
            config,
            created_at,
            state: JobState::Starting,
            ended_at: None,
        }
    }
}

/// Read-only view of a job handed to callers and observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    /// Serialized inline: `"state": "failed", "exitCode": 1, "signal": null`.
    #[serde(flatten)]
    pub state: JobState,
    pub config: JobConfig,
    pub stats: JobStats,
    pub start_time: u64,
    pub end_time: Option<u64>,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
