//! ## Lifecycle Manager
//!
//! Launches worker processes, hands each one to a per-job [`supervisor`] and routes stop
//! requests to it.
//!
//! [`LifecycleManager::start`] does all of its validation before anything is recorded: a
//! request that fails validation, names an unknown pool or has no usable binary leaves no
//! job behind. The only record ever removed again is that of a job whose process the OS
//! refused to create.

pub(crate) mod supervisor;

use std::{
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{
    command::CommandBuilder,
    error::{OrchestratorError, OrchestratorResult},
    job::{now_millis, JobConfig, JobId, JobRequest, JobState, MiningJob},
    pool_catalog::{PoolCatalog, PoolDefinition},
    registry::{JobRegistry, ProcessControl, StopRequest},
    status::Status,
    task_manager::TaskManager,
    telemetry::{TelemetryBroadcaster, TelemetryEvent},
};

use supervisor::Supervisor;

/// Extra time given to supervisors on shutdown on top of the stop grace period.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

static JOB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Starts, stops and reaps worker processes.
pub struct LifecycleManager {
    catalog: Arc<PoolCatalog>,
    commands: CommandBuilder,
    registry: Arc<JobRegistry>,
    broadcaster: Arc<TelemetryBroadcaster>,
    task_manager: Arc<TaskManager>,
    status_tx: async_channel::Sender<Status>,
    max_threads: u32,
    grace_period: Duration,
}

impl LifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<PoolCatalog>,
        commands: CommandBuilder,
        registry: Arc<JobRegistry>,
        broadcaster: Arc<TelemetryBroadcaster>,
        task_manager: Arc<TaskManager>,
        status_tx: async_channel::Sender<Status>,
        max_threads: u32,
        grace_period: Duration,
    ) -> Self {
        Self {
            catalog,
            commands,
            registry,
            broadcaster,
            task_manager,
            status_tx,
            max_threads,
            grace_period,
        }
    }

    /// Launches a worker for `request`.
    ///
    /// When this returns `Ok`, the job is `Running` and both output readers are already
    /// consuming the worker's pipes. Must be called from within a tokio runtime.
    pub fn start(&self, request: JobRequest) -> OrchestratorResult<JobId> {
        self.validate(&request)?;
        let pool = self.catalog.resolve(&request.pool_id)?;
        check_algorithm(&request, &pool)?;
        let command = self.commands.build(&pool, &request)?;

        let created_at = now_millis();
        let algorithm = request
            .algorithm
            .clone()
            .unwrap_or_else(|| pool.algorithm.clone());
        let job_id = JobId::new(
            &algorithm,
            &pool.id,
            created_at,
            JOB_COUNTER.fetch_add(1, Ordering::Relaxed),
        );
        let config = JobConfig {
            algorithm,
            pool: pool.view(),
            wallet: request.wallet,
            worker: request.worker,
            threads: request.threads,
            intensity: request.intensity,
            command_line: command.to_string(),
        };
        self.registry
            .create(MiningJob::new(job_id.clone(), config, created_at))?;

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);

        debug!("Spawning job {job_id}: {command}");
        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn worker for job {job_id}: {e}");
                self.registry.remove(&job_id)?;
                return Err(OrchestratorError::Spawn(e));
            }
        };

        // The stop channel only ever needs to hold one request.
        let (stop_tx, stop_rx) = async_channel::bounded(1);
        let attached = self
            .registry
            .attach_control(
                &job_id,
                ProcessControl {
                    pid: child.id(),
                    stop_tx: stop_tx.clone(),
                },
            )
            .and_then(|stop_requested| {
                self.registry
                    .transition(&job_id, JobState::Running)
                    .map(|summary| (stop_requested, summary))
            });
        let (stop_requested, summary) = match attached {
            Ok(attached) => attached,
            Err(e) => {
                let _ = child.start_kill();
                self.registry.remove(&job_id)?;
                return Err(e);
            }
        };

        if let Some(summary) = summary {
            self.broadcaster.publish(TelemetryEvent::JobStarted {
                job_id: job_id.clone(),
                payload: summary,
            });
        }

        let supervisor = Supervisor::new(
            job_id.clone(),
            self.registry.clone(),
            self.broadcaster.clone(),
            self.status_tx.clone(),
            self.grace_period,
        );
        let readers = supervisor.spawn_readers(&mut child);
        self.task_manager
            .spawn(supervisor.supervise(child, stop_rx, readers));

        if stop_requested {
            debug!("Delivering deferred stop to job {job_id}");
            let _ = stop_tx.try_send(());
        }

        info!("Job {job_id} running: {command}");
        Ok(job_id)
    }

    /// Asks the worker of `job_id` to exit. Returns immediately.
    ///
    /// Stopping a job that already ended succeeds without doing anything.
    pub fn stop(&self, job_id: &JobId) -> OrchestratorResult<()> {
        match self.registry.request_stop(job_id)? {
            StopRequest::Deliver { stop_tx, pid } => {
                if stop_tx.try_send(()).is_ok() {
                    info!("Stop requested for job {job_id} (pid {pid:?})");
                } else {
                    debug!("Stop for job {job_id} already in flight");
                }
            }
            StopRequest::Deferred => {
                info!("Stop requested for job {job_id} while it is starting");
            }
            StopRequest::AlreadyTerminal => {
                debug!("Job {job_id} already ended, nothing to stop");
            }
        }
        Ok(())
    }

    /// Stops every active job and waits for all supervisors to finish.
    pub async fn shutdown(&self) -> OrchestratorResult<()> {
        let active = self.registry.active_job_ids()?;
        info!("Stopping {} active job(s)", active.len());
        for job_id in &active {
            if let Err(e) = self.stop(job_id) {
                warn!("Failed to stop job {job_id}: {e}");
            }
        }
        self.task_manager
            .join_all(self.grace_period + SHUTDOWN_MARGIN)
            .await;
        Ok(())
    }

    fn validate(&self, request: &JobRequest) -> OrchestratorResult<()> {
        if request.wallet.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "wallet must not be empty".to_string(),
            ));
        }
        if request.threads == 0 || request.threads > self.max_threads {
            return Err(OrchestratorError::InvalidRequest(format!(
                "threads must be between 1 and {}, got {}",
                self.max_threads, request.threads
            )));
        }
        Ok(())
    }
}

fn check_algorithm(request: &JobRequest, pool: &PoolDefinition) -> OrchestratorResult<()> {
    match &request.algorithm {
        Some(algorithm) if !algorithm.eq_ignore_ascii_case(&pool.algorithm) => {
            Err(OrchestratorError::InvalidRequest(format!(
                "pool `{}` mines {}, not {algorithm}",
                pool.id, pool.algorithm
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BinaryRegistry, Platform};

    fn manager(registry: BinaryRegistry) -> (LifecycleManager, Arc<JobRegistry>) {
        let jobs = Arc::new(JobRegistry::new());
        let (status_tx, _status_rx) = async_channel::bounded(16);
        let manager = LifecycleManager::new(
            Arc::new(PoolCatalog::builtin()),
            CommandBuilder::new(registry),
            jobs.clone(),
            Arc::new(TelemetryBroadcaster::new(jobs.clone(), 16)),
            Arc::new(TaskManager::new()),
            status_tx,
            4,
            Duration::from_secs(1),
        );
        (manager, jobs)
    }

    fn assert_invalid(result: OrchestratorResult<JobId>) {
        match result {
            Err(OrchestratorError::InvalidRequest(_)) => {}
            other => panic!("Expected InvalidRequest, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_requests_leave_no_record() {
        let (manager, jobs) = manager(BinaryRegistry::new());
        assert_invalid(manager.start(JobRequest::new("litecoin", " ", "w1", 1)));
        assert_invalid(manager.start(JobRequest::new("litecoin", "abc", "w1", 0)));
        assert_invalid(manager.start(JobRequest::new("litecoin", "abc", "w1", 5)));
        assert_invalid(
            manager.start(JobRequest::new("litecoin", "abc", "w1", 1).with_algorithm("randomx")),
        );
        assert!(matches!(
            manager.start(JobRequest::new("nope", "abc", "w1", 1)),
            Err(OrchestratorError::UnknownPool(_))
        ));
        assert!(matches!(
            manager.start(JobRequest::new("litecoin", "abc", "w1", 1)),
            Err(OrchestratorError::BinaryUnavailable { .. })
        ));
        assert!(jobs.is_empty().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file without the executable bit cannot be spawned.
        let path = dir.path().join("not-executable");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        let mut binaries = BinaryRegistry::new();
        binaries.register("scrypt", Platform::host(), path);

        let (manager, jobs) = manager(binaries);
        match manager.start(JobRequest::new("litecoin", "abc", "w1", 1)) {
            Err(OrchestratorError::Spawn(_)) => {}
            other => panic!("Expected Spawn, got: {:?}", other),
        }
        assert!(jobs.is_empty().unwrap());
    }

    #[test]
    fn test_stop_unknown_job() {
        let (manager, _jobs) = manager(BinaryRegistry::new());
        assert!(matches!(
            manager.stop(&JobId::from("missing")),
            Err(OrchestratorError::JobNotFound(_))
        ));
    }
}
