//! ## Mining Orchestrator
//!
//! Launches and supervises external mining worker processes, each bound to a remote pool,
//! and broadcasts their state and metrics to any number of observers.
//!
//! The central component is [`MiningOrchestrator`], which wires together:
//! - the [`PoolCatalog`](pool_catalog::PoolCatalog) of known pools,
//! - the [`CommandBuilder`](command::CommandBuilder) that turns a request into a worker
//!   invocation,
//! - the [`JobRegistry`](registry::JobRegistry) holding every job's state and stats,
//! - the [`LifecycleManager`](lifecycle::LifecycleManager) spawning and reaping workers,
//! - the [`TelemetryBroadcaster`](telemetry::TelemetryBroadcaster) fanning changes out.
//!
//! [`MiningOrchestrator::start`] runs it as a service until Ctrl+C.
use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, info, warn};

use crate::{
    command::{BinaryRegistry, CommandBuilder},
    config::OrchestratorConfig,
    error::OrchestratorResult,
    job::{JobId, JobRequest, JobSummary},
    lifecycle::LifecycleManager,
    pool_catalog::{PoolCatalog, PoolView},
    registry::JobRegistry,
    status::{State, Status},
    task_manager::TaskManager,
    telemetry::{Subscription, TelemetryBroadcaster},
};

pub mod command;
pub mod config;
pub mod custom_mutex;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod logging;
pub mod parser;
pub mod pool_catalog;
pub mod registry;
pub mod status;
pub mod task_manager;
pub mod telemetry;

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// The orchestrator service.
pub struct MiningOrchestrator {
    config: OrchestratorConfig,
    catalog: Arc<PoolCatalog>,
    registry: Arc<JobRegistry>,
    broadcaster: Arc<TelemetryBroadcaster>,
    lifecycle: LifecycleManager,
    status_rx: async_channel::Receiver<Status>,
}

impl MiningOrchestrator {
    /// Validates `config` and assembles the pool catalog and binary registry.
    pub fn new(config: OrchestratorConfig) -> OrchestratorResult<Self> {
        config.validate()?;
        let catalog = Arc::new(PoolCatalog::from_config(&config.pools)?);
        let commands = CommandBuilder::new(BinaryRegistry::from_config(&config.binaries)?);
        let registry = Arc::new(JobRegistry::new());
        let broadcaster = Arc::new(TelemetryBroadcaster::new(
            registry.clone(),
            config.subscriber_queue_capacity,
        ));
        let (status_tx, status_rx) = async_channel::bounded(STATUS_CHANNEL_CAPACITY);
        let lifecycle = LifecycleManager::new(
            catalog.clone(),
            commands,
            registry.clone(),
            broadcaster.clone(),
            Arc::new(TaskManager::new()),
            status_tx,
            config.max_threads(),
            config.stop_grace_period(),
        );
        Ok(Self {
            config,
            catalog,
            registry,
            broadcaster,
            lifecycle,
            status_rx,
        })
    }

    /// Launches a worker. The job is `Running` when this returns.
    pub fn start_job(&self, request: JobRequest) -> OrchestratorResult<JobId> {
        self.lifecycle.start(request)
    }

    /// Requests a graceful stop. Does not wait for the worker to exit.
    pub fn stop_job(&self, job_id: &JobId) -> OrchestratorResult<()> {
        self.lifecycle.stop(job_id)
    }

    pub fn get_job(&self, job_id: &JobId) -> OrchestratorResult<JobSummary> {
        self.registry.get(job_id)
    }

    pub fn list_jobs(&self) -> OrchestratorResult<Vec<JobSummary>> {
        self.registry.list()
    }

    /// Subscribes to job events, starting with a snapshot of every job.
    pub fn subscribe(&self) -> OrchestratorResult<Subscription> {
        self.broadcaster.subscribe()
    }

    pub fn list_pools(&self) -> Vec<PoolView> {
        self.catalog.list()
    }

    /// Stops every running job and waits for their supervisors.
    pub async fn shutdown(&self) -> OrchestratorResult<()> {
        self.lifecycle.shutdown().await
    }

    /// Runs the orchestrator as a service.
    ///
    /// Starts the configured jobs, logs every telemetry event and reports supervisor
    /// status until Ctrl+C, then stops all jobs.
    pub async fn start(self) -> OrchestratorResult<()> {
        info!("Starting mining orchestrator...");
        info!(
            "{} pool(s) available: {}",
            self.catalog.len(),
            self.catalog
                .list()
                .iter()
                .map(|p| p.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let events = self.subscribe()?;
        let event_logger = tokio::spawn(log_events(events));

        for request in self.config.jobs.clone() {
            let pool_id = request.pool_id.clone();
            match self.start_job(request) {
                Ok(job_id) => info!("Started configured job {job_id}"),
                Err(e) => error!("Failed to start configured job on pool `{pool_id}`: {e}"),
            }
        }

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, initiating graceful shutdown...");
                    break;
                }
                message = self.status_rx.recv() => {
                    let Ok(status) = message else {
                        warn!("Status channel closed, shutting down");
                        break;
                    };
                    match status.state {
                        State::JobExited { job_id, state } => {
                            info!("Job {job_id} reaped as {}", state.name());
                        }
                        State::ReaderFailed { job_id, stream, reason } => {
                            warn!("Lost {stream} of job {job_id}: {reason}");
                        }
                        State::SupervisorFailed { job_id, reason } => {
                            error!("Supervisor of job {job_id} failed: {reason}");
                        }
                    }
                }
            }
        }

        self.shutdown().await?;
        self.broadcaster.close();
        if let Err(e) = event_logger.await {
            warn!("Telemetry logger ended abnormally: {e}");
        }
        info!("Mining orchestrator shutdown complete.");
        Ok(())
    }
}

async fn log_events(mut events: Subscription) {
    while let Some(event) = events.next().await {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "telemetry", "{json}"),
            Err(e) => warn!("Failed to serialize {} event: {e}", event.kind()),
        }
    }
}
