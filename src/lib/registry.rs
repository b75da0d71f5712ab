//! ## Job Registry
//!
//! In-memory table of every job launched by this process. The registry owns each job's
//! [`JobState`] and [`JobStats`] and, while the job is active, the control handle used to
//! ask its supervisor to stop the worker.
//!
//! The outer map is behind an `RwLock` and is write-locked only to insert or remove a
//! record. Every other operation clones the record's `Arc` under a read lock and then
//! works on that single record through its own [`Mutex`].

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tracing::debug;

use crate::{
    custom_mutex::Mutex,
    error::{OrchestratorError, OrchestratorResult},
    job::{now_millis, JobId, JobState, JobStats, JobSummary, MiningJob},
    parser::MetricUpdate,
    status::OutputStream,
};

/// Handle through which a job's supervisor is told to stop the worker.
#[derive(Debug, Clone)]
pub(crate) struct ProcessControl {
    pub pid: Option<u32>,
    pub stop_tx: async_channel::Sender<()>,
}

/// What the caller of [`JobRegistry::request_stop`] has to do next.
#[derive(Debug)]
pub(crate) enum StopRequest {
    /// Send on `stop_tx` to reach the supervisor of worker `pid`.
    Deliver {
        stop_tx: async_channel::Sender<()>,
        pid: Option<u32>,
    },
    /// The process does not exist yet; the stop is delivered once it does.
    Deferred,
    /// The job already ended.
    AlreadyTerminal,
}

#[derive(Debug)]
struct JobRecord {
    job: MiningJob,
    stats: JobStats,
    control: Option<ProcessControl>,
    stop_requested: bool,
    /// Sequence of the last line applied from each pipe.
    last_sequence: HashMap<OutputStream, u64>,
}

impl JobRecord {
    fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job.id.clone(),
            state: self.job.state,
            config: self.job.config.clone(),
            stats: self.stats.clone(),
            start_time: self.job.created_at,
            end_time: self.job.ended_at,
        }
    }
}

/// The job table.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobRecord>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new job with empty stats.
    pub fn create(&self, job: MiningJob) -> OrchestratorResult<JobSummary> {
        let mut jobs = self.jobs.write()?;
        if jobs.contains_key(&job.id) {
            return Err(OrchestratorError::DuplicateJob(job.id));
        }
        let record = JobRecord {
            job,
            stats: JobStats::default(),
            control: None,
            stop_requested: false,
            last_sequence: HashMap::new(),
        };
        let summary = record.summary();
        jobs.insert(summary.job_id.clone(), Arc::new(Mutex::new(record)));
        Ok(summary)
    }

    pub fn get(&self, job_id: &JobId) -> OrchestratorResult<JobSummary> {
        self.with_record(job_id, |r| r.summary())
    }

    /// All jobs ordered by start time.
    pub fn list(&self) -> OrchestratorResult<Vec<JobSummary>> {
        let records: Vec<_> = self.jobs.read()?.values().cloned().collect();
        let mut summaries = Vec::with_capacity(records.len());
        for record in records {
            summaries.push(record.safe_lock(|r| r.summary())?);
        }
        summaries.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(summaries)
    }

    /// Identifiers of jobs that are `Starting` or `Running`.
    pub fn active_job_ids(&self) -> OrchestratorResult<Vec<JobId>> {
        let records: Vec<_> = self.jobs.read()?.values().cloned().collect();
        let mut ids = Vec::new();
        for record in records {
            if let Some(id) =
                record.safe_lock(|r| r.job.state.is_active().then(|| r.job.id.clone()))?
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Applies the fields present in `update`, read from `stream`, and returns the
    /// resulting stats.
    ///
    /// Sequences are compared per pipe only: stdout and stderr are not ordered relative to
    /// each other. Returns `None` when nothing changed: the job is terminal, the update is
    /// not newer than the last one applied from the same pipe, or its share counters
    /// would move backwards.
    pub fn apply_metric_update(
        &self,
        job_id: &JobId,
        stream: OutputStream,
        update: &MetricUpdate,
    ) -> OrchestratorResult<Option<JobStats>> {
        self.with_record(job_id, |r| {
            if r.job.state.is_terminal() {
                return None;
            }
            let last = r.last_sequence.entry(stream).or_default();
            if update.sequence <= *last {
                return None;
            }
            *last = update.sequence;
            let mut changed = false;
            if let Some(hash_rate) = update.hash_rate {
                r.stats.hash_rate = hash_rate;
                changed = true;
            }
            if let Some(shares) = &update.shares {
                changed |= r.stats.accept_shares(shares);
            }
            if !changed {
                return None;
            }
            r.stats.revision += 1;
            r.stats.last_update = Some(now_millis());
            Some(r.stats.clone())
        })
    }

    /// Moves a job to `next`.
    ///
    /// A job that is already terminal is left untouched and `Ok(None)` is returned. On a
    /// terminal transition the control handle is released and the end time recorded.
    pub fn transition(
        &self,
        job_id: &JobId,
        next: JobState,
    ) -> OrchestratorResult<Option<JobSummary>> {
        self.with_record(job_id, |r| {
            let current = r.job.state;
            if current.is_terminal() {
                debug!(
                    "Ignoring transition of job {job_id} to {}: already {}",
                    next.name(),
                    current.name()
                );
                return Ok(None);
            }
            if !current.can_advance_to(&next) {
                return Err(OrchestratorError::InvalidTransition {
                    job_id: job_id.clone(),
                    from: current,
                    to: next,
                });
            }
            r.job.state = next;
            if next.is_terminal() {
                r.control = None;
                r.job.ended_at = Some(now_millis());
            }
            Ok(Some(r.summary()))
        })?
    }

    /// Stores the control handle of a freshly spawned worker. Returns whether a stop was
    /// requested while the job was starting.
    pub(crate) fn attach_control(
        &self,
        job_id: &JobId,
        control: ProcessControl,
    ) -> OrchestratorResult<bool> {
        self.with_record(job_id, |r| {
            if r.job.state.is_active() {
                r.control = Some(control);
            }
            r.stop_requested
        })
    }

    /// Marks the job as asked to stop.
    pub(crate) fn request_stop(&self, job_id: &JobId) -> OrchestratorResult<StopRequest> {
        self.with_record(job_id, |r| {
            if r.job.state.is_terminal() {
                return StopRequest::AlreadyTerminal;
            }
            r.stop_requested = true;
            match &r.control {
                Some(control) => StopRequest::Deliver {
                    stop_tx: control.stop_tx.clone(),
                    pid: control.pid,
                },
                None => StopRequest::Deferred,
            }
        })
    }

    pub(crate) fn stop_requested(&self, job_id: &JobId) -> OrchestratorResult<bool> {
        self.with_record(job_id, |r| r.stop_requested)
    }

    /// Drops a record. Only used when a job never got a process.
    pub(crate) fn remove(&self, job_id: &JobId) -> OrchestratorResult<()> {
        self.jobs.write()?.remove(job_id);
        Ok(())
    }

    pub fn len(&self) -> OrchestratorResult<usize> {
        Ok(self.jobs.read()?.len())
    }

    pub fn is_empty(&self) -> OrchestratorResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Runs `f` on one record while holding only that record's lock.
    fn with_record<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> OrchestratorResult<T> {
        let record = self.record(job_id)?;
        let result = record
            .safe_lock(f)
            .map_err(|e| OrchestratorError::PoisonLock(e.to_string()));
        result
    }

    fn record(&self, job_id: &JobId) -> OrchestratorResult<Arc<Mutex<JobRecord>>> {
        self.jobs
            .read()?
            .get(job_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))
    }
}
