//! ## Status Reporting System
//!
//! Per-job supervisor and reader tasks never return errors to a caller. Instead they
//! report what happened to the orchestrator's status loop through a [`StatusSender`]
//! tagged with the job and, for readers, the output stream.
//!
//! Status channels are bounded and written with `try_send`: a supervisor must be able to
//! finish reaping its worker even if nobody reads the status loop.

use tracing::{debug, error, warn};

use crate::{
    error::OrchestratorError,
    job::{JobId, JobState},
};

/// Which worker pipe a reader task consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Identifies the task that originated a [`Status`] update.
#[derive(Debug, Clone)]
pub enum StatusSender {
    /// The supervisor that owns a worker process.
    Supervisor {
        job_id: JobId,
        tx: async_channel::Sender<Status>,
    },
    /// A task reading one of a worker's output pipes.
    Reader {
        job_id: JobId,
        stream: OutputStream,
        tx: async_channel::Sender<Status>,
    },
}

impl StatusSender {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Supervisor { job_id, .. } | Self::Reader { job_id, .. } => job_id,
        }
    }

    /// Sends a [`Status`] update without waiting.
    pub fn send(&self, status: Status) -> Result<(), async_channel::TrySendError<Status>> {
        match self {
            Self::Supervisor { job_id, tx } => {
                debug!(
                    "Sending status from Supervisor [{}]: {:?}",
                    job_id, status.state
                );
                tx.try_send(status)
            }
            Self::Reader { job_id, stream, tx } => {
                debug!(
                    "Sending status from Reader [{} {}]: {:?}",
                    job_id, stream, status.state
                );
                tx.try_send(status)
            }
        }
    }
}

/// The type of event or error being reported by a task.
#[derive(Debug)]
pub enum State {
    /// A worker process was reaped and its job reached `state`.
    JobExited { job_id: JobId, state: JobState },
    /// Reading a worker pipe failed. The job keeps running.
    ReaderFailed {
        job_id: JobId,
        stream: OutputStream,
        reason: OrchestratorError,
    },
    /// A supervisor could not record its job's outcome.
    SupervisorFailed {
        job_id: JobId,
        reason: OrchestratorError,
    },
}

/// A message reporting the current [`State`] of a task.
#[derive(Debug)]
pub struct Status {
    pub state: State,
}

/// Reports a normal worker exit.
pub fn report_exit(sender: &StatusSender, state: JobState) {
    let status = Status {
        state: State::JobExited {
            job_id: sender.job_id().clone(),
            state,
        },
    };
    if let Err(e) = sender.send(status) {
        debug!("Status update from {sender:?} not delivered: {e}");
    }
}

/// Constructs and sends a [`Status`] update based on the [`StatusSender`] and error
/// context.
fn send_status(sender: &StatusSender, error: OrchestratorError) {
    let state = match sender {
        StatusSender::Supervisor { job_id, .. } => {
            warn!("Supervisor [{job_id}] failed: {error:?}");
            State::SupervisorFailed {
                job_id: job_id.clone(),
                reason: error,
            }
        }
        StatusSender::Reader { job_id, stream, .. } => {
            warn!("Reader [{job_id} {stream}] stopped: {error:?}");
            State::ReaderFailed {
                job_id: job_id.clone(),
                stream: *stream,
                reason: error,
            }
        }
    };

    if let Err(e) = sender.send(Status { state }) {
        error!("Failed to send status update from {sender:?}: {e}");
    }
}

/// Centralized error dispatcher for supervisor and reader tasks.
pub fn handle_error(sender: &StatusSender, e: OrchestratorError) {
    error!("Error in {:?}: {:?}", sender, e);
    send_status(sender, e);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_error_is_tagged() {
        let (tx, rx) = async_channel::bounded(4);
        let sender = StatusSender::Reader {
            job_id: JobId::from("job-1"),
            stream: OutputStream::Stderr,
            tx,
        };
        handle_error(
            &sender,
            OrchestratorError::Io(std::io::Error::other("pipe closed")),
        );
        match rx.try_recv().unwrap().state {
            State::ReaderFailed { job_id, stream, .. } => {
                assert_eq!(job_id.as_str(), "job-1");
                assert_eq!(stream, OutputStream::Stderr);
            }
            other => panic!("Expected ReaderFailed, got: {:?}", other),
        }
    }

    #[test]
    fn test_full_status_channel_does_not_block() {
        let (tx, rx) = async_channel::bounded(1);
        let sender = StatusSender::Supervisor {
            job_id: JobId::from("job-2"),
            tx,
        };
        report_exit(&sender, JobState::Stopped);
        report_exit(&sender, JobState::Stopped);
        assert_eq!(rx.len(), 1);
    }
}
