//! Per-job supervision: output readers and the reaper.
//!
//! Each worker gets two reader tasks, one per pipe, and one supervisor task that waits for
//! the process to exit or for a stop request. A stop sends `SIGTERM` to the worker's
//! process group and escalates to `SIGKILL` once the grace period runs out.

use std::{process::ExitStatus, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    job::{JobId, JobState},
    parser::parse_line,
    registry::JobRegistry,
    status::{handle_error, report_exit, OutputStream, Status, StatusSender},
    telemetry::{TelemetryBroadcaster, TelemetryEvent},
};

/// How long readers may keep draining buffered output after the worker exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct Supervisor {
    job_id: JobId,
    registry: Arc<JobRegistry>,
    broadcaster: Arc<TelemetryBroadcaster>,
    status_tx: async_channel::Sender<Status>,
    grace_period: Duration,
}

impl Supervisor {
    pub(crate) fn new(
        job_id: JobId,
        registry: Arc<JobRegistry>,
        broadcaster: Arc<TelemetryBroadcaster>,
        status_tx: async_channel::Sender<Status>,
        grace_period: Duration,
    ) -> Self {
        Self {
            job_id,
            registry,
            broadcaster,
            status_tx,
            grace_period,
        }
    }

    /// Takes the child's pipes and starts one reader task per pipe.
    pub(crate) fn spawn_readers(&self, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(self.reader(OutputStream::Stdout).run(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(self.reader(OutputStream::Stderr).run(stderr)));
        }
        readers
    }

    fn reader(&self, stream: OutputStream) -> OutputReader {
        OutputReader {
            job_id: self.job_id.clone(),
            registry: self.registry.clone(),
            broadcaster: self.broadcaster.clone(),
            status: StatusSender::Reader {
                job_id: self.job_id.clone(),
                stream,
                tx: self.status_tx.clone(),
            },
            stream,
        }
    }

    /// Waits for the worker to exit, stopping it if asked to, then records the outcome.
    pub(crate) async fn supervise(
        self,
        mut child: Child,
        stop_rx: async_channel::Receiver<()>,
        readers: Vec<JoinHandle<()>>,
    ) {
        let status = StatusSender::Supervisor {
            job_id: self.job_id.clone(),
            tx: self.status_tx.clone(),
        };

        let (exit, stop_requested) = self.wait_for_exit(&mut child, &stop_rx, &status).await;
        let exit = match exit {
            Ok(exit) => Some(exit),
            Err(e) => {
                handle_error(&status, e.into());
                None
            }
        };

        drain_readers(&self.job_id, readers).await;

        let state = match exit {
            Some(exit) => exit_state(exit, stop_requested),
            None => JobState::Failed {
                exit_code: None,
                signal: None,
            },
        };

        match self.registry.transition(&self.job_id, state) {
            Ok(Some(summary)) => {
                info!("Job {} exited: {}", self.job_id, describe(&state));
                self.broadcaster.publish(TelemetryEvent::job_ended(summary));
                report_exit(&status, state);
            }
            Ok(None) => debug!("Job {} was already terminal", self.job_id),
            Err(e) => handle_error(&status, e),
        }
    }

    /// Waits for the worker to exit on its own or terminates it on a stop request.
    ///
    /// Also returns whether a stop had been requested by the time the worker exited; a stop
    /// arriving later does not turn a crash into a clean stop.
    async fn wait_for_exit(
        &self,
        child: &mut Child,
        stop_rx: &async_channel::Receiver<()>,
        status: &StatusSender,
    ) -> (std::io::Result<ExitStatus>, bool) {
        tokio::select! {
            exit = child.wait() => {
                let stop_requested = match self.registry.stop_requested(&self.job_id) {
                    Ok(requested) => requested,
                    Err(e) => {
                        handle_error(status, e);
                        false
                    }
                };
                (exit, stop_requested)
            }
            Ok(()) = stop_rx.recv() => (self.terminate(child).await, true),
        }
    }

    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        info!("Stopping job {}", self.job_id);
        signal_group(child, Termination::Graceful);
        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    "Job {} did not exit within {:?}, killing it",
                    self.job_id, self.grace_period
                );
                signal_group(child, Termination::Forced);
                child.wait().await
            }
        }
    }
}

async fn drain_readers(job_id: &JobId, readers: Vec<JoinHandle<()>>) {
    let abort_handles: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, join_all(readers))
        .await
        .is_err()
    {
        warn!("Output of job {job_id} still open after exit, abandoning readers");
        for handle in abort_handles {
            handle.abort();
        }
    }
}

/// Maps a worker's exit status to the job's terminal state.
pub(crate) fn exit_state(exit: ExitStatus, stop_requested: bool) -> JobState {
    let code = exit.code();
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&exit);
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    match (code, signal) {
        (Some(0), _) => JobState::Stopped,
        (None, Some(_)) if stop_requested => JobState::Stopped,
        (exit_code, signal) => JobState::Failed { exit_code, signal },
    }
}

fn describe(state: &JobState) -> String {
    match state {
        JobState::Failed {
            exit_code: Some(code),
            ..
        } => format!("failed with exit code {code}"),
        JobState::Failed {
            signal: Some(signal),
            ..
        } => format!("failed on signal {signal}"),
        other => other.name().to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Forced,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, termination: Termination) {
    use nix::{
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    let Some(pid) = child.id() else {
        return;
    };
    let signal = match termination {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!("killpg({pid}, {signal}) failed: {e}, signalling the worker only");
        if let Err(e) = child.start_kill() {
            debug!("Failed to kill worker {pid}: {e}");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _termination: Termination) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to kill worker: {e}");
    }
}

/// Feeds one worker pipe through the parser into the registry.
struct OutputReader {
    job_id: JobId,
    registry: Arc<JobRegistry>,
    broadcaster: Arc<TelemetryBroadcaster>,
    status: StatusSender,
    stream: OutputStream,
}

impl OutputReader {
    async fn run<R>(self, pipe: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut pipe = BufReader::new(pipe);
        let mut buf = Vec::new();
        let mut sequence = 0u64;
        loop {
            buf.clear();
            match pipe.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    sequence += 1;
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    trace!("[{} {}] {}", self.job_id, self.stream, line);
                    let Some(update) = parse_line(line) else {
                        continue;
                    };
                    let update = update.with_sequence(sequence);
                    match self
                        .registry
                        .apply_metric_update(&self.job_id, self.stream, &update)
                    {
                        Ok(Some(stats)) => self.broadcaster.publish(TelemetryEvent::StatsUpdated {
                            job_id: self.job_id.clone(),
                            payload: stats,
                        }),
                        Ok(None) => {}
                        Err(e) => {
                            handle_error(&self.status, e);
                            break;
                        }
                    }
                }
                Err(e) => {
                    handle_error(&self.status, e.into());
                    break;
                }
            }
        }
        debug!("[{} {}] closed", self.job_id, self.stream);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        job::{JobConfig, MiningJob},
        pool_catalog::PoolCatalog,
    };
    use std::os::unix::process::ExitStatusExt;

    fn supervised_job() -> (Supervisor, Arc<JobRegistry>, StatusSender) {
        let registry = Arc::new(JobRegistry::new());
        let config = JobConfig {
            algorithm: "scrypt".to_string(),
            pool: PoolCatalog::builtin().resolve("litecoin").unwrap().view(),
            wallet: "abc".to_string(),
            worker: "w1".to_string(),
            threads: 1,
            intensity: None,
            command_line: "/bin/sh".to_string(),
        };
        let job_id = JobId::new("scrypt", "litecoin", 1, 1);
        registry
            .create(MiningJob::new(job_id.clone(), config, 1))
            .unwrap();
        registry.transition(&job_id, JobState::Running).unwrap();

        let (status_tx, _status_rx) = async_channel::bounded(8);
        let status = StatusSender::Supervisor {
            job_id: job_id.clone(),
            tx: status_tx.clone(),
        };
        let supervisor = Supervisor::new(
            job_id,
            registry.clone(),
            Arc::new(TelemetryBroadcaster::new(registry.clone(), 8)),
            status_tx,
            Duration::from_secs(1),
        );
        (supervisor, registry, status)
    }

    #[tokio::test]
    async fn test_stop_after_crash_keeps_the_failure() {
        let (supervisor, registry, status) = supervised_job();
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "kill -9 $$"])
            .spawn()
            .unwrap();
        let (_stop_tx, stop_rx) = async_channel::bounded(1);

        let (exit, stop_requested) = supervisor
            .wait_for_exit(&mut child, &stop_rx, &status)
            .await;
        assert!(!stop_requested);

        // The stop only lands once the worker is already dead.
        registry.request_stop(&supervisor.job_id).unwrap();
        assert_eq!(
            exit_state(exit.unwrap(), stop_requested),
            JobState::Failed {
                exit_code: None,
                signal: Some(9)
            }
        );
    }

    #[tokio::test]
    async fn test_stop_request_terminates_the_worker() {
        let (supervisor, registry, status) = supervised_job();
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "while true; do sleep 0.1; done"])
            .spawn()
            .unwrap();
        let (stop_tx, stop_rx) = async_channel::bounded(1);
        registry.request_stop(&supervisor.job_id).unwrap();
        stop_tx.try_send(()).unwrap();

        let (exit, stop_requested) = supervisor
            .wait_for_exit(&mut child, &stop_rx, &status)
            .await;
        assert!(stop_requested);
        assert_eq!(exit_state(exit.unwrap(), stop_requested), JobState::Stopped);
    }

    #[test]
    fn test_exit_classification() {
        let clean = ExitStatus::from_raw(0);
        let code_one = ExitStatus::from_raw(1 << 8);
        let sigterm = ExitStatus::from_raw(15);

        assert_eq!(exit_state(clean, false), JobState::Stopped);
        assert_eq!(
            exit_state(code_one, false),
            JobState::Failed {
                exit_code: Some(1),
                signal: None
            }
        );
        assert_eq!(
            exit_state(code_one, true),
            JobState::Failed {
                exit_code: Some(1),
                signal: None
            }
        );
        assert_eq!(exit_state(sigterm, true), JobState::Stopped);
        assert_eq!(
            exit_state(sigterm, false),
            JobState::Failed {
                exit_code: None,
                signal: Some(15)
            }
        );
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&JobState::Failed {
                exit_code: Some(2),
                signal: None
            }),
            "failed with exit code 2"
        );
        assert_eq!(describe(&JobState::Stopped), "stopped");
    }
}
