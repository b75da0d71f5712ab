use std::{sync::Mutex as StdMutex, time::Duration};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::warn;

/// Manages the tokio tasks spawned for job supervisors and readers.
///
/// Handles of finished tasks are pruned on every spawn, so a long-running service that
/// launches many short jobs does not accumulate them.
pub struct TaskManager {
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Spawns a new async task and adds it to the managed collection.
    #[track_caller]
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        use tracing::Instrument;
        let location = std::panic::Location::caller();
        let span = tracing::trace_span!(
            "task",
            file = location.file(),
            line = location.line(),
            column = location.column(),
        );

        let handle = tokio::spawn(fut.instrument(span));
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Waits for every managed task, aborting whatever is still running after `timeout`.
    pub async fn join_all(&self, timeout: Duration) {
        let handles = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            let stragglers = abort_handles.iter().filter(|h| !h.is_finished()).count();
            warn!("{stragglers} task(s) still running after {timeout:?}, aborting them");
            for handle in abort_handles {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn test_join_all_waits_for_tasks() {
        let manager = TaskManager::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            manager.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        manager.join_all(Duration::from_secs(5)).await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_join_all_aborts_stragglers() {
        let manager = TaskManager::new();
        manager.spawn(futures::future::pending());
        tokio::time::timeout(
            Duration::from_secs(1),
            manager.join_all(Duration::from_millis(20)),
        )
        .await
        .expect("join_all did not give up on the pending task");
    }
}
