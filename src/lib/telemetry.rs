//! ## Telemetry Broadcaster
//!
//! Fans registry changes out to any number of observers. Every subscriber owns a bounded
//! queue; [`TelemetryBroadcaster::publish`] only ever calls `try_send`, so a slow observer
//! can never stall a job supervisor. A subscriber whose queue is full is dropped and its
//! [`Subscription`] ends once the already queued events are drained.
//!
//! A new subscription starts with a [`TelemetryEvent::Snapshot`] of every job. The
//! snapshot is taken while the subscriber list is locked, so any change published after
//! it reaches the new subscriber as a delta.
//!
//! Stats of one job are applied under its record lock but published after it is
//! released, so two readers of the same job may publish out of order. Each subscriber
//! remembers the newest stats revision it was sent per job and skips older ones.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_channel::TrySendError;
use futures::Stream;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::{
    custom_mutex::Mutex,
    error::OrchestratorResult,
    job::{JobId, JobStats, JobSummary},
    registry::JobRegistry,
};

/// An event delivered to subscribers, serialized as `{type, jobId, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TelemetryEvent {
    /// Every known job, sent once at the start of a subscription.
    Snapshot { payload: Vec<JobSummary> },
    #[serde(rename_all = "camelCase")]
    JobStarted { job_id: JobId, payload: JobSummary },
    #[serde(rename_all = "camelCase")]
    JobStopped { job_id: JobId, payload: JobSummary },
    #[serde(rename_all = "camelCase")]
    JobFailed { job_id: JobId, payload: JobSummary },
    #[serde(rename_all = "camelCase")]
    StatsUpdated { job_id: JobId, payload: JobStats },
}

impl TelemetryEvent {
    /// Event for a job that reached a terminal state.
    pub fn job_ended(summary: JobSummary) -> Self {
        let job_id = summary.job_id.clone();
        match summary.state {
            crate::job::JobState::Failed { .. } => TelemetryEvent::JobFailed {
                job_id,
                payload: summary,
            },
            _ => TelemetryEvent::JobStopped {
                job_id,
                payload: summary,
            },
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            TelemetryEvent::Snapshot { .. } => None,
            TelemetryEvent::JobStarted { job_id, .. }
            | TelemetryEvent::JobStopped { job_id, .. }
            | TelemetryEvent::JobFailed { job_id, .. }
            | TelemetryEvent::StatsUpdated { job_id, .. } => Some(job_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::Snapshot { .. } => "snapshot",
            TelemetryEvent::JobStarted { .. } => "jobStarted",
            TelemetryEvent::JobStopped { .. } => "jobStopped",
            TelemetryEvent::JobFailed { .. } => "jobFailed",
            TelemetryEvent::StatsUpdated { .. } => "statsUpdated",
        }
    }

    fn stats_revision(&self) -> Option<u64> {
        match self {
            TelemetryEvent::Snapshot { .. } => None,
            TelemetryEvent::JobStarted { payload, .. }
            | TelemetryEvent::JobStopped { payload, .. }
            | TelemetryEvent::JobFailed { payload, .. } => Some(payload.stats.revision),
            TelemetryEvent::StatsUpdated { payload, .. } => Some(payload.revision),
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: async_channel::Sender<TelemetryEvent>,
    /// Newest stats revision sent, per job.
    revisions: HashMap<JobId, u64>,
}

impl Subscriber {
    fn is_stale(&self, event: &TelemetryEvent) -> bool {
        match (event, event.job_id()) {
            (TelemetryEvent::StatsUpdated { payload, .. }, Some(job_id)) => self
                .revisions
                .get(job_id)
                .is_some_and(|&sent| payload.revision < sent),
            _ => false,
        }
    }

    fn record(&mut self, event: &TelemetryEvent) {
        if let (Some(job_id), Some(revision)) = (event.job_id(), event.stats_revision()) {
            let sent = self.revisions.entry(job_id.clone()).or_default();
            *sent = (*sent).max(revision);
        }
    }
}

#[derive(Debug, Default)]
struct Subscribers {
    next_id: u64,
    list: Vec<Subscriber>,
}

/// Bounded fan-out of job events.
#[derive(Debug)]
pub struct TelemetryBroadcaster {
    registry: Arc<JobRegistry>,
    capacity: usize,
    subscribers: Mutex<Subscribers>,
}

impl TelemetryBroadcaster {
    /// `capacity` is the number of events a subscriber may lag behind before it is
    /// dropped. It is raised to 1 if zero.
    pub fn new(registry: Arc<JobRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            capacity: capacity.max(1),
            subscribers: Mutex::new(Subscribers::default()),
        }
    }

    /// Registers a new observer. The first event it receives is a snapshot of all jobs.
    pub fn subscribe(&self) -> OrchestratorResult<Subscription> {
        let (tx, rx) = async_channel::bounded(self.capacity);
        let id = self.subscribers.safe_lock(|subscribers| {
            let snapshot = self.registry.list()?;
            let revisions = snapshot
                .iter()
                .map(|job| (job.job_id.clone(), job.stats.revision))
                .collect();
            // A fresh queue always has room for one event.
            let _ = tx.try_send(TelemetryEvent::Snapshot { payload: snapshot });
            let id = subscribers.next_id;
            subscribers.next_id += 1;
            subscribers.list.push(Subscriber { id, tx, revisions });
            OrchestratorResult::Ok(id)
        })??;
        debug!("Telemetry subscriber {id} registered");
        Ok(Subscription {
            id,
            receiver: Box::pin(rx),
        })
    }

    /// Delivers `event` to every subscriber without waiting.
    ///
    /// A `StatsUpdated` older than what a subscriber already received for that job is
    /// not sent to it.
    pub fn publish(&self, event: TelemetryEvent) {
        let result = self.subscribers.safe_lock(|subscribers| {
            subscribers.list.retain_mut(|subscriber| {
                if subscriber.is_stale(&event) {
                    return true;
                }
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => {
                        subscriber.record(&event);
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Telemetry subscriber {} is not keeping up, dropping it",
                            subscriber.id
                        );
                        false
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Telemetry subscriber {} went away", subscriber.id);
                        false
                    }
                }
            });
        });
        if let Err(e) = result {
            error!("Failed to publish {} event: {e}", event.kind());
        }
    }

    /// Drops every subscriber. Their subscriptions end once the queued events are read.
    pub fn close(&self) {
        let result = self
            .subscribers
            .safe_lock(|subscribers| std::mem::take(&mut subscribers.list).len());
        match result {
            Ok(count) => debug!("Closed {count} telemetry subscriber(s)"),
            Err(e) => error!("Failed to close telemetry subscribers: {e}"),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .safe_lock(|subscribers| subscribers.list.len())
            .unwrap_or_default()
    }
}

/// A stream of [`TelemetryEvent`]s for one observer.
///
/// Dropping it unsubscribes on the next publish.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: Pin<Box<async_channel::Receiver<TelemetryEvent>>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event. `None` once the subscriber has been dropped and its
    /// queue is empty.
    pub async fn recv(&self) -> Option<TelemetryEvent> {
        self.receiver.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<TelemetryEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = TelemetryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        job::{JobConfig, JobState, MiningJob},
        parser::MetricUpdate,
        pool_catalog::PoolCatalog,
        status::OutputStream,
    };
    use futures::StreamExt;

    fn registry_with_job() -> (Arc<JobRegistry>, JobId) {
        let registry = Arc::new(JobRegistry::new());
        let config = JobConfig {
            algorithm: "scrypt".to_string(),
            pool: PoolCatalog::builtin().resolve("litecoin").unwrap().view(),
            wallet: "abc".to_string(),
            worker: "w1".to_string(),
            threads: 1,
            intensity: None,
            command_line: String::new(),
        };
        let id = JobId::new("scrypt", "litecoin", 1, 1);
        registry
            .create(MiningJob::new(id.clone(), config, 1))
            .unwrap();
        (registry, id)
    }

    fn stats_event(job_id: &JobId, hash_rate: f64) -> TelemetryEvent {
        TelemetryEvent::StatsUpdated {
            job_id: job_id.clone(),
            payload: JobStats {
                hash_rate,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_snapshot_precedes_deltas() {
        let (registry, id) = registry_with_job();
        let broadcaster = TelemetryBroadcaster::new(registry, 8);
        let mut subscription = broadcaster.subscribe().unwrap();
        broadcaster.publish(stats_event(&id, 1.0));

        match subscription.next().await {
            Some(TelemetryEvent::Snapshot { payload }) => {
                assert_eq!(payload.len(), 1);
                assert_eq!(payload[0].job_id, id);
            }
            other => panic!("Expected snapshot, got: {:?}", other),
        }
        assert_eq!(subscription.next().await, Some(stats_event(&id, 1.0)));
    }

    #[test]
    fn test_lagging_subscriber_is_dropped() {
        let (registry, id) = registry_with_job();
        let broadcaster = TelemetryBroadcaster::new(registry, 2);
        let slow = broadcaster.subscribe().unwrap();
        let fast = broadcaster.subscribe().unwrap();

        broadcaster.publish(stats_event(&id, 1.0));
        assert!(fast.try_recv().is_some());
        assert!(fast.try_recv().is_some());

        // The slow queue now holds the snapshot and one delta.
        broadcaster.publish(stats_event(&id, 2.0));
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(fast.try_recv(), Some(stats_event(&id, 2.0)));

        assert!(matches!(
            slow.try_recv(),
            Some(TelemetryEvent::Snapshot { .. })
        ));
        assert_eq!(slow.try_recv(), Some(stats_event(&id, 1.0)));
        assert_eq!(slow.try_recv(), None);
    }

    #[test]
    fn test_stale_stats_are_skipped() {
        let (registry, id) = registry_with_job();
        let broadcaster = TelemetryBroadcaster::new(registry, 8);
        let subscription = broadcaster.subscribe().unwrap();
        assert!(matches!(
            subscription.try_recv(),
            Some(TelemetryEvent::Snapshot { .. })
        ));

        let revised = |revision, hash_rate| TelemetryEvent::StatsUpdated {
            job_id: id.clone(),
            payload: JobStats {
                hash_rate,
                revision,
                ..Default::default()
            },
        };
        broadcaster.publish(revised(2, 2.0));
        broadcaster.publish(revised(1, 1.0));
        broadcaster.publish(revised(3, 3.0));

        assert_eq!(subscription.try_recv(), Some(revised(2, 2.0)));
        assert_eq!(subscription.try_recv(), Some(revised(3, 3.0)));
        assert_eq!(subscription.try_recv(), None);
    }

    #[test]
    fn test_concurrent_updates_end_on_registry_stats() {
        let (registry, id) = registry_with_job();
        registry.transition(&id, JobState::Running).unwrap();
        let broadcaster = Arc::new(TelemetryBroadcaster::new(registry.clone(), 1024));
        let subscription = broadcaster.subscribe().unwrap();

        let writers: Vec<_> = [OutputStream::Stdout, OutputStream::Stderr]
            .into_iter()
            .map(|stream| {
                let registry = registry.clone();
                let broadcaster = broadcaster.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for sequence in 1..=200u64 {
                        let update = MetricUpdate {
                            hash_rate: Some(sequence as f64),
                            shares: None,
                            sequence,
                        };
                        if let Some(stats) =
                            registry.apply_metric_update(&id, stream, &update).unwrap()
                        {
                            broadcaster.publish(TelemetryEvent::StatsUpdated {
                                job_id: id.clone(),
                                payload: stats,
                            });
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut last: Option<JobStats> = None;
        while let Some(event) = subscription.try_recv() {
            if let TelemetryEvent::StatsUpdated { payload, .. } = event {
                if let Some(previous) = &last {
                    assert!(payload.revision > previous.revision);
                }
                last = Some(payload);
            }
        }
        assert_eq!(last, Some(registry.get(&id).unwrap().stats));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_after_queued_events() {
        let (registry, id) = registry_with_job();
        let broadcaster = TelemetryBroadcaster::new(registry, 8);
        let subscription = broadcaster.subscribe().unwrap();
        broadcaster.publish(stats_event(&id, 1.0));
        broadcaster.close();
        assert_eq!(broadcaster.subscriber_count(), 0);

        let events: Vec<_> = subscription.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], stats_event(&id, 1.0));
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let (registry, id) = registry_with_job();
        let broadcaster = TelemetryBroadcaster::new(registry, 4);
        drop(broadcaster.subscribe().unwrap());
        broadcaster.publish(stats_event(&id, 1.0));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_event_wire_format() {
        let (registry, id) = registry_with_job();
        registry.transition(&id, JobState::Running).unwrap();
        let summary = registry
            .transition(
                &id,
                JobState::Failed {
                    exit_code: Some(1),
                    signal: None,
                },
            )
            .unwrap()
            .unwrap();
        let event = TelemetryEvent::job_ended(summary);
        assert_eq!(event.kind(), "jobFailed");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "jobFailed");
        assert_eq!(json["jobId"], id.as_str());
        assert_eq!(json["payload"]["state"], "failed");
        assert_eq!(json["payload"]["exitCode"], 1);
        assert!(json["payload"]["signal"].is_null());
        assert_eq!(json["payload"]["stats"]["acceptedShares"], 0);
    }
}
