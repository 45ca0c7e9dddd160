//! Lifecycle event fan-out
//!
//! A broadcast channel with a bounded per-subscriber queue. Publishing
//! never blocks: a subscriber that falls behind has its oldest undelivered
//! events dropped and observes a `Lagged` marker telling it how many it
//! missed, at which point it should re-fetch authoritative state from the
//! store. The bus is a liveness channel, not the source of truth.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::models::JobEvent;

/// Which events a subscriber wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFilter {
    /// Every job's events
    #[default]
    All,
    /// Only events for one job
    Job(Uuid),
}

impl EventFilter {
    pub fn matches(&self, event: &JobEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Job(job_id) => event.job_id == *job_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// `capacity` bounds each subscriber's undelivered queue
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Broadcast an event. Never blocks; no subscribers is not an error.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    /// New subscriber; unsubscribing is dropping the stream
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        EventStream {
            rx: self.sender.subscribe(),
            filter,
            dropped: self.dropped.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total events dropped across all subscribers since startup
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// What a subscriber pulls off its stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(JobEvent),
    /// The subscriber fell behind and `n` events were dropped for it;
    /// authoritative state should be re-fetched from the store
    Lagged(u64),
}

pub struct EventStream {
    rx: broadcast::Receiver<JobEvent>,
    filter: EventFilter,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Next item matching the filter, or `None` when the bus is gone
    pub async fn next(&mut self) -> Option<StreamItem> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => {
                    return Some(StreamItem::Event(event));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    warn!(missed = n, "event subscriber lagged, oldest events dropped");
                    return Some(StreamItem::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeploySpec, Job, JobEvent};
    use std::collections::BTreeMap;

    fn event_for(job: &Job, detail: &str) -> JobEvent {
        JobEvent::transition(job, Some(detail.to_string()))
    }

    fn job(target: &str) -> Job {
        Job::new(
            DeploySpec {
                target: target.to_string(),
                image: "nginx:latest".to_string(),
                ports: vec![],
                env: BTreeMap::new(),
                resources: None,
                health_path: None,
            },
            0,
        )
    }

    #[tokio::test]
    async fn test_publish_subscribe_roundtrip() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe(EventFilter::All);

        let job = job("web");
        bus.publish(event_for(&job, "queued"));

        match stream.next().await {
            Some(StreamItem::Event(event)) => {
                assert_eq!(event.job_id, job.id);
                assert_eq!(event.detail.as_deref(), Some("queued"));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_filter_selects_single_job() {
        let bus = EventBus::new(16);
        let web = job("web");
        let api = job("api");
        let mut stream = bus.subscribe(EventFilter::Job(web.id));

        bus.publish(event_for(&api, "noise"));
        bus.publish(event_for(&web, "signal"));

        match stream.next().await {
            Some(StreamItem::Event(event)) => {
                assert_eq!(event.job_id, web.id);
                assert_eq!(event.detail.as_deref(), Some("signal"));
            }
            other => panic!("expected filtered event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(event_for(&job("web"), "nobody listening"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_and_counts() {
        let bus = EventBus::new(2);
        let mut stream = bus.subscribe(EventFilter::All);
        let job = job("web");

        for i in 0..50 {
            bus.publish(event_for(&job, &format!("event-{i}")));
        }

        // First pull reports the lag, then delivery resumes from the
        // oldest retained event.
        match stream.next().await {
            Some(StreamItem::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag marker, got {other:?}"),
        }
        assert!(bus.dropped_events() > 0);

        let mut seen = Vec::new();
        drop(bus);
        while let Some(item) = stream.next().await {
            match item {
                StreamItem::Event(event) => seen.push(event.detail.unwrap()),
                StreamItem::Lagged(_) => {}
            }
        }
        // The tail of the published sequence survives, in order.
        assert_eq!(seen.last().map(String::as_str), Some("event-49"));
        let positions: Vec<usize> = seen
            .iter()
            .map(|d| d.trim_start_matches("event-").parse().unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_is_dropped() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe(EventFilter::All);
        drop(bus);
        assert!(stream.next().await.is_none());
    }
}
