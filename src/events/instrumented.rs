use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rabbitmq::MessageContext;

use super::{
    publishers::{EventPublisher, PublishError},
    types::DomainEvent,
};
use crate::metrics::MetricsSink;

pub const METRIC_PUBLISH_CALLS: &str = "events.publish.calls";
pub const METRIC_PUBLISH_SUCCESS: &str = "events.publish.success";
pub const METRIC_PUBLISH_FAILURE: &str = "events.publish.failure";
pub const METRIC_PUBLISH_DURATION: &str = "events.publish.duration";

/// Aggregate publishing figures since the publisher was created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub total_published: u64,
    pub total_failed: u64,
    pub last_duration: Option<Duration>,
    pub last_published_at: Option<DateTime<Utc>>,
}

/// Decorator recording call, outcome and duration metrics per event type
///
/// Results pass through untouched.
pub struct InstrumentedPublisher<P> {
    inner: P,
    sink: Arc<dyn MetricsSink>,
    stats: Mutex<PublisherStats>,
}

impl<P: EventPublisher> InstrumentedPublisher<P> {
    pub fn new(inner: P, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner,
            sink,
            stats: Mutex::new(PublisherStats::default()),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats.lock().clone()
    }

    fn record(&self, event: &DomainEvent, elapsed: Duration, succeeded: bool) {
        let tags = [("event_type", event.event_type())];
        self.sink.increment_counter(METRIC_PUBLISH_CALLS, &tags);
        self.sink.record_duration(METRIC_PUBLISH_DURATION, elapsed, &tags);
        if succeeded {
            self.sink.increment_counter(METRIC_PUBLISH_SUCCESS, &tags);
        } else {
            self.sink.increment_counter(METRIC_PUBLISH_FAILURE, &tags);
        }
    }

    fn update_stats(&self, events: u64, elapsed: Duration, succeeded: bool) {
        let mut stats = self.stats.lock();
        if succeeded {
            stats.total_published += events;
            stats.last_published_at = Some(Utc::now());
        } else {
            stats.total_failed += events;
        }
        stats.last_duration = Some(elapsed);
    }
}

#[async_trait]
impl<P: EventPublisher> EventPublisher for InstrumentedPublisher<P> {
    async fn publish(&self, ctx: &MessageContext, event: &DomainEvent) -> Result<(), PublishError> {
        let started = Instant::now();
        let result = self.inner.publish(ctx, event).await;
        let elapsed = started.elapsed();

        self.record(event, elapsed, result.is_ok());
        self.update_stats(1, elapsed, result.is_ok());
        result
    }

    async fn publish_batch(
        &self,
        ctx: &MessageContext,
        events: &[DomainEvent],
    ) -> Result<(), PublishError> {
        let started = Instant::now();
        let result = self.inner.publish_batch(ctx, events).await;
        let elapsed = started.elapsed();

        if !events.is_empty() {
            let share = batch_share(elapsed, events.len());
            for event in events {
                self.record(event, share, result.is_ok());
            }
            self.update_stats(events.len() as u64, elapsed, result.is_ok());
        }
        result
    }
}

/// Per-event share of a batch's duration
fn batch_share(elapsed: Duration, events: usize) -> Duration {
    elapsed.div_f64(events.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use mockall::mock;

    mock! {
        pub Inner {}

        #[async_trait]
        impl EventPublisher for Inner {
            async fn publish(&self, ctx: &MessageContext, event: &DomainEvent) -> Result<(), PublishError>;
            async fn publish_batch(&self, ctx: &MessageContext, events: &[DomainEvent]) -> Result<(), PublishError>;
        }
    }

    fn instrumented(inner: MockInner) -> (InstrumentedPublisher<MockInner>, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        (InstrumentedPublisher::new(inner, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn successful_publish_is_counted_per_type() {
        let mut inner = MockInner::new();
        inner.expect_publish().times(2).returning(|_, _| Ok(()));
        let (publisher, metrics) = instrumented(inner);
        let ctx = MessageContext::new();

        for _ in 0..2 {
            let event = DomainEvent::new("party.added", "x", b"{}".to_vec());
            publisher.publish(&ctx, &event).await.unwrap();
        }

        let tags = [("event_type", "party.added")];
        assert_eq!(metrics.counter(METRIC_PUBLISH_CALLS, &tags), 2);
        assert_eq!(metrics.counter(METRIC_PUBLISH_SUCCESS, &tags), 2);
        assert_eq!(metrics.counter(METRIC_PUBLISH_FAILURE, &tags), 0);
        assert_eq!(metrics.durations(METRIC_PUBLISH_DURATION, &tags).len(), 2);

        let stats = publisher.stats();
        assert_eq!(stats.total_published, 2);
        assert!(stats.last_published_at.is_some());
    }

    #[tokio::test]
    async fn errors_pass_through_unchanged() {
        let mut inner = MockInner::new();
        inner.expect_publish().returning(|_, _| {
            Err(PublishError::Unconfirmed {
                confirmed: 1,
                total: 3,
            })
        });
        let (publisher, metrics) = instrumented(inner);

        let event = DomainEvent::new("process.created", "p-1", b"{}".to_vec());
        let err = publisher
            .publish(&MessageContext::new(), &event)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PublishError::Unconfirmed {
                confirmed: 1,
                total: 3
            }
        ));
        let tags = [("event_type", "process.created")];
        assert_eq!(metrics.counter(METRIC_PUBLISH_FAILURE, &tags), 1);
        assert_eq!(publisher.stats().total_failed, 1);
        assert_eq!(publisher.stats().last_published_at, None);
    }

    #[tokio::test]
    async fn batch_records_every_event() {
        let mut inner = MockInner::new();
        inner.expect_publish_batch().times(1).returning(|_, _| Ok(()));
        let (publisher, metrics) = instrumented(inner);
        let events = vec![
            DomainEvent::new("process.created", "p-1", b"{}".to_vec()),
            DomainEvent::new("process.created", "p-2", b"{}".to_vec()),
            DomainEvent::new("party.added", "x", b"{}".to_vec()),
        ];

        publisher
            .publish_batch(&MessageContext::new(), &events)
            .await
            .unwrap();

        assert_eq!(
            metrics.counter(METRIC_PUBLISH_SUCCESS, &[("event_type", "process.created")]),
            2
        );
        assert_eq!(
            metrics.counter(METRIC_PUBLISH_SUCCESS, &[("event_type", "party.added")]),
            1
        );
        assert_eq!(publisher.stats().total_published, 3);
    }

    #[test]
    fn batch_share_splits_evenly_for_any_batch_length() {
        assert_eq!(batch_share(Duration::from_secs(1), 4), Duration::from_millis(250));
        assert_eq!(batch_share(Duration::from_secs(1), 0), Duration::from_secs(1));

        #[cfg(target_pointer_width = "64")]
        assert!(batch_share(Duration::from_secs(1), 1usize << 32) < Duration::from_micros(1));
    }
}
