use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use rabbitmq::MessageContext;
use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use super::{
    publishers::{EventPublisher, PublishError},
    types::DomainEvent,
};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingConfig {
    /// Events per flushed batch
    pub batch_size: usize,
    /// Longest time an event waits in the buffer
    pub flush_interval: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl BatchingConfig {
    /// Capacity of the internal queue: two batches
    pub fn queue_capacity(&self) -> usize {
        self.batch_size.max(1) * 2
    }
}

/// Publisher that buffers events and sends them in confirmed batches from a background task
///
/// A full queue never blocks or drops: the event is published inline through the wrapped
/// publisher instead. If a batch fails, each of its events is retried on its own.
pub struct AsyncBatchingPublisher {
    inner: Arc<dyn EventPublisher>,
    config: BatchingConfig,
    sender: Mutex<Option<mpsc::Sender<DomainEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncBatchingPublisher {
    /// Wraps `inner` and starts the flush loop; must be called inside a tokio runtime
    pub fn new(inner: Arc<dyn EventPublisher>, config: BatchingConfig) -> Self {
        let config = BatchingConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        let (sender, receiver) = mpsc::channel(config.queue_capacity());
        let worker = tokio::spawn(run_flush_loop(Arc::clone(&inner), receiver, config));

        Self {
            inner,
            config,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stops accepting buffered events, flushes what is queued and waits for the flush loop
    ///
    /// Later calls to `publish` go straight to the wrapped publisher.
    pub async fn close(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!("batch flush loop ended abnormally: {}", err);
            }
        }
        info!("batching publisher closed");
    }
}

#[async_trait]
impl EventPublisher for AsyncBatchingPublisher {
    async fn publish(&self, ctx: &MessageContext, event: &DomainEvent) -> Result<(), PublishError> {
        // the flush runs without the caller's context, so the ids must travel on the event
        let event = event.clone().inherit_metadata(ctx);
        let sender = self.sender.lock().clone();

        let event = match sender {
            Some(sender) => match sender.try_send(event) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(event)) => {
                    debug!(
                        event_type = event.event_type(),
                        capacity = self.config.queue_capacity(),
                        "batch queue full, publishing inline"
                    );
                    event
                }
                Err(TrySendError::Closed(event)) => event,
            },
            None => event,
        };

        self.inner.publish(ctx, &event).await
    }

    /// Already a batch: handed to the wrapped publisher as is
    async fn publish_batch(
        &self,
        ctx: &MessageContext,
        events: &[DomainEvent],
    ) -> Result<(), PublishError> {
        self.inner.publish_batch(ctx, events).await
    }
}

async fn run_flush_loop(
    inner: Arc<dyn EventPublisher>,
    mut receiver: mpsc::Receiver<DomainEvent>,
    config: BatchingConfig,
) {
    let mut buffer = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        select! {
            received = receiver.recv() => match received {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= config.batch_size {
                        flush(inner.as_ref(), &mut buffer).await;
                        ticker.reset();
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(inner.as_ref(), &mut buffer).await;
                }
            }
        }
    }

    if !buffer.is_empty() {
        flush(inner.as_ref(), &mut buffer).await;
    }
    debug!("batch flush loop stopped");
}

async fn flush(inner: &dyn EventPublisher, buffer: &mut Vec<DomainEvent>) {
    let batch = std::mem::take(buffer);
    let ctx = MessageContext::background();

    match inner.publish_batch(&ctx, &batch).await {
        Ok(()) => debug!(events = batch.len(), "batch flushed"),
        Err(err) => {
            warn!(
                events = batch.len(),
                "batch publish failed, publishing events one by one: {}", err
            );
            let mut failed = 0usize;
            for event in &batch {
                if let Err(err) = inner.publish(&ctx, event).await {
                    failed += 1;
                    error!(
                        event_type = event.event_type(),
                        event_id = event.id(),
                        tenant_id = event.tenant_id(),
                        trace_id = event.trace_id(),
                        "failed to publish event: {}",
                        err
                    );
                }
            }
            if failed > 0 {
                error!(failed, events = batch.len(), "events dropped after fallback");
            }
        }
    }
}
