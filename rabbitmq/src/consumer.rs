use std::{any::Any, error::Error, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{select, sync::mpsc::UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{context::MessageContext, transport::BrokerChannel, transport::Delivery};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// How a handler failed, which decides what happens to the message
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// Processing failed but may succeed later; the message is requeued
    #[error("message processing failed: {0}")]
    Retry(BoxError),
    /// The message can never be processed; it is rejected without requeue and dead-lettered
    #[error("message rejected: {0}")]
    Reject(BoxError),
}

impl ConsumeError {
    pub fn retry(err: impl Into<BoxError>) -> Self {
        ConsumeError::Retry(err.into())
    }

    pub fn reject(err: impl Into<BoxError>) -> Self {
        ConsumeError::Reject(err.into())
    }
}

pub type ConsumeResult = Result<(), ConsumeError>;

/// Processes deliveries taken from one queue
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &MessageContext, delivery: &Delivery) -> ConsumeResult;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageContext, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConsumeResult> + Send + 'static,
{
    async fn handle(&self, ctx: &MessageContext, delivery: &Delivery) -> ConsumeResult {
        (self.f)(ctx.clone(), delivery.clone()).await
    }
}

/// Wraps an async closure into a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(MessageContext, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConsumeResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Best-effort text of a caught panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Runs one consumer until it is cancelled or the broker ends its delivery stream
///
/// Deliveries are processed one at a time, so a single consumer sees its queue in FIFO order.
pub(crate) async fn run_consumer(
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: UnboundedReceiver<Delivery>,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    info!(queue = %queue, consumer_tag = %consumer_tag, "consumer started");

    loop {
        select! {
            biased;
            _ = cancel.cancelled() => {
                stop_consumer(&queue, &consumer_tag, channel.as_ref(), &mut deliveries).await;
                return;
            }
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => {
                    process_delivery(&queue, channel.as_ref(), handler.as_ref(), delivery).await;
                }
                None => {
                    // the reconnect supervisor starts a new consumer on the next channel
                    info!(queue = %queue, "delivery stream closed by broker");
                    return;
                }
            }
        }
    }
}

async fn stop_consumer(
    queue: &str,
    consumer_tag: &str,
    channel: &dyn BrokerChannel,
    deliveries: &mut UnboundedReceiver<Delivery>,
) {
    if channel.is_open() {
        if let Err(err) = channel.cancel_consumer(consumer_tag).await {
            debug!(queue, "failed to cancel consumer: {}", err);
        }
    }

    deliveries.close();
    let mut returned = 0;
    while let Ok(delivery) = deliveries.try_recv() {
        if channel.nack(delivery.delivery_tag, true).await.is_ok() {
            returned += 1;
        }
    }
    info!(queue, returned, "consumer stopped");
}

async fn process_delivery(
    queue: &str,
    channel: &dyn BrokerChannel,
    handler: &dyn MessageHandler,
    delivery: Delivery,
) {
    let ctx = MessageContext::from_headers(&delivery.properties.headers);
    let delivery_tag = delivery.delivery_tag;
    let started = Instant::now();

    let outcome = AssertUnwindSafe(handler.handle(&ctx, &delivery))
        .catch_unwind()
        .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let settled = match outcome {
        Ok(Ok(())) => {
            debug!(
                queue,
                routing_key = %delivery.routing_key,
                tenant_id = ctx.tenant_id(),
                trace_id = ctx.trace_id(),
                elapsed_ms,
                "message processed"
            );
            channel.ack(delivery_tag).await
        }
        Ok(Err(ConsumeError::Retry(err))) => {
            warn!(
                queue,
                routing_key = %delivery.routing_key,
                tenant_id = ctx.tenant_id(),
                trace_id = ctx.trace_id(),
                redelivered = delivery.redelivered,
                elapsed_ms,
                "message processing failed, requeueing: {}",
                err
            );
            channel.nack(delivery_tag, true).await
        }
        Ok(Err(ConsumeError::Reject(err))) => {
            warn!(
                queue,
                routing_key = %delivery.routing_key,
                tenant_id = ctx.tenant_id(),
                trace_id = ctx.trace_id(),
                elapsed_ms,
                "message rejected: {}",
                err
            );
            channel.nack(delivery_tag, false).await
        }
        Err(panic) => {
            error!(
                queue,
                routing_key = %delivery.routing_key,
                tenant_id = ctx.tenant_id(),
                trace_id = ctx.trace_id(),
                elapsed_ms,
                "message handler panicked, requeueing: {}",
                panic_message(panic.as_ref())
            );
            channel.nack(delivery_tag, true).await
        }
    };

    if let Err(err) = settled {
        // an unsettled message is redelivered once the channel goes away
        warn!(queue, delivery_tag, "failed to settle message: {}", err);
    }
}
