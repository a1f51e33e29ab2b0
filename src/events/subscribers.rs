//! Consuming domain events from the broker.
//!
//! [`EventSubscriber`] binds an [`EnvelopeHandler`] to a queue through the connection manager.
//! Each delivery is decoded into a [`ReceivedEvent`]; bodies that are not event envelopes are
//! rejected without requeue so the broker dead-letters them, while handler errors requeue the
//! message for another attempt. [`DispatchBridge`] feeds remote events into a local
//! [`EventDispatcher`].

use std::sync::Arc;

use async_trait::async_trait;
use rabbitmq::{
    ConnectionManager, ConsumeError, ConsumeResult, Delivery, MessageContext, MessageHandler,
    RabbitMQError,
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{
    dispatcher::EventDispatcher,
    publishers::HEADER_EVENT_ID,
    types::{DomainEvent, EventEnvelope, EventResult},
};

/// An event taken off a queue
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub envelope: EventEnvelope,
    /// Id the producer gave the event; empty if the message carried none
    pub event_id: String,
    pub tenant_id: String,
    pub trace_id: String,
    pub routing_key: String,
    /// The broker delivered this message before
    pub redelivered: bool,
}

impl ReceivedEvent {
    /// Decodes a delivery; the ids come from `ctx`, which the consumer built from the headers
    pub fn from_delivery(ctx: &MessageContext, delivery: &Delivery) -> EventResult<Self> {
        let envelope = EventEnvelope::from_slice(&delivery.body)?;
        let event_id = delivery
            .properties
            .message_id
            .clone()
            .or_else(|| delivery.properties.header(HEADER_EVENT_ID).map(str::to_owned))
            .unwrap_or_default();

        Ok(Self {
            envelope,
            event_id,
            tenant_id: ctx.tenant_id().to_owned(),
            trace_id: ctx.trace_id().to_owned(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
        })
    }

    pub fn event_type(&self) -> &str {
        &self.envelope.event_type
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> EventResult<T> {
        self.envelope.decode_payload()
    }

    /// The event as the producer created it, original id included
    pub fn to_domain_event(&self) -> DomainEvent {
        DomainEvent::restore(
            self.event_id.clone(),
            &self.envelope,
            self.tenant_id.clone(),
            self.trace_id.clone(),
        )
    }
}

/// Processes events received from a queue
///
/// An `Err` requeues the message.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &MessageContext, event: &ReceivedEvent) -> EventResult<()>;
}

/// Subscribes envelope handlers to queues through the shared connection manager
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    manager: ConnectionManager,
}

impl EventSubscriber {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Starts consuming `queue` with `handler`
    ///
    /// The subscription survives reconnections. When the broker is down the consumer starts as
    /// soon as the connection is back.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<(), RabbitMQError> {
        let adapter = EnvelopeAdapter {
            queue: queue.to_owned(),
            handler,
        };
        self.manager.subscribe(queue, Arc::new(adapter)).await
    }

    pub async fn unsubscribe(&self, queue: &str) -> bool {
        self.manager.unsubscribe(queue).await
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

struct EnvelopeAdapter {
    queue: String,
    handler: Arc<dyn EnvelopeHandler>,
}

#[async_trait]
impl MessageHandler for EnvelopeAdapter {
    async fn handle(&self, ctx: &MessageContext, delivery: &Delivery) -> ConsumeResult {
        let event = match ReceivedEvent::from_delivery(ctx, delivery) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    queue = %self.queue,
                    routing_key = %delivery.routing_key,
                    "invalid event envelope, dead-lettering: {}",
                    err
                );
                return Err(ConsumeError::reject(err));
            }
        };

        debug!(
            queue = %self.queue,
            event_type = event.event_type(),
            event_id = %event.event_id,
            redelivered = event.redelivered,
            "event received"
        );
        self.handler
            .handle(ctx, &event)
            .await
            .map_err(ConsumeError::retry)
    }
}

/// Hands received events to local handlers
///
/// Local handlers run detached, so the message is acknowledged once they are started.
pub struct DispatchBridge {
    dispatcher: Arc<EventDispatcher>,
}

impl DispatchBridge {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl EnvelopeHandler for DispatchBridge {
    async fn handle(&self, ctx: &MessageContext, event: &ReceivedEvent) -> EventResult<()> {
        let started = self
            .dispatcher
            .dispatch_local(ctx, &event.to_domain_event())
            .await;
        debug!(event_type = event.event_type(), handlers = started, "remote event dispatched");
        Ok(())
    }
}
