//! Broker-backed publishing of domain events.
//!
//! [`RabbitEventPublisher`] turns a [`DomainEvent`] into an
//! [`EventEnvelope`](super::types::EventEnvelope) body, derives the routing key from a
//! [`RoutingTable`], attaches propagation and event headers and hands the message to the
//! [`ConnectionManager`]. Batches are sent in confirm mode and succeed only once the
//! broker acknowledged every message.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::{StreamExt, stream::FuturesUnordered};
use rabbitmq::{
    ConnectionManager, HEADER_TENANT_ID, HEADER_TRACE_ID, MessageContext, MessageProperties,
    RabbitMQError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{select, time::Instant};
use tracing::{debug, warn};

use super::{
    routing::RoutingTable,
    types::{DomainEvent, EventError},
};

/// Time the broker gets to confirm a whole batch
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

pub const HEADER_EVENT_ID: &str = "event_id";
pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_EVENT_VERSION: &str = "event_version";
pub const HEADER_AGGREGATE_ID: &str = "aggregate_id";
pub const HEADER_OCCURRED_AT: &str = "occurred_at";

#[derive(Error, Debug, Clone)]
pub enum PublishError {
    /// The broker or channel cannot take messages right now
    #[error("Broker unavailable: {0}")]
    Unavailable(RabbitMQError),

    /// The event could not be encoded; retrying will not help
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    /// The broker negatively confirmed, or lost, part of a batch
    #[error("Only {confirmed} of {total} messages were confirmed by the broker")]
    Unconfirmed { confirmed: usize, total: usize },

    /// Confirmations did not arrive within the batch timeout
    #[error("Timed out waiting for confirms: {confirmed} of {total} confirmed")]
    ConfirmTimeout { confirmed: usize, total: usize },

    #[error("Publish cancelled by caller")]
    Cancelled,

    #[error("Publish deadline exceeded")]
    DeadlineExceeded,
}

impl PublishError {
    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::Unavailable(err) => err.is_transient(),
            PublishError::Unconfirmed { .. } | PublishError::ConfirmTimeout { .. } => true,
            PublishError::Serialization(_)
            | PublishError::Cancelled
            | PublishError::DeadlineExceeded => false,
        }
    }
}

impl From<RabbitMQError> for PublishError {
    fn from(err: RabbitMQError) -> Self {
        match err {
            RabbitMQError::Cancelled => PublishError::Cancelled,
            RabbitMQError::DeadlineExceeded => PublishError::DeadlineExceeded,
            other => PublishError::Unavailable(other),
        }
    }
}

impl From<EventError> for PublishError {
    fn from(err: EventError) -> Self {
        PublishError::Serialization(err.to_string())
    }
}

/// Sends domain events across process boundaries
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, ctx: &MessageContext, event: &DomainEvent) -> Result<(), PublishError>;

    /// Publishes `events` as one unit; succeeds only if every event was accepted
    async fn publish_batch(
        &self,
        ctx: &MessageContext,
        events: &[DomainEvent],
    ) -> Result<(), PublishError>;
}

/// A message ready to be handed to the broker
struct Outgoing {
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
}

/// [`EventPublisher`] writing to the events exchange through the connection manager
#[derive(Debug, Clone)]
pub struct RabbitEventPublisher {
    manager: ConnectionManager,
    exchange: String,
    app_id: String,
    routes: RoutingTable,
    confirm_timeout: Duration,
}

impl RabbitEventPublisher {
    /// Publisher targeting the exchange of the manager's topology, with the default routes
    pub fn new(manager: ConnectionManager, app_id: impl Into<String>) -> Self {
        let exchange = manager.topology().exchange.clone();
        Self {
            manager,
            exchange,
            app_id: app_id.into(),
            routes: RoutingTable::default(),
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    pub fn with_routes(mut self, routes: RoutingTable) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn routing_key<'a>(&'a self, event_type: &'a str) -> &'a str {
        self.routes.routing_key(event_type)
    }

    /// Publishes a raw body with the context headers
    pub async fn publish_to(
        &self,
        ctx: &MessageContext,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), PublishError> {
        let mut properties = self.base_properties();
        ctx.inject_headers(&mut properties.headers);
        self.manager
            .publish(ctx, exchange, routing_key, body, &properties)
            .await?;
        Ok(())
    }

    /// Wraps `data` in a new event of `event_type` and publishes it
    pub async fn publish_event<T>(
        &self,
        ctx: &MessageContext,
        event_type: &str,
        data: &T,
    ) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let event = DomainEvent::json(event_type, "", data)?;
        self.publish(ctx, &event).await
    }

    fn base_properties(&self) -> MessageProperties {
        let mut properties = MessageProperties::json();
        properties.app_id = Some(self.app_id.clone());
        properties.timestamp = u64::try_from(Utc::now().timestamp()).ok();
        properties
    }

    fn encode(&self, ctx: &MessageContext, event: &DomainEvent) -> Result<Outgoing, PublishError> {
        let body = event.to_envelope()?.to_bytes()?;

        let mut properties = self.base_properties();
        properties.message_id = Some(event.id().to_owned());

        let tenant_id = first_non_empty(ctx.tenant_id(), event.tenant_id());
        let trace_id = first_non_empty(ctx.trace_id(), event.trace_id());
        let headers = &mut properties.headers;
        if !tenant_id.is_empty() {
            headers.insert(HEADER_TENANT_ID.to_owned(), tenant_id.to_owned());
        }
        if !trace_id.is_empty() {
            headers.insert(HEADER_TRACE_ID.to_owned(), trace_id.to_owned());
        }
        headers.insert(HEADER_EVENT_ID.to_owned(), event.id().to_owned());
        headers.insert(HEADER_EVENT_TYPE.to_owned(), event.event_type().to_owned());
        headers.insert(HEADER_EVENT_VERSION.to_owned(), event.version().to_owned());
        headers.insert(HEADER_AGGREGATE_ID.to_owned(), event.aggregate_id().to_owned());
        headers.insert(
            HEADER_OCCURRED_AT.to_owned(),
            event
                .occurred_at()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        );

        Ok(Outgoing {
            routing_key: self.routing_key(event.event_type()).to_owned(),
            body,
            properties,
        })
    }

    /// Waits for every confirmation, bounded by `deadline` and the caller's context
    async fn await_confirms(
        &self,
        ctx: &MessageContext,
        pending: Vec<rabbitmq::PendingConfirm>,
        deadline: Instant,
    ) -> Result<(), PublishError> {
        let total = pending.len();
        let mut waiting: FuturesUnordered<_> =
            pending.into_iter().map(|confirm| confirm.wait()).collect();
        let mut confirmed = 0;

        loop {
            select! {
                biased;
                err = ctx.interrupted() => return Err(err.into()),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(confirmed, total, "batch confirmation timed out");
                    return Err(PublishError::ConfirmTimeout { confirmed, total });
                }
                next = waiting.next() => match next {
                    Some(Ok(true)) => confirmed += 1,
                    Some(Ok(false)) => debug!("broker nacked a batch message"),
                    Some(Err(err)) => debug!("confirmation lost: {}", err),
                    None => break,
                }
            }
        }

        if confirmed < total {
            warn!(confirmed, total, "batch not fully confirmed");
            return Err(PublishError::Unconfirmed { confirmed, total });
        }
        Ok(())
    }
}

fn first_non_empty<'a>(preferred: &'a str, fallback: &'a str) -> &'a str {
    if preferred.is_empty() { fallback } else { preferred }
}

#[async_trait]
impl EventPublisher for RabbitEventPublisher {
    async fn publish(&self, ctx: &MessageContext, event: &DomainEvent) -> Result<(), PublishError> {
        let outgoing = self.encode(ctx, event)?;
        self.manager
            .publish(
                ctx,
                &self.exchange,
                &outgoing.routing_key,
                outgoing.body,
                &outgoing.properties,
            )
            .await?;

        debug!(
            event_type = event.event_type(),
            routing_key = %outgoing.routing_key,
            tenant_id = ctx.tenant_id(),
            trace_id = ctx.trace_id(),
            "event published"
        );
        Ok(())
    }

    async fn publish_batch(
        &self,
        ctx: &MessageContext,
        events: &[DomainEvent],
    ) -> Result<(), PublishError> {
        if events.is_empty() {
            return Ok(());
        }
        ctx.check()?;
        let deadline = Instant::now() + self.confirm_timeout;

        // encode everything first so a bad event fails the batch before anything is sent
        let outgoing = events
            .iter()
            .map(|event| self.encode(ctx, event))
            .collect::<Result<Vec<_>, _>>()?;

        let mut pending = Vec::with_capacity(outgoing.len());
        for message in outgoing {
            let confirm = self
                .manager
                .publish_confirmed(
                    ctx,
                    &self.exchange,
                    &message.routing_key,
                    message.body,
                    &message.properties,
                )
                .await?;
            pending.push(confirm);
        }

        self.await_confirms(ctx, pending, deadline).await?;
        debug!(
            events = events.len(),
            tenant_id = ctx.tenant_id(),
            trace_id = ctx.trace_id(),
            "batch published and confirmed"
        );
        Ok(())
    }
}
