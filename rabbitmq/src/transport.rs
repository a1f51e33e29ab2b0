use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    RabbitMQError,
    topology::{ExchangeKind, QueueArguments},
};

/// Properties attached to a published message
///
/// Only string headers are carried; that covers every header the event publisher writes and
/// keeps the type independent from the wire library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// Request durable storage from the broker (AMQP delivery mode 2)
    pub persistent: bool,
    pub message_id: Option<String>,
    pub app_id: Option<String>,
    /// Unix seconds
    pub timestamp: Option<u64>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_owned()),
            persistent: true,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Outstanding publisher confirmation for one message
///
/// The broker answers per delivery tag, so confirmations arriving out of order still settle
/// the right message.
#[derive(Debug)]
pub struct PendingConfirm {
    delivery_tag: u64,
    receiver: oneshot::Receiver<bool>,
}

impl PendingConfirm {
    pub fn new(delivery_tag: u64, receiver: oneshot::Receiver<bool>) -> Self {
        Self {
            delivery_tag,
            receiver,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Waits for the broker's answer: `true` for ack, `false` for nack
    ///
    /// # Errors
    /// Returns `RabbitMQError::ChannelClosed` if the channel died before answering
    pub async fn wait(self) -> Result<bool, RabbitMQError> {
        self.receiver
            .await
            .map_err(|_| RabbitMQError::ChannelClosed)
    }
}

/// Opens channels to a broker
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establishes a fresh connection and opens one channel on it
    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, RabbitMQError>;

    /// Human readable target, for logs. Must not leak credentials.
    fn describe(&self) -> String;
}

/// One logical connection/channel pair to the broker
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), RabbitMQError>;

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: &QueueArguments,
    ) -> Result<(), RabbitMQError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_pattern: &str,
    ) -> Result<(), RabbitMQError>;

    /// Limits the number of unacknowledged deliveries in flight per consumer
    async fn set_prefetch(&self, count: u16) -> Result<(), RabbitMQError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<(), RabbitMQError>;

    /// Publishes in confirm mode (enabled on first use) and returns the pending confirmation
    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<PendingConfirm, RabbitMQError>;

    /// Starts a manual-acknowledgement consumer
    ///
    /// The receiver ends when the broker cancels the consumer or the channel closes.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<UnboundedReceiver<Delivery>, RabbitMQError>;

    /// Stops the consumer started with `consumer_tag`; messages it holds stay unacked
    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), RabbitMQError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError>;

    /// Cancelled once the channel or its connection is closed by either side
    fn closed(&self) -> CancellationToken;

    fn is_open(&self) -> bool {
        !self.closed().is_cancelled()
    }

    async fn close(&self) -> Result<(), RabbitMQError>;
}
