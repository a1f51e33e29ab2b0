//! Broker plumbing for domain event delivery.
//!
//! The crate owns everything that talks to the message broker: the transport seam
//! ([`Transport`] / [`BrokerChannel`]), an amqprs-backed implementation ([`AmqpTransport`]),
//! an in-process broker ([`MemoryBroker`]) used for development runs and tests, topology
//! declaration, and the [`ConnectionManager`] that supervises reconnection and re-binds
//! consumers.
//!
//! It deals in exchanges, queues, raw bodies and string headers only; what a body means is
//! up to the caller.

pub mod amqp;
pub mod consumer;
pub mod context;
pub mod manager;
pub mod memory;
pub mod topology;
pub mod transport;

pub use amqp::AmqpTransport;
pub use consumer::{BoxError, ConsumeError, ConsumeResult, MessageHandler, handler_fn, panic_message};
pub use context::MessageContext;
pub use manager::{
    ConnectionManager, ConnectionSettings, ConnectionState, DEFAULT_PREFETCH, DEFAULT_RECONNECT_DELAY,
};
pub use memory::{ConfirmBehavior, MemoryBroker, MemoryTransport};
pub use topology::{
    DEFAULT_MESSAGE_TTL, ExchangeKind, QueueArguments, QueueConfig, Topology, setup_topology,
    topic_matches,
};
pub use transport::{BrokerChannel, Delivery, MessageProperties, PendingConfirm, Transport};

/// Header carrying the tenant of the call that produced a message
pub const HEADER_TENANT_ID: &str = "tenant_id";
/// Header carrying the distributed trace id of the call that produced a message
pub const HEADER_TRACE_ID: &str = "trace_id";

/// Error types for RabbitMQ operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RabbitMQError {
    /// Error in the provided URI
    #[error("Provided URI Error: {0}")]
    UriError(String),
    /// Error establishing connection
    #[error("Connection error: {0}")]
    ConnectionError(String),
    /// Error opening a channel
    #[error("Error while opening a rabbitmq channel: {0}")]
    OpenChannelError(String),
    /// Error declaring a queue
    #[error("Error while declaring a queue: {0}")]
    QueueDeclarationError(String),
    /// Error declaring an exchange
    #[error("Error while declaring a exchange: {0}")]
    ExchangeDeclarationError(String),
    /// Error starting to consume from a subscription
    #[error("Error while starting to consume from a subscription: {0}")]
    SubscriptionError(String),
    /// Error binding a queue to an exchange
    #[error("Error while binding a queue to exchange: {0}")]
    QueueBindingError(String),
    /// Error closing a channel
    #[error("Error while closing a channel: {0}")]
    CloseChannelError(String),
    /// Error publishing a message
    #[error("Error while publishing a message: {0}")]
    PublishError(String),
    /// Error while acknowledging a message failed
    #[error("Error while acknowledging a message: {0}")]
    AckMessageError(String),
    /// The channel a call was issued on has been closed by either side
    #[error("Channel closed")]
    ChannelClosed,
    /// The manager has no usable channel (never connected, or reconnecting)
    #[error("Connection not established")]
    NotConnected,
    /// The manager was shut down with `close()`
    #[error("Connection manager closed")]
    Closed,
    /// The caller's context was cancelled while waiting on the broker
    #[error("Operation cancelled by caller")]
    Cancelled,
    /// The caller's context deadline elapsed while waiting on the broker
    #[error("Operation deadline exceeded")]
    DeadlineExceeded,
}

impl RabbitMQError {
    /// Whether the error comes from broker/connection trouble that may go away on its own
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            RabbitMQError::UriError(_)
                | RabbitMQError::Closed
                | RabbitMQError::Cancelled
                | RabbitMQError::DeadlineExceeded
        )
    }

    /// Whether the error was caused by the caller's context rather than the broker
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            RabbitMQError::Cancelled | RabbitMQError::DeadlineExceeded
        )
    }
}
