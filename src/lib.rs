// Expose the modules
pub mod config;
pub mod events;
pub mod metrics;
pub mod telemetry;

// Re-export key types for easier usage
pub use config::{BrokerKind, Config, ConfigError};
pub use events::{
    AsyncBatchingPublisher, BatchingConfig, DispatchBridge, DomainEvent, EnvelopeHandler,
    EventDispatcher, EventEnvelope, EventError, EventHandler, EventLogger, EventPublisher,
    EventResult, EventSubscriber, InstrumentedPublisher, PublishError, PublisherStats,
    RabbitEventPublisher, ReceivedEvent, RoutingTable,
};
pub use crate::metrics::{InMemoryMetrics, MetricsSink, RecorderMetrics};
