pub mod batching;
pub mod dispatcher;
pub mod handlers;
pub mod instrumented;
pub mod publishers;
pub mod routing;
pub mod subscribers;
pub mod types;

// Re-export key types for easier usage
pub use batching::{AsyncBatchingPublisher, BatchingConfig};
pub use dispatcher::EventDispatcher;
pub use handlers::{EventHandler, EventLogger, from_fn};
pub use instrumented::{InstrumentedPublisher, PublisherStats};
pub use publishers::{EventPublisher, PublishError, RabbitEventPublisher};
pub use routing::RoutingTable;
pub use subscribers::{DispatchBridge, EnvelopeHandler, EventSubscriber, ReceivedEvent};
pub use types::*;
