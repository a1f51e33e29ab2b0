//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | EventHandler            | Trait for local event handling                    | handle_event      |
// | FnEventHandler          | Adapter turning an async closure into a handler   | from_fn           |
// | EventLogger             | Logging handler keeping a bounded history         | get_history       |
//--------------------------------------------------------------------------------------------------

use std::{collections::VecDeque, future::Future, sync::Arc};

use rabbitmq::MessageContext;
use tokio::sync::RwLock;
use tracing::info;

use super::types::{DomainEvent, EventResult};

/// Event handler trait for processing events in-process
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used when logging this handler's failures
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Processes an event
    async fn handle_event(&self, ctx: &MessageContext, event: &DomainEvent) -> EventResult<()>;
}

/// Handler backed by an async closure
pub struct FnEventHandler<F> {
    name: String,
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(MessageContext, DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = EventResult<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_event(&self, ctx: &MessageContext, event: &DomainEvent) -> EventResult<()> {
        (self.f)(ctx.clone(), event.clone()).await
    }
}

/// Wraps an async closure into a named [`EventHandler`]
pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(MessageContext, DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EventResult<()>> + Send + 'static,
{
    Arc::new(FnEventHandler {
        name: name.into(),
        f,
    })
}

/// A simple in-memory event logger for debugging
pub struct EventLogger {
    /// Maximum number of events to keep in history
    max_history: usize,
    /// Event history, oldest first
    history: Arc<RwLock<VecDeque<DomainEvent>>>,
}

impl EventLogger {
    /// Creates a new event logger
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(max_history))),
        }
    }

    /// Returns the event history
    pub async fn get_history(&self) -> Vec<DomainEvent> {
        self.history.read().await.iter().cloned().collect()
    }
}

#[async_trait::async_trait]
impl EventHandler for EventLogger {
    fn name(&self) -> &str {
        "event-logger"
    }

    async fn handle_event(&self, ctx: &MessageContext, event: &DomainEvent) -> EventResult<()> {
        info!(
            event_type = event.event_type(),
            event_id = event.id(),
            aggregate_id = event.aggregate_id(),
            tenant_id = ctx.tenant_id(),
            trace_id = ctx.trace_id(),
            "event observed"
        );

        if self.max_history == 0 {
            return Ok(());
        }

        let mut history = self.history.write().await;
        // Remove oldest event if at capacity
        if history.len() >= self.max_history {
            history.pop_front();
        }
        history.push_back(event.clone());

        Ok(())
    }
}
